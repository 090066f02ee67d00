// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use serde::{Deserialize, Serialize};

use crate::app::AppSettings;
use crate::Error;

/// Upper bound of a single encoded message, each message is sent as one datagram
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Where a message came from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pid: libc::pid_t,
    proc_name: String,
}

impl Metadata {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }
}

/// Everything a worker needs to know before it can serve
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// The slot of the worker in the pool, stable across restarts
    pub worker_id: usize,
    /// `module:object` reference of the application to load
    pub app: String,
    pub settings: AppSettings,
    pub log_json: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// First message to every worker
    Configure(WorkerConfig),
    /// Stop accepting connections; when `graceful`, in-flight requests are completed first
    Shutdown { graceful: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    metadata: Metadata,
    kind: MessageKind,
}

impl Message {
    /// Create a message originating from this process
    pub fn new(proc_name: &str, kind: MessageKind) -> Self {
        Self {
            metadata: Metadata {
                pid: nix::unistd::getpid().as_raw(),
                proc_name: proc_name.to_string(),
            },
            kind,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn into_kind(self) -> MessageKind {
        self.kind
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::from(format!(
                "control message of {} bytes exceeds {} bytes",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;

    #[test]
    fn test_configure_survives_encoding() {
        let config = WorkerConfig {
            worker_id: 3,
            app: "run:app".to_string(),
            settings: AppSettings {
                profile: Profile::Production,
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            log_json: true,
        };
        let message = Message::new("serve", MessageKind::Configure(config.clone()));

        let decoded = Message::from_bytes(&message.to_bytes().expect("encode")).expect("decode");
        assert_eq!(decoded.into_kind(), MessageKind::Configure(config));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Message::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let config = WorkerConfig {
            worker_id: 0,
            app: "run:app".to_string(),
            settings: AppSettings {
                profile: Profile::Development,
                allowed_origins: vec!["x".repeat(MAX_MESSAGE_SIZE)],
            },
            log_json: false,
        };

        let err = Message::new("serve", MessageKind::Configure(config))
            .to_bytes()
            .expect_err("too large");
        assert!(err.to_string().contains("exceeds"));
    }
}
