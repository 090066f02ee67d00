// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::app::AppLoadError;

/// Process exit codes shared by the supervisor and its workers
pub mod exit {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const USAGE: u8 = 2;
    /// A worker could not reach the point of serving requests
    pub const WORKER_BOOT_ERROR: u8 = 3;
    /// The application reference could not be loaded
    pub const APP_LOAD_ERROR: u8 = 4;
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("nix error: {0}")]
    NixError(#[from] nix::Error),
    #[error("control message could not be encoded or decoded: {0}")]
    CodecError(#[from] bincode::Error),
    #[error(transparent)]
    AppLoad(#[from] AppLoadError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("worker failed to boot: {0}")]
    WorkerBoot(String),
    #[error("worker in slot {slot} failed to boot (exit code {code})")]
    WorkerBootExit { slot: usize, code: u8 },
    #[error("worker restart limit reached ({max_restarts} within {window:?})")]
    RestartLimit { max_restarts: u32, window: Duration },
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

impl From<&'static str> for ErrorKind {
    fn from(err: &'static str) -> Self {
        ErrorKind::ErrorStr(err)
    }
}

impl From<String> for ErrorKind {
    fn from(err: String) -> Self {
        ErrorKind::ErrorMsg(err)
    }
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Errors raised before a worker starts serving are boot failures, unless the application itself failed to load
    pub fn into_worker_boot(self) -> Self {
        match self.0 {
            ErrorKind::AppLoad(_) | ErrorKind::WorkerBoot(_) => self,
            other => Self::from_kind(ErrorKind::WorkerBoot(other.to_string())),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match &self.0 {
            ErrorKind::AppLoad(_) => exit::APP_LOAD_ERROR,
            ErrorKind::WorkerBoot(_) => exit::WORKER_BOOT_ERROR,
            ErrorKind::WorkerBootExit { code, .. } => match *code {
                exit::APP_LOAD_ERROR => exit::APP_LOAD_ERROR,
                _ => exit::WORKER_BOOT_ERROR,
            },
            ErrorKind::Config(_) => exit::USAGE,
            _ => exit::FAILURE,
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}
