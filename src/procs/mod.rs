// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod restart;
mod supervisor;
mod worker;

pub use restart::{RestartPolicy, RestartTracker};
pub use supervisor::Supervisor;
pub use worker::{Worker, WorkerArgs};

use std::process::Stdio;

use async_trait::async_trait;

use crate::fork::StdIoConf;
use crate::Error;

pub const CONTROL_IN: &str = "control-in";
pub const LISTEN_FD: &str = "listen-fd";

/// Response headers identifying the worker that served a request
pub const X_WORKER_ID: &str = "x-worker-id";
pub const X_WORKER_PID: &str = "x-worker-pid";

/// A trait to define common construction of a process
///
/// Every process is the same binary, started with `NAME` as its subcommand.
#[async_trait]
pub trait Process: Sized + Send + 'static {
    const NAME: &'static str;

    /// Command line arguments of the process
    type Args: Send + 'static;

    async fn run(self, args: Self::Args) -> Result<(), Error>;

    fn get_stdio() -> StdIoConf {
        StdIoConf {
            stdin: Stdio::null(),
            stderr: Stdio::inherit(),
            stdout: Stdio::inherit(),
        }
    }
}
