// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::env;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tokio::process::Command;
use tracing::debug;

use crate::control::{Control, CtlEnd, Write};
use crate::procs::{self, Process};
use crate::Error;

pub struct StdIoConf {
    pub stdin: Stdio,
    pub stderr: Stdio,
    pub stdout: Stdio,
}

pub struct Child {
    pub child: tokio::process::Child,
    pub control: CtlEnd<Write>,
}

/// Clears close-on-exec so that the descriptor survives into spawned processes
pub fn inherit_fd(fd: RawFd) -> nix::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags.difference(FdFlag::FD_CLOEXEC)))?;
    Ok(())
}

/// Re-executes the current binary as the process `P`.
///
/// The child gets the read end of a fresh control channel as `--control-in`, followed by `args`. Any other
///   descriptor named in `args` must already be inheritable, see [`inherit_fd`].
pub fn new_process<P>(args: &[String]) -> Result<Child, Error>
where
    P: Process,
{
    let stdio = P::get_stdio();

    let (read, write) = Control::new()?.split();
    inherit_fd(read.as_raw_fd())?;

    // FIXME: clear env? set working directory? uid/gid?
    let child = Command::new(env::current_exe()?)
        .arg(P::NAME)
        .arg(format!("--{}={}", procs::CONTROL_IN, read.as_raw_fd()))
        .args(args)
        .kill_on_drop(true)
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr)
        .spawn()?;

    debug!(
        process = P::NAME,
        pid = ?child.id(),
        control = write.as_raw_fd(),
        "started child process"
    );

    // the child holds its own copy now
    drop(read);
    Ok(Child {
        child,
        control: write,
    })
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;

    use super::*;

    #[test]
    fn test_inherit_fd_clears_cloexec() {
        let (socket, _peer) = UnixDatagram::pair().expect("socketpair");
        let fd = socket.as_raw_fd();

        let before = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
        assert!(before.contains(FdFlag::FD_CLOEXEC));

        inherit_fd(fd).expect("inherit");

        let after = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
        assert!(!after.contains(FdFlag::FD_CLOEXEC));
    }
}
