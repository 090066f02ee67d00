// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Control channels between the supervisor and its workers.
//!
//! A control channel is a unix datagram socketpair. The supervisor keeps the `Write` end, the worker inherits
//!   the `Read` end across exec and is told the descriptor number on its command line.

use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram as StdUnixDatagram;

use tokio::net::UnixDatagram;
use tracing::trace;

use crate::msg::{Message, MAX_MESSAGE_SIZE};
use crate::Error;

#[derive(Clone, Copy, Debug)]
pub struct Read;
#[derive(Clone, Copy, Debug)]
pub struct Write;

// A marker trait to designate the end of the channel this represents
pub trait End: Clone + Copy + Debug + Send + Sync + 'static {
    fn display() -> &'static str;
}

impl End for Read {
    fn display() -> &'static str {
        "Read"
    }
}
impl End for Write {
    fn display() -> &'static str {
        "Write"
    }
}

#[derive(Debug)]
pub struct CtlEnd<E: End> {
    fd: OwnedFd,
    ghost: PhantomData<E>,
}

impl<E: End> CtlEnd<E> {
    /// Registers the socket with the tokio reactor, must be called from within a runtime
    pub fn into_async(self) -> io::Result<AsyncCtlEnd<E>> {
        trace!(fd = self.fd.as_raw_fd(), end = E::display(), "registering control end");
        let datagram = StdUnixDatagram::from(self.fd);
        datagram.set_nonblocking(true)?;

        Ok(AsyncCtlEnd {
            datagram: UnixDatagram::from_std(datagram)?,
            ghost: PhantomData,
        })
    }
}

impl<E: End> FromRawFd for CtlEnd<E> {
    unsafe fn from_raw_fd(raw_fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(raw_fd),
            ghost: PhantomData,
        }
    }
}

impl<E: End> AsRawFd for CtlEnd<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl<E: End> IntoRawFd for CtlEnd<E> {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

pub struct Control {
    read: CtlEnd<Read>,
    write: CtlEnd<Write>,
}

impl Control {
    /// Creates a new control socketpair, both ends are close-on-exec.
    ///
    /// It's expected that this is created before spawning, the read end is then made inheritable for the child
    ///   and dropped by the parent once the child is running.
    pub fn new() -> io::Result<Self> {
        let (read, write) = StdUnixDatagram::pair()?;
        trace!(
            read = read.as_raw_fd(),
            write = write.as_raw_fd(),
            "created control socketpair"
        );

        Ok(Self {
            read: CtlEnd {
                fd: OwnedFd::from(read),
                ghost: PhantomData,
            },
            write: CtlEnd {
                fd: OwnedFd::from(write),
                ghost: PhantomData,
            },
        })
    }

    pub fn split(self) -> (CtlEnd<Read>, CtlEnd<Write>) {
        let Control { read, write } = self;
        (read, write)
    }
}

#[derive(Debug)]
pub struct AsyncCtlEnd<E: End> {
    datagram: UnixDatagram,
    ghost: PhantomData<E>,
}

impl AsyncCtlEnd<Read> {
    /// Waits for the next message, one message per datagram
    pub async fn recv_msg(&self) -> Result<Message, Error> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let len = self.datagram.recv(&mut buf).await?;
        if len == 0 {
            return Err(Error::from("control channel closed"));
        }

        Message::from_bytes(&buf[..len])
    }
}

impl AsyncCtlEnd<Write> {
    pub async fn send_msg(&self, message: &Message) -> Result<(), Error> {
        let bytes = message.to_bytes()?;
        let sent = self.datagram.send(&bytes).await?;
        if sent != bytes.len() {
            return Err(Error::from(format!(
                "control message truncated, sent {} of {} bytes",
                sent,
                bytes.len()
            )));
        }

        Ok(())
    }
}
