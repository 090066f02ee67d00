// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::future::IntoFuture;
use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use clap::Args;
use nix::unistd::{getpid, getppid, Pid};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};

use crate::app::{AppRef, AppRegistry};
use crate::control::{AsyncCtlEnd, CtlEnd, Read};
use crate::logging;
use crate::msg::{MessageKind, WorkerConfig};
use crate::procs::{self, Process, X_WORKER_ID, X_WORKER_PID};
use crate::Error;

/// Time allowed between spawn and the configuration message
const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(10);
const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Args, Clone, Debug)]
pub struct WorkerArgs {
    /// control input filedescriptor (used when spawning the process)
    #[arg(short, long = procs::CONTROL_IN, value_name = "NUMBER")]
    pub control_in: RawFd,

    /// listening socket filedescriptor shared by all workers
    #[arg(short, long = procs::LISTEN_FD, value_name = "NUMBER")]
    pub listen_fd: RawFd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownMode {
    /// Stop accepting, finish in-flight requests
    Graceful,
    /// Exit now
    Quick,
}

/// Serves the application on the shared listening socket.
///
/// Rules:
///  - receives its configuration from the supervisor, and only the supervisor
///  - owns its own copy of the application, nothing is shared with other workers but the listener
///  - exits when told to by the supervisor, by signal, or when the supervisor is gone
#[derive(Debug)]
pub struct Worker {
    registry: AppRegistry,
}

impl Worker {
    pub fn new(registry: AppRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Process for Worker {
    const NAME: &'static str = "worker";
    type Args = WorkerArgs;

    async fn run(self, args: WorkerArgs) -> Result<(), Error> {
        // This is safe because the supervisor passes the fd number of the control end it made inheritable for us
        let control = unsafe { CtlEnd::<Read>::from_raw_fd(args.control_in) }
            .into_async()
            .map_err(|e| Error::from(e).into_worker_boot())?;

        let config = receive_config(&control)
            .await
            .map_err(Error::into_worker_boot)?;

        logging::init(config.settings.profile, config.log_json);

        let span = info_span!("worker", id = config.worker_id, pid = getpid().as_raw());
        self.serve(control, config, args.listen_fd)
            .instrument(span)
            .await
    }
}

impl Worker {
    async fn serve(
        self,
        control: AsyncCtlEnd<Read>,
        config: WorkerConfig,
        listen_fd: RawFd,
    ) -> Result<(), Error> {
        let app_ref = config.app.parse::<AppRef>()?;
        let router = self.registry.load(&app_ref, &config.settings)?;

        let listener = adopt_listener(listen_fd).map_err(Error::into_worker_boot)?;
        let signals = ShutdownSignals::new().map_err(|e| Error::from(e).into_worker_boot())?;

        let router = identify(router, config.worker_id).layer(TraceLayer::new_for_http());

        info!(
            app = %app_ref,
            addr = ?listener.local_addr().ok(),
            "worker booted"
        );

        let (mode_tx, mode_rx) = watch::channel(None);
        tokio::spawn(
            watch_shutdown(control, signals, getppid(), mode_tx).instrument(tracing::Span::current()),
        );

        let graceful = wait_for_mode(mode_rx.clone(), |_| true);
        let quick = wait_for_mode(mode_rx, |mode| mode == ShutdownMode::Quick);

        tokio::select! {
            served = axum::serve(listener, router).with_graceful_shutdown(graceful).into_future() => {
                served?;
                info!("worker stopped");
            }
            _ = quick => {
                info!("worker exiting without draining connections");
            }
        }

        Ok(())
    }
}

/// Adds the worker identity to every response
fn identify(router: Router, worker_id: usize) -> Router {
    router
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(X_WORKER_ID),
            HeaderValue::from(worker_id),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(X_WORKER_PID),
            HeaderValue::from(getpid().as_raw()),
        ))
}

async fn receive_config(control: &AsyncCtlEnd<Read>) -> Result<WorkerConfig, Error> {
    let message = tokio::time::timeout(CONFIGURE_TIMEOUT, control.recv_msg())
        .await
        .map_err(|_| Error::from("timed out waiting for configuration"))??;

    verify_pid(message.metadata().pid(), getppid())?;

    match message.into_kind() {
        MessageKind::Configure(config) => Ok(config),
        other => Err(Error::from(format!(
            "expected configuration, received: {:?}",
            other
        ))),
    }
}

/// Ensure the source pid is the original parent, i.e. the supervisor
fn verify_pid(src: libc::pid_t, parent: Pid) -> Result<(), Error> {
    if src != parent.as_raw() {
        return Err(Error::from(format!(
            "control message from pid {} but parent is {}",
            src, parent
        )));
    }

    Ok(())
}

fn adopt_listener(fd: RawFd) -> Result<TcpListener, Error> {
    // This is safe because the listener was made inheritable by the supervisor, and is only owned here
    let listener = unsafe { StdTcpListener::from_raw_fd(fd) };
    // not a listening TCP socket if this fails
    listener.local_addr()?;
    listener.set_nonblocking(true)?;

    Ok(TcpListener::from_std(listener)?)
}

struct ShutdownSignals {
    terminate: Signal,
    interrupt: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }
}

/// Resolves once the shutdown mode satisfies `accept`
async fn wait_for_mode(
    mut mode_rx: watch::Receiver<Option<ShutdownMode>>,
    accept: fn(ShutdownMode) -> bool,
) {
    loop {
        let mode = *mode_rx.borrow_and_update();
        if mode.map_or(false, accept) {
            return;
        }

        if mode_rx.changed().await.is_err() {
            // the mode can no longer change
            futures::future::pending::<()>().await;
        }
    }
}

async fn watch_shutdown(
    control: AsyncCtlEnd<Read>,
    mut signals: ShutdownSignals,
    parent: Pid,
    mode_tx: watch::Sender<Option<ShutdownMode>>,
) {
    let mut orphan_check = tokio::time::interval(ORPHAN_CHECK_INTERVAL);

    let mode = loop {
        tokio::select! {
            message = control.recv_msg() => match message {
                Ok(message) => {
                    if let Err(e) = verify_pid(message.metadata().pid(), parent) {
                        warn!(error = %e, "ignoring control message");
                        continue;
                    }

                    match message.into_kind() {
                        MessageKind::Shutdown { graceful: true } => break ShutdownMode::Graceful,
                        MessageKind::Shutdown { graceful: false } => break ShutdownMode::Quick,
                        other => warn!(?other, "unexpected control message"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "control channel failed");
                    break ShutdownMode::Graceful;
                }
            },
            _ = signals.terminate.recv() => break ShutdownMode::Graceful,
            _ = signals.interrupt.recv() => break ShutdownMode::Quick,
            _ = signals.quit.recv() => break ShutdownMode::Quick,
            _ = orphan_check.tick() => {
                if getppid() != parent {
                    warn!(supervisor = %parent, "supervisor went away");
                    break ShutdownMode::Graceful;
                }
            }
        }
    };

    info!(?mode, "shutting down");
    mode_tx.send(Some(mode)).ok();
}
