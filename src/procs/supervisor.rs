// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::AppRegistry;
use crate::config::{ServeArgs, ServeSettings};
use crate::control::{AsyncCtlEnd, Write};
use crate::error::{exit, ErrorKind};
use crate::fork;
use crate::logging;
use crate::msg::{Message, MessageKind, WorkerConfig};
use crate::procs::{self, Process, RestartTracker, Worker};
use crate::Error;

/// Time workers get to exit on a quick shutdown before they are killed
const QUICK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Time allowed for killed workers to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Launch and monitor the worker pool
///
/// Rules:
///   - must validate the application before binding anything
///   - owns the listening socket, never accepts on it
///   - should restart failed workers, within the restart policy
///   - halts the pool if a worker can't boot
#[derive(Debug)]
pub struct Supervisor {
    registry: AppRegistry,
}

impl Supervisor {
    pub fn new(registry: AppRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Process for Supervisor {
    const NAME: &'static str = "serve";
    type Args = ServeArgs;

    async fn run(self, args: ServeArgs) -> Result<(), Error> {
        let settings = ServeSettings::resolve(&args)?;
        logging::init(settings.profile, settings.log_json);

        info!(
            app = %settings.app,
            bind = %settings.bind,
            workers = settings.workers,
            profile = ?settings.profile,
            "starting worker pool"
        );

        // a broken application must never get as far as the socket
        if let Err(e) = self.registry.load(&settings.app, &settings.app_settings()) {
            error!(app = %settings.app, error = %e, "application could not be loaded");
            return Err(e.into());
        }

        let listener = bind_listener(settings.bind)?;
        fork::inherit_fd(listener.as_raw_fd())?;
        info!(addr = %listener.local_addr()?, "listening");

        WorkerPool::new(settings, listener).run().await
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr).map_err(|source| ErrorKind::Bind { addr, source }.into())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownMode {
    Graceful,
    Quick,
}

/// What to do about a worker that exited while the pool was running
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Restart,
    /// The worker never came up, restarting would fail the same way
    Halt { code: u8 },
}

fn disposition(status: &io::Result<ExitStatus>) -> Disposition {
    let code = match status {
        Ok(status) => status.code(),
        Err(_) => None,
    };

    match code {
        Some(code) if code == i32::from(exit::WORKER_BOOT_ERROR) => Disposition::Halt {
            code: exit::WORKER_BOOT_ERROR,
        },
        Some(code) if code == i32::from(exit::APP_LOAD_ERROR) => Disposition::Halt {
            code: exit::APP_LOAD_ERROR,
        },
        _ => Disposition::Restart,
    }
}

struct WorkerHandle {
    pid: Pid,
    control: AsyncCtlEnd<Write>,
    started: Instant,
}

struct WorkerExit {
    slot: usize,
    pid: Pid,
    status: io::Result<ExitStatus>,
}

struct WorkerPool {
    settings: ServeSettings,
    listener: TcpListener,
    slots: Vec<Option<WorkerHandle>>,
    restarts: RestartTracker,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
}

impl WorkerPool {
    fn new(settings: ServeSettings, listener: TcpListener) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();

        Self {
            slots: (0..settings.workers).map(|_| None).collect(),
            restarts: RestartTracker::new(settings.restart),
            settings,
            listener,
            exits_tx,
            exits_rx,
        }
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    async fn run(mut self) -> Result<(), Error> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;

        for slot in 0..self.slots.len() {
            if let Err(e) = self.spawn_worker(slot).await {
                error!(slot, error = %e, "failed to spawn worker");
                self.shutdown(ShutdownMode::Quick).await;
                return Err(e);
            }
        }
        info!(workers = self.live(), "worker pool started");

        let outcome = loop {
            tokio::select! {
                biased;

                _ = terminate.recv() => {
                    info!("SIGTERM received, stopping gracefully");
                    break Ok(ShutdownMode::Graceful);
                }
                _ = interrupt.recv() => {
                    info!("SIGINT received, stopping");
                    break Ok(ShutdownMode::Quick);
                }
                _ = quit.recv() => {
                    info!("SIGQUIT received, stopping");
                    break Ok(ShutdownMode::Quick);
                }
                Some(exited) = self.exits_rx.recv() => {
                    if let Err(e) = self.handle_exit(exited).await {
                        break Err(e);
                    }
                }
            }
        };

        match outcome {
            Ok(mode) => {
                self.shutdown(mode).await;
                info!("worker pool stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "halting worker pool");
                self.shutdown(ShutdownMode::Graceful).await;
                Err(e)
            }
        }
    }

    fn worker_config(&self, slot: usize) -> WorkerConfig {
        WorkerConfig {
            worker_id: slot,
            app: self.settings.app.to_string(),
            settings: self.settings.app_settings(),
            log_json: self.settings.log_json,
        }
    }

    async fn spawn_worker(&mut self, slot: usize) -> Result<(), Error> {
        let args = [format!(
            "--{}={}",
            procs::LISTEN_FD,
            self.listener.as_raw_fd()
        )];
        let fork::Child { mut child, control } = fork::new_process::<Worker>(&args)?;

        let pid = match child.id() {
            Some(id) => Pid::from_raw(id as libc::pid_t),
            None => return Err(Error::from("worker exited before it was configured")),
        };

        let configure = Message::new(
            Supervisor::NAME,
            MessageKind::Configure(self.worker_config(slot)),
        );
        let control = match control.into_async() {
            Ok(control) => control,
            Err(e) => {
                child.start_kill().ok();
                return Err(e.into());
            }
        };
        if let Err(e) = control.send_msg(&configure).await {
            child.start_kill().ok();
            return Err(e);
        }

        let exits = self.exits_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            exits.send(WorkerExit { slot, pid, status }).ok();
        });

        info!(slot, pid = pid.as_raw(), "spawned worker");
        self.slots[slot] = Some(WorkerHandle {
            pid,
            control,
            started: Instant::now(),
        });

        Ok(())
    }

    /// Takes the worker out of its slot, returns false for stale exits
    fn reap(&mut self, exited: &WorkerExit) -> bool {
        match self.slots.get(exited.slot) {
            Some(Some(handle)) if handle.pid == exited.pid => (),
            _ => return false,
        }

        if let Some(handle) = self.slots[exited.slot].take() {
            match exited.status {
                Ok(ref status) => info!(
                    slot = exited.slot,
                    pid = exited.pid.as_raw(),
                    code = ?status.code(),
                    signal = ?status.signal(),
                    uptime_ms = handle.started.elapsed().as_millis() as u64,
                    "worker exited"
                ),
                Err(ref e) => warn!(
                    slot = exited.slot,
                    pid = exited.pid.as_raw(),
                    error = %e,
                    "worker could not be waited on"
                ),
            }
        }

        true
    }

    async fn handle_exit(&mut self, exited: WorkerExit) -> Result<(), Error> {
        if !self.reap(&exited) {
            debug!(slot = exited.slot, pid = exited.pid.as_raw(), "ignoring stale exit");
            return Ok(());
        }
        warn!(slot = exited.slot, "worker exited unexpectedly");

        match disposition(&exited.status) {
            Disposition::Halt { code } => {
                Err(ErrorKind::WorkerBootExit {
                    slot: exited.slot,
                    code,
                }
                .into())
            }
            Disposition::Restart => {
                if !self.restarts.try_restart(Instant::now()) {
                    let policy = self.restarts.policy();
                    return Err(ErrorKind::RestartLimit {
                        max_restarts: policy.max_restarts,
                        window: policy.window,
                    }
                    .into());
                }

                self.spawn_worker(exited.slot).await
            }
        }
    }

    async fn shutdown(&mut self, mode: ShutdownMode) {
        let graceful = mode == ShutdownMode::Graceful;
        let message = Message::new(Supervisor::NAME, MessageKind::Shutdown { graceful });

        for handle in self.slots.iter().flatten() {
            if let Err(e) = handle.control.send_msg(&message).await {
                warn!(pid = handle.pid.as_raw(), error = %e, "control failed, sending SIGTERM");
                kill(handle.pid, Signal::SIGTERM).ok();
            }
        }

        let timeout = if graceful {
            self.settings.graceful_timeout
        } else {
            QUICK_SHUTDOWN_TIMEOUT
        };
        info!(workers = self.live(), ?timeout, ?mode, "waiting for workers to exit");

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        while self.live() > 0 {
            tokio::select! {
                _ = &mut deadline => break,
                Some(exited) = self.exits_rx.recv() => {
                    self.reap(&exited);
                }
            }
        }

        if self.live() == 0 {
            return;
        }

        for handle in self.slots.iter().flatten() {
            warn!(pid = handle.pid.as_raw(), "worker did not exit in time, killing");
            kill(handle.pid, Signal::SIGKILL).ok();
        }

        while self.live() > 0 {
            match tokio::time::timeout(REAP_TIMEOUT, self.exits_rx.recv()).await {
                Ok(Some(exited)) => {
                    self.reap(&exited);
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited_with(code: i32) -> io::Result<ExitStatus> {
        // wait status layout, exit code in the second byte
        Ok(ExitStatus::from_raw(code << 8))
    }

    #[test]
    fn test_disposition() {
        assert_eq!(disposition(&exited_with(0)), Disposition::Restart);
        assert_eq!(disposition(&exited_with(1)), Disposition::Restart);
        assert_eq!(
            disposition(&exited_with(3)),
            Disposition::Halt { code: 3 }
        );
        assert_eq!(
            disposition(&exited_with(4)),
            Disposition::Halt { code: 4 }
        );
    }

    #[test]
    fn test_disposition_signaled() {
        // killed by SIGKILL
        let status = Ok(ExitStatus::from_raw(9));
        assert_eq!(disposition(&status), Disposition::Restart);

        let status = Err(io::Error::from(io::ErrorKind::Other));
        assert_eq!(disposition(&status), Disposition::Restart);
    }

    #[test]
    fn test_bind_in_use() {
        let first = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = first.local_addr().unwrap();

        let err = bind_listener(addr).expect_err("address in use");
        match err.kind() {
            ErrorKind::Bind { source, .. } => assert_eq!(source.kind(), io::ErrorKind::AddrInUse),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
