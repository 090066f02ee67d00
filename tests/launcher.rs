// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(target_os = "linux")]

use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const MINIUM: &str = env!("CARGO_BIN_EXE_minium");
const STARTUP: Duration = Duration::from_secs(15);

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .expect("no free port")
        .port()
}

fn command(port: u16, args: &[&str]) -> Command {
    let mut command = Command::new(MINIUM);
    command
        .arg("serve")
        .arg("--bind")
        .arg(format!("127.0.0.1:{}", port))
        .args(args)
        .env("MINIUM_ENV", "testing")
        .env_remove("MINIUM_APP")
        .env_remove("MINIUM_BIND")
        .env_remove("MINIUM_WORKERS")
        .env_remove("MINIUM_CONFIG")
        .env_remove("MINIUM_MAX_RESTARTS");
    command
}

fn spawn(port: u16, args: &[&str]) -> Child {
    command(port, args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start minium")
}

fn run(port: u16, args: &[&str]) -> Output {
    command(port, args)
        .stdin(Stdio::null())
        .output()
        .expect("failed to run minium")
}

/// Children of `parent` according to /proc
fn children(parent: u32) -> Vec<i32> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc").expect("no /proc").flatten() {
        let pid = match entry.file_name().to_string_lossy().parse::<i32>() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let stat = match fs::read_to_string(entry.path().join("stat")) {
            Ok(stat) => stat,
            Err(_) => continue,
        };

        // the command name may contain spaces, fields after it are fixed: state, ppid, ...
        let fields = match stat.rfind(')') {
            Some(end) => stat[end + 1..].split_whitespace().collect::<Vec<_>>(),
            None => continue,
        };
        if fields.len() > 1 && fields[0] != "Z" && fields[1] == parent.to_string() {
            pids.push(pid);
        }
    }

    pids.sort_unstable();
    pids
}

fn wait_for_children(parent: u32, count: usize) -> Vec<i32> {
    let start = Instant::now();
    loop {
        let pids = children(parent);
        if pids.len() == count || start.elapsed() > STARTUP {
            return pids;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }

    child.kill().ok();
    None
}

fn terminate(child: &mut Child) -> Option<ExitStatus> {
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("SIGTERM");
    wait_for_exit(child, Duration::from_secs(10))
}

fn http_get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    write!(
        stream,
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    )
    .expect("write request");

    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    response
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response
        .lines()
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

#[test]
fn test_serves_from_four_workers() {
    let port = free_port();
    let mut supervisor = spawn(port, &["run:app"]);

    let workers = wait_for_children(supervisor.id(), 4);
    assert_eq!(workers.len(), 4, "expected 4 workers, found {:?}", workers);

    let response = http_get(port, "/health");
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"status\":\"ok\""), "{}", response);

    let worker_id = header(&response, "x-worker-id")
        .and_then(|id| id.parse::<usize>().ok())
        .expect("x-worker-id header");
    assert!(worker_id < 4);

    let worker_pid = header(&response, "x-worker-pid")
        .and_then(|pid| pid.parse::<i32>().ok())
        .expect("x-worker-pid header");
    assert!(workers.contains(&worker_pid));

    let status = terminate(&mut supervisor).expect("supervisor did not stop");
    assert!(status.success(), "{:?}", status);
}

#[test]
fn test_unknown_app_fails_before_binding() {
    let port = free_port();
    let output = run(port, &["nope:app"]);

    assert_eq!(output.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no module named `nope`"), "{}", stderr);

    // the port was never taken
    TcpListener::bind(("127.0.0.1", port)).expect("port should be free");
}

#[test]
fn test_unknown_object_fails() {
    let port = free_port();
    let output = run(port, &["run:application"]);

    assert_eq!(output.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("has no object `application`"), "{}", stderr);
}

#[test]
fn test_second_instance_address_in_use() {
    let port = free_port();
    let mut first = spawn(port, &["--workers", "1"]);
    assert_eq!(wait_for_children(first.id(), 1).len(), 1);

    let output = run(port, &["--workers", "1"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to bind"), "{}", stderr);

    let status = terminate(&mut first).expect("first instance did not stop");
    assert!(status.success());
}

#[test]
fn test_crashed_worker_is_replaced() {
    let port = free_port();
    let mut supervisor = spawn(port, &["--workers", "2"]);

    let before = wait_for_children(supervisor.id(), 2);
    assert_eq!(before.len(), 2);

    kill(Pid::from_raw(before[0]), Signal::SIGKILL).expect("SIGKILL worker");

    let start = Instant::now();
    let after = loop {
        let after = children(supervisor.id());
        if (after.len() == 2 && !after.contains(&before[0])) || start.elapsed() > STARTUP {
            break after;
        }
        thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(after.len(), 2, "{:?}", after);
    assert!(!after.contains(&before[0]));
    assert!(after.contains(&before[1]));

    let status = terminate(&mut supervisor).expect("supervisor did not stop");
    assert!(status.success());
}

#[test]
fn test_restart_limit_halts_pool() {
    let port = free_port();
    let mut supervisor = spawn(port, &["--workers", "2", "--max-restarts", "0"]);

    let workers = wait_for_children(supervisor.id(), 2);
    assert_eq!(workers.len(), 2);

    kill(Pid::from_raw(workers[0]), Signal::SIGKILL).expect("SIGKILL worker");

    let status = wait_for_exit(&mut supervisor, Duration::from_secs(15)).expect("pool did not halt");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_zero_workers_is_usage_error() {
    let output = run(free_port(), &["--workers", "0"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_command_required() {
    let output = Command::new(MINIUM).output().expect("failed to run minium");
    assert_eq!(output.status.code(), Some(2));
}
