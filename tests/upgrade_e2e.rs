//! End-to-end upgrade of the real binary: SIGHUP, listener handoff, drain, exit.

use std::net::SocketAddr;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use handoff_server::upgrade::read_pid_file;

mod common;

/// Kills any process it still knows about when the test ends.
struct Cleanup {
    pids: Vec<u32>,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for pid in &self.pids {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
    }
}

fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn write_config(dir: &Path, addr: SocketAddr) -> std::path::PathBuf {
    let path = dir.join("server.toml");
    let pid_file = dir.join("server.pid");
    std::fs::write(
        &path,
        format!(
            r#"
[listener]
name = "http"
address = "{addr}"

[upgrade]
drain_timeout_secs = 5
ready_timeout_secs = 10
pid_file = "{}"

[logging]
level = "info"
"#,
            pid_file.display()
        ),
    )
    .unwrap();
    path
}

fn start(config: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_handoff-server"))
        .arg("--config")
        .arg(config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

async fn wait_exit(child: &mut Child, limit: Duration) -> std::process::ExitStatus {
    common::eventually(limit, || {
        let status = child.try_wait().unwrap();
        async move { status }
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sighup_hands_listener_to_successor() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_port();
    let config = write_config(dir.path(), addr);
    let pid_file = dir.path().join("server.pid");

    let mut root = start(&config);
    let mut cleanup = Cleanup {
        pids: vec![root.id()],
    };

    // Root generation: binds, serves, writes its pid.
    let root_pid = common::eventually(Duration::from_secs(10), || {
        let pid_file = pid_file.clone();
        async move { read_pid_file(&pid_file).ok() }
    })
    .await;
    assert_eq!(root_pid, root.id());
    assert_eq!(common::http_get(addr).await.unwrap(), (200, "OK".to_string()));

    kill(Pid::from_raw(root_pid as i32), Signal::SIGHUP).unwrap();

    // The successor rewrites the pid file once it inherited the socket and serves.
    let successor_pid = common::eventually(Duration::from_secs(10), || {
        let pid_file = pid_file.clone();
        async move { read_pid_file(&pid_file).ok().filter(|pid| *pid != root_pid) }
    })
    .await;
    cleanup.pids.push(successor_pid);
    assert_eq!(common::http_get(addr).await.unwrap(), (200, "OK".to_string()));

    // The predecessor drains and exits cleanly.
    let status = wait_exit(&mut root, Duration::from_secs(10)).await;
    assert!(status.success(), "predecessor exited with {status}");

    // Only the successor is left, still on the same address.
    assert_eq!(common::http_get(addr).await.unwrap(), (200, "OK".to_string()));

    kill(Pid::from_raw(successor_pid as i32), Signal::SIGTERM).unwrap();
    common::eventually(Duration::from_secs(10), || async move {
        common::http_get(addr).await.is_err().then_some(())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sigterm_stops_root_generation() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_port();
    let config = write_config(dir.path(), addr);

    let mut root = start(&config);
    let _cleanup = Cleanup {
        pids: vec![root.id()],
    };

    common::eventually(Duration::from_secs(10), || async move {
        common::http_get(addr).await.ok()
    })
    .await;

    kill(Pid::from_raw(root.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_exit(&mut root, Duration::from_secs(10)).await;
    assert!(status.success(), "exited with {status}");
    assert!(common::http_get(addr).await.is_err());
}
