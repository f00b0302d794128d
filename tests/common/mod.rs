//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tokio::sync::Notify;

use handoff_server::config::ServerConfig;
use handoff_server::net::listener::{BindError, FreshBind, ListenerSource, ListenerSpec};
use handoff_server::upgrade::{
    Coordinator, GenerationState, Handoff, SpawnError, Spawner, Successor, UpgradeError,
    UpgradeSettings,
};

/// Non-pooled client so a drain never waits on our idle keep-alive connections.
#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// `GET /` and return status code and body.
#[allow(dead_code)]
pub async fn http_get(addr: SocketAddr) -> reqwest::Result<(u16, String)> {
    let res = client().get(format!("http://{addr}/")).send().await?;
    let status = res.status().as_u16();
    Ok((status, res.text().await?))
}

/// Router whose `GET /` signals `started`, sleeps for `delay`, then answers `OK`.
#[allow(dead_code)]
pub fn slow_router(delay: Duration, started: Arc<Notify>) -> Router {
    Router::new().route(
        "/",
        get(move || {
            let started = started.clone();
            async move {
                started.notify_one();
                tokio::time::sleep(delay).await;
                "OK"
            }
        }),
    )
}

/// Config listening on an ephemeral loopback port.
#[allow(dead_code)]
pub fn test_config(drain_timeout_secs: u64) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.address = "127.0.0.1:0".to_string();
    config.upgrade.drain_timeout_secs = drain_timeout_secs;
    config
}

/// Root coordinator binding fresh sockets and spawning through `spawner`.
#[allow(dead_code)]
pub fn coordinator(spawner: impl Spawner + 'static) -> Arc<Coordinator> {
    coordinator_with(FreshBind::default(), spawner)
}

/// Root coordinator acquiring listeners from `source`.
#[allow(dead_code)]
pub fn coordinator_with(
    source: impl ListenerSource + 'static,
    spawner: impl Spawner + 'static,
) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(
        UpgradeSettings {
            ready_timeout: Duration::from_secs(2),
            pid_file: None,
        },
        Box::new(source),
        None,
        Box::new(spawner),
    ))
}

/// Binds fresh sockets and keeps a duplicate of each for the test.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct TappedBind {
    fresh: FreshBind,
    taps: Arc<Mutex<Vec<std::net::TcpListener>>>,
}

#[allow(dead_code)]
impl TappedBind {
    /// Duplicate of the first listener bound.
    pub fn first(&self) -> std::net::TcpListener {
        self.taps.lock().unwrap()[0].try_clone().unwrap()
    }
}

impl ListenerSource for TappedBind {
    fn acquire(&mut self, spec: &ListenerSpec) -> Result<Option<std::net::TcpListener>, BindError> {
        let listener = self.fresh.acquire(spec)?;
        if let Some(listener) = &listener {
            self.taps.lock().unwrap().push(listener.try_clone().unwrap());
        }
        Ok(listener)
    }

    fn kind(&self) -> &'static str {
        "tapped"
    }
}

/// Shut a listening socket down under the server so its next accept fails.
#[allow(dead_code)]
pub fn break_listener(listener: &std::net::TcpListener) {
    // SAFETY: the descriptor is owned by `listener` and stays open for the call.
    let rc = unsafe { libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR) };
    assert_eq!(rc, 0, "shutdown(2) failed: {}", std::io::Error::last_os_error());
}

/// Wait until the coordinator reaches `state` (or a later one).
#[allow(dead_code)]
pub async fn wait_for_state(coordinator: &Coordinator, state: GenerationState) {
    let mut changes = coordinator.state_changes();
    tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| *s >= state))
        .await
        .expect("timed out waiting for generation state")
        .unwrap();
}

/// The address of the single registered listener.
#[allow(dead_code)]
pub fn serving_addr(coordinator: &Coordinator) -> SocketAddr {
    coordinator.listeners()[0].1
}

/// Poll `check` every 20ms until it returns `Some`, or panic after `limit`.
#[allow(dead_code)]
pub async fn eventually<T, F, Fut>(limit: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A spawner whose successor reports ready immediately.
#[allow(dead_code)]
pub struct ImmediateReadySpawner;

impl Spawner for ImmediateReadySpawner {
    fn spawn(&self, _handoff: &Handoff) -> Result<Box<dyn Successor>, UpgradeError> {
        Ok(Box::new(ReadySuccessor))
    }
}

struct ReadySuccessor;

#[async_trait]
impl Successor for ReadySuccessor {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn ready(&mut self) -> Result<(), UpgradeError> {
        Ok(())
    }

    async fn abort(&mut self) {}
}

/// A spawner that cannot create processes.
#[allow(dead_code)]
pub struct FailingSpawner;

impl Spawner for FailingSpawner {
    fn spawn(&self, _handoff: &Handoff) -> Result<Box<dyn Successor>, UpgradeError> {
        Err(SpawnError {
            program: "/nonexistent/handoff-server".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .into())
    }
}
