//! Graceful HTTP server over a lent listener.
//!
//! # Responsibilities
//! - Attach an axum `Router` to a listener created elsewhere
//! - Accept connections and serve HTTP/1.1 and HTTP/2 on each
//! - Stop accepting on shutdown and let in-flight connections finish
//! - Publish "became reachable" and "fully stopped" milestones
//!
//! # Design Decisions
//! - The server never creates sockets; the upgrade coordinator owns them
//! - Lifecycle is a forward-only `watch` value; milestones are views onto it
//! - Each connection is told to shut down gracefully through a shared drain flag
//! - Transient accept errors are skipped, descriptor exhaustion backs off

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::ServiceExt;

use crate::lifecycle::shutdown::{ShutdownReason, ShutdownSignal};
use crate::net::connection::{ConnectionGuard, ConnectionTracker};

/// Pause after the process runs out of descriptors or buffers.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle of a server. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerLifecycleState {
    Starting,
    Running,
    Draining,
    Closed,
}

/// The accept loop hit an error it cannot recover from.
#[derive(Debug, Error)]
#[error("accept failed on {address}: {source}")]
pub struct AcceptError {
    pub address: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// A one-shot point in the server lifecycle that can be awaited.
#[derive(Debug, Clone)]
pub struct Milestone {
    rx: watch::Receiver<ServerLifecycleState>,
    target: ServerLifecycleState,
}

impl Milestone {
    /// Resolve once the server has reached the milestone.
    ///
    /// Returns `false` if the server was dropped without ever getting there.
    pub async fn wait(mut self) -> bool {
        let target = self.target;
        self.rx.wait_for(|state| *state >= target).await.is_ok()
    }

    /// Whether the milestone has already been passed.
    pub fn reached(&self) -> bool {
        *self.rx.borrow() >= self.target
    }
}

/// HTTP server bound to a listener it did not create.
pub struct GracefulServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
    state: watch::Sender<ServerLifecycleState>,
    connections: ConnectionTracker,
}

impl GracefulServer {
    /// Attach `router` to an already-listening socket.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn configure(listener: std::net::TcpListener, router: Router) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        let (state, _) = watch::channel(ServerLifecycleState::Starting);

        Ok(Self {
            listener,
            router,
            local_addr,
            state,
            connections: ConnectionTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fires when the accept loop is about to start.
    pub fn became_reachable(&self) -> Milestone {
        self.milestone(ServerLifecycleState::Running)
    }

    /// Fires once the accept loop has ended, for whatever reason.
    pub fn stopped_accepting(&self) -> Milestone {
        self.milestone(ServerLifecycleState::Draining)
    }

    /// Fires after shutdown completed and every connection is gone.
    pub fn fully_stopped(&self) -> Milestone {
        self.milestone(ServerLifecycleState::Closed)
    }

    pub fn lifecycle(&self) -> watch::Receiver<ServerLifecycleState> {
        self.state.subscribe()
    }

    /// Live connection tracker, usable after `run` took the server.
    pub fn connections(&self) -> ConnectionTracker {
        self.connections.clone()
    }

    fn milestone(&self, target: ServerLifecycleState) -> Milestone {
        Milestone {
            rx: self.state.subscribe(),
            target,
        }
    }

    /// Serve until `shutdown` fires or accepting fails, then drain.
    ///
    /// Returns the shutdown reason after a graceful stop. Either way the
    /// listener is closed and in-flight connections have finished when this
    /// returns.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<ShutdownReason, AcceptError> {
        let Self {
            listener,
            router,
            local_addr,
            state,
            connections,
        } = self;

        advance(&state, ServerLifecycleState::Running);
        tracing::info!(address = %local_addr, "HTTP server accepting connections");

        let (drain_tx, drain_rx) = watch::channel(false);

        let outcome = loop {
            tokio::select! {
                biased;

                reason = shutdown.recv() => break Ok(reason),

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_connection(stream, peer, router.clone(), connections.track(), drain_rx.clone());
                    }
                    Err(e) if is_connection_error(&e) => {
                        tracing::debug!(error = %e, "Connection failed before accept, skipping");
                    }
                    Err(e) if is_resource_exhaustion(&e) => {
                        tracing::error!(
                            error = %e,
                            backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                            "Out of resources while accepting, backing off"
                        );
                        tokio::select! {
                            biased;
                            reason = shutdown.recv() => break Ok(reason),
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                    Err(source) => {
                        tracing::error!(address = %local_addr, error = %source, "Accept loop failed");
                        break Err(AcceptError { address: local_addr, source });
                    }
                },
            }
        };

        advance(&state, ServerLifecycleState::Draining);
        drop(listener);
        let _ = drain_tx.send(true);

        tracing::info!(
            address = %local_addr,
            active_connections = connections.active_count(),
            "Stopped accepting, draining connections"
        );
        connections.wait_idle().await;

        advance(&state, ServerLifecycleState::Closed);
        tracing::info!(address = %local_addr, "HTTP server stopped");

        outcome
    }
}

impl std::fmt::Debug for GracefulServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulServer")
            .field("local_addr", &self.local_addr)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

fn advance(state: &watch::Sender<ServerLifecycleState>, next: ServerLifecycleState) {
    state.send_if_modified(|current| {
        if *current < next {
            *current = next;
            true
        } else {
            false
        }
    });
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    guard: ConnectionGuard,
    mut drain: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let id = guard.id();
        let _ = stream.set_nodelay(true);
        tracing::trace!(connection = %id, peer = %peer, "Connection accepted");

        let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
            router.clone().oneshot(request)
        });
        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let mut draining = *drain.borrow_and_update();
        if draining {
            conn.as_mut().graceful_shutdown();
        }

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(connection = %id, peer = %peer, error = %e, "Connection ended with error");
                    }
                    break;
                }
                _ = drain.changed(), if !draining => {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }

        drop(guard);
    });
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::shutdown::Shutdown;
    use axum::routing::get;

    fn server() -> GracefulServer {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        GracefulServer::configure(listener, Router::new().route("/", get(|| async { "OK" }))).unwrap()
    }

    #[tokio::test]
    async fn pre_triggered_shutdown_walks_every_state() {
        let server = server();
        let mut lifecycle = server.lifecycle();
        let reachable = server.became_reachable();
        let stopped = server.fully_stopped();
        assert!(!reachable.reached());

        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownReason::Requested);

        let reason = server.run(shutdown.subscribe()).await.unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
        assert!(reachable.clone().wait().await);
        assert!(stopped.wait().await);
        assert_eq!(*lifecycle.borrow_and_update(), ServerLifecycleState::Closed);
    }

    #[tokio::test]
    async fn dropped_server_never_reaches_milestones() {
        let server = server();
        let reachable = server.became_reachable();
        drop(server);
        assert!(!reachable.wait().await);
    }

    #[test]
    fn lifecycle_never_moves_backwards() {
        let (state, _rx) = watch::channel(ServerLifecycleState::Starting);
        advance(&state, ServerLifecycleState::Draining);
        advance(&state, ServerLifecycleState::Running);
        assert_eq!(*state.borrow(), ServerLifecycleState::Draining);
    }

    #[test]
    fn accept_error_classification() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_connection_error(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(libc::EBADF)));
    }
}
