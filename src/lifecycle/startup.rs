//! Running one process generation from listener registration to exit.
//!
//! # Responsibilities
//! - Register the configured listener with the coordinator
//! - Start the graceful server on it and report readiness once reachable
//! - Turn control events into upgrades and exit requests
//! - Drain within the deadline, or force the exit
//!
//! # Design Decisions
//! - Fail fast: a listener that cannot be registered is fatal
//! - Readiness is reported only after the accept loop is live
//! - Upgrades run on their own task so control events stay responsive
//! - Every exit path, including a failed accept loop, drains under the deadline
//! - A second termination signal during the drain forces the exit

use std::io;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::config::ServerConfig;
use crate::http::server::{AcceptError, GracefulServer, Milestone};
use crate::lifecycle::shutdown::{drain_with_deadline, Shutdown, ShutdownReason, FORCED_EXIT_CODE};
use crate::lifecycle::signals::ControlEvent;
use crate::net::listener::BindError;
use crate::upgrade::{Coordinator, UpgradeError, UpgradeSession};

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationExit {
    /// Drained in time after an upgrade or an exit request.
    Clean(ShutdownReason),
    /// In-flight connections outlived the drain deadline.
    DrainTimedOut,
    /// A second termination signal arrived during the drain.
    Forced,
    /// The server stopped accepting on its own (accept loop failure or panic)
    /// and drained within the deadline.
    ServeFailed,
}

impl GenerationExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            GenerationExit::Clean(_) => 0,
            _ => FORCED_EXIT_CODE,
        }
    }
}

/// The generation could not start serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to attach HTTP server to listener: {0}")]
    Attach(#[source] io::Error),

    #[error("HTTP server stopped before becoming reachable")]
    NeverReachable,
}

type ServerTask = JoinHandle<Result<ShutdownReason, AcceptError>>;
type UpgradeTask = JoinHandle<Result<UpgradeSession, UpgradeError>>;

enum Supervision {
    Exit(ShutdownReason),
    AcceptStopped,
}

/// Serve `router` on the configured listener until this generation exits.
///
/// The coordinator is stopped before returning, whatever the outcome.
pub async fn run_generation(
    config: &ServerConfig,
    coordinator: Arc<Coordinator>,
    router: Router,
    events: mpsc::Receiver<ControlEvent>,
) -> Result<GenerationExit, StartupError> {
    let result = serve_generation(config, &coordinator, router, events).await;
    coordinator.stop();
    result
}

async fn serve_generation(
    config: &ServerConfig,
    coordinator: &Arc<Coordinator>,
    router: Router,
    mut events: mpsc::Receiver<ControlEvent>,
) -> Result<GenerationExit, StartupError> {
    let listener = &config.listener;
    let handle = coordinator.register(&listener.name, listener.network, &listener.address)?;
    tracing::info!(
        name = handle.name(),
        address = %handle.local_addr(),
        successor = coordinator.is_successor(),
        "Listener registered"
    );

    let server =
        GracefulServer::configure(handle.into_listener(), router).map_err(StartupError::Attach)?;
    let reachable = server.became_reachable();
    let accept_stopped = server.stopped_accepting();
    let stopped = server.fully_stopped();
    let connections = server.connections();

    let shutdown = Shutdown::new();
    let mut server_task: ServerTask = tokio::spawn(server.run(shutdown.subscribe()));

    if !reachable.wait().await {
        return Err(StartupError::NeverReachable);
    }
    if let Err(e) = coordinator.mark_ready() {
        tracing::warn!(error = %e, "Failed to report readiness");
    }

    let reason = match supervise(coordinator, accept_stopped, &mut events).await {
        Supervision::Exit(reason) => Some(reason),
        Supervision::AcceptStopped => None,
    };

    let drain_timeout = config.upgrade.drain_timeout();
    match reason {
        Some(reason) => {
            tracing::info!(
                reason = %reason,
                drain_timeout_secs = drain_timeout.as_secs(),
                active_connections = connections.active_count(),
                "Generation exiting, draining"
            );
            shutdown.trigger(reason);
        }
        None => tracing::error!(
            drain_timeout_secs = drain_timeout.as_secs(),
            active_connections = connections.active_count(),
            "HTTP server stopped accepting, draining"
        ),
    }

    let drain = drain_with_deadline(drain_timeout, async {
        let joined = (&mut server_task).await;
        stopped.wait().await;
        joined
    });

    let exit = tokio::select! {
        drained = drain => match (drained, reason) {
            (Ok(Ok(Ok(_))), Some(reason)) => {
                tracing::info!(reason = %reason, "Drain complete");
                GenerationExit::Clean(reason)
            }
            (Ok(Ok(Ok(stopped_for))), None) => {
                tracing::error!(reason = %stopped_for, "HTTP server stopped unexpectedly");
                GenerationExit::ServeFailed
            }
            (Ok(Ok(Err(e))), _) => {
                tracing::error!(error = %e, "HTTP server failed");
                GenerationExit::ServeFailed
            }
            (Ok(Err(e)), _) => {
                tracing::error!(error = %e, "HTTP server task panicked");
                GenerationExit::ServeFailed
            }
            (Err(e), _) => {
                tracing::error!(
                    error = %e,
                    active_connections = connections.active_count(),
                    "Drain deadline exceeded, forcing exit"
                );
                server_task.abort();
                GenerationExit::DrainTimedOut
            }
        },
        signal = next_termination(&mut events) => {
            tracing::warn!(
                signal,
                active_connections = connections.active_count(),
                "Second termination signal while draining, forcing exit"
            );
            server_task.abort();
            GenerationExit::Forced
        }
    };

    Ok(exit)
}

/// Handle control events until the generation must exit or the server stops
/// accepting on its own.
async fn supervise(
    coordinator: &Arc<Coordinator>,
    accept_stopped: Milestone,
    events: &mut mpsc::Receiver<ControlEvent>,
) -> Supervision {
    let accept_stopped = accept_stopped.wait();
    tokio::pin!(accept_stopped);
    let mut upgrade: Option<UpgradeTask> = None;
    let mut events_open = true;

    loop {
        tokio::select! {
            biased;

            reason = coordinator.wait_for_exit() => return Supervision::Exit(reason),

            _ = &mut accept_stopped => return Supervision::AcceptStopped,

            joined = join_upgrade(&mut upgrade) => {
                upgrade = None;
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Upgrade task panicked");
                }
            }

            event = events.recv(), if events_open => match event {
                Some(ControlEvent::Upgrade) if upgrade.is_some() => {
                    tracing::warn!("Upgrade already in progress, ignoring request");
                }
                Some(ControlEvent::Upgrade) => {
                    let coordinator = Arc::clone(coordinator);
                    upgrade = Some(tokio::spawn(async move { coordinator.trigger_upgrade().await }));
                }
                Some(ControlEvent::Shutdown(signal)) => {
                    coordinator.request_exit(ShutdownReason::Signal(signal));
                }
                None => {
                    tracing::debug!("Control channel closed");
                    events_open = false;
                }
            },
        }
    }
}

async fn join_upgrade(task: &mut Option<UpgradeTask>) -> Result<(), JoinError> {
    match task {
        Some(handle) => handle.await.map(|_| ()),
        None => std::future::pending().await,
    }
}

/// Resolve with the next termination signal, ignoring anything else.
async fn next_termination(events: &mut mpsc::Receiver<ControlEvent>) -> &'static str {
    while let Some(event) = events.recv().await {
        match event {
            ControlEvent::Shutdown(signal) => return signal,
            ControlEvent::Upgrade => tracing::warn!("Ignoring upgrade request while draining"),
        }
    }
    std::future::pending().await
}
