//! Shutdown coordination and the bounded drain window.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Exit code used when the drain window elapses or a forced exit is requested.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Default drain window before a generation is terminated uncleanly.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a generation (or a server) is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A successor reported ready and now owns the listeners.
    Upgraded,
    /// An OS termination signal arrived.
    Signal(&'static str),
    /// Shutdown was requested programmatically.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Upgraded => f.write_str("upgraded"),
            ShutdownReason::Signal(name) => write!(f, "signal {name}"),
            ShutdownReason::Requested => f.write_str("requested"),
        }
    }
}

/// Sends a one-shot shutdown reason to any number of subscribers.
///
/// Late subscribers still observe a reason triggered before they subscribed.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<Option<ShutdownReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger shutdown. Only the first reason sticks; returns whether this call set it.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    /// Wait for the shutdown reason. Resolves immediately if already triggered.
    ///
    /// If the [`Shutdown`] is dropped without triggering, this resolves with
    /// [`ShutdownReason::Requested`].
    pub async fn recv(&mut self) -> ShutdownReason {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::Requested),
            Err(_) => ShutdownReason::Requested,
        }
    }

    pub fn triggered(&self) -> Option<ShutdownReason> {
        *self.rx.borrow()
    }
}

/// The drain did not finish inside its window.
#[derive(Debug, Error)]
#[error("drain did not complete within {timeout:?}")]
pub struct DrainTimeoutError {
    pub timeout: Duration,
}

/// Run `drain` with a hard deadline.
///
/// Finishing early drops the timer with it, so nothing fires afterwards.
pub async fn drain_with_deadline<F>(timeout: Duration, drain: F) -> Result<F::Output, DrainTimeoutError>
where
    F: Future,
{
    tokio::time::timeout(timeout, drain)
        .await
        .map_err(|_| DrainTimeoutError { timeout })
}
