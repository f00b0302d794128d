//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGHUP, SIGTERM and SIGINT
//! - Translate them into [`ControlEvent`]s on a channel
//!
//! # Design Decisions
//! - Business logic never touches OS signals; it consumes the channel, so tests
//!   inject events directly
//! - SIGHUP means "upgrade", never "shutdown"
//! - A full channel drops the event with a warning instead of blocking the handler

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the control channel.
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// An operator request delivered to a running generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Spawn a successor and hand over the listeners.
    Upgrade,
    /// Drain and exit. Carries the signal name for logs.
    Shutdown(&'static str),
}

/// Create a control channel for manual event injection.
pub fn control_channel() -> (mpsc::Sender<ControlEvent>, mpsc::Receiver<ControlEvent>) {
    mpsc::channel(CONTROL_CHANNEL_CAPACITY)
}

/// Install signal handlers and forward them as [`ControlEvent`]s.
///
/// Must be called from inside a Tokio runtime. The returned task ends once the
/// receiver is dropped.
pub fn listen() -> io::Result<(mpsc::Receiver<ControlEvent>, JoinHandle<()>)> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let (tx, rx) = control_channel();

    let task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = hangup.recv() => ControlEvent::Upgrade,
                Some(()) = terminate.recv() => ControlEvent::Shutdown("SIGTERM"),
                Some(()) = interrupt.recv() => ControlEvent::Shutdown("SIGINT"),
                else => break,
            };

            tracing::info!(event = ?event, "Signal received");

            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tracing::warn!(event = ?event, "Control channel full, dropping signal");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        tracing::debug!("Signal listener stopped");
    });

    Ok((rx, task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_channel_delivers_in_order() {
        let (tx, mut rx) = control_channel();
        tx.send(ControlEvent::Upgrade).await.unwrap();
        tx.send(ControlEvent::Shutdown("SIGTERM")).await.unwrap();

        assert_eq!(rx.recv().await, Some(ControlEvent::Upgrade));
        assert_eq!(rx.recv().await, Some(ControlEvent::Shutdown("SIGTERM")));
    }

    #[tokio::test]
    async fn listen_installs_handlers() {
        let (rx, task) = listen().unwrap();
        drop(rx);
        task.abort();
    }
}
