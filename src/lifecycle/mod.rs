//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Register listener → Start server → Reachable → mark_ready
//!
//! Signals (signals.rs):
//!     SIGHUP → ControlEvent::Upgrade → Coordinator::trigger_upgrade
//!     SIGTERM/SIGINT → ControlEvent::Shutdown → Coordinator::request_exit
//!
//! Shutdown (shutdown.rs):
//!     Exit decided → Stop accepting → Drain connections (deadline) → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: listener first, readiness only once reachable
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced exit after deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownReason, ShutdownSignal};
pub use signals::ControlEvent;
pub use startup::{run_generation, GenerationExit, StartupError};
