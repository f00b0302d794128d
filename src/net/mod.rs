//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerSpec (name, network, address)
//!     → listener.rs (inherited descriptor or fresh bind)
//!     → ListenerHandle lent to the HTTP server
//!     → connection.rs (per-connection IDs, live count for drain)
//! ```
//!
//! # Design Decisions
//! - Sockets are bound once per upgrade chain and passed on afterwards
//! - Each connection is tracked so a drain can wait for it

pub mod connection;
pub mod listener;

pub use listener::{BindError, FreshBind, ListenerHandle, ListenerSource, ListenerSpec, Network};
