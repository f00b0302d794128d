//! Minimal HTTP server with zero-downtime binary upgrades.
//!
//! A running process hands its listening sockets to a freshly spawned
//! successor, waits for the successor to report ready, then drains and exits.
//! No connection attempt is refused during the switch.
//!
//! # Architecture Overview
//!
//! ```text
//!   generation N                                   generation N+1
//!  ┌───────────────────────────────┐             ┌───────────────────────────────┐
//!  │ lifecycle::signals  (SIGHUP)  │             │ Coordinator::from_env         │
//!  │        │                      │  fork/exec  │   (HANDOFF_LISTENERS,         │
//!  │        ▼                      │  + fds      │    HANDOFF_READY_FD)          │
//!  │ upgrade::Coordinator ─────────┼────────────▶│        │ register (reuse fd)  │
//!  │   registry of listeners       │             │        ▼                      │
//!  │        │ lend dup             │             │ http::GracefulServer          │
//!  │        ▼                      │  "ready\n"  │        │ reachable            │
//!  │ http::GracefulServer ◀────────┼─────────────┤ Coordinator::mark_ready       │
//!  │   drain → exit 0              │             │                               │
//!  └───────────────────────────────┘             └───────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod upgrade;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ServerConfig;
pub use http::GracefulServer;
pub use lifecycle::{run_generation, GenerationExit, Shutdown};
pub use upgrade::Coordinator;
