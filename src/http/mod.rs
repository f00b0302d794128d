//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! lent TCP listener
//!     → server.rs (accept loop, hyper-util auto HTTP/1.1 + HTTP/2, drain)
//!     → routes.rs (request ID, timeout, tracing layers)
//!     → GET / → "OK"
//! ```

pub mod request;
pub mod routes;
pub mod server;

pub use request::X_REQUEST_ID;
pub use routes::build_router;
pub use server::{AcceptError, GracefulServer, Milestone, ServerLifecycleState};
