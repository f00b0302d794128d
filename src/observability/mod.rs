//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (pid, listener, successor pid)
//!     → request spans carrying the request ID (tower-http TraceLayer)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, pretty or JSON)
//! ```

pub mod logging;

pub use logging::{init_logging, LoggingError};
