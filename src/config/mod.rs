//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → CLI overrides applied in main, validated again
//!     → ServerConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a new config takes effect through an upgrade
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{HttpConfig, ListenerConfig, LogFormat, LoggingConfig, ServerConfig, UpgradeConfig};
pub use validation::{validate_config, ValidationError};
