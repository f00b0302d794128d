//! Zero-downtime upgrades through listener handoff.
//!
//! # Responsibilities
//! - Keep a registry of named listening sockets for this generation
//! - Start a successor process that inherits those sockets
//! - Carry the successor's readiness back to its predecessor
//! - Tell the predecessor when to stop accepting and drain
//!
//! # Data Flow
//! ```text
//! SIGHUP → Coordinator::trigger_upgrade → Spawner (fork/exec + HANDOFF_* env)
//!                                              │
//!        successor: Coordinator::from_env → register → serve → mark_ready
//!                                              │ "ready\n" on the pipe
//! predecessor: wait_for_exit resolves (Upgraded) → drain → exit
//! ```

pub mod coordinator;
pub mod error;
pub mod inherit;
pub mod pidfile;
pub mod session;
pub mod spawn;

pub use coordinator::{Coordinator, GenerationState, UpgradeSettings, DEFAULT_READY_TIMEOUT};
pub use error::{HandoffError, InheritError, ReadyError, SpawnError, UpgradeError};
pub use inherit::{Inheritance, InheritedDescriptor, InheritedListeners, ReadyNotifier};
pub use pidfile::{read_pid_file, write_pid_file};
pub use session::{SessionOutcome, UpgradeSession};
pub use spawn::{ExecSpawner, ExecSuccessor, Handoff, Spawner, Successor};
