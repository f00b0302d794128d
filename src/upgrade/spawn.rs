//! Successor process creation.
//!
//! # Responsibilities
//! - Build the inherited descriptor table for a successor
//! - Fork/exec the successor with those descriptors left open
//! - Wait for the successor's readiness message
//!
//! # Design Decisions
//! - [`Spawner`] and [`Successor`] are traits so the coordinator can be driven
//!   by fakes in tests
//! - The handoff owns `dup`s of the registered sockets; the registry itself is
//!   never touched by the child setup

use std::ffi::OsString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use crate::upgrade::error::{HandoffError, SpawnError, UpgradeError};
use crate::upgrade::inherit::{
    encode_descriptors, readiness_pipe, set_cloexec, InheritedDescriptor, LISTENERS_ENV,
    PARENT_PID_ENV, READY_FD_ENV, READY_MESSAGE,
};

/// Descriptors prepared for one successor. Dropping it closes the duplicates.
#[derive(Debug)]
pub struct Handoff {
    listeners: Vec<(InheritedDescriptor, OwnedFd)>,
}

impl Handoff {
    /// Build a handoff from owned duplicates of the registered sockets.
    pub fn new(listeners: impl IntoIterator<Item = (InheritedDescriptor, OwnedFd)>) -> Self {
        let listeners = listeners
            .into_iter()
            .map(|(mut descriptor, fd)| {
                descriptor.fd = fd.as_raw_fd();
                (descriptor, fd)
            })
            .collect();
        Self { listeners }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &InheritedDescriptor> {
        self.listeners.iter().map(|(descriptor, _)| descriptor)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn raw_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(|(_, fd)| fd.as_raw_fd()).collect()
    }

    fn encode(&self) -> Result<String, HandoffError> {
        let table: Vec<InheritedDescriptor> = self.descriptors().cloned().collect();
        encode_descriptors(&table)
    }
}

/// Creates successor processes.
pub trait Spawner: Send + Sync {
    /// Start a successor that inherits `handoff`. Must not block on readiness.
    fn spawn(&self, handoff: &Handoff) -> Result<Box<dyn Successor>, UpgradeError>;
}

/// A started successor that has not yet been confirmed ready.
#[async_trait]
pub trait Successor: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolve once the successor reports ready, or fail if it cannot.
    async fn ready(&mut self) -> Result<(), UpgradeError>;

    /// Give up on the successor and terminate it.
    async fn abort(&mut self);
}

/// Re-executes a binary (normally the current one) as the successor.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = OsString>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Spawn successors from the current executable with the current arguments.
    ///
    /// The path is captured now, before a deployment replaces the file on disk.
    pub fn current_process() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, std::env::args_os().skip(1)))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl Spawner for ExecSpawner {
    fn spawn(&self, handoff: &Handoff) -> Result<Box<dyn Successor>, UpgradeError> {
        let table = handoff.encode()?;
        let (read_end, write_end) = readiness_pipe().map_err(HandoffError::ReadyPipe)?;
        let ready = pipe::Receiver::from_owned_fd(read_end).map_err(HandoffError::ReadyPipe)?;

        let ready_fd = write_end.as_raw_fd();
        let mut inherited = handoff.raw_fds();
        inherited.push(ready_fd);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(LISTENERS_ENV, table)
            .env(READY_FD_ENV, ready_fd.to_string())
            .env(PARENT_PID_ENV, std::process::id().to_string());

        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                for fd in &inherited {
                    set_cloexec(*fd, false)?;
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| SpawnError {
            program: self.program.clone(),
            source,
        })?;

        // Only the child may hold the write end, so its exit shows up as EOF.
        drop(write_end);

        tracing::info!(
            program = %self.program.display(),
            pid = child.id(),
            listeners = handoff.len(),
            "Successor spawned"
        );

        Ok(Box::new(ExecSuccessor { child, ready }))
    }
}

/// A successor started by [`ExecSpawner`].
#[derive(Debug)]
pub struct ExecSuccessor {
    child: Child,
    ready: pipe::Receiver,
}

#[async_trait]
impl Successor for ExecSuccessor {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn ready(&mut self) -> Result<(), UpgradeError> {
        let mut message = [0u8; READY_MESSAGE.len()];
        match self.ready.read_exact(&mut message).await {
            Ok(_) if &message[..] == READY_MESSAGE => Ok(()),
            Ok(_) => Err(UpgradeError::BadReadyMessage),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let status = match self.child.wait().await {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("status unknown: {e}"),
                };
                Err(UpgradeError::SuccessorExited(status))
            }
            Err(e) => Err(UpgradeError::ReadyPipe(e)),
        }
    }

    async fn abort(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "Failed to kill successor");
            return;
        }
        match self.child.wait().await {
            Ok(status) => tracing::info!(status = %status, "Successor terminated"),
            Err(e) => tracing::warn!(error = %e, "Failed to reap successor"),
        }
    }
}
