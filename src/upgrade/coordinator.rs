//! The upgrade coordinator: listener registry plus the readiness/exit handshake.
//!
//! # State Machine (per process generation)
//! ```text
//! Registering ──mark_ready──▶ Serving ──trigger_upgrade──▶ Upgrading
//!                                ▲                             │
//!                                └──────── upgrade failed ─────┤
//!                                                              ▼
//!            request_exit ──────────────────────────────▶ Draining ──stop──▶ Exited
//! ```
//!
//! # Design Decisions
//! - One coordinator per process, passed around explicitly (`Arc<Coordinator>`)
//! - Listener sources are tried in order: inherited first, fresh bind last
//! - A single-permit semaphore guarantees at most one upgrade in flight
//! - Exit is published through a [`Shutdown`] so waiters never poll
//! - A failed upgrade never touches the registered listeners

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};

use crate::lifecycle::shutdown::{Shutdown, ShutdownReason};
use crate::net::listener::{
    BindError, FreshBind, ListenerHandle, ListenerSource, ListenerSpec, Network,
};
use crate::upgrade::error::{HandoffError, InheritError, ReadyError, UpgradeError};
use crate::upgrade::inherit::{Inheritance, InheritedDescriptor, ReadyNotifier};
use crate::upgrade::pidfile::write_pid_file;
use crate::upgrade::session::UpgradeSession;
use crate::upgrade::spawn::{Handoff, Spawner};

/// Default time a successor gets to report ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Protocol state of this process generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GenerationState {
    Registering,
    Serving,
    Upgrading,
    Draining,
    Exited,
}

/// Tunables for the upgrade protocol.
#[derive(Debug, Clone)]
pub struct UpgradeSettings {
    pub ready_timeout: Duration,
    pub pid_file: Option<PathBuf>,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            pid_file: None,
        }
    }
}

struct Registered {
    spec: ListenerSpec,
    listener: TcpListener,
}

impl Registered {
    fn handle(&self) -> Result<ListenerHandle, BindError> {
        let io_err = |source| BindError::Io {
            address: self.spec.address.clone(),
            source,
        };
        let dup = self.listener.try_clone().map_err(io_err)?;
        ListenerHandle::new(self.spec.clone(), dup).map_err(io_err)
    }
}

struct Registry {
    listeners: BTreeMap<String, Registered>,
    sources: Vec<Box<dyn ListenerSource>>,
    closed: bool,
}

impl Registry {
    fn owner_of(&self, spec: &ListenerSpec) -> Option<&str> {
        self.listeners
            .values()
            .find(|r| r.spec.same_socket(spec))
            .map(|r| r.spec.name.as_str())
    }

    fn acquire(&mut self, spec: &ListenerSpec) -> Result<TcpListener, BindError> {
        for source in &mut self.sources {
            if let Some(listener) = source.acquire(spec)? {
                tracing::debug!(name = %spec.name, source = source.kind(), "Listener acquired");
                return Ok(listener);
            }
        }
        Err(BindError::Unavailable {
            name: spec.name.clone(),
            address: spec.address.clone(),
        })
    }

    fn release_unclaimed(&mut self) {
        for source in &mut self.sources {
            source.release_unclaimed();
        }
    }
}

/// Owns this generation's listeners and drives upgrades to a successor.
pub struct Coordinator {
    registry: Mutex<Registry>,
    spawner: Box<dyn Spawner>,
    ready_notifier: Mutex<Option<ReadyNotifier>>,
    successor: bool,
    parent_pid: Option<u32>,
    settings: UpgradeSettings,
    upgrade_slot: Semaphore,
    state: watch::Sender<GenerationState>,
    exit: Shutdown,
    last_session: Mutex<Option<UpgradeSession>>,
}

impl Coordinator {
    /// Build a coordinator from explicit parts.
    ///
    /// `inheritance` is `Some` when this process is a successor; its listeners
    /// are consulted before `fresh`.
    pub fn new(
        settings: UpgradeSettings,
        fresh: Box<dyn ListenerSource>,
        inheritance: Option<Inheritance>,
        spawner: Box<dyn Spawner>,
    ) -> Self {
        let mut sources: Vec<Box<dyn ListenerSource>> = Vec::with_capacity(2);
        let (ready_notifier, parent_pid, successor) = match inheritance {
            Some(inheritance) => {
                let (listeners, ready, parent_pid) = inheritance.into_parts();
                sources.push(Box::new(listeners));
                (Some(ready), parent_pid, true)
            }
            None => (None, None, false),
        };
        sources.push(fresh);

        let (state, _) = watch::channel(GenerationState::Registering);

        Self {
            registry: Mutex::new(Registry {
                listeners: BTreeMap::new(),
                sources,
                closed: false,
            }),
            spawner,
            ready_notifier: Mutex::new(ready_notifier),
            successor,
            parent_pid,
            settings,
            upgrade_slot: Semaphore::new(1),
            state,
            exit: Shutdown::new(),
            last_session: Mutex::new(None),
        }
    }

    /// Build a coordinator for this process, inheriting from the environment
    /// when started as a successor.
    pub fn from_env(
        settings: UpgradeSettings,
        backlog: i32,
        spawner: Box<dyn Spawner>,
    ) -> Result<Self, InheritError> {
        let inheritance = Inheritance::from_env()?;
        if let Some(inheritance) = &inheritance {
            tracing::info!(
                parent_pid = inheritance.parent_pid(),
                listeners = ?inheritance.listeners().names(),
                "Started as successor"
            );
        }
        Ok(Self::new(
            settings,
            Box::new(FreshBind::new(backlog)),
            inheritance,
            spawner,
        ))
    }

    /// Whether this process was started by a predecessor.
    pub fn is_successor(&self) -> bool {
        self.successor
    }

    pub fn parent_pid(&self) -> Option<u32> {
        self.parent_pid
    }

    pub fn state(&self) -> GenerationState {
        *self.state.borrow()
    }

    /// Watch protocol state changes.
    pub fn state_changes(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    /// The most recent upgrade attempt, finished or not.
    pub fn last_session(&self) -> Option<UpgradeSession> {
        lock(&self.last_session).clone()
    }

    /// Names and local addresses of every registered listener.
    pub fn listeners(&self) -> Vec<(String, std::net::SocketAddr)> {
        lock(&self.registry)
            .listeners
            .values()
            .filter_map(|r| Some((r.spec.name.clone(), r.listener.local_addr().ok()?)))
            .collect()
    }

    /// Get a listener by name: inherited if the predecessor passed one,
    /// otherwise freshly bound. Repeated calls reuse the registered socket.
    pub fn register(
        &self,
        name: &str,
        network: Network,
        address: &str,
    ) -> Result<ListenerHandle, BindError> {
        let spec = ListenerSpec::new(name, network, address);
        let mut registry = lock(&self.registry);

        if registry.closed {
            return Err(BindError::Closed);
        }

        if let Some(existing) = registry.listeners.get(name) {
            if !existing.spec.same_socket(&spec) {
                return Err(BindError::NameTaken {
                    name: name.to_string(),
                    address: existing.spec.address.clone(),
                });
            }
            tracing::debug!(name, address, "Listener already registered, lending duplicate");
            return existing.handle();
        }

        if let Some(owner) = registry.owner_of(&spec) {
            return Err(BindError::AddressTaken {
                address: address.to_string(),
                owner: owner.to_string(),
            });
        }

        let listener = registry.acquire(&spec)?;
        let registered = Registered { spec, listener };
        let handle = registered.handle()?;
        registry.listeners.insert(name.to_string(), registered);

        Ok(handle)
    }

    /// Report that this generation serves traffic.
    ///
    /// Writes the pid file, closes inherited listeners nobody claimed and, in a
    /// successor, tells the predecessor it may drain. Idempotent.
    pub fn mark_ready(&self) -> Result<(), ReadyError> {
        if self.state() >= GenerationState::Draining {
            return Err(ReadyError::Stopping);
        }

        lock(&self.registry).release_unclaimed();
        self.write_pid_file();

        let notifier = lock(&self.ready_notifier).take();
        let promoted = self.state.send_if_modified(|state| {
            if *state == GenerationState::Registering {
                *state = GenerationState::Serving;
                true
            } else {
                false
            }
        });

        if let Some(notifier) = notifier {
            notifier.notify().map_err(ReadyError::Notify)?;
            tracing::info!(parent_pid = self.parent_pid, "Readiness reported to predecessor");
        } else if promoted {
            tracing::info!("Generation ready");
        }

        Ok(())
    }

    /// Spawn a successor, hand it the listeners and wait for its readiness.
    ///
    /// On success this generation moves to `Draining` and [`wait_for_exit`]
    /// resolves with [`ShutdownReason::Upgraded`]. On failure it returns to
    /// `Serving` with its listeners untouched.
    ///
    /// [`wait_for_exit`]: Coordinator::wait_for_exit
    pub async fn trigger_upgrade(&self) -> Result<UpgradeSession, UpgradeError> {
        let _permit = self
            .upgrade_slot
            .try_acquire()
            .map_err(|_| UpgradeError::InProgress)?;

        let mut refused = None;
        self.state.send_if_modified(|state| match *state {
            GenerationState::Serving => {
                *state = GenerationState::Upgrading;
                true
            }
            GenerationState::Registering => {
                refused = Some(UpgradeError::NotReady);
                false
            }
            GenerationState::Upgrading => {
                refused = Some(UpgradeError::InProgress);
                false
            }
            GenerationState::Draining | GenerationState::Exited => {
                refused = Some(UpgradeError::Stopping);
                false
            }
        });
        if let Some(err) = refused {
            return Err(err);
        }

        let mut session = UpgradeSession::begin();
        *lock(&self.last_session) = Some(session.clone());
        tracing::info!("Upgrade triggered");

        let result = self.run_upgrade(&mut session).await;
        match &result {
            Ok(()) => {
                session.succeed();
                *lock(&self.last_session) = Some(session.clone());
                self.state.send_if_modified(|state| {
                    if *state < GenerationState::Draining {
                        *state = GenerationState::Draining;
                        true
                    } else {
                        false
                    }
                });
                self.exit.trigger(ShutdownReason::Upgraded);
                tracing::info!(
                    successor_pid = session.successor_pid(),
                    elapsed_ms = session.elapsed().as_millis() as u64,
                    "Upgrade succeeded, successor owns the listeners"
                );
            }
            Err(err) => {
                session.fail(err);
                self.state.send_if_modified(|state| {
                    if *state == GenerationState::Upgrading {
                        *state = GenerationState::Serving;
                        true
                    } else {
                        false
                    }
                });
                // The failed successor may have overwritten it.
                self.write_pid_file();
                *lock(&self.last_session) = Some(session.clone());
                tracing::warn!(
                    error = %err,
                    successor_pid = session.successor_pid(),
                    "Upgrade failed, continuing to serve"
                );
            }
        }

        result.map(|()| session)
    }

    async fn run_upgrade(&self, session: &mut UpgradeSession) -> Result<(), UpgradeError> {
        let handoff = self.prepare_handoff()?;
        let mut successor = self.spawner.spawn(&handoff)?;
        drop(handoff);

        session.attach_successor(successor.pid());
        *lock(&self.last_session) = Some(session.clone());

        let timeout = self.settings.ready_timeout;
        let outcome = match tokio::time::timeout(timeout, successor.ready()).await {
            Ok(result) => result,
            Err(_) => Err(UpgradeError::ReadyTimeout(timeout)),
        };

        if outcome.is_err() {
            successor.abort().await;
        }
        outcome
    }

    fn prepare_handoff(&self) -> Result<Handoff, HandoffError> {
        let registry = lock(&self.registry);
        let mut listeners = Vec::with_capacity(registry.listeners.len());

        for registered in registry.listeners.values() {
            let fd: OwnedFd = registered
                .listener
                .try_clone()
                .map_err(|source| HandoffError::Duplicate {
                    name: registered.spec.name.clone(),
                    source,
                })?
                .into();
            let descriptor = InheritedDescriptor {
                name: registered.spec.name.clone(),
                network: registered.spec.network,
                address: registered.spec.address.clone(),
                fd: -1,
            };
            listeners.push((descriptor, fd));
        }

        Ok(Handoff::new(listeners))
    }

    /// Ask this generation to terminate without upgrading.
    pub fn request_exit(&self, reason: ShutdownReason) {
        self.state.send_if_modified(|state| {
            if *state < GenerationState::Draining {
                *state = GenerationState::Draining;
                true
            } else {
                false
            }
        });
        if self.exit.trigger(reason) {
            tracing::info!(reason = %reason, "Exit requested");
        }
    }

    /// Wait until this generation must terminate.
    pub async fn wait_for_exit(&self) -> ShutdownReason {
        self.exit.subscribe().recv().await
    }

    /// The exit reason, if one has been decided.
    pub fn exit_reason(&self) -> Option<ShutdownReason> {
        self.exit.reason()
    }

    /// Close every descriptor this coordinator holds. Idempotent.
    pub fn stop(&self) {
        let mut registry = lock(&self.registry);
        if registry.closed {
            return;
        }
        registry.closed = true;
        let count = registry.listeners.len();
        registry.listeners.clear();
        registry.release_unclaimed();
        drop(registry);

        // A successor that never got ready lets its predecessor carry on.
        drop(lock(&self.ready_notifier).take());

        self.state.send_replace(GenerationState::Exited);
        tracing::debug!(listeners = count, "Coordinator stopped");
    }

    fn write_pid_file(&self) {
        let Some(path) = &self.settings.pid_file else {
            return;
        };
        if let Err(e) = write_pid_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write pid file");
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("successor", &self.successor)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
