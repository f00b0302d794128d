//! Descriptor inheritance between process generations.
//!
//! # Wire Contract
//! ```text
//! HANDOFF_LISTENERS  = [{"name":"http","network":"tcp","address":"127.0.0.1:8080","fd":5}]
//! HANDOFF_READY_FD   = 7      write end of the readiness pipe
//! HANDOFF_PARENT_PID = 4242   predecessor pid, informational
//! ```
//!
//! The predecessor clears `FD_CLOEXEC` on the listed descriptors between fork
//! and exec, so they keep their numbers in the successor. The successor sets
//! `FD_CLOEXEC` again when it adopts them, and reports readiness by writing
//! [`READY_MESSAGE`] to the pipe and closing it.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Write};
use std::net::TcpListener;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};

use crate::net::listener::{BindError, ListenerSource, ListenerSpec, Network};
use crate::upgrade::error::{HandoffError, InheritError};

pub const LISTENERS_ENV: &str = "HANDOFF_LISTENERS";
pub const READY_FD_ENV: &str = "HANDOFF_READY_FD";
pub const PARENT_PID_ENV: &str = "HANDOFF_PARENT_PID";

/// Bytes a successor writes once it serves traffic.
pub const READY_MESSAGE: &[u8] = b"ready\n";

/// One entry of the inherited descriptor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritedDescriptor {
    pub name: String,
    pub network: Network,
    pub address: String,
    pub fd: RawFd,
}

impl InheritedDescriptor {
    pub fn spec(&self) -> ListenerSpec {
        ListenerSpec::new(self.name.clone(), self.network, self.address.clone())
    }
}

pub fn encode_descriptors(descriptors: &[InheritedDescriptor]) -> Result<String, HandoffError> {
    Ok(serde_json::to_string(descriptors)?)
}

/// Parse and sanity-check a descriptor table. Does not touch the descriptors.
pub fn decode_descriptors(raw: &str) -> Result<Vec<InheritedDescriptor>, InheritError> {
    let malformed = |reason: String| InheritError::Malformed {
        var: LISTENERS_ENV,
        reason,
    };

    let descriptors: Vec<InheritedDescriptor> =
        serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;

    let mut names = HashSet::new();
    let mut fds = HashSet::new();
    for descriptor in &descriptors {
        if descriptor.fd <= 2 {
            return Err(malformed(format!(
                "descriptor {} for '{}' collides with stdio",
                descriptor.fd, descriptor.name
            )));
        }
        if !names.insert(descriptor.name.as_str()) {
            return Err(malformed(format!("duplicate listener '{}'", descriptor.name)));
        }
        if !fds.insert(descriptor.fd) {
            return Err(malformed(format!("descriptor {} listed twice", descriptor.fd)));
        }
    }

    Ok(descriptors)
}

/// Set or clear `FD_CLOEXEC` on a raw descriptor.
///
/// Only calls `fcntl`, so it is safe to use between fork and exec.
pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    // SAFETY: fcntl on an integer descriptor does not touch process memory.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create the readiness pipe as `(read end, write end)`, both close-on-exec.
pub fn readiness_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe(2).
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(fds[0], true)?;
    set_cloexec(fds[1], true)?;
    Ok((read, write))
}

/// Write end of the readiness pipe held by a successor.
#[derive(Debug)]
pub struct ReadyNotifier {
    pipe: File,
}

impl ReadyNotifier {
    pub fn new(pipe: impl Into<File>) -> Self {
        Self { pipe: pipe.into() }
    }

    /// Tell the predecessor this generation serves traffic. Closes the pipe.
    pub fn notify(mut self) -> io::Result<()> {
        self.pipe.write_all(READY_MESSAGE)?;
        self.pipe.flush()
    }
}

/// Listeners passed down by the predecessor, claimable by name.
#[derive(Debug, Default)]
pub struct InheritedListeners {
    available: HashMap<String, (ListenerSpec, TcpListener)>,
}

impl InheritedListeners {
    pub fn new(listeners: impl IntoIterator<Item = (ListenerSpec, TcpListener)>) -> Self {
        let available = listeners
            .into_iter()
            .map(|(spec, listener)| (spec.name.clone(), (spec, listener)))
            .collect();
        Self { available }
    }

    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.available.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ListenerSource for InheritedListeners {
    fn acquire(&mut self, spec: &ListenerSpec) -> Result<Option<TcpListener>, BindError> {
        let Some((inherited, listener)) = self.available.remove(&spec.name) else {
            return Ok(None);
        };

        if inherited.same_socket(spec) {
            tracing::info!(
                name = %spec.name,
                address = %spec.address,
                "Reusing inherited listener"
            );
            Ok(Some(listener))
        } else {
            tracing::warn!(
                name = %spec.name,
                inherited = %inherited.address,
                requested = %spec.address,
                "Inherited listener does not match configuration, closing it"
            );
            Ok(None)
        }
    }

    fn release_unclaimed(&mut self) {
        for (name, (spec, _listener)) in self.available.drain() {
            tracing::info!(name = %name, address = %spec.address, "Closing unclaimed inherited listener");
        }
    }

    fn kind(&self) -> &'static str {
        "inherited"
    }
}

/// Everything a successor receives from its predecessor.
#[derive(Debug)]
pub struct Inheritance {
    listeners: InheritedListeners,
    ready: ReadyNotifier,
    parent_pid: Option<u32>,
}

impl Inheritance {
    pub fn new(listeners: InheritedListeners, ready: ReadyNotifier, parent_pid: Option<u32>) -> Self {
        Self {
            listeners,
            ready,
            parent_pid,
        }
    }

    /// Read the inheritance left in this process's environment.
    ///
    /// Returns `Ok(None)` for a root process. Call once, at startup: the
    /// descriptors are adopted and owned by the returned value.
    pub fn from_env() -> Result<Option<Self>, InheritError> {
        // SAFETY: the predecessor placed these descriptors in the environment
        // for this process, and nothing else here has claimed them yet.
        unsafe { Self::from_lookup(|key| std::env::var(key).ok()) }
    }

    /// Read the inheritance through `lookup` instead of the process environment.
    ///
    /// # Safety
    /// Every descriptor named by the lookup must be open, owned by nobody else
    /// in this process, and the listener entries must be listening sockets.
    pub unsafe fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, InheritError> {
        let Some(raw) = lookup(LISTENERS_ENV) else {
            return Ok(None);
        };
        let descriptors = decode_descriptors(&raw)?;

        let ready_fd: RawFd = lookup(READY_FD_ENV)
            .ok_or(InheritError::MissingReadyFd)?
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| InheritError::Malformed {
                var: READY_FD_ENV,
                reason: e.to_string(),
            })?;
        if ready_fd <= 2 || descriptors.iter().any(|d| d.fd == ready_fd) {
            return Err(InheritError::Malformed {
                var: READY_FD_ENV,
                reason: format!("descriptor {ready_fd} is reserved"),
            });
        }

        let parent_pid = lookup(PARENT_PID_ENV).and_then(|pid| pid.trim().parse().ok());

        // Check everything before adopting anything.
        for descriptor in &descriptors {
            set_cloexec(descriptor.fd, true).map_err(|source| InheritError::Descriptor {
                name: descriptor.name.clone(),
                fd: descriptor.fd,
                source,
            })?;
        }
        set_cloexec(ready_fd, true).map_err(|source| InheritError::Descriptor {
            name: "readiness pipe".into(),
            fd: ready_fd,
            source,
        })?;

        // SAFETY: guaranteed by the caller; each descriptor is adopted exactly once.
        let ready = ReadyNotifier::new(unsafe { File::from_raw_fd(ready_fd) });

        let mut listeners = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            // SAFETY: guaranteed by the caller; each descriptor is adopted exactly once.
            let listener = unsafe { TcpListener::from_raw_fd(descriptor.fd) };
            if let Err(source) = listener.local_addr() {
                return Err(InheritError::Descriptor {
                    name: descriptor.name,
                    fd: descriptor.fd,
                    source,
                });
            }
            listeners.push((descriptor.spec(), listener));
        }

        Ok(Some(Self {
            listeners: InheritedListeners::new(listeners),
            ready,
            parent_pid,
        }))
    }

    pub fn parent_pid(&self) -> Option<u32> {
        self.parent_pid
    }

    pub fn listeners(&self) -> &InheritedListeners {
        &self.listeners
    }

    pub(crate) fn into_parts(self) -> (InheritedListeners, ReadyNotifier, Option<u32>) {
        (self.listeners, self.ready, self.parent_pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn descriptor(name: &str, fd: RawFd) -> InheritedDescriptor {
        InheritedDescriptor {
            name: name.into(),
            network: Network::Tcp,
            address: "127.0.0.1:8080".into(),
            fd,
        }
    }

    fn cloexec_is_set(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags != -1 && flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn table_encodes_as_json_array() {
        let encoded = encode_descriptors(&[descriptor("http", 5)]).unwrap();
        assert_eq!(
            encoded,
            r#"[{"name":"http","network":"tcp","address":"127.0.0.1:8080","fd":5}]"#
        );
        assert_eq!(decode_descriptors(&encoded).unwrap(), vec![descriptor("http", 5)]);
    }

    #[test]
    fn table_rejects_stdio_and_duplicates() {
        let stdio = encode_descriptors(&[descriptor("http", 1)]).unwrap();
        assert!(matches!(decode_descriptors(&stdio), Err(InheritError::Malformed { .. })));

        let dup_fd = encode_descriptors(&[descriptor("a", 5), descriptor("b", 5)]).unwrap();
        assert!(matches!(decode_descriptors(&dup_fd), Err(InheritError::Malformed { .. })));

        let dup_name = encode_descriptors(&[descriptor("a", 5), descriptor("a", 6)]).unwrap();
        assert!(matches!(decode_descriptors(&dup_name), Err(InheritError::Malformed { .. })));

        assert!(matches!(decode_descriptors("{nope"), Err(InheritError::Malformed { .. })));
    }

    #[test]
    fn root_process_has_no_inheritance() {
        let inherited = unsafe { Inheritance::from_lookup(|_| None) }.unwrap();
        assert!(inherited.is_none());
    }

    #[test]
    fn listeners_without_ready_fd_are_rejected() {
        let table = encode_descriptors(&[descriptor("http", 1000)]).unwrap();
        let err = unsafe {
            Inheritance::from_lookup(|key| (key == LISTENERS_ENV).then(|| table.clone()))
        }
        .unwrap_err();
        assert!(matches!(err, InheritError::MissingReadyFd));
    }

    #[test]
    fn closed_descriptor_is_rejected() {
        let table = encode_descriptors(&[descriptor("http", 1000)]).unwrap();
        let err = unsafe {
            Inheritance::from_lookup(|key| match key {
                LISTENERS_ENV => Some(table.clone()),
                READY_FD_ENV => Some("1001".into()),
                _ => None,
            })
        }
        .unwrap_err();
        assert!(matches!(err, InheritError::Descriptor { fd: 1000, .. }), "got {err:?}");
    }

    #[test]
    fn adopts_listeners_and_ready_pipe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let listener_fd = listener.into_raw_fd();
        set_cloexec(listener_fd, false).unwrap();

        let (mut read_end, write_end) = {
            let (read, write) = readiness_pipe().unwrap();
            (File::from(read), write.into_raw_fd())
        };

        let table = encode_descriptors(&[InheritedDescriptor {
            name: "http".into(),
            network: Network::Tcp,
            address: address.to_string(),
            fd: listener_fd,
        }])
        .unwrap();

        let inheritance = unsafe {
            Inheritance::from_lookup(|key| match key {
                LISTENERS_ENV => Some(table.clone()),
                READY_FD_ENV => Some(write_end.to_string()),
                PARENT_PID_ENV => Some("4242".into()),
                _ => None,
            })
        }
        .unwrap()
        .unwrap();

        assert_eq!(inheritance.parent_pid(), Some(4242));
        assert_eq!(inheritance.listeners().names(), vec!["http".to_string()]);
        assert!(cloexec_is_set(listener_fd));

        let (mut listeners, ready, _) = inheritance.into_parts();
        let spec = ListenerSpec::new("http", Network::Tcp, address.to_string());
        let adopted = listeners.acquire(&spec).unwrap().unwrap();
        assert_eq!(adopted.as_raw_fd(), listener_fd);
        assert_eq!(adopted.local_addr().unwrap(), address);

        ready.notify().unwrap();
        let mut message = Vec::new();
        read_end.read_to_end(&mut message).unwrap();
        assert_eq!(message, READY_MESSAGE);
    }

    #[test]
    fn mismatched_inherited_listener_is_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let inherited = ListenerSpec::new("http", Network::Tcp, "127.0.0.1:8080");
        let mut source = InheritedListeners::new([(inherited, listener)]);

        let moved = ListenerSpec::new("http", Network::Tcp, "127.0.0.1:9090");
        assert!(source.acquire(&moved).unwrap().is_none());
        assert!(source.is_empty());
    }

    #[test]
    fn unknown_names_fall_through_and_unclaimed_are_released() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let inherited = ListenerSpec::new("admin", Network::Tcp, "127.0.0.1:8081");
        let mut source = InheritedListeners::new([(inherited, listener)]);

        let other = ListenerSpec::new("http", Network::Tcp, "127.0.0.1:8080");
        assert!(source.acquire(&other).unwrap().is_none());
        assert_eq!(source.len(), 1);

        source.release_unclaimed();
        assert!(source.is_empty());
    }
}
