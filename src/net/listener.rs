//! Named listening sockets and the sources that produce them.
//!
//! # Responsibilities
//! - Describe a listener by name, network and bind address
//! - Bind fresh TCP sockets with a configured backlog
//! - Hand out duplicated descriptors so the registry keeps the original
//!
//! # Design Decisions
//! - A socket comes from a [`ListenerSource`]; the coordinator asks the
//!   inherited source first and only then binds fresh
//! - Sockets are created with `socket2` so backlog and `SO_REUSEADDR` are explicit
//! - Handles own a `dup` of the registry's descriptor, never the original

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use thiserror::Error;

/// Default accept backlog for freshly bound sockets.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Network protocol of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = BindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            other => Err(BindError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Errors raised while producing a listener.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("cannot resolve listener address '{address}': {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("address {address} is already registered as listener '{owner}'")]
    AddressTaken { address: String, owner: String },

    #[error("listener '{name}' is already registered for {address}")]
    NameTaken { name: String, address: String },

    #[error("no listener source could provide '{name}' ({address})")]
    Unavailable { name: String, address: String },

    #[error("listener registry is closed")]
    Closed,
}

/// What a listener should be: its registry name, network and bind address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerSpec {
    pub name: String,
    pub network: Network,
    pub address: String,
}

impl ListenerSpec {
    pub fn new(name: impl Into<String>, network: Network, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network,
            address: address.into(),
        }
    }

    /// Resolve the bind address, taking the first result for host names.
    pub fn resolve(&self) -> Result<SocketAddr, BindError> {
        let resolve_err = |source| BindError::Resolve {
            address: self.address.clone(),
            source,
        };
        self.address
            .to_socket_addrs()
            .map_err(resolve_err)?
            .next()
            .ok_or_else(|| {
                resolve_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address resolved to nothing",
                ))
            })
    }

    /// Whether `other` describes the same socket (ignoring the name).
    pub fn same_socket(&self, other: &ListenerSpec) -> bool {
        self.network == other.network && self.address == other.address
    }
}

/// A named, bound listening socket lent out by the coordinator.
///
/// The handle owns a duplicate of the registered descriptor; dropping it does
/// not close the socket held by the registry.
#[derive(Debug)]
pub struct ListenerHandle {
    spec: ListenerSpec,
    local_addr: SocketAddr,
    listener: TcpListener,
}

impl ListenerHandle {
    pub(crate) fn new(spec: ListenerSpec, listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            spec,
            local_addr,
            listener,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn network(&self) -> Network {
        self.spec.network
    }

    /// The address the listener was requested on (as configured).
    pub fn address(&self) -> &str {
        &self.spec.address
    }

    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    /// Give up the handle and keep the underlying std listener.
    pub fn into_listener(self) -> TcpListener {
        self.listener
    }
}

/// Something that can provide a bound listener for a spec.
///
/// Returning `Ok(None)` means "not mine, ask the next source".
pub trait ListenerSource: Send {
    fn acquire(&mut self, spec: &ListenerSpec) -> Result<Option<TcpListener>, BindError>;

    /// Close every listener this source still holds but nobody asked for.
    fn release_unclaimed(&mut self) {}

    /// Short name for logs.
    fn kind(&self) -> &'static str;
}

/// Binds brand new sockets.
#[derive(Debug, Clone)]
pub struct FreshBind {
    backlog: i32,
}

impl FreshBind {
    pub fn new(backlog: i32) -> Self {
        Self { backlog }
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }
}

impl Default for FreshBind {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

impl ListenerSource for FreshBind {
    fn acquire(&mut self, spec: &ListenerSpec) -> Result<Option<TcpListener>, BindError> {
        let addr = spec.resolve()?;
        let io_err = |source| BindError::Io {
            address: spec.address.clone(),
            source,
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(io_err)?;
        socket.set_reuse_address(true).map_err(io_err)?;
        socket.bind(&addr.into()).map_err(io_err)?;
        socket.listen(self.backlog).map_err(io_err)?;

        tracing::info!(
            name = %spec.name,
            address = %addr,
            backlog = self.backlog,
            "Listener bound"
        );

        Ok(Some(socket.into()))
    }

    fn kind(&self) -> &'static str {
        "fresh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parses_tcp_only() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert!(matches!(
            "udp".parse::<Network>(),
            Err(BindError::UnsupportedNetwork(n)) if n == "udp"
        ));
    }

    #[test]
    fn spec_resolves_host_names() {
        let spec = ListenerSpec::new("http", Network::Tcp, "localhost:0");
        let addr = spec.resolve().unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn spec_rejects_garbage_address() {
        let spec = ListenerSpec::new("http", Network::Tcp, "not an address");
        assert!(matches!(spec.resolve(), Err(BindError::Resolve { .. })));
    }

    #[test]
    fn fresh_bind_listens_on_ephemeral_port() {
        let spec = ListenerSpec::new("http", Network::Tcp, "127.0.0.1:0");
        let listener = FreshBind::default().acquire(&spec).unwrap().unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // The socket is listening: a client can connect.
        std::net::TcpStream::connect(addr).unwrap();
    }

    #[test]
    fn fresh_bind_fails_when_address_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = occupied.local_addr().unwrap().to_string();
        let spec = ListenerSpec::new("http", Network::Tcp, address);

        let err = FreshBind::default().acquire(&spec).unwrap_err();
        assert!(matches!(err, BindError::Io { .. }), "got {err:?}");
    }

    #[test]
    fn handle_reports_local_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let expected = listener.local_addr().unwrap();
        let handle =
            ListenerHandle::new(ListenerSpec::new("http", Network::Tcp, "127.0.0.1:0"), listener)
                .unwrap();
        assert_eq!(handle.local_addr(), expected);
        assert_eq!(handle.name(), "http");
        assert_eq!(handle.address(), "127.0.0.1:0");
    }
}
