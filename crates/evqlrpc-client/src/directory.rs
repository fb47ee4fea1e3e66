//! Host lookup for the dispatcher.
//!
//! Tasks name their candidate hosts by identifier (a server id in the cluster
//! configuration). Before opening a connection the dispatcher asks a
//! [`HostDirectory`] for the host's address and whether it is currently
//! considered up.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Address and liveness of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEntry {
    pub addr: SocketAddr,
    pub is_live: bool,
}

impl HostEntry {
    pub fn live(addr: SocketAddr) -> Self {
        Self {
            addr,
            is_live: true,
        }
    }

    pub fn down(addr: SocketAddr) -> Self {
        Self {
            addr,
            is_live: false,
        }
    }
}

/// Resolves host identifiers to addresses.
///
/// Returning `None` or a non-live entry fails the current attempt; the task
/// moves on to its next host.
///
/// Any `Fn(&str) -> Option<HostEntry>` closure is a directory.
pub trait HostDirectory {
    fn resolve(&self, host: &str) -> Option<HostEntry>;
}

impl<F> HostDirectory for F
where
    F: Fn(&str) -> Option<HostEntry>,
{
    fn resolve(&self, host: &str) -> Option<HostEntry> {
        self(host)
    }
}

/// Fixed host table.
///
/// # Example
///
/// ```rust
/// use evqlrpc_client::{HostDirectory, StaticDirectory};
///
/// let mut directory = StaticDirectory::new();
/// directory.add_host("node-a", "127.0.0.1:9175".parse().unwrap());
/// directory.set_live("node-a", false);
///
/// assert!(!directory.resolve("node-a").unwrap().is_live);
/// assert!(directory.resolve("node-b").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    hosts: HashMap<String, HostEntry>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a host, marking it live.
    pub fn add_host(&mut self, host: impl Into<String>, addr: SocketAddr) {
        self.hosts.insert(host.into(), HostEntry::live(addr));
    }

    pub fn with_host(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.add_host(host, addr);
        self
    }

    pub fn remove_host(&mut self, host: &str) -> Option<HostEntry> {
        self.hosts.remove(host)
    }

    /// Flips a host's liveness. Returns false for unknown hosts.
    pub fn set_live(&mut self, host: &str, is_live: bool) -> bool {
        match self.hosts.get_mut(host) {
            Some(entry) => {
                entry.is_live = is_live;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl HostDirectory for StaticDirectory {
    fn resolve(&self, host: &str) -> Option<HostEntry> {
        self.hosts.get(host).copied()
    }
}
