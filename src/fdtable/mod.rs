// src/fdtable/mod.rs
//! Process-wide descriptor table
//!
//! Maps each descriptor value the application holds to its interposer state:
//! pass-through (real OS socket) or tunneled (overlay connection). A lookup
//! miss means "not one of ours" and the caller must fall back to the real
//! call, so descriptors created before the interposer attached are never
//! misrouted. Shard locks are held only for the insert/remove/clone itself,
//! never across overlay or real networking calls.

pub mod tunnel;

use std::os::unix::io::RawFd;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

pub use tunnel::{OverlayConnection, ReadOutcome, Readiness, WriteOutcome};

/// Interposer-side state for one descriptor value
#[derive(Clone)]
pub enum DescriptorEntry {
    /// Real OS socket; every call passes through untouched
    PassThrough,

    /// Overlay tunnel standing in for the descriptor's data path
    Tunneled(Arc<OverlayConnection>),
}

/// Process-wide descriptor table
pub struct DescriptorTable {
    entries: DashMap<RawFd, DescriptorEntry>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register state for a descriptor value.
    ///
    /// A stale entry under the same value means a close was missed (the OS
    /// recycles descriptor numbers); the stale tunnel is torn down first so
    /// the one-live-entry-per-value invariant holds.
    pub fn register(&self, fd: RawFd, entry: DescriptorEntry) {
        if let Some(old) = self.entries.insert(fd, entry) {
            if let DescriptorEntry::Tunneled(conn) = old {
                warn!(fd, host = conn.hostname(), "replacing stale descriptor entry");
                conn.close();
            }
        }
        debug!(fd, "descriptor registered");
    }

    /// Look up a descriptor; `None` means "not one of ours"
    pub fn lookup(&self, fd: RawFd) -> Option<DescriptorEntry> {
        self.entries.get(&fd).map(|e| e.value().clone())
    }

    /// Tunneled connection for a descriptor, if any
    pub fn tunnel(&self, fd: RawFd) -> Option<Arc<OverlayConnection>> {
        match self.lookup(fd) {
            Some(DescriptorEntry::Tunneled(conn)) => Some(conn),
            _ => None,
        }
    }

    /// Remove a descriptor's entry. Idempotent: removing an absent value is a
    /// no-op returning `None`.
    pub fn remove(&self, fd: RawFd) -> Option<DescriptorEntry> {
        self.entries.remove(&fd).map(|(_, entry)| entry)
    }

    /// Close a descriptor's tunnel, if it has one, and drop the entry.
    ///
    /// Returns true when a tunneled entry was actually torn down. Safe to call
    /// any number of times for the same value.
    pub fn close(&self, fd: RawFd) -> bool {
        match self.remove(fd) {
            Some(DescriptorEntry::Tunneled(conn)) => {
                conn.close();
                true
            }
            Some(DescriptorEntry::PassThrough) | None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayStream;
    use crate::utils::errors::{Result, ShimError};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct InertStream {
        down: AtomicBool,
    }

    impl InertStream {
        fn new() -> Self {
            Self {
                down: AtomicBool::new(false),
            }
        }
    }

    impl OverlayStream for InertStream {
        fn send(&self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
        fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
            // Block-ish: park until shutdown, then report teardown.
            while !self.down.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(ShimError::Transport("shutdown".to_string()))
        }
        fn shutdown(&self) {
            self.down.store(true, Ordering::Relaxed);
        }
    }

    fn tunneled() -> DescriptorEntry {
        DescriptorEntry::Tunneled(OverlayConnection::spawn(
            "svc.ziti",
            80,
            Box::new(InertStream::new()),
        ))
    }

    #[test]
    fn test_lookup_miss_means_not_ours() {
        let table = DescriptorTable::new();
        assert!(table.lookup(42).is_none());
        assert!(table.tunnel(42).is_none());
    }

    #[test]
    fn test_register_lookup_remove() {
        let table = DescriptorTable::new();
        table.register(7, tunneled());

        assert!(table.tunnel(7).is_some());
        assert!(table.remove(7).is_some());
        assert!(table.lookup(7).is_none());
    }

    #[test]
    fn test_double_close_is_idempotent() {
        let table = DescriptorTable::new();
        table.register(9, tunneled());

        assert!(table.close(9));
        assert!(!table.close(9));
        assert!(!table.close(9));
    }

    #[test]
    fn test_close_unknown_fd_is_noop() {
        let table = DescriptorTable::new();
        assert!(!table.close(1234));
    }

    #[test]
    fn test_stale_entry_replaced_and_torn_down() {
        let table = DescriptorTable::new();
        table.register(5, tunneled());
        let stale = table.tunnel(5).unwrap();

        table.register(5, tunneled());
        assert!(stale.is_closed());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_passthrough_entry_close_does_not_count() {
        let table = DescriptorTable::new();
        table.register(3, DescriptorEntry::PassThrough);
        assert!(!table.close(3));
        assert!(table.lookup(3).is_none());
    }
}
