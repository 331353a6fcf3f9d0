use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sockrelay_transport::Connection;

use crate::error::RegistrationFailure;

/// Descriptor → connection map shared between the gateway and the dispatch loop.
///
/// Inserts and removes take the write lock; lookups take the read lock.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<RawFd, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under its descriptor.
    ///
    /// Returns the new size, or `None` if the descriptor is already present
    /// (the existing entry is left untouched).
    pub fn insert(&self, connection: Arc<Connection>) -> Option<usize> {
        self.insert_bounded(connection, None, |_| Ok(())).ok()
    }

    /// Insert a connection if the registry has room and the descriptor is new.
    ///
    /// The checks, `register`, and the insert all happen under one write lock,
    /// so concurrent callers cannot push the size past `max`. `register` runs
    /// only after both checks pass; if it fails nothing is inserted.
    pub fn insert_bounded(
        &self,
        connection: Arc<Connection>,
        max: Option<usize>,
        register: impl FnOnce(RawFd) -> io::Result<()>,
    ) -> Result<usize, RegistrationFailure> {
        let mut map = self.write();
        if let Some(max) = max {
            if map.len() >= max {
                return Err(RegistrationFailure::CapacityReached { max });
            }
        }
        let fd = connection.fd();
        if map.contains_key(&fd) {
            return Err(RegistrationFailure::Duplicate);
        }
        register(fd).map_err(RegistrationFailure::Os)?;
        map.insert(fd, connection);
        Ok(map.len())
    }

    /// Remove the entry for `fd` if it still belongs to connection `id`.
    ///
    /// A descriptor can be reused by the OS once closed; matching the id keeps
    /// a stale removal from evicting the new owner.
    pub fn remove(&self, fd: RawFd, id: u64) -> Option<Arc<Connection>> {
        let mut map = self.write();
        match map.get(&fd) {
            Some(existing) if existing.id() == id => map.remove(&fd),
            _ => None,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.read().get(&fd).cloned()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.read().contains_key(&fd)
    }

    /// Resolve a batch of ready descriptors under one read lock.
    ///
    /// Descriptors with no entry (removed since the event fired) are skipped.
    pub fn resolve(&self, fds: &[RawFd]) -> Vec<Arc<Connection>> {
        let map = self.read();
        fds.iter().filter_map(|fd| map.get(fd).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Take every entry out, leaving the registry empty.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.write().drain().map(|(_, conn)| conn).collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RawFd, Arc<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RawFd, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::testing::server_connection;

    #[test]
    fn insert_rejects_duplicate_descriptor() {
        let registry = Registry::new();
        let (conn, _peer) = server_connection();

        assert_eq!(registry.insert(Arc::clone(&conn)), Some(1));
        assert_eq!(registry.insert(Arc::clone(&conn)), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bounded_insert_skips_register_when_full() {
        let registry = Registry::new();
        let (a, _pa) = server_connection();
        let (b, _pb) = server_connection();
        registry
            .insert_bounded(Arc::clone(&a), Some(1), |_| Ok(()))
            .unwrap();

        let mut registered = false;
        let err = registry
            .insert_bounded(Arc::clone(&b), Some(1), |_| {
                registered = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, RegistrationFailure::CapacityReached { max: 1 }));
        assert!(!registered);
        assert!(!registry.contains(b.fd()));
    }

    #[test]
    fn failed_register_leaves_registry_unchanged() {
        let registry = Registry::new();
        let (conn, _peer) = server_connection();

        let err = registry
            .insert_bounded(Arc::clone(&conn), None, |_| {
                Err(io::Error::from_raw_os_error(libc::EMFILE))
            })
            .unwrap_err();
        assert!(matches!(err, RegistrationFailure::Os(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_requires_matching_id() {
        let registry = Registry::new();
        let (conn, _peer) = server_connection();
        registry.insert(Arc::clone(&conn));

        assert!(registry.remove(conn.fd(), conn.id() + 1_000).is_none());
        assert!(registry.contains(conn.fd()));

        assert!(registry.remove(conn.fd(), conn.id()).is_some());
        assert!(registry.remove(conn.fd(), conn.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn size_is_adds_minus_successful_removes() {
        let registry = Registry::new();
        let conns: Vec<_> = (0..12).map(|_| server_connection()).collect();

        for (conn, _) in &conns {
            registry.insert(Arc::clone(conn));
        }
        let mut removed = 0;
        // Interleave: remove every third connection twice, re-add one.
        for (i, (conn, _)) in conns.iter().enumerate() {
            if i % 3 == 0 {
                if registry.remove(conn.fd(), conn.id()).is_some() {
                    removed += 1;
                }
                assert!(registry.remove(conn.fd(), conn.id()).is_none());
            }
        }
        let (first, _) = &conns[0];
        assert!(registry.insert(Arc::clone(first)).is_some());
        removed -= 1;

        assert_eq!(registry.len(), conns.len() - removed);
        let fds: HashSet<_> = conns.iter().map(|(c, _)| c.fd()).collect();
        assert_eq!(fds.len(), conns.len());
    }

    #[test]
    fn resolve_skips_unknown_descriptors() {
        let registry = Registry::new();
        let (a, _pa) = server_connection();
        let (b, _pb) = server_connection();
        registry.insert(Arc::clone(&a));

        let resolved = registry.resolve(&[a.fd(), b.fd(), -1]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id(), a.id());
    }

    #[test]
    fn concurrent_inserts_and_removes_stay_consistent() {
        let registry = Arc::new(Registry::new());
        let conns: Vec<_> = (0..32).map(|_| server_connection()).collect();
        let shared: Vec<Arc<Connection>> = conns.iter().map(|(c, _)| Arc::clone(c)).collect();

        let handles: Vec<_> = shared
            .chunks(8)
            .map(|chunk| {
                let registry = Arc::clone(&registry);
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for conn in &chunk {
                        registry.insert(Arc::clone(conn));
                    }
                    for conn in chunk.iter().step_by(2) {
                        registry.remove(conn.fd(), conn.id());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 16);
        assert_eq!(registry.drain().len(), 16);
        assert!(registry.is_empty());
    }
}
