use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::wire_header::ConnectionId;

pub type SharedConnection = Arc<Mutex<Connection>>;

type ConnectionMap = FxHashMap<ConnectionId, SharedConnection>;

/// Locks a connection. A panic while a connection was locked leaves its state intact enough
///  to continue, so poisoning is ignored.
pub fn lock_connection(connection: &SharedConnection) -> MutexGuard<'_, Connection> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

/// All connections of an end point, keyed by connection id.
///
/// The map is copy-on-write: readers get an immutable snapshot and are never blocked by each
///  other or by iteration, writers copy the map and swap it. Connections are shared with their
///  own lock, so modifying a connection's state does not touch the map.
///
/// Lock order: code holding a connection's lock must not modify the map. Sweeping only
///  `try_lock`s connections while holding the map's write lock.
pub struct ConnectionPool {
    config: Arc<TransportConfig>,
    connections: RwLock<Arc<ConnectionMap>>,
}

impl ConnectionPool {
    pub fn new(config: Arc<TransportConfig>) -> ConnectionPool {
        ConnectionPool {
            config,
            connections: RwLock::new(Default::default()),
        }
    }

    /// a point-in-time view of all connections
    pub fn snapshot(&self) -> Arc<ConnectionMap> {
        self.connections.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut ConnectionMap) -> T) -> T {
        let mut current = self.connections.write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut map = (**current).clone();
        let result = f(&mut map);
        *current = Arc::new(map);
        result
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<SharedConnection> {
        self.snapshot()
            .get(connection_id)
            .cloned()
    }

    /// Returns the connection with a given id, creating it if it does not exist. The other
    ///  arguments only apply to a newly created connection: the first writer wins. The returned
    ///  flag is `true` iff the connection was created by this call.
    pub fn get_or_create(&self, connection_id: ConnectionId, keep_alive: bool, now: Instant, remote_addr: SocketAddr) -> (SharedConnection, bool) {
        if let Some(existing) = self.get(&connection_id) {
            return (existing, false);
        }

        self.update(|map| {
            if let Some(existing) = map.get(&connection_id) {
                return (existing.clone(), false);
            }

            debug!("new connection {} to {} (keep alive: {})", connection_id, remote_addr, keep_alive);
            let connection = Arc::new(Mutex::new(Connection::new(connection_id, keep_alive, now, remote_addr, &self.config)));
            map.insert(connection_id, connection.clone());
            (connection, true)
        })
    }

    /// Registers inbound activity on a connection, returning `false` if there is no such
    ///  connection
    pub fn touch(&self, connection_id: &ConnectionId, now: Instant, remote_addr: SocketAddr) -> bool {
        match self.get(connection_id) {
            Some(connection) => {
                lock_connection(&connection).touch(now, remote_addr);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, connection_id: &ConnectionId) -> Option<SharedConnection> {
        let removed = self.update(|map| map.remove(connection_id));
        if removed.is_some() {
            debug!("removed connection {}", connection_id);
        }
        removed
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.snapshot()
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Evicts all connections that are not kept alive and were silent for longer than
    ///  `inactivity_timeout`, returning the evicted connections' ids and addresses
    pub fn sweep(&self, now: Instant, inactivity_timeout: Duration) -> Vec<(ConnectionId, Vec<SocketAddr>)> {
        let candidates = self.snapshot()
            .iter()
            .filter(|(_, conn)| lock_connection(conn).is_inactive(now, inactivity_timeout))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            trace!("sweep: no inactive connections");
            return Vec::new();
        }

        self.update(|map| {
            let mut evicted = Vec::new();
            for id in candidates {
                let Some(conn) = map.get(&id) else {
                    continue;
                };
                // a connection that is locked is being worked on, i.e. it is active
                let addrs = match conn.try_lock() {
                    Ok(conn) if conn.is_inactive(now, inactivity_timeout) => conn.remote_endpoints.clone(),
                    Err(TryLockError::Poisoned(e)) if e.get_ref().is_inactive(now, inactivity_timeout) => e.get_ref().remote_endpoints.clone(),
                    _ => continue,
                };
                debug!("evicting inactive connection {}", id);
                map.remove(&id);
                evicted.push((id, addrs));
            }
            evicted
        })
    }

    /// Removes all connections, returning how many there were
    pub fn clear(&self) -> usize {
        self.update(|map| {
            let num_connections = map.len();
            map.clear();
            num_connections
        })
    }
}
