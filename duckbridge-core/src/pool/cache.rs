//! Thread-local connection cache.
//!
//! Every worker thread owns at most one connection, keyed by its
//! `ThreadId`. Entries are inserted by the owning thread only; teardown
//! drains the whole map under the write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use crate::engine::DbConnection;
use crate::error::PoolError;
use crate::id::{ConnectionId, ConnectionIdGenerator};

/// One cached connection. Clones share the same underlying connection.
pub struct CachedConnection<C> {
    id: ConnectionId,
    conn: Arc<Mutex<C>>,
    broken: Arc<AtomicBool>,
}

impl<C> Clone for CachedConnection<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            conn: self.conn.clone(),
            broken: self.broken.clone(),
        }
    }
}

impl<C> CachedConnection<C> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, C> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flag the connection so the next acquisition on its thread reconnects.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same underlying connection object.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

struct CacheInner<C> {
    connections: HashMap<ThreadId, CachedConnection<C>>,
}

pub struct ConnectionCache<C> {
    inner: RwLock<CacheInner<C>>,
    ids: ConnectionIdGenerator,
}

impl<C: DbConnection> ConnectionCache<C> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                connections: HashMap::new(),
            }),
            ids: ConnectionIdGenerator::new(),
        }
    }

    /// Return the current thread's connection, opening one with `open` on a
    /// cache miss. The flag is true when a new connection was opened.
    ///
    /// `open` runs without holding the cache lock.
    pub fn connect<F>(&self, open: F) -> Result<(CachedConnection<C>, bool), PoolError>
    where
        F: FnOnce() -> Result<C, PoolError>,
    {
        let thread_id = thread::current().id();
        if let Some(entry) = self.connection_for(thread_id) {
            return Ok((entry, false));
        }

        let entry = CachedConnection {
            id: self.ids.next(),
            conn: Arc::new(Mutex::new(open()?)),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let mut inner = self.write();
        inner.connections.insert(thread_id, entry.clone());
        debug!(
            connection_id = %entry.id,
            thread = ?thread_id,
            cached = inner.connections.len(),
            "cached new connection"
        );
        Ok((entry, true))
    }

    /// Close and evict one connection, leaving other threads' entries alone.
    /// Returns false when no entry has that id.
    pub fn disconnect(&self, id: ConnectionId) -> Result<bool, PoolError> {
        let removed = {
            let mut inner = self.write();
            let key = inner
                .connections
                .iter()
                .find(|(_, entry)| entry.id == id)
                .map(|(thread_id, _)| *thread_id);
            key.and_then(|thread_id| inner.connections.remove(&thread_id))
        };
        match removed {
            Some(entry) => {
                entry.lock().close()?;
                debug!(connection_id = %id, "disconnected connection");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn connection_for(&self, thread_id: ThreadId) -> Option<CachedConnection<C>> {
        self.read().connections.get(&thread_id).cloned()
    }

    /// Close every cached connection and clear the cache. Close errors are
    /// logged; returns how many connections were removed.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.write();
            inner.connections.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            if let Err(err) = entry.lock().close() {
                warn!(connection_id = %entry.id, error = %err, "failed to close connection");
            }
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheInner<C>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheInner<C>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: DbConnection> Default for ConnectionCache<C> {
    fn default() -> Self {
        Self::new()
    }
}
