//! Concurrent registry of connections for broadcast fan-out.
//!
//! Membership is tracked both ways: the pool maps [`ConnectionId`] to the
//! connection, and every member keeps a weak reference back to each pool it
//! is in. Both sides change while the pool's write lock is held, and closing
//! a connection removes it from every pool before its socket is released.
//!
//! Lock order is pool lock, then the member's own locks. Nothing takes a pool
//! lock while holding a member lock.

use crate::connection::{Connection, ConnectionId, Shared};
use crate::error::Error;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PoolId(u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct PoolInner {
    id: PoolId,
    members: RwLock<HashMap<ConnectionId, Arc<Shared>>>,
}

impl PoolInner {
    // Removes a closing member. Both sides change under this pool's lock.
    pub(crate) fn evict(&self, member: &Shared) {
        let mut members = self.members.write();
        if members.remove(&member.id).is_some() {
            member.leave_pool(self.id);
            debug!(pool = %self.id, connection = %member.id, "Closed connection left the pool");
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for member in self.members.get_mut().values() {
            member.leave_pool(self.id);
        }
    }
}

/// A set of connections that can be broadcast to.
///
/// Cloning is cheap and every clone refers to the same pool. The pool holds
/// its members alive until they are removed or closed; dropping the last
/// clone deregisters the pool from all members.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("count", &self.count())
            .finish()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ConnectionPool {
    /// Creates an empty pool sized for about `hint` members.
    pub fn new(hint: usize) -> Self {
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        debug!(pool = %id, hint, "Pool created");
        Self {
            inner: Arc::new(PoolInner {
                id,
                members: RwLock::new(HashMap::with_capacity(hint)),
            }),
        }
    }

    /// Registers a connection. Fails if it is already a member or closed.
    #[instrument(skip(self, conn), fields(pool = %self.inner.id, connection = %conn.id()))]
    pub fn add(&self, conn: &Connection) -> Result<(), Error> {
        let shared = conn.shared();
        let mut members = self.inner.members.write();
        if members.contains_key(&shared.id) {
            return Err(Error::AlreadyInPool { id: shared.id });
        }
        shared.join_pool(self.inner.id, Arc::downgrade(&self.inner))?;
        members.insert(shared.id, Arc::clone(shared));
        debug!(count = members.len(), "Connection added");
        Ok(())
    }

    /// Unregisters a connection. Removing a non-member is logged and
    /// reported as [`Error::NotInPool`].
    #[instrument(skip(self, conn), fields(pool = %self.inner.id, connection = %conn.id()))]
    pub fn remove(&self, conn: &Connection) -> Result<(), Error> {
        let id = conn.id();
        let mut members = self.inner.members.write();
        match members.remove(&id) {
            Some(shared) => {
                shared.leave_pool(self.inner.id);
                debug!(count = members.len(), "Connection removed");
                Ok(())
            }
            None => {
                warn!("Connection is not in the pool");
                Err(Error::NotInPool { id })
            }
        }
    }

    /// Queues a copy of `message` on every member except `from`.
    ///
    /// Members that refuse the message (full queue, no longer running) are
    /// skipped. Returns the number of members the message was queued on.
    #[instrument(skip(self, from, message), fields(pool = %self.inner.id, len = message.len()))]
    pub fn broadcast(&self, from: Option<&Connection>, message: &[u8]) -> Result<usize, Error> {
        if message.is_empty() {
            return Err(Error::EmptyMessage);
        }
        let skip = from.map(Connection::id);

        let members = self.inner.members.read();
        let mut delivered = 0;
        for (id, member) in members.iter() {
            if Some(*id) == skip {
                continue;
            }
            match member.enqueue(message.to_vec()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(connection = %id, %err, "Broadcast skipped member"),
            }
        }

        if delivered == 0 {
            debug!(members = members.len(), "Broadcast reached no connection");
        } else {
            trace!(delivered, "Broadcast queued");
        }
        Ok(delivered)
    }

    pub fn count(&self) -> usize {
        self.inner.members.read().len()
    }

    pub fn contains(&self, conn: &Connection) -> bool {
        self.inner.members.read().contains_key(&conn.id())
    }

    /// Ids of the current members, in no particular order.
    pub fn members(&self) -> Vec<ConnectionId> {
        self.inner.members.read().keys().copied().collect()
    }
}
