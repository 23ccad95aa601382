use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CapacityScope, HubError, connection::ConnectionHandle};

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<Uuid, Arc<ConnectionHandle>>,
    by_user: HashMap<Uuid, Vec<Uuid>>,
}

/// Live connections indexed by id and by user.
///
/// Ceilings are checked and counters updated under the write lock, so they can
/// never be exceeded by concurrent registrations. Readers get snapshots and do
/// their I/O after the lock is released.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Inner>,
    max_total: usize,
    max_per_user: usize,
}

impl Registry {
    #[must_use]
    pub fn new(max_total: usize, max_per_user: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_total,
            max_per_user,
        }
    }

    pub async fn insert(&self, handle: Arc<ConnectionHandle>) -> Result<(), HubError> {
        let mut inner = self.inner.write().await;
        if inner.connections.len() >= self.max_total {
            return Err(HubError::Capacity {
                scope: CapacityScope::Global,
                limit: self.max_total,
            });
        }
        let user_id = handle.user_id();
        let owned = inner.by_user.get(&user_id).map_or(0, Vec::len);
        if owned >= self.max_per_user {
            return Err(HubError::Capacity {
                scope: CapacityScope::User,
                limit: self.max_per_user,
            });
        }

        inner.by_user.entry(user_id).or_default().push(handle.id());
        inner.connections.insert(handle.id(), handle);
        Ok(())
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<ConnectionHandle>> {
        let mut inner = self.inner.write().await;
        let handle = inner.connections.remove(&id)?;
        let user_id = handle.user_id();
        if let Some(ids) = inner.by_user.get_mut(&user_id) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                inner.by_user.remove(&user_id);
            }
        }
        Some(handle)
    }

    pub async fn for_user(&self, user_id: Uuid) -> Vec<Arc<ConnectionHandle>> {
        let inner = self.inner.read().await;
        inner.by_user.get(&user_id).map_or_else(Vec::new, |ids| {
            ids.iter()
                .filter_map(|id| inner.connections.get(id).cloned())
                .collect()
        })
    }

    pub async fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn user_len(&self, user_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .map_or(0, Vec::len)
    }
}
