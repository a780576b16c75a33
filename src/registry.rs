//! Session registry: the authenticated sessions currently alive on
//! this proxy, deduplicated by name and by uuid.
//!
//! A session appears here exactly while it is in the Init or Connected
//! state; cleanup removes it on the way back to Disconnected.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RegisteredSession {
    pub session_id: u64,
    pub name: String,
    pub uuid: Uuid,
}

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, RegisteredSession>,
    by_uuid: HashMap<Uuid, u64>,
}

pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub async fn has_name(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .by_name
            .contains_key(&name.to_ascii_lowercase())
    }

    pub async fn has_uuid(&self, uuid: Uuid) -> bool {
        self.state.read().await.by_uuid.contains_key(&uuid)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_uuid.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn register(&self, entry: RegisteredSession) {
        let mut state = self.state.write().await;
        state.by_uuid.insert(entry.uuid, entry.session_id);
        state.by_name.insert(entry.name.to_ascii_lowercase(), entry);
    }

    /// Removes the session, keyed by id so a newer session under the
    /// same name is never evicted by a stale cleanup.
    pub async fn unregister(&self, session_id: u64, name: &str, uuid: Uuid) {
        let mut state = self.state.write().await;
        let name_key = name.to_ascii_lowercase();
        if state
            .by_name
            .get(&name_key)
            .is_some_and(|entry| entry.session_id == session_id)
        {
            state.by_name.remove(&name_key);
        }
        if state.by_uuid.get(&uuid).is_some_and(|id| *id == session_id) {
            state.by_uuid.remove(&uuid);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = SessionRegistry::new();
        let uuid = crypto::offline_uuid("Alice");
        registry
            .register(RegisteredSession {
                session_id: 1,
                name: "Alice".into(),
                uuid,
            })
            .await;
        assert!(registry.has_name("alice").await);
        assert!(registry.has_uuid(uuid).await);
        assert_eq!(registry.len().await, 1);

        registry.unregister(1, "Alice", uuid).await;
        assert!(!registry.has_name("Alice").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let uuid = crypto::offline_uuid("Alice");
        registry
            .register(RegisteredSession {
                session_id: 2,
                name: "Alice".into(),
                uuid,
            })
            .await;
        // session 1 already lost the name; its cleanup must not evict
        registry.unregister(1, "Alice", uuid).await;
        assert!(registry.has_name("Alice").await);
        assert!(registry.has_uuid(uuid).await);
    }
}
