//! Connect directory: the servers players can be routed to and the
//! network-wide set of players currently connected through this proxy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ServerConfig;

/// A server players can be proxied to.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub name: String,
    pub address: String,
    pub max_players: u32,
}

/// Result of claiming a local player slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPlayerResult {
    Added,
    DuplicateName,
    DuplicateUuid,
}

#[derive(Default)]
struct DirectoryState {
    servers: HashMap<String, Arc<ServerRecord>>,
    players_by_name: HashMap<String, Uuid>,
    players_by_uuid: HashMap<Uuid, String>,
}

/// Process-wide directory. Internally synchronized.
pub struct ConnectDirectory {
    state: RwLock<DirectoryState>,
}

impl ConnectDirectory {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
        }
    }

    /// (Re)loads the server list from configuration. Players stay put;
    /// a session on a removed server keeps playing until it leaves.
    pub async fn load_servers(&self, configs: &[ServerConfig]) {
        let mut state = self.state.write().await;
        state.servers.clear();
        for config in configs {
            let record = ServerRecord {
                name: config.name.clone(),
                address: config.address.clone(),
                max_players: config.max_players,
            };
            if state
                .servers
                .insert(config.name.clone(), Arc::new(record))
                .is_some()
            {
                log::warn!("Duplicate server {} in configuration", config.name);
            }
        }
        log::debug!("Connect directory loaded {} servers", state.servers.len());
    }

    pub async fn has_server(&self, name: &str) -> bool {
        self.state.read().await.servers.contains_key(name)
    }

    pub async fn get_server(&self, name: &str) -> Option<Arc<ServerRecord>> {
        self.state.read().await.servers.get(name).cloned()
    }

    /// Claims a slot for a player. Both duplicate outcomes leave the
    /// directory untouched.
    pub async fn add_local_player(&self, name: &str, uuid: Uuid) -> AddPlayerResult {
        let mut state = self.state.write().await;
        let name_key = name.to_ascii_lowercase();
        if state.players_by_name.contains_key(&name_key) {
            return AddPlayerResult::DuplicateName;
        }
        if state.players_by_uuid.contains_key(&uuid) {
            return AddPlayerResult::DuplicateUuid;
        }
        state.players_by_name.insert(name_key.clone(), uuid);
        state.players_by_uuid.insert(uuid, name_key);
        AddPlayerResult::Added
    }

    pub async fn remove_local_player(&self, name: &str, uuid: Uuid) {
        let mut state = self.state.write().await;
        state.players_by_name.remove(&name.to_ascii_lowercase());
        state.players_by_uuid.remove(&uuid);
    }

    /// Number of players connected through the proxy.
    pub async fn player_count(&self) -> usize {
        self.state.read().await.players_by_uuid.len()
    }

    /// Summed cap of the known servers, reported in status responses
    /// when max-player syncing is on.
    pub async fn max_players(&self) -> u32 {
        self.state
            .read()
            .await
            .servers
            .values()
            .map(|server| server.max_players)
            .sum()
    }
}

impl Default for ConnectDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_owned(),
            address: "127.0.0.1:25566".to_owned(),
            max_players: 20,
        }
    }

    #[tokio::test]
    async fn add_remove_tracks_both_keys() {
        let directory = ConnectDirectory::new();
        let uuid = crypto::offline_uuid("Alice");
        assert_eq!(
            directory.add_local_player("Alice", uuid).await,
            AddPlayerResult::Added
        );
        assert_eq!(
            directory.add_local_player("alice", crypto::offline_uuid("Other")).await,
            AddPlayerResult::DuplicateName
        );
        assert_eq!(
            directory.add_local_player("Alice2", uuid).await,
            AddPlayerResult::DuplicateUuid
        );
        assert_eq!(directory.player_count().await, 1);

        directory.remove_local_player("Alice", uuid).await;
        assert_eq!(directory.player_count().await, 0);
        assert_eq!(
            directory.add_local_player("Alice", uuid).await,
            AddPlayerResult::Added
        );
    }

    #[tokio::test]
    async fn server_lookup_and_cap() {
        let directory = ConnectDirectory::new();
        directory.load_servers(&[server("lobby"), server("arena")]).await;
        assert!(directory.has_server("lobby").await);
        assert!(!directory.has_server("void").await);
        assert_eq!(directory.get_server("arena").await.unwrap().name, "arena");
        assert_eq!(directory.max_players().await, 40);
    }
}
