//! Identity service client.
//!
//! One call matters: `authenticate(name, server_id, shared_secret,
//! public_key)`. The server id is digested together with the shared
//! secret and public key and checked server-side; the session core
//! treats all of that as opaque.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto;

const DEFAULT_ENDPOINT: &str = "https://sessionserver.mojang.com/session/minecraft/hasJoined";

/// Profile returned by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameProfile {
    /// Profile id, 32 hex chars without hyphens.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<GameProfileProperty>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameProfileProperty {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl GameProfile {
    /// Synthesizes the profile used when authentication is disabled.
    pub fn offline(name: &str) -> Self {
        Self {
            id: crypto::offline_uuid(name).simple().to_string(),
            name: name.to_owned(),
            properties: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The service answered but did not vouch for the player.
    #[error("identity service rejected the login")]
    Rejected,
    #[error("identity service request failed: {0}")]
    Request(String),
    #[error("identity service returned an invalid profile: {0}")]
    InvalidProfile(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Asks the identity service whether the named player completed the
    /// encryption handshake for this server id.
    async fn authenticate(
        &self,
        name: &str,
        server_id: &str,
        shared_secret: &[u8],
        public_key: &[u8],
    ) -> Result<GameProfile, AuthError>;
}

/// Production implementation backed by the Mojang session service.
pub struct MojangAuthenticator {
    endpoint: String,
}

impl MojangAuthenticator {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned()),
        }
    }
}

#[async_trait]
impl Authenticator for MojangAuthenticator {
    async fn authenticate(
        &self,
        name: &str,
        server_id: &str,
        shared_secret: &[u8],
        public_key: &[u8],
    ) -> Result<GameProfile, AuthError> {
        let digest = crypto::server_digest(server_id, shared_secret, public_key);
        let url = format!(
            "{}?username={}&serverId={}",
            self.endpoint, name, digest
        );
        // the HTTP client is blocking, keep it off the runtime threads
        let response = tokio::task::spawn_blocking(move || {
            ureq::get(&url).timeout(std::time::Duration::from_secs(10)).call()
        })
        .await
        .map_err(|err| AuthError::Request(err.to_string()))?;
        match response {
            Ok(response) => {
                if response.status() == 204 {
                    // no content: the service does not know this login
                    return Err(AuthError::Rejected);
                }
                let profile: GameProfile = response
                    .into_json()
                    .map_err(|err| AuthError::InvalidProfile(err.to_string()))?;
                Ok(profile)
            }
            Err(ureq::Error::Status(status, _)) if status == 403 || status == 404 => {
                Err(AuthError::Rejected)
            }
            Err(err) => Err(AuthError::Request(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_profile_matches_name_uuid() {
        let profile = GameProfile::offline("Alice");
        assert_eq!(profile.name, "Alice");
        assert_eq!(
            profile.id,
            crypto::offline_uuid("Alice").simple().to_string()
        );
        assert!(profile.properties.is_empty());
    }

    #[test]
    fn profile_parses_service_response() {
        let profile: GameProfile = serde_json::from_str(
            r#"{
                "id": "069a79f444e94726a5befca90e38aaf5",
                "name": "Notch",
                "properties": [
                    {"name": "textures", "value": "e30=", "signature": "sig"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(profile.id, "069a79f444e94726a5befca90e38aaf5");
        assert_eq!(profile.properties.len(), 1);
        assert_eq!(profile.properties[0].signature.as_deref(), Some("sig"));
    }
}
