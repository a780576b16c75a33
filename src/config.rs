use std::collections::HashMap;
use std::path::PathBuf;

use log::log_enabled;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, RwLockReadGuard};

/// As config may be updated by reloads,
/// it is proxied behind this provider.
pub struct ConfigProvider {
    /// Config file path. Used for reloads.
    config_file: PathBuf,

    /// Last parsed config.
    config: RwLock<RootConfig>,
    /// Reload notifier.
    reload_notify: Notify,
}

/// Configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// Address to listen on.
    #[serde(alias = "bind")]
    pub bind_address: String,

    /// Whether to authenticate players against the identity service.
    /// Disabling this runs the proxy in offline mode.
    #[serde(default = "default_true")]
    pub authenticate: bool,
    /// Player cap across the proxy. -1 disables the cap.
    #[serde(default = "default_max_players")]
    pub max_players: i32,
    /// Report the connect directory's cap in status responses instead
    /// of `max_players`.
    #[serde(default)]
    pub sync_max_players: bool,
    /// Brand reported in status responses.
    #[serde(default = "default_brand")]
    pub brand: String,
    /// PKCS#8 DER file holding the proxy's RSA private key.
    /// A fresh keypair is generated at startup when unset.
    pub rsa_key_file: Option<PathBuf>,
    /// Identity service endpoint override.
    pub auth_endpoint: Option<String>,

    /// Player-facing messages.
    #[serde(default)]
    pub messages: Messages,

    /// Servers players can be routed to.
    pub servers: Vec<ServerConfig>,
    /// Virtual-host routes. The `default` entry catches every host
    /// without a more specific route.
    pub routes: HashMap<String, RouteConfig>,
}

/// Localized messages sent on policy disconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Messages {
    #[serde(default = "default_logged_in")]
    pub logged_in: String,
    #[serde(default = "default_full")]
    pub full: String,
    #[serde(default = "default_offline")]
    pub offline: String,
    #[serde(default = "default_auth_failed")]
    pub auth_failed: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            logged_in: default_logged_in(),
            full: default_full(),
            offline: default_offline(),
            auth_failed: default_auth_failed(),
        }
    }
}

/// Configuration for a backend server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name routes refer to.
    pub name: String,
    /// Address of the server.
    pub address: String,
    /// Player cap the server reports to the directory.
    #[serde(default = "default_server_max_players")]
    pub max_players: u32,
}

/// Configuration for one virtual-host route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Candidate servers, by name.
    pub servers: Vec<String>,
    /// MOTD pool, one picked at random per status request.
    #[serde(default = "default_motds")]
    pub motds: Vec<String>,
    /// Favicon PNG paths, one picked at random per status request.
    #[serde(default)]
    pub icons: Vec<String>,
    /// Text file whose lines become the status player sample.
    pub sample: Option<String>,
}

impl ConfigProvider {
    pub fn new(config_file: PathBuf, config: RootConfig) -> Self {
        Self {
            config_file,
            config: RwLock::new(config),
            reload_notify: Notify::new(),
        }
    }
}

/// Attempts to read the configuration file.
///
/// ## Arguments
///
/// * `config_file` - Config file path
///
/// ## Returns
///
/// A [`ConfigProvider`] that is guaranteed to have the config already loaded and without errors.
pub fn read_config(config_file: PathBuf) -> anyhow::Result<ConfigProvider> {
    let contents = std::fs::read_to_string(&config_file)?;
    let config: RootConfig = toml::from_str(&contents)?;
    let config_provider = ConfigProvider {
        config_file,
        config: RwLock::new(config),
        reload_notify: Notify::new(),
    };
    Ok(config_provider)
}

impl ConfigProvider {
    #[inline]
    pub async fn read(&self) -> RwLockReadGuard<'_, RootConfig> {
        self.config.read().await
    }

    #[inline]
    pub async fn wait_reload(&self) {
        self.reload_notify.notified().await;
    }

    /// Reloads the configuration.
    pub async fn reload(&self) {
        let config = match self.read_config().await {
            Ok(config) => config,
            Err(err) => {
                log::error!("Unable to reload config file: {:?}", err);
                return;
            }
        };
        let mut w = self.config.write().await;
        *w = config;
        drop(w);
        log::info!("Config file reloaded.");
        if log_enabled!(log::Level::Debug) {
            let config = self.read().await;
            log::debug!("Parsed configuration: {:#?}", config);
        }
        self.reload_notify.notify_waiters();
    }

    async fn read_config(&self) -> anyhow::Result<RootConfig> {
        let contents = tokio::fs::read_to_string(&self.config_file).await?;
        let config: RootConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_players() -> i32 {
    -1
}

fn default_brand() -> String {
    "basalt".to_owned()
}

fn default_server_max_players() -> u32 {
    20
}

fn default_motds() -> Vec<String> {
    vec!["A Minecraft Server".to_owned()]
}

fn default_logged_in() -> String {
    "&cYou are already logged in to this network.".to_owned()
}

fn default_full() -> String {
    "&cThe network is full.".to_owned()
}

fn default_offline() -> String {
    "&cThere is no server available to handle your connection.".to_owned()
}

fn default_auth_failed() -> String {
    "Error: Authentication to Minecraft.net Failed".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config: RootConfig = toml::from_str(
            r#"
            bind = "0.0.0.0:25565"

            [[servers]]
            name = "lobby"
            address = "127.0.0.1:25566"

            [routes.default]
            servers = ["lobby"]
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:25565");
        assert!(config.authenticate);
        assert_eq!(config.max_players, -1);
        assert_eq!(config.servers[0].name, "lobby");
        assert_eq!(config.routes["default"].servers, vec!["lobby"]);
        assert_eq!(config.routes["default"].motds, vec!["A Minecraft Server"]);
        assert_eq!(config.messages.auth_failed, default_auth_failed());
    }
}
