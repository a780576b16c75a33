//! Virtual-host routing.
//!
//! The routing key is the sanitized `server_address` the client typed
//! into its multiplayer screen. Routes resolve most-specific first:
//! exact host, then `*.suffix` wildcard, then the `default` entry.

use std::sync::Arc;

use crate::config::{ConfigProvider, RouteConfig};

pub const DEFAULT_ROUTE: &str = "default";

pub struct Router {
    config_provider: Arc<ConfigProvider>,
}

impl Router {
    pub fn new(config_provider: Arc<ConfigProvider>) -> Self {
        Self { config_provider }
    }

    async fn resolve(&self, virtual_host: &str) -> Option<RouteConfig> {
        let host = virtual_host.to_ascii_lowercase();
        let config = self.config_provider.read().await;
        if let Some(route) = config.routes.get(&host) {
            return Some(route.clone());
        }
        let mut best: Option<(usize, &RouteConfig)> = None;
        for (key, route) in config.routes.iter() {
            if let Some(suffix) = key.strip_prefix("*.") {
                let matches = host == suffix
                    || host
                        .strip_suffix(suffix)
                        .is_some_and(|head| head.ends_with('.'));
                if matches && best.map_or(true, |(len, _)| suffix.len() > len) {
                    best = Some((suffix.len(), route));
                }
            }
        }
        if let Some((_, route)) = best {
            return Some(route.clone());
        }
        config.routes.get(DEFAULT_ROUTE).cloned()
    }

    /// Candidate server names for a virtual host.
    pub async fn route(&self, virtual_host: &str) -> Vec<String> {
        self.resolve(virtual_host)
            .await
            .map(|route| route.servers)
            .unwrap_or_default()
    }

    /// MOTD pool for a virtual host. Never empty.
    pub async fn route_motds(&self, virtual_host: &str) -> Vec<String> {
        let motds = self
            .resolve(virtual_host)
            .await
            .map(|route| route.motds)
            .unwrap_or_default();
        if motds.is_empty() {
            vec!["A Minecraft Server".to_owned()]
        } else {
            motds
        }
    }

    /// Favicon path pool for a virtual host.
    pub async fn route_icons(&self, virtual_host: &str) -> Vec<String> {
        self.resolve(virtual_host)
            .await
            .map(|route| route.icons)
            .unwrap_or_default()
    }

    /// Player-sample file path for a virtual host.
    pub async fn route_sample(&self, virtual_host: &str) -> Option<String> {
        self.resolve(virtual_host).await.and_then(|route| route.sample)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::RootConfig;

    fn provider(routes: &str) -> Arc<ConfigProvider> {
        let config: RootConfig = toml::from_str(&format!(
            r#"
            bind = "0.0.0.0:25565"
            servers = []
            {}
            "#,
            routes
        ))
        .unwrap();
        Arc::new(ConfigProvider::new(PathBuf::from("config.toml"), config))
    }

    #[tokio::test]
    async fn exact_match_wins_over_wildcard_and_default() {
        let router = Router::new(provider(
            r#"
            [routes."hub.example.com"]
            servers = ["hub"]
            [routes."*.example.com"]
            servers = ["wild"]
            [routes.default]
            servers = ["lobby"]
            "#,
        ));
        assert_eq!(router.route("hub.example.com").await, vec!["hub"]);
        assert_eq!(router.route("play.example.com").await, vec!["wild"]);
        assert_eq!(router.route("elsewhere.net").await, vec!["lobby"]);
    }

    #[tokio::test]
    async fn wildcard_does_not_match_partial_labels() {
        let router = Router::new(provider(
            r#"
            [routes."*.example.com"]
            servers = ["wild"]
            "#,
        ));
        assert!(router.route("notexample.com").await.is_empty());
        assert_eq!(router.route("a.b.example.com").await, vec!["wild"]);
    }

    #[tokio::test]
    async fn motds_fall_back_to_default_line() {
        let router = Router::new(provider(
            r#"
            [routes.default]
            servers = ["lobby"]
            "#,
        ));
        assert_eq!(
            router.route_motds("anything").await,
            vec!["A Minecraft Server"]
        );
        assert!(router.route_sample("anything").await.is_none());
    }
}
