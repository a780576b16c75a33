use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::auth::{Authenticator, MojangAuthenticator};
use crate::config::{ConfigProvider, Messages};
use crate::crypto::ProxyKeypair;
use crate::directory::ConnectDirectory;
use crate::event::EventBus;
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::session::Session;

/// The proxy server: owns the shared services every session consumes
/// and accepts client connections.
pub struct ProxyServer {
    /// Config provider.
    pub config_provider: Arc<ConfigProvider>,
    /// Virtual-host router.
    pub router: Router,
    /// Connect directory.
    pub directory: ConnectDirectory,
    /// Live authenticated sessions.
    pub session_registry: SessionRegistry,
    /// Hook surface.
    pub event_bus: EventBus,
    /// Identity service client.
    pub authenticator: Box<dyn Authenticator>,
    /// RSA keypair for the encryption handshake.
    pub keypair: ProxyKeypair,

    session_counter: AtomicU64,
}

impl ProxyServer {
    /// Builds the proxy and its services from configuration.
    pub async fn init(config_provider: Arc<ConfigProvider>) -> anyhow::Result<Arc<Self>> {
        let auth_endpoint = config_provider.read().await.auth_endpoint.clone();
        Self::init_with_authenticator(
            config_provider,
            Box::new(MojangAuthenticator::new(auth_endpoint)),
        )
        .await
    }

    /// Same as [`Self::init`] with an injected identity service client.
    pub async fn init_with_authenticator(
        config_provider: Arc<ConfigProvider>,
        authenticator: Box<dyn Authenticator>,
    ) -> anyhow::Result<Arc<Self>> {
        let (rsa_key_file, servers) = {
            let config = config_provider.read().await;
            (config.rsa_key_file.clone(), config.servers.clone())
        };
        let keypair = match &rsa_key_file {
            Some(path) => ProxyKeypair::from_der_file(path)?,
            None => {
                log::debug!("No RSA key file configured, generating a keypair");
                ProxyKeypair::generate()?
            }
        };
        let directory = ConnectDirectory::new();
        directory.load_servers(&servers).await;
        Ok(Arc::new(Self {
            router: Router::new(config_provider.clone()),
            config_provider,
            directory,
            session_registry: SessionRegistry::new(),
            event_bus: EventBus::new(),
            authenticator,
            keypair,
            session_counter: AtomicU64::new(0),
        }))
    }

    /// Runs the proxy server.
    ///
    /// If stopped graciously it will return `Ok(())`, otherwise it will return an error.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let bind_address = {
            let config = self.config_provider.read().await;
            config.bind_address.clone()
        };
        let listener = TcpListener::bind(&bind_address).await?;
        self.serve_listener(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        log::info!("Listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::trace!("[{}] Accepted connection", addr);
            if let Err(err) = stream.set_nodelay(true) {
                log::debug!("[{}] Could not set nodelay: {:?}", addr, err);
            }
            tokio::spawn({
                let server = self.clone();
                async move {
                    Session::serve(server, stream).await;
                }
            });
        }
    }

    /// Propagates changes from the config provider.
    pub async fn reload_config(&self) {
        let servers = {
            let config = self.config_provider.read().await;
            config.servers.clone()
        };
        self.directory.load_servers(&servers).await;
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn authenticate_enabled(&self) -> bool {
        self.config_provider.read().await.authenticate
    }

    pub async fn max_players(&self) -> i32 {
        self.config_provider.read().await.max_players
    }

    pub async fn sync_max_players(&self) -> bool {
        self.config_provider.read().await.sync_max_players
    }

    pub async fn brand(&self) -> String {
        self.config_provider.read().await.brand.clone()
    }

    pub async fn messages(&self) -> Messages {
        self.config_provider.read().await.messages.clone()
    }
}
