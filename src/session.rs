//! Per-client session engine.
//!
//! A session owns one client connection and drives it through the
//! protocol state machine: handshake, status or login (plain or
//! encrypted), then live play against an upstream bridge. The codec
//! pipeline is reconfigured in place as the connection negotiates
//! encryption and compression and crosses protocol phases.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::auth::GameProfile;
use crate::bridge::{BridgeHandle, BridgeSnapshot, SessionOutBridge};
use crate::crypto;
use crate::directory::{AddPlayerResult, ServerRecord};
use crate::event::{PacketDirection, RedirectEvent, SessionInfo};
use crate::minecraft::codec::{
    self, Cfb8Codec, CodecError, Flow, FrameCodec, PacketPipeline, Phase, PipelineError,
    RegistryCodec, Stage, ZlibCodec,
};
use crate::minecraft::io::{ConnCodec, ConnError, ConnHandle};
use crate::minecraft::packet::{
    ClientSettings, Disconnect, EncryptRequest, EncryptResponse, Handshake, LoginDisconnect,
    LoginSetCompression, LoginStart, LoginSuccess, Packet, PluginMessage, SetCompression,
    StatusPing, StatusResponse, NEXT_STATE_LOGIN, NEXT_STATE_STATUS,
};
use crate::minecraft::version::{
    self, Version, COMPRESSION_IN_LOGIN_VERSION, HYPHENATED_UUID_VERSION,
};
use crate::minecraft::{colorize, CHANNEL_BRAND, CHANNEL_REGISTER, CHANNEL_UNREGISTER};
use crate::proxy::ProxyServer;
use crate::registry::RegisteredSession;
use crate::status;

/// Idle read timeout, both before and after login.
pub const READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Hard cap on registered plugin channels per session.
const MAX_PLUGIN_CHANNELS: usize = 128;

const MAX_NAME_LENGTH: usize = 16;

/// Compression threshold pinned for versions that negotiate during login.
const LOGIN_COMPRESSION_THRESHOLD: i32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial and terminal. Entering it from any other state is
    /// irreversible for the session.
    Disconnected,
    Status,
    StatusPing,
    Login,
    LoginEncrypt,
    /// Authenticated and registered; the upstream bridge has not
    /// completed its own handshake yet.
    Init,
    /// Upstream bridge is live; client packets are forwarded.
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Status => "Status",
            Self::StatusPing => "StatusPing",
            Self::Login => "Login",
            Self::LoginEncrypt => "LoginEncrypt",
            Self::Init => "Init",
            Self::Connected => "Connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unexpected packet: {expected} expected, got {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },
    #[error("unexpected handshake state: {0}")]
    UnexpectedNextState(i32),
    #[error("protocol version does not match: {0}")]
    UnsupportedVersion(i32),
    #[error("unexpected name: {0:?}")]
    InvalidName(String),
    #[error("could not decrypt encryption response")]
    DecryptFailed,
    #[error("verify token does not match")]
    VerifyTokenMismatch,
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Accumulates NUL-separated channel names into the session's set,
/// capping both the incoming batch and the total at the protocol
/// limit. Channels past the cap are dropped in order.
fn accumulate_plugin_channels(channels: &mut HashSet<String>, data: &[u8]) {
    for chunk in data.split(|byte| *byte == 0).take(MAX_PLUGIN_CHANNELS) {
        if chunk.is_empty() {
            continue;
        }
        let Ok(channel) = std::str::from_utf8(chunk) else {
            continue;
        };
        if channels.len() >= MAX_PLUGIN_CHANNELS {
            break;
        }
        channels.insert(channel.to_owned());
    }
}

/// Checks the client-chosen display name: 1-16 chars of `[A-Za-z0-9_]`.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// State shared between the session's read task, its out bridge and
/// the hook surface.
pub struct SessionShared {
    pub session_id: u64,
    pub server: Arc<ProxyServer>,
    pub conn: ConnHandle,

    state: Mutex<SessionState>,
    redirecting: Mutex<bool>,
    /// Upstream names this session is currently attached to.
    active_servers: Mutex<HashSet<String>>,
    compression_threshold: Mutex<i32>,
    out_bridge: Mutex<Option<BridgeHandle>>,
    /// Set once the session authenticates.
    identity: Mutex<Option<(String, Uuid)>>,
    remote: Mutex<(String, String)>,

    client_entity_id: AtomicI32,
    server_entity_id: AtomicI32,
}

impl SessionShared {
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock")
    }

    /// Updates the state and fires the state hook.
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock") = state;
        self.server.event_bus.fire_session_state(&self.info(), state);
    }

    pub fn authenticated(&self) -> bool {
        matches!(self.state(), SessionState::Init | SessionState::Connected)
    }

    pub fn initializing(&self) -> bool {
        self.state() == SessionState::Init
    }

    pub fn is_redirecting(&self) -> bool {
        *self.redirecting.lock().expect("redirecting lock")
    }

    pub fn set_redirecting(&self, redirecting: bool) {
        *self.redirecting.lock().expect("redirecting lock") = redirecting;
    }

    pub fn add_active_server(&self, name: &str) {
        self.active_servers
            .lock()
            .expect("active servers lock")
            .insert(name.to_owned());
    }

    pub fn remove_active_server(&self, name: &str) {
        self.active_servers
            .lock()
            .expect("active servers lock")
            .remove(name);
    }

    pub fn client_entity_id(&self) -> i32 {
        self.client_entity_id.load(Ordering::Acquire)
    }

    pub fn server_entity_id(&self) -> i32 {
        self.server_entity_id.load(Ordering::Acquire)
    }

    pub fn set_client_entity_id(&self, id: i32) {
        self.client_entity_id.store(id, Ordering::Release);
    }

    pub fn set_server_entity_id(&self, id: i32) {
        self.server_entity_id.store(id, Ordering::Release);
    }

    pub fn out_bridge(&self) -> Option<BridgeHandle> {
        self.out_bridge.lock().expect("out bridge lock").clone()
    }

    pub fn set_out_bridge(&self, handle: BridgeHandle) {
        *self.out_bridge.lock().expect("out bridge lock") = Some(handle);
    }

    fn take_out_bridge(&self) -> Option<BridgeHandle> {
        self.out_bridge.lock().expect("out bridge lock").take()
    }

    /// Whether the given bridge is the one currently serving the session.
    pub fn is_current_bridge(&self, bridge_id: u64) -> bool {
        self.out_bridge
            .lock()
            .expect("out bridge lock")
            .as_ref()
            .is_some_and(|handle| handle.bridge_id == bridge_id)
    }

    fn set_identity(&self, name: &str, uuid: Uuid) {
        *self.identity.lock().expect("identity lock") = Some((name.to_owned(), uuid));
    }

    pub fn remote(&self) -> (String, String) {
        self.remote.lock().expect("remote lock").clone()
    }

    /// Overrides the reported remote address, trusting a front layer's
    /// forwarded value.
    pub fn remote_override(&self, ip: String, port: String) {
        *self.remote.lock().expect("remote lock") = (ip, port);
    }

    pub fn info(&self) -> SessionInfo {
        let (remote_ip, remote_port) = self.remote();
        SessionInfo {
            session_id: self.session_id,
            remote_ip,
            remote_port,
            name: self
                .identity
                .lock()
                .expect("identity lock")
                .as_ref()
                .map(|(name, _)| name.clone()),
        }
    }

    /// Writes a packet to the client, through the hook surface. A
    /// vetoed write is silently suppressed.
    pub async fn write(&self, packet: &Packet) -> Result<(), ConnError> {
        let info = self.info();
        if self
            .server
            .event_bus
            .fire_packet_pre(&info, packet, PacketDirection::Write)
        {
            return Ok(());
        }
        self.conn.write(packet).await?;
        self.server
            .event_bus
            .fire_packet_monitor(&info, packet, PacketDirection::Write);
        Ok(())
    }

    /// Sets the compression threshold. A call with the current value is
    /// a no-op; an effective change is announced to the client at most
    /// once, depending on the protocol phase and version.
    pub async fn set_compression(&self, threshold: i32) -> Result<(), SessionError> {
        {
            let mut current = self.compression_threshold.lock().expect("threshold lock");
            if *current == threshold {
                return Ok(());
            }
            *current = threshold;
        }
        let (phase, registry_version) = self
            .conn
            .with_pipeline(|pipeline| (pipeline.registry_phase(), pipeline.registry_version()))
            .await;
        match (phase, registry_version) {
            (Some(Phase::Login), Some(_)) => {
                self.write(&Packet::LoginSetCompression(LoginSetCompression { threshold }))
                    .await?;
            }
            (Some(Phase::Play), Some(version)) if version.legacy_play_compression => {
                self.write(&Packet::SetCompression(SetCompression { threshold }))
                    .await?;
            }
            // Newer play registries have no SetCompression packet; for
            // those the threshold is pinned during login and never
            // re-announced.
            _ => {}
        }
        self.conn
            .with_pipeline(|pipeline| {
                if threshold == -1 {
                    pipeline.remove(codec::ZLIB).map(|_| ())
                } else if pipeline.has(codec::ZLIB) {
                    pipeline
                        .replace(Stage::Zlib(ZlibCodec::new(threshold)))
                        .map(|_| ())
                } else {
                    pipeline.add_before(codec::REGISTRY, Stage::Zlib(ZlibCodec::new(threshold)))
                }
            })
            .await?;
        Ok(())
    }

    /// Disconnects the client with a plain text reason.
    pub async fn disconnect(&self, reason: &str) {
        let json = serde_json::json!({ "text": reason }).to_string();
        self.disconnect_json(&json).await;
    }

    /// Disconnects the client with a raw chat component. The packet is
    /// only written when a phase that knows a disconnect packet is
    /// active; otherwise the connection just closes.
    pub async fn disconnect_json(&self, json: &str) {
        let phase = self.conn.with_pipeline(|pipeline| pipeline.registry_phase()).await;
        match phase {
            Some(Phase::Login) => {
                let _ = self
                    .write(&Packet::LoginDisconnect(LoginDisconnect {
                        reason: json.to_owned(),
                    }))
                    .await;
            }
            Some(Phase::Play) => {
                let _ = self
                    .write(&Packet::Disconnect(Disconnect {
                        reason: json.to_owned(),
                    }))
                    .await;
            }
            _ => {}
        }
        self.conn.close().await;
    }
}

/// One client connection being driven through the state machine.
pub struct Session {
    shared: Arc<SessionShared>,
    conn: ConnCodec,

    protocol_version: i32,
    protocol: Option<&'static Version>,
    virtual_host: String,
    raw_virtual_host: String,
    server_port: u16,
    name: String,
    uuid: Option<Uuid>,
    profile: Option<GameProfile>,
    server_id: String,
    verify_token: Vec<u8>,
    plugin_channels: HashSet<String>,
    client_settings: Option<ClientSettings>,
    mc_brand: Option<PluginMessage>,
}

impl Session {
    /// Serves one accepted client connection to completion.
    pub async fn serve(server: Arc<ProxyServer>, stream: TcpStream) {
        let (remote_ip, remote_port) = match stream.peer_addr() {
            Ok(addr) => (addr.ip().to_string(), addr.port().to_string()),
            Err(_) => (String::new(), String::new()),
        };
        let mut pipeline = PacketPipeline::new();
        pipeline
            .add_last(Stage::Frame(FrameCodec))
            .expect("fresh pipeline");
        pipeline
            .add_last(Stage::Registry(RegistryCodec::handshake(Flow::Player)))
            .expect("fresh pipeline");
        let (conn, handle) = ConnCodec::new(stream, pipeline, READ_TIMEOUT);

        let shared = Arc::new(SessionShared {
            session_id: server.next_session_id(),
            server,
            conn: handle,
            state: Mutex::new(SessionState::Disconnected),
            redirecting: Mutex::new(false),
            active_servers: Mutex::new(HashSet::new()),
            compression_threshold: Mutex::new(-1),
            out_bridge: Mutex::new(None),
            identity: Mutex::new(None),
            remote: Mutex::new((remote_ip, remote_port)),
            client_entity_id: AtomicI32::new(0),
            server_entity_id: AtomicI32::new(0),
        });

        if shared.server.event_bus.fire_session_open(&shared.info()) {
            shared.conn.close().await;
            return;
        }

        let mut session = Session {
            shared: shared.clone(),
            conn,
            protocol_version: 0,
            protocol: None,
            virtual_host: String::new(),
            raw_virtual_host: String::new(),
            server_port: 0,
            name: String::new(),
            uuid: None,
            profile: None,
            server_id: String::new(),
            verify_token: Vec::new(),
            plugin_channels: HashSet::new(),
            client_settings: None,
            mc_brand: None,
        };
        let err = session.run().await;
        session.error_caught(err).await;
    }

    /// Read loop: exits with the first transport, decode or handler
    /// error, which is then funneled through [`Self::error_caught`].
    async fn run(&mut self) -> SessionError {
        loop {
            let packet = match self.conn.read_packet().await {
                Ok(packet) => packet,
                Err(err) => return err.into(),
            };
            if let Err(err) = self.handle_packet(packet).await {
                return err;
            }
        }
    }

    /// Fires the hook surface around the state-specific dispatch.
    async fn handle_packet(&mut self, packet: Packet) -> Result<(), SessionError> {
        let info = self.shared.info();
        if self
            .shared
            .server
            .event_bus
            .fire_packet_pre(&info, &packet, PacketDirection::Read)
        {
            return Ok(());
        }
        self.dispatch_packet(&packet).await?;
        self.shared
            .server
            .event_bus
            .fire_packet_monitor(&info, &packet, PacketDirection::Read);
        Ok(())
    }

    async fn dispatch_packet(&mut self, packet: &Packet) -> Result<(), SessionError> {
        match self.shared.state() {
            SessionState::Disconnected => match packet {
                Packet::Handshake(handshake) => self.handle_handshake(handshake).await,
                other => Err(SessionError::UnexpectedPacket {
                    expected: "handshake",
                    got: other.kind(),
                }),
            },
            SessionState::Status => match packet {
                Packet::StatusRequest(_) => self.handle_status_request().await,
                other => Err(SessionError::UnexpectedPacket {
                    expected: "status request",
                    got: other.kind(),
                }),
            },
            SessionState::StatusPing => match packet {
                Packet::StatusPing(ping) => {
                    self.shared
                        .write(&Packet::StatusPing(StatusPing { time: ping.time }))
                        .await?;
                    self.shared.conn.close().await;
                    Ok(())
                }
                other => Err(SessionError::UnexpectedPacket {
                    expected: "status ping",
                    got: other.kind(),
                }),
            },
            SessionState::Login => match packet {
                Packet::LoginStart(login) => self.handle_login_start(login).await,
                other => Err(SessionError::UnexpectedPacket {
                    expected: "login start",
                    got: other.kind(),
                }),
            },
            SessionState::LoginEncrypt => match packet {
                Packet::EncryptResponse(response) => self.handle_encrypt_response(response).await,
                other => Err(SessionError::UnexpectedPacket {
                    expected: "login encrypt",
                    got: other.kind(),
                }),
            },
            // nothing is expected from the client until the bridge is
            // live; anything early is dropped
            SessionState::Init => {
                log::trace!(
                    "[{}] Dropping {} received while initializing",
                    self.shared.remote().0,
                    packet.kind()
                );
                Ok(())
            }
            SessionState::Connected => self.handle_play_packet(packet).await,
        }
    }

    async fn handle_handshake(&mut self, handshake: &Handshake) -> Result<(), SessionError> {
        self.protocol_version = handshake.protocol_version;
        self.raw_virtual_host = handshake.server_address.clone();
        self.server_port = handshake.server_port;
        // some vendors smuggle extra data after a NUL; route only on
        // the prefix, keep the raw form for upstream forwarding
        let host = self.raw_virtual_host.split('\0').next().unwrap_or("");
        self.virtual_host = host.strip_suffix('.').unwrap_or(host).to_owned();

        let supported = version::is_supported(self.protocol_version);
        match handshake.next_state {
            NEXT_STATE_STATUS => {
                if !supported {
                    // answer with a version the client can at least
                    // render a mismatch against
                    self.protocol_version = version::fallback_version();
                }
                self.shared
                    .conn
                    .with_pipeline(|pipeline| {
                        pipeline.replace(Stage::Registry(RegistryCodec::status(Flow::Player)))
                    })
                    .await?;
                self.shared.set_state(SessionState::Status);
                Ok(())
            }
            NEXT_STATE_LOGIN => {
                if !supported {
                    return Err(SessionError::UnsupportedVersion(self.protocol_version));
                }
                let protocol = version::select(self.protocol_version);
                self.protocol = Some(protocol);
                self.shared
                    .conn
                    .with_pipeline(|pipeline| {
                        pipeline.replace(Stage::Registry(RegistryCodec::login(
                            protocol,
                            Flow::Player,
                        )))
                    })
                    .await?;
                self.shared.set_state(SessionState::Login);
                Ok(())
            }
            other => Err(SessionError::UnexpectedNextState(other)),
        }
    }

    async fn handle_status_request(&mut self) -> Result<(), SessionError> {
        let body =
            status::build_status(&self.shared.server, &self.virtual_host, self.protocol_version)
                .await?;
        self.shared
            .write(&Packet::StatusResponse(StatusResponse { body }))
            .await?;
        self.shared.set_state(SessionState::StatusPing);
        Ok(())
    }

    async fn handle_login_start(&mut self, login: &LoginStart) -> Result<(), SessionError> {
        if !valid_name(&login.name) {
            return Err(SessionError::InvalidName(login.name.clone()));
        }
        self.name = login.name.clone();
        if self.shared.server.authenticate_enabled().await {
            self.server_id = crypto::gen_salt();
            self.verify_token = crypto::random_bytes(4);
            self.shared
                .write(&Packet::EncryptRequest(EncryptRequest {
                    server_id: self.server_id.clone(),
                    public_key: self.shared.server.keypair.public_key_der().to_vec(),
                    verify_token: self.verify_token.clone(),
                }))
                .await?;
            self.shared.set_state(SessionState::LoginEncrypt);
        } else {
            self.profile = Some(GameProfile::offline(&self.name));
            self.set_authenticated(true).await?;
        }
        Ok(())
    }

    async fn handle_encrypt_response(
        &mut self,
        response: &EncryptResponse,
    ) -> Result<(), SessionError> {
        let server = self.shared.server.clone();
        let secret_ciphertext = response.shared_secret.clone();
        let token_ciphertext = response.verify_token.clone();
        // RSA decrypt is CPU-bound, keep it off the runtime threads
        let decrypted = tokio::task::spawn_blocking(move || {
            let shared_secret = server.keypair.decrypt(&secret_ciphertext)?;
            let verify_token = server.keypair.decrypt(&token_ciphertext)?;
            anyhow::Ok((shared_secret, verify_token))
        })
        .await
        .map_err(|err| SessionError::Other(err.into()))?
        .map_err(|_| SessionError::DecryptFailed)?;
        let (shared_secret, verify_token) = decrypted;
        if !crypto::constant_time_eq(&self.verify_token, &verify_token) {
            return Err(SessionError::VerifyTokenMismatch);
        }
        self.set_encryption(&shared_secret).await?;

        let server = &self.shared.server;
        let auth_result = server
            .authenticator
            .authenticate(
                &self.name,
                &self.server_id,
                &shared_secret,
                server.keypair.public_key_der(),
            )
            .await;
        let (remote_ip, _) = self.shared.remote();
        match auth_result {
            Ok(profile) => {
                log::info!("Authorized {} (ip: {})", self.name, remote_ip);
                self.profile = Some(profile);
                self.set_authenticated(true).await?;
            }
            Err(err) => {
                log::warn!(
                    "Failed to authorize {} (ip: {}): {}",
                    self.name,
                    remote_ip,
                    err
                );
                self.set_authenticated(false).await?;
            }
        }
        Ok(())
    }

    /// Installs the stream cipher in front of the framing stage; every
    /// byte in both directions is ciphered from here on.
    async fn set_encryption(&mut self, shared_secret: &[u8]) -> Result<(), SessionError> {
        let cipher = Cfb8Codec::new(shared_secret)?;
        self.shared
            .conn
            .with_pipeline(|pipeline| pipeline.add_before(codec::FRAME, Stage::Cfb8(cipher)))
            .await?;
        Ok(())
    }

    /// Runs the post-authentication sequence: identity checks, capacity
    /// checks, backend selection, login completion and the first
    /// redirect. Any policy rejection disconnects with a localized
    /// message and leaves the session to be cleaned up.
    async fn set_authenticated(&mut self, result: bool) -> Result<(), SessionError> {
        let messages = self.shared.server.messages().await;
        if !result {
            self.shared.disconnect(&colorize(&messages.auth_failed)).await;
            return Ok(());
        }
        let profile = match &self.profile {
            Some(profile) => profile.clone(),
            None => return Err(SessionError::Other(anyhow::anyhow!("missing game profile"))),
        };
        let uuid = match crypto::canonical_uuid(&profile.id) {
            Some(uuid) => uuid,
            None => {
                self.shared.disconnect(&colorize(&messages.auth_failed)).await;
                return Ok(());
            }
        };
        self.uuid = Some(uuid);

        let server = self.shared.server.clone();
        if server.session_registry.has_name(&self.name).await
            || server.session_registry.has_uuid(uuid).await
        {
            self.shared.disconnect(&colorize(&messages.logged_in)).await;
            return Ok(());
        }
        let max_players = server.max_players().await;
        if max_players > 1 && server.session_registry.len().await >= max_players as usize {
            self.shared.disconnect(&colorize(&messages.full)).await;
            return Ok(());
        }

        let mut candidates = Vec::new();
        for name in server.router.route(&self.virtual_host).await {
            if server.directory.has_server(&name).await {
                candidates.push(name);
            }
        }
        if candidates.is_empty() {
            self.shared.disconnect(&colorize(&messages.offline)).await;
            return Ok(());
        }
        let server_name = candidates
            .swap_remove(rand::thread_rng().gen_range(0..candidates.len()));
        let record = match server.directory.get_server(&server_name).await {
            Some(record) => record,
            None => {
                self.shared
                    .disconnect(&format!("Error: Outbound Server Mismatch: {}", server_name))
                    .await;
                return Ok(());
            }
        };
        match server.directory.add_local_player(&self.name, uuid).await {
            AddPlayerResult::Added => {}
            AddPlayerResult::DuplicateName | AddPlayerResult::DuplicateUuid => {
                self.shared.disconnect(&colorize(&messages.logged_in)).await;
                return Ok(());
            }
        }
        self.shared.set_identity(&self.name, uuid);
        self.shared.set_state(SessionState::Init);

        if self.protocol_version >= COMPRESSION_IN_LOGIN_VERSION {
            self.shared
                .set_compression(LOGIN_COMPRESSION_THRESHOLD)
                .await?;
        }
        let uuid_field = if self.protocol_version >= HYPHENATED_UUID_VERSION {
            uuid.hyphenated().to_string()
        } else {
            profile.id.clone()
        };
        self.shared
            .write(&Packet::LoginSuccess(LoginSuccess {
                uuid: uuid_field,
                name: self.name.clone(),
            }))
            .await?;
        let protocol = match self.protocol {
            Some(protocol) => protocol,
            None => return Err(SessionError::Other(anyhow::anyhow!("missing protocol"))),
        };
        self.shared
            .conn
            .with_pipeline(|pipeline| {
                pipeline.replace(Stage::Registry(RegistryCodec::play(protocol, Flow::Player)))
            })
            .await?;
        self.shared.conn.set_timeout(READ_TIMEOUT);
        server
            .session_registry
            .register(RegisteredSession {
                session_id: self.shared.session_id,
                name: self.name.clone(),
                uuid,
            })
            .await;
        self.redirect(&record).await;
        Ok(())
    }

    /// Migrates the session to the given upstream. Fires the vetoable
    /// redirect hook, dials, and hands the socket to a fresh bridge. A
    /// dial failure is fatal while initializing and soft once live.
    pub async fn redirect(&mut self, record: &Arc<ServerRecord>) {
        let init = self.shared.initializing();
        let event = RedirectEvent {
            init,
            server_name: &record.name,
            server_addr: &record.address,
        };
        if self
            .shared
            .server
            .event_bus
            .fire_session_redirect(&self.shared.info(), &event)
        {
            return;
        }
        let (remote_ip, _) = self.shared.remote();
        match TcpStream::connect(&record.address).await {
            Ok(stream) => {
                log::info!(
                    "Redirected {} (ip: {}) to {}",
                    self.name,
                    remote_ip,
                    record.name
                );
                let snapshot = BridgeSnapshot {
                    protocol: self.protocol.unwrap_or(&version::V1_8),
                    protocol_version: self.protocol_version,
                    raw_virtual_host: self.raw_virtual_host.clone(),
                    server_port: self.server_port,
                    name: self.name.clone(),
                    profile: self.profile.clone(),
                    uuid: self.uuid.unwrap_or_else(Uuid::nil),
                    client_settings: self.client_settings.clone(),
                    mc_brand: self.mc_brand.clone(),
                };
                if !init {
                    self.shared.set_redirecting(true);
                }
                SessionOutBridge::start(self.shared.clone(), record.clone(), stream, snapshot);
            }
            Err(err) => {
                log::warn!(
                    "Failed to redirect {} (ip: {}) to {}: {:?}",
                    self.name,
                    remote_ip,
                    record.name,
                    err
                );
                if self.shared.initializing() {
                    self.shared
                        .disconnect("Error: Outbound Connection Mismatch")
                        .await;
                }
            }
        }
    }

    /// Connected-phase dispatch: plugin channel bookkeeping always
    /// applies; forwarding is suppressed while a redirect is swapping
    /// upstreams.
    async fn handle_play_packet(&mut self, packet: &Packet) -> Result<(), SessionError> {
        match packet {
            Packet::ClientSettings(settings) => {
                self.client_settings = Some(settings.clone());
            }
            Packet::PluginMessage(message) if message.channel == CHANNEL_REGISTER => {
                self.register_plugin_channels(&message.data);
            }
            Packet::PluginMessage(message) if message.channel == CHANNEL_UNREGISTER => {
                for chunk in message.data.split(|byte| *byte == 0) {
                    if let Ok(channel) = std::str::from_utf8(chunk) {
                        self.plugin_channels.remove(channel);
                    }
                }
            }
            Packet::PluginMessage(message) if message.channel == CHANNEL_BRAND => {
                self.mc_brand = Some(message.clone());
            }
            _ => {}
        }
        if self.shared.is_redirecting() {
            return Ok(());
        }
        let mut outgoing = packet.clone();
        if let Packet::Generic(generic) = &mut outgoing {
            let leading_ids = self
                .protocol
                .map(|protocol| protocol.id_map.entity_id_leading_sb)
                .unwrap_or_default();
            if leading_ids.contains(&generic.id) {
                generic.swap_entities(
                    self.shared.client_entity_id(),
                    self.shared.server_entity_id(),
                    false,
                );
            }
        }
        if let Some(bridge) = self.shared.out_bridge() {
            bridge.write(outgoing).await;
        }
        Ok(())
    }

    fn register_plugin_channels(&mut self, data: &[u8]) {
        accumulate_plugin_channels(&mut self.plugin_channels, data);
    }

    /// The single cleanup chokepoint: unregisters, closes, and fires
    /// the close hook. Always runs exactly once, when the read loop
    /// exits.
    async fn error_caught(&mut self, err: SessionError) {
        if self.shared.authenticated() {
            if let Some(uuid) = self.uuid {
                self.shared
                    .server
                    .directory
                    .remove_local_player(&self.name, uuid)
                    .await;
                self.shared
                    .server
                    .session_registry
                    .unregister(self.shared.session_id, &self.name, uuid)
                    .await;
            }
            let (remote_ip, _) = self.shared.remote();
            log::info!(
                "Disconnected {} (ip: {}): {}",
                self.name,
                remote_ip,
                err
            );
        } else {
            log::debug!(
                "[{}] Connection ended: {}",
                self.shared.remote().0,
                err
            );
        }
        // dropping the handle lets the bridge task wind down
        drop(self.shared.take_out_bridge());
        self.shared.set_state(SessionState::Disconnected);
        self.shared.conn.close().await;
        self.shared
            .server
            .event_bus
            .fire_session_close(&self.shared.info());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_name("Alice"));
        assert!(valid_name("a"));
        assert!(valid_name("Player_123"));
        assert!(valid_name("abcdefghijklmnop"));
        assert!(!valid_name(""));
        assert!(!valid_name("abcdefghijklmnopq"));
        assert!(!valid_name("space name"));
        assert!(!valid_name("dash-name"));
        assert!(!valid_name("émile"));
        assert!(!valid_name("nul\0name"));
    }

    #[test]
    fn state_display() {
        assert_eq!(SessionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(SessionState::LoginEncrypt.to_string(), "LoginEncrypt");
        assert_eq!(SessionState::Connected.to_string(), "Connected");
    }

    #[test]
    fn plugin_channels_cap_at_128() {
        let mut channels = HashSet::new();
        let names: Vec<String> = (0..200).map(|i| format!("ch{:03}", i)).collect();
        let batch = names.join("\0");
        accumulate_plugin_channels(&mut channels, batch.as_bytes());
        assert_eq!(channels.len(), 128);
        // the first 128 of the batch, in order
        for name in &names[..128] {
            assert!(channels.contains(name));
        }
        for name in &names[128..] {
            assert!(!channels.contains(name));
        }

        // a later batch with fresh names adds none
        accumulate_plugin_channels(&mut channels, b"late1\0late2");
        assert_eq!(channels.len(), 128);
        assert!(!channels.contains("late1"));
    }

    #[test]
    fn plugin_channels_dedup_and_skip_invalid() {
        let mut channels = HashSet::new();
        accumulate_plugin_channels(&mut channels, b"a|b\0a|b\0\0c|d");
        assert_eq!(channels.len(), 2);
        accumulate_plugin_channels(&mut channels, &[0xFF, 0xFE]);
        assert_eq!(channels.len(), 2);
    }
}
