//! Upstream side of a session: the bridge that logs in to a backend
//! server on the player's behalf and relays traffic afterwards.
//!
//! The session owns the bridge handle; the bridge holds a non-owning
//! reference to the session's shared state. A redirect simply starts a
//! fresh bridge; the previous one notices it is no longer current and
//! winds down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::GameProfile;
use crate::directory::ServerRecord;
use crate::minecraft::codec::{
    self, Flow, FrameCodec, PacketPipeline, RegistryCodec, Stage, ZlibCodec,
};
use crate::minecraft::io::{ConnCodec, ConnHandle};
use crate::minecraft::packet::{
    ClientSettings, Handshake, JoinGame, LoginStart, Packet, PluginMessage, NEXT_STATE_LOGIN,
};
use crate::minecraft::version::Version;
use crate::session::{SessionShared, SessionState, READ_TIMEOUT};

static BRIDGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outbound packet queue depth towards one backend.
const BRIDGE_QUEUE: usize = 64;

/// Handle the session keeps to its current bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    pub bridge_id: u64,
    pub server_name: String,
    tx: mpsc::Sender<Packet>,
}

impl BridgeHandle {
    /// Queues a packet for the backend. Dropped quietly if the bridge
    /// already wound down; the session is about to find out anyway.
    pub async fn write(&self, packet: Packet) {
        if self.tx.send(packet).await.is_err() {
            log::trace!("Dropped packet for closed bridge to {}", self.server_name);
        }
    }
}

/// Session data the bridge needs to log in upstream and to replay
/// client state after the switch.
pub struct BridgeSnapshot {
    pub protocol: &'static Version,
    pub protocol_version: i32,
    pub raw_virtual_host: String,
    pub server_port: u16,
    pub name: String,
    pub profile: Option<GameProfile>,
    pub uuid: Uuid,
    pub client_settings: Option<ClientSettings>,
    pub mc_brand: Option<PluginMessage>,
}

enum BridgePhase {
    Login,
    Play,
}

pub struct SessionOutBridge {
    session: Arc<SessionShared>,
    server: Arc<ServerRecord>,
    conn: ConnCodec,
    upstream: ConnHandle,
    rx: mpsc::Receiver<Packet>,
    handle: BridgeHandle,
    snapshot: BridgeSnapshot,
    /// Whether this bridge is the session's first upstream.
    init: bool,
}

impl SessionOutBridge {
    /// Builds a bridge over an already-dialed upstream socket and
    /// starts serving it in the background.
    pub fn start(
        session: Arc<SessionShared>,
        server: Arc<ServerRecord>,
        stream: TcpStream,
        snapshot: BridgeSnapshot,
    ) {
        let mut pipeline = PacketPipeline::new();
        pipeline
            .add_last(Stage::Frame(FrameCodec))
            .expect("fresh pipeline");
        pipeline
            .add_last(Stage::Registry(RegistryCodec::login(
                snapshot.protocol,
                Flow::Server,
            )))
            .expect("fresh pipeline");
        let (conn, upstream) = ConnCodec::new(stream, pipeline, READ_TIMEOUT);
        let (tx, rx) = mpsc::channel(BRIDGE_QUEUE);
        let handle = BridgeHandle {
            bridge_id: BRIDGE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
            server_name: server.name.clone(),
            tx,
        };
        let init = session.state() == SessionState::Init;
        let bridge = Self {
            session,
            server,
            conn,
            upstream,
            rx,
            handle,
            snapshot,
            init,
        };
        tokio::spawn(async move {
            bridge.serve().await;
        });
    }

    async fn serve(self) {
        let Self {
            session,
            server,
            mut conn,
            upstream,
            mut rx,
            handle,
            snapshot,
            init,
        } = self;

        let result = Self::run(
            &session, &server, &mut conn, &upstream, &mut rx, &handle, &snapshot,
        )
        .await;

        session.remove_active_server(&server.name);
        upstream.close().await;
        match result {
            // the session wound the bridge down itself; nothing to do
            Ok(()) => log::debug!("Bridge to {} closed", server.name),
            Err(err) => {
                log::debug!("Bridge to {} closed unexpectedly: {:?}", server.name, err);
                if session.is_current_bridge(handle.bridge_id) {
                    // the player's upstream is gone, take the client down with it
                    session.conn.close().await;
                } else if init && session.state() == SessionState::Init {
                    session
                        .disconnect("Error: Outbound Connection Mismatch")
                        .await;
                } else if !init {
                    // a failed redirect leaves the client on its old upstream
                    session.set_redirecting(false);
                }
            }
        }
    }

    async fn run(
        session: &Arc<SessionShared>,
        server: &Arc<ServerRecord>,
        conn: &mut ConnCodec,
        upstream: &ConnHandle,
        rx: &mut mpsc::Receiver<Packet>,
        handle: &BridgeHandle,
        snapshot: &BridgeSnapshot,
    ) -> anyhow::Result<()> {
        upstream
            .write(&Packet::Handshake(Handshake {
                protocol_version: snapshot.protocol_version,
                server_address: forwarding_address(session, snapshot),
                server_port: snapshot.server_port,
                next_state: NEXT_STATE_LOGIN,
            }))
            .await?;
        upstream
            .write(&Packet::LoginStart(LoginStart {
                name: snapshot.name.clone(),
            }))
            .await?;

        let mut phase = BridgePhase::Login;
        loop {
            tokio::select! {
                from_session = rx.recv() => {
                    match from_session {
                        // the session only forwards once connected
                        Some(packet) => {
                            if matches!(phase, BridgePhase::Play) {
                                upstream.write(&packet).await?;
                            }
                        }
                        // session dropped the handle: wind down
                        None => return Ok(()),
                    }
                }
                result = conn.read_packet() => {
                    let packet = result?;
                    match phase {
                        BridgePhase::Login => {
                            if Self::handle_login_packet(
                                session, upstream, snapshot, &packet, &mut phase,
                            )
                            .await?
                            {
                                return Ok(());
                            }
                        }
                        BridgePhase::Play => {
                            if Self::handle_play_packet(
                                session, server, upstream, handle, snapshot, packet,
                            )
                            .await?
                            {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handles one backend packet during the upstream login. Returns
    /// whether the bridge should stop.
    async fn handle_login_packet(
        session: &Arc<SessionShared>,
        upstream: &ConnHandle,
        snapshot: &BridgeSnapshot,
        packet: &Packet,
        phase: &mut BridgePhase,
    ) -> anyhow::Result<bool> {
        match packet {
            Packet::LoginSetCompression(compression) => {
                let threshold = compression.threshold;
                upstream
                    .with_pipeline(|pipeline| {
                        if pipeline.has(codec::ZLIB) {
                            pipeline
                                .replace(Stage::Zlib(ZlibCodec::new(threshold)))
                                .map(|_| ())
                        } else {
                            pipeline
                                .add_before(codec::REGISTRY, Stage::Zlib(ZlibCodec::new(threshold)))
                        }
                    })
                    .await?;
                Ok(false)
            }
            Packet::LoginSuccess(_) => {
                upstream
                    .with_pipeline(|pipeline| {
                        pipeline.replace(Stage::Registry(RegistryCodec::play(
                            snapshot.protocol,
                            Flow::Server,
                        )))
                    })
                    .await?;
                *phase = BridgePhase::Play;
                Ok(false)
            }
            Packet::LoginDisconnect(disconnect) => {
                log::debug!("Backend refused login: {}", disconnect.reason);
                session.disconnect_json(&disconnect.reason).await;
                Ok(true)
            }
            Packet::EncryptRequest(_) => {
                // backends behind the proxy must run in offline mode
                log::error!("Backend requested encryption; run it in offline mode");
                if session.state() == SessionState::Init {
                    session
                        .disconnect("Error: Outbound Connection Mismatch")
                        .await;
                }
                Ok(true)
            }
            other => {
                log::trace!("Ignoring {} during upstream login", other.kind());
                Ok(false)
            }
        }
    }

    /// Handles one backend packet during play. Returns whether the
    /// bridge should stop.
    async fn handle_play_packet(
        session: &Arc<SessionShared>,
        server: &Arc<ServerRecord>,
        upstream: &ConnHandle,
        handle: &BridgeHandle,
        snapshot: &BridgeSnapshot,
        packet: Packet,
    ) -> anyhow::Result<bool> {
        match packet {
            Packet::JoinGame(join) => {
                Self::handle_join(session, server, upstream, handle, snapshot, join).await?;
                Ok(false)
            }
            Packet::SetCompression(compression) => {
                // legacy play-phase negotiation applies to both links
                let threshold = compression.threshold;
                upstream
                    .with_pipeline(|pipeline| {
                        if threshold == -1 {
                            pipeline.remove(codec::ZLIB).map(|_| ())
                        } else if pipeline.has(codec::ZLIB) {
                            pipeline
                                .replace(Stage::Zlib(ZlibCodec::new(threshold)))
                                .map(|_| ())
                        } else {
                            pipeline
                                .add_before(codec::REGISTRY, Stage::Zlib(ZlibCodec::new(threshold)))
                        }
                    })
                    .await?;
                session.set_compression(threshold).await?;
                Ok(false)
            }
            Packet::Disconnect(disconnect) => {
                session.disconnect_json(&disconnect.reason).await;
                Ok(true)
            }
            mut other => {
                if !session.is_current_bridge(handle.bridge_id) {
                    // a newer bridge took over
                    return Ok(true);
                }
                if let Packet::Generic(generic) = &mut other {
                    if snapshot
                        .protocol
                        .id_map
                        .entity_id_leading_cb
                        .contains(&generic.id)
                    {
                        generic.swap_entities(
                            session.server_entity_id(),
                            session.client_entity_id(),
                            false,
                        );
                    }
                }
                session.write(&other).await?;
                Ok(false)
            }
        }
    }

    /// The backend finished its own handshake: adopt its entity id,
    /// replay cached client state and make this bridge current.
    async fn handle_join(
        session: &Arc<SessionShared>,
        server: &Arc<ServerRecord>,
        upstream: &ConnHandle,
        handle: &BridgeHandle,
        snapshot: &BridgeSnapshot,
        join: JoinGame,
    ) -> anyhow::Result<()> {
        let first = session.state() == SessionState::Init;
        session.set_server_entity_id(join.entity_id);
        if first {
            // the id the client learns now is the one it keeps for life
            session.set_client_entity_id(join.entity_id);
        }
        session.set_out_bridge(handle.clone());
        session.add_active_server(&server.name);

        let mut forwarded = join;
        forwarded.entity_id = session.client_entity_id();
        session.write(&Packet::JoinGame(forwarded)).await?;

        if let Some(settings) = &snapshot.client_settings {
            upstream
                .write(&Packet::ClientSettings(settings.clone()))
                .await?;
        }
        if let Some(brand) = &snapshot.mc_brand {
            upstream
                .write(&Packet::PluginMessage(brand.clone()))
                .await?;
        }

        if first {
            session.set_state(SessionState::Connected);
        } else {
            session.set_redirecting(false);
        }
        log::info!("Player {} connected to {}", snapshot.name, server.name);
        Ok(())
    }
}

/// BungeeCord-style forwarding data: the raw virtual host the client
/// sent, then the client address and profile id, NUL-joined. Skin
/// properties ride along as JSON when the profile has any.
fn forwarding_address(session: &SessionShared, snapshot: &BridgeSnapshot) -> String {
    let (remote_ip, _) = session.remote();
    let mut address = format!(
        "{}\0{}\0{}",
        snapshot.raw_virtual_host,
        remote_ip,
        snapshot.uuid.simple()
    );
    if let Some(profile) = &snapshot.profile {
        if !profile.properties.is_empty() {
            if let Ok(properties) = serde_json::to_string(&profile.properties) {
                address.push('\0');
                address.push_str(&properties);
            }
        }
    }
    address
}
