//! Packet pipeline: the ordered, name-keyed chain of codec stages a
//! connection's bytes flow through.
//!
//! Stages are inserted/replaced/removed by name between frames as the
//! session negotiates encryption and compression and moves across
//! protocol phases. Decode walks the chain head-to-tail (decrypt,
//! unframe, decompress, registry), encode walks it tail-to-head.

use std::io::{Read, Write};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::{Buf, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::datatypes::{peek_varint, BufError, ReadBuf, WriteBuf};
use super::packet::{
    ClientSettings, Disconnect, EncryptRequest, EncryptResponse, GenericPacket, Handshake,
    JoinGame, LoginDisconnect, LoginSetCompression, LoginStart, LoginSuccess, Message,
    MessageError, Packet, PluginMessage, SetCompression, StatusPing, StatusRequest,
    StatusResponse, WireCtx,
};
use super::version::Version;

/// Longest allowed frame: 3-byte VarInt maximum.
pub const MAX_FRAME_LENGTH: i32 = 2097151;

/// Longest allowed frame body once decompressed.
pub const MAX_UNCOMPRESSED_LENGTH: usize = 1 << 23;

pub const CFB8: &str = "cfb8";
pub const FRAME: &str = "varIntLength";
pub const ZLIB: &str = "zlib";
pub const REGISTRY: &str = "registry";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Buf(#[from] BufError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("frame length {0} is out of bounds")]
    FrameLength(i32),
    #[error("uncompressed length {0} is out of bounds")]
    UncompressedLength(i32),
    #[error("shared secret must be 16 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("zlib error: {0}")]
    Zlib(#[from] std::io::Error),
    #[error("packet {0} cannot be encoded by the current registry")]
    Unencodable(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline has no stage named {0}")]
    MissingStage(&'static str),
    #[error("pipeline already has a stage named {0}")]
    DuplicateStage(&'static str),
}

/// Protocol phase a registry decodes for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Status,
    Login,
    Play,
}

/// Which endpoint the pipeline faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Player <-> Proxy: decodes serverbound packets, encodes clientbound.
    Player,
    /// Proxy <-> Server: decodes clientbound packets, encodes serverbound.
    Server,
}

type Aes128Cfb8Enc = cfb8::Encryptor<aes::Aes128>;
type Aes128Cfb8Dec = cfb8::Decryptor<aes::Aes128>;

/// AES-128-CFB8 stream cipher stage. The 16-byte shared secret doubles
/// as the IV. Once installed it is never removed.
pub struct Cfb8Codec {
    enc: Aes128Cfb8Enc,
    dec: Aes128Cfb8Dec,
}

impl Cfb8Codec {
    pub fn new(shared_secret: &[u8]) -> Result<Self, CodecError> {
        if shared_secret.len() != 16 {
            return Err(CodecError::BadKeyLength(shared_secret.len()));
        }
        let enc = Aes128Cfb8Enc::new_from_slices(shared_secret, shared_secret)
            .map_err(|_| CodecError::BadKeyLength(shared_secret.len()))?;
        let dec = Aes128Cfb8Dec::new_from_slices(shared_secret, shared_secret)
            .map_err(|_| CodecError::BadKeyLength(shared_secret.len()))?;
        Ok(Self { enc, dec })
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.enc
                .encrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.dec
                .decrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
        }
    }
}

/// VarInt length framing stage.
pub struct FrameCodec;

/// Threshold-conditional zlib stage. Frame bodies at or above the
/// threshold are deflated; smaller ones are stored with a zero marker.
pub struct ZlibCodec {
    pub threshold: i32,
}

impl ZlibCodec {
    pub fn new(threshold: i32) -> Self {
        Self { threshold }
    }

    fn compress(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = WriteBuf::new();
        if self.threshold >= 0 && body.len() >= self.threshold as usize {
            out.write_varint(body.len() as i32);
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            out.write_bytes(&encoder.finish()?);
        } else {
            out.write_varint(0);
            out.write_bytes(body);
        }
        Ok(out.0.to_vec())
    }

    fn decompress(&self, body: Bytes) -> Result<Bytes, CodecError> {
        let mut read = ReadBuf::new(body);
        let uncompressed_len = read.read_varint()?;
        if uncompressed_len == 0 {
            return Ok(read.read_rest());
        }
        if uncompressed_len < 0 || uncompressed_len as usize > MAX_UNCOMPRESSED_LENGTH {
            return Err(CodecError::UncompressedLength(uncompressed_len));
        }
        let compressed = read.read_rest();
        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut out = Vec::with_capacity(uncompressed_len as usize);
        decoder.read_to_end(&mut out)?;
        if out.len() != uncompressed_len as usize {
            return Err(CodecError::UncompressedLength(uncompressed_len));
        }
        Ok(Bytes::from(out))
    }
}

/// The stage that knows, for one phase and one protocol version, how to
/// decode each packet id to a typed packet and back.
pub struct RegistryCodec {
    pub phase: Phase,
    pub version: Option<&'static Version>,
    pub flow: Flow,
}

impl RegistryCodec {
    pub fn handshake(flow: Flow) -> Self {
        Self {
            phase: Phase::Handshake,
            version: None,
            flow,
        }
    }

    pub fn status(flow: Flow) -> Self {
        Self {
            phase: Phase::Status,
            version: None,
            flow,
        }
    }

    pub fn login(version: &'static Version, flow: Flow) -> Self {
        Self {
            phase: Phase::Login,
            version: Some(version),
            flow,
        }
    }

    pub fn play(version: &'static Version, flow: Flow) -> Self {
        Self {
            phase: Phase::Play,
            version: Some(version),
            flow,
        }
    }

    fn ctx(&self) -> WireCtx {
        self.version
            .map(Version::wire_ctx)
            .unwrap_or(WireCtx {
                varint_arrays: true,
            })
    }

    /// Decodes one frame body (id + fields) into a packet.
    pub fn decode(&self, body: Bytes) -> Result<Packet, CodecError> {
        let ctx = self.ctx();
        let mut buf = ReadBuf::new(body);
        let id = buf.read_varint()?;
        let packet = match (self.phase, self.flow) {
            (Phase::Handshake, Flow::Player) => match id {
                0x00 => Packet::Handshake(Handshake::deserialize(ctx, &mut buf)?),
                _ => return Err(MessageError::UnknownPacket(id).into()),
            },
            (Phase::Status, Flow::Player) => match id {
                0x00 => Packet::StatusRequest(StatusRequest::deserialize(ctx, &mut buf)?),
                0x01 => Packet::StatusPing(StatusPing::deserialize(ctx, &mut buf)?),
                _ => return Err(MessageError::UnknownPacket(id).into()),
            },
            (Phase::Status, Flow::Server) => match id {
                0x00 => Packet::StatusResponse(StatusResponse::deserialize(ctx, &mut buf)?),
                0x01 => Packet::StatusPing(StatusPing::deserialize(ctx, &mut buf)?),
                _ => return Err(MessageError::UnknownPacket(id).into()),
            },
            (Phase::Login, Flow::Player) => {
                let ids = &self.version.ok_or(MessageError::UnknownPacket(id))?.id_map;
                if id == ids.login_start {
                    Packet::LoginStart(LoginStart::deserialize(ctx, &mut buf)?)
                } else if id == ids.login_encrypt_response {
                    Packet::EncryptResponse(EncryptResponse::deserialize(ctx, &mut buf)?)
                } else {
                    return Err(MessageError::UnknownPacket(id).into());
                }
            }
            (Phase::Login, Flow::Server) => {
                let ids = &self.version.ok_or(MessageError::UnknownPacket(id))?.id_map;
                if id == ids.login_disconnect {
                    Packet::LoginDisconnect(LoginDisconnect::deserialize(ctx, &mut buf)?)
                } else if id == ids.login_encrypt_request {
                    Packet::EncryptRequest(EncryptRequest::deserialize(ctx, &mut buf)?)
                } else if id == ids.login_success {
                    Packet::LoginSuccess(LoginSuccess::deserialize(ctx, &mut buf)?)
                } else if ids.login_set_compression == Some(id) {
                    Packet::LoginSetCompression(LoginSetCompression::deserialize(ctx, &mut buf)?)
                } else {
                    return Err(MessageError::UnknownPacket(id).into());
                }
            }
            (Phase::Play, Flow::Player) => {
                let ids = &self.version.ok_or(MessageError::UnknownPacket(id))?.id_map;
                if id == ids.play_client_settings {
                    Packet::ClientSettings(ClientSettings::deserialize(ctx, &mut buf)?)
                } else if id == ids.play_plugin_message_sb {
                    Packet::PluginMessage(PluginMessage::deserialize(ctx, &mut buf)?)
                } else {
                    Packet::Generic(GenericPacket {
                        id,
                        body: buf.read_rest(),
                    })
                }
            }
            (Phase::Play, Flow::Server) => {
                let ids = &self.version.ok_or(MessageError::UnknownPacket(id))?.id_map;
                if id == ids.play_disconnect {
                    Packet::Disconnect(Disconnect::deserialize(ctx, &mut buf)?)
                } else if id == ids.play_join_game {
                    Packet::JoinGame(JoinGame::deserialize(ctx, &mut buf)?)
                } else if ids.play_set_compression == Some(id) {
                    Packet::SetCompression(SetCompression::deserialize(ctx, &mut buf)?)
                } else if id == ids.play_plugin_message_cb {
                    Packet::PluginMessage(PluginMessage::deserialize(ctx, &mut buf)?)
                } else {
                    Packet::Generic(GenericPacket {
                        id,
                        body: buf.read_rest(),
                    })
                }
            }
            (phase, flow) => {
                log::trace!("decode with no registry rule for {:?}/{:?}", phase, flow);
                return Err(MessageError::UnknownPacket(id).into());
            }
        };
        Ok(packet)
    }

    /// Encodes a packet into a frame body (id + fields).
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let ctx = self.ctx();
        let mut buf = WriteBuf::new();
        let id = self.outbound_id(packet)?;
        buf.write_varint(id);
        match packet {
            Packet::Handshake(p) => p.serialize(ctx, &mut buf)?,
            Packet::StatusRequest(p) => p.serialize(ctx, &mut buf)?,
            Packet::StatusResponse(p) => p.serialize(ctx, &mut buf)?,
            Packet::StatusPing(p) => p.serialize(ctx, &mut buf)?,
            Packet::LoginStart(p) => p.serialize(ctx, &mut buf)?,
            Packet::EncryptRequest(p) => p.serialize(ctx, &mut buf)?,
            Packet::EncryptResponse(p) => p.serialize(ctx, &mut buf)?,
            Packet::LoginSuccess(p) => p.serialize(ctx, &mut buf)?,
            Packet::LoginDisconnect(p) => p.serialize(ctx, &mut buf)?,
            Packet::LoginSetCompression(p) => p.serialize(ctx, &mut buf)?,
            Packet::ClientSettings(p) => p.serialize(ctx, &mut buf)?,
            Packet::PluginMessage(p) => p.serialize(ctx, &mut buf)?,
            Packet::SetCompression(p) => p.serialize(ctx, &mut buf)?,
            Packet::Disconnect(p) => p.serialize(ctx, &mut buf)?,
            Packet::JoinGame(p) => p.serialize(ctx, &mut buf)?,
            Packet::Generic(p) => buf.write_bytes(&p.body),
        }
        Ok(buf.0.to_vec())
    }

    fn outbound_id(&self, packet: &Packet) -> Result<i32, CodecError> {
        let unencodable = || CodecError::Unencodable(packet.kind());
        let ids = self.version.map(|version| &version.id_map);
        let id = match (self.flow, packet) {
            // clientbound (towards the player)
            (Flow::Player, Packet::StatusResponse(_)) => 0x00,
            (Flow::Player, Packet::StatusPing(_)) => 0x01,
            (Flow::Player, Packet::EncryptRequest(_)) => {
                ids.ok_or_else(unencodable)?.login_encrypt_request
            }
            (Flow::Player, Packet::LoginSuccess(_)) => ids.ok_or_else(unencodable)?.login_success,
            (Flow::Player, Packet::LoginDisconnect(_)) => {
                ids.ok_or_else(unencodable)?.login_disconnect
            }
            (Flow::Player, Packet::LoginSetCompression(_)) => ids
                .ok_or_else(unencodable)?
                .login_set_compression
                .ok_or_else(unencodable)?,
            (Flow::Player, Packet::SetCompression(_)) => ids
                .ok_or_else(unencodable)?
                .play_set_compression
                .ok_or_else(unencodable)?,
            (Flow::Player, Packet::Disconnect(_)) => ids.ok_or_else(unencodable)?.play_disconnect,
            (Flow::Player, Packet::JoinGame(_)) => ids.ok_or_else(unencodable)?.play_join_game,
            (Flow::Player, Packet::PluginMessage(_)) => {
                ids.ok_or_else(unencodable)?.play_plugin_message_cb
            }
            // serverbound (towards the backend)
            (Flow::Server, Packet::Handshake(_)) => 0x00,
            (Flow::Server, Packet::StatusRequest(_)) => 0x00,
            (Flow::Server, Packet::StatusPing(_)) => 0x01,
            (Flow::Server, Packet::LoginStart(_)) => ids.ok_or_else(unencodable)?.login_start,
            (Flow::Server, Packet::EncryptResponse(_)) => {
                ids.ok_or_else(unencodable)?.login_encrypt_response
            }
            (Flow::Server, Packet::ClientSettings(_)) => {
                ids.ok_or_else(unencodable)?.play_client_settings
            }
            (Flow::Server, Packet::PluginMessage(_)) => {
                ids.ok_or_else(unencodable)?.play_plugin_message_sb
            }
            (_, Packet::Generic(p)) => p.id,
            _ => return Err(unencodable()),
        };
        Ok(id)
    }
}

/// One pipeline stage, keyed by a fixed name.
pub enum Stage {
    Cfb8(Cfb8Codec),
    Frame(FrameCodec),
    Zlib(ZlibCodec),
    Registry(RegistryCodec),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cfb8(_) => CFB8,
            Self::Frame(_) => FRAME,
            Self::Zlib(_) => ZLIB,
            Self::Registry(_) => REGISTRY,
        }
    }
}

/// Ordered chain of codec stages.
///
/// Mutations must only happen between frames; the connection driver
/// guarantees this by keeping the pipeline behind the same lock as the
/// write half.
pub struct PacketPipeline {
    stages: Vec<Stage>,
}

impl Default for PacketPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name() == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.position(name).map(|idx| &self.stages[idx])
    }

    pub fn add_last(&mut self, stage: Stage) -> Result<(), PipelineError> {
        if self.has(stage.name()) {
            return Err(PipelineError::DuplicateStage(stage.name()));
        }
        self.stages.push(stage);
        Ok(())
    }

    pub fn add_before(&mut self, pivot: &'static str, stage: Stage) -> Result<(), PipelineError> {
        if self.has(stage.name()) {
            return Err(PipelineError::DuplicateStage(stage.name()));
        }
        let idx = self
            .position(pivot)
            .ok_or(PipelineError::MissingStage(pivot))?;
        self.stages.insert(idx, stage);
        Ok(())
    }

    pub fn replace(&mut self, stage: Stage) -> Result<Stage, PipelineError> {
        let idx = self
            .position(stage.name())
            .ok_or(PipelineError::MissingStage(stage.name()))?;
        Ok(std::mem::replace(&mut self.stages[idx], stage))
    }

    pub fn remove(&mut self, name: &'static str) -> Result<Stage, PipelineError> {
        let idx = self.position(name).ok_or(PipelineError::MissingStage(name))?;
        Ok(self.stages.remove(idx))
    }

    /// Stage names in chain order, for diagnostics and tests.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    fn registry(&self) -> Result<&RegistryCodec, PipelineError> {
        match self.get(REGISTRY) {
            Some(Stage::Registry(registry)) => Ok(registry),
            _ => Err(PipelineError::MissingStage(REGISTRY)),
        }
    }

    pub fn registry_phase(&self) -> Option<Phase> {
        self.registry().ok().map(|registry| registry.phase)
    }

    pub fn registry_version(&self) -> Option<&'static Version> {
        self.registry().ok().and_then(|registry| registry.version)
    }

    fn zlib(&self) -> Option<&ZlibCodec> {
        match self.get(ZLIB) {
            Some(Stage::Zlib(zlib)) => Some(zlib),
            _ => None,
        }
    }

    /// Moves up to `len` bytes from the raw (possibly ciphered) buffer
    /// into the frame buffer, running them through the stream cipher
    /// when one is installed. Bytes past the current frame stay
    /// untouched in `raw` so a cipher installed by the very packet
    /// being processed applies to them.
    fn pull(&mut self, raw: &mut BytesMut, frame: &mut BytesMut, len: usize) {
        let len = len.min(raw.len());
        if len == 0 {
            return;
        }
        let mut chunk = raw.split_to(len);
        if let Some(idx) = self.position(CFB8) {
            if let Stage::Cfb8(cfb8) = &mut self.stages[idx] {
                cfb8.decrypt(&mut chunk);
            }
        }
        frame.extend_from_slice(&chunk);
    }

    /// Attempts to decode one packet. `raw` holds bytes exactly as
    /// received, `frame` holds deciphered bytes of the frame currently
    /// being assembled. Returns [`None`] when more input is needed.
    pub fn decode_step(
        &mut self,
        raw: &mut BytesMut,
        frame: &mut BytesMut,
    ) -> Result<Option<Packet>, CodecError> {
        let (length, prefix_len) = loop {
            match peek_varint(frame)? {
                Some(parsed) => break parsed,
                None => {
                    if raw.is_empty() {
                        return Ok(None);
                    }
                    self.pull(raw, frame, 1);
                }
            }
        };
        if length <= 0 || length > MAX_FRAME_LENGTH {
            return Err(CodecError::FrameLength(length));
        }
        let full = prefix_len + length as usize;
        if frame.len() < full {
            let missing = full - frame.len();
            if raw.is_empty() {
                return Ok(None);
            }
            self.pull(raw, frame, missing);
            if frame.len() < full {
                return Ok(None);
            }
        }
        frame.advance(prefix_len);
        let mut body = frame.split_to(length as usize).freeze();
        if let Some(zlib) = self.zlib() {
            body = zlib.decompress(body)?;
        }
        let packet = self.registry()?.decode(body)?;
        Ok(Some(packet))
    }

    /// Encodes a packet into wire bytes, ready to be written out.
    pub fn encode(&mut self, packet: &Packet) -> Result<Bytes, CodecError> {
        let mut body = self.registry()?.encode(packet)?;
        if let Some(zlib) = self.zlib() {
            body = zlib.compress(&body)?;
        }
        let mut framed = WriteBuf::new();
        framed.write_varint(body.len() as i32);
        framed.write_bytes(&body);
        let mut bytes = framed.0.to_vec();
        if let Some(idx) = self.position(CFB8) {
            if let Stage::Cfb8(cfb8) = &mut self.stages[idx] {
                cfb8.encrypt(&mut bytes);
            }
        }
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minecraft::version::V1_12_1;

    fn player_login_pipeline() -> PacketPipeline {
        let mut pipeline = PacketPipeline::new();
        pipeline.add_last(Stage::Frame(FrameCodec)).unwrap();
        pipeline
            .add_last(Stage::Registry(RegistryCodec::login(&V1_12_1, Flow::Player)))
            .unwrap();
        pipeline
    }

    #[test]
    fn duplicate_stage_rejected() {
        let mut pipeline = player_login_pipeline();
        assert!(matches!(
            pipeline.add_last(Stage::Frame(FrameCodec)),
            Err(PipelineError::DuplicateStage(FRAME))
        ));
    }

    #[test]
    fn missing_stage_rejected() {
        let mut pipeline = PacketPipeline::new();
        assert!(matches!(
            pipeline.remove(ZLIB),
            Err(PipelineError::MissingStage(ZLIB))
        ));
        assert!(matches!(
            pipeline.add_before(FRAME, Stage::Zlib(ZlibCodec::new(256))),
            Err(PipelineError::MissingStage(FRAME))
        ));
    }

    #[test]
    fn decode_across_split_input() {
        let mut server_side = PacketPipeline::new();
        server_side.add_last(Stage::Frame(FrameCodec)).unwrap();
        server_side
            .add_last(Stage::Registry(RegistryCodec::login(&V1_12_1, Flow::Server)))
            .unwrap();
        let bytes = server_side
            .encode(&Packet::LoginStart(LoginStart {
                name: "Alice".into(),
            }))
            .unwrap();

        let mut pipeline = player_login_pipeline();
        let mut frame = BytesMut::new();
        // feed one byte at a time
        for (i, byte) in bytes.iter().enumerate() {
            let mut raw = BytesMut::from(&[*byte][..]);
            let decoded = pipeline.decode_step(&mut raw, &mut frame).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none());
            } else {
                match decoded {
                    Some(Packet::LoginStart(login)) => assert_eq!(login.name, "Alice"),
                    other => panic!("unexpected decode result: {:?}", other.map(|p| p.kind())),
                }
            }
        }
    }

    #[test]
    fn zlib_threshold_marks_small_bodies() {
        let zlib = ZlibCodec::new(256);
        let small = zlib.compress(&[1, 2, 3]).unwrap();
        // zero marker means stored uncompressed
        assert_eq!(small[0], 0);
        assert_eq!(&small[1..], &[1, 2, 3]);

        let big_body = vec![7u8; 512];
        let big = zlib.compress(&big_body).unwrap();
        assert_ne!(big[0], 0);
        let roundtrip = zlib.decompress(Bytes::from(big)).unwrap();
        assert_eq!(&roundtrip[..], &big_body[..]);
    }

    #[test]
    fn cfb8_streams_are_symmetric() {
        let secret = [9u8; 16];
        let mut sender = Cfb8Codec::new(&secret).unwrap();
        let mut receiver = Cfb8Codec::new(&secret).unwrap();
        let original = b"split across several writes".to_vec();
        let mut ciphered = original.clone();
        sender.encrypt(&mut ciphered[..10]);
        sender.encrypt(&mut ciphered[10..]);
        assert_ne!(ciphered, original);
        receiver.decrypt(&mut ciphered[..3]);
        receiver.decrypt(&mut ciphered[3..]);
        assert_eq!(ciphered, original);
    }

    #[test]
    fn cfb8_rejects_bad_key() {
        assert!(matches!(
            Cfb8Codec::new(&[1, 2, 3]),
            Err(CodecError::BadKeyLength(3))
        ));
    }
}
