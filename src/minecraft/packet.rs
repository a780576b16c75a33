//! Typed packets the proxy needs to understand.
//!
//! Only the handshake, status and login phases are fully typed, plus the
//! handful of play packets the proxy inspects. Everything else flows
//! through as a [`GenericPacket`] and is forwarded verbatim (modulo
//! entity id rewriting).

use bytes::Bytes;

use super::datatypes::{BufError, ReadBuf, WriteBuf};

#[derive(Clone, Debug, thiserror::Error)]
pub enum MessageError {
    /// Error while serializing/deserializing the message
    #[error(transparent)]
    Buf(#[from] BufError),
    /// Handshake next-state field is neither status nor login
    #[error("invalid next state {0}")]
    InvalidNextState(i32),
    /// Packet id is not known to the current registry
    #[error("unknown packet id {0:#04x}")]
    UnknownPacket(i32),
}

/// Per-version encoding quirks threaded through message coding.
///
/// The oldest protocol generation prefixes byte arrays with an i16
/// where everything after it uses VarInts.
#[derive(Clone, Copy, Debug)]
pub struct WireCtx {
    pub varint_arrays: bool,
}

pub trait Message: Sized {
    fn serialize(&self, ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError>;

    fn deserialize(ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError>;
}

/// A decoded packet, client- or server-bound.
#[derive(Clone, Debug)]
pub enum Packet {
    Handshake(Handshake),
    StatusRequest(StatusRequest),
    StatusResponse(StatusResponse),
    StatusPing(StatusPing),
    LoginStart(LoginStart),
    EncryptRequest(EncryptRequest),
    EncryptResponse(EncryptResponse),
    LoginSuccess(LoginSuccess),
    LoginDisconnect(LoginDisconnect),
    LoginSetCompression(LoginSetCompression),
    ClientSettings(ClientSettings),
    PluginMessage(PluginMessage),
    /// Play-phase SetCompression, only present in legacy play registries.
    SetCompression(SetCompression),
    Disconnect(Disconnect),
    JoinGame(JoinGame),
    Generic(GenericPacket),
}

impl Packet {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::StatusRequest(_) => "StatusRequest",
            Self::StatusResponse(_) => "StatusResponse",
            Self::StatusPing(_) => "StatusPing",
            Self::LoginStart(_) => "LoginStart",
            Self::EncryptRequest(_) => "EncryptRequest",
            Self::EncryptResponse(_) => "EncryptResponse",
            Self::LoginSuccess(_) => "LoginSuccess",
            Self::LoginDisconnect(_) => "LoginDisconnect",
            Self::LoginSetCompression(_) => "LoginSetCompression",
            Self::ClientSettings(_) => "ClientSettings",
            Self::PluginMessage(_) => "PluginMessage",
            Self::SetCompression(_) => "SetCompression",
            Self::Disconnect(_) => "Disconnect",
            Self::JoinGame(_) => "JoinGame",
            Self::Generic(_) => "Generic",
        }
    }
}

/// First packet of every connection.
#[derive(Clone, Debug)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;

impl Message for Handshake {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_varint(self.protocol_version);
        buf.write_str(&self.server_address);
        buf.write_u16(self.server_port);
        buf.write_varint(self.next_state);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            protocol_version: buf.read_varint()?,
            server_address: buf.read_str()?,
            server_port: buf.read_u16()?,
            next_state: buf.read_varint()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct StatusRequest;

impl Message for StatusRequest {
    fn serialize(&self, _ctx: WireCtx, _buf: &mut WriteBuf) -> Result<(), MessageError> {
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, _buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self)
    }
}

#[derive(Clone, Debug)]
pub struct StatusResponse {
    /// Status document, already serialized to JSON.
    pub body: String,
}

impl Message for StatusResponse {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.body);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            body: buf.read_str()?,
        })
    }
}

/// Same layout in both directions; the pong echoes the ping payload.
#[derive(Clone, Debug)]
pub struct StatusPing {
    pub time: i64,
}

impl Message for StatusPing {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_i64(self.time);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            time: buf.read_i64()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct LoginStart {
    pub name: String,
}

impl Message for LoginStart {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.name);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            name: buf.read_str()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct EncryptRequest {
    pub server_id: String,
    pub public_key: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl Message for EncryptRequest {
    fn serialize(&self, ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.server_id);
        buf.write_byte_array(&self.public_key, ctx.varint_arrays);
        buf.write_byte_array(&self.verify_token, ctx.varint_arrays);
        Ok(())
    }

    fn deserialize(ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            server_id: buf.read_str()?,
            public_key: buf.read_byte_array(ctx.varint_arrays)?,
            verify_token: buf.read_byte_array(ctx.varint_arrays)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct EncryptResponse {
    pub shared_secret: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl Message for EncryptResponse {
    fn serialize(&self, ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_byte_array(&self.shared_secret, ctx.varint_arrays);
        buf.write_byte_array(&self.verify_token, ctx.varint_arrays);
        Ok(())
    }

    fn deserialize(ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            shared_secret: buf.read_byte_array(ctx.varint_arrays)?,
            verify_token: buf.read_byte_array(ctx.varint_arrays)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct LoginSuccess {
    /// Hyphenated UUID on modern versions, raw profile id on the oldest.
    pub uuid: String,
    pub name: String,
}

impl Message for LoginSuccess {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.uuid);
        buf.write_str(&self.name);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            uuid: buf.read_str()?,
            name: buf.read_str()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct LoginDisconnect {
    /// Chat component, already serialized to JSON.
    pub reason: String,
}

impl Message for LoginDisconnect {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.reason);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            reason: buf.read_str()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct LoginSetCompression {
    pub threshold: i32,
}

impl Message for LoginSetCompression {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_varint(self.threshold);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            threshold: buf.read_varint()?,
        })
    }
}

/// Play-phase counterpart of [`LoginSetCompression`]. Only the legacy
/// play registries know this packet.
#[derive(Clone, Debug)]
pub struct SetCompression {
    pub threshold: i32,
}

impl Message for SetCompression {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_varint(self.threshold);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            threshold: buf.read_varint()?,
        })
    }
}

/// Play-phase disconnect.
#[derive(Clone, Debug)]
pub struct Disconnect {
    pub reason: String,
}

impl Message for Disconnect {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.reason);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            reason: buf.read_str()?,
        })
    }
}

/// Clientbound join. The proxy only cares about the entity id; the
/// version-dependent tail is kept verbatim.
#[derive(Clone, Debug)]
pub struct JoinGame {
    pub entity_id: i32,
    pub rest: Bytes,
}

impl Message for JoinGame {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_i32(self.entity_id);
        buf.write_bytes(&self.rest);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            entity_id: buf.read_i32()?,
            rest: buf.read_rest(),
        })
    }
}

/// Serverbound client settings. Cached by the session and replayed
/// after a redirect; the version-dependent tail is kept verbatim.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub locale: String,
    pub rest: Bytes,
}

impl Message for ClientSettings {
    fn serialize(&self, _ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.locale);
        buf.write_bytes(&self.rest);
        Ok(())
    }

    fn deserialize(_ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            locale: buf.read_str()?,
            rest: buf.read_rest(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct PluginMessage {
    pub channel: String,
    pub data: Bytes,
}

impl Message for PluginMessage {
    fn serialize(&self, ctx: WireCtx, buf: &mut WriteBuf) -> Result<(), MessageError> {
        buf.write_str(&self.channel);
        if !ctx.varint_arrays {
            // the oldest generation length-prefixes the payload
            buf.write_i16(self.data.len() as i16);
        }
        buf.write_bytes(&self.data);
        Ok(())
    }

    fn deserialize(ctx: WireCtx, buf: &mut ReadBuf) -> Result<Self, MessageError> {
        let channel = buf.read_str()?;
        let data = if ctx.varint_arrays {
            buf.read_rest()
        } else {
            let len = buf.read_i16()?;
            if len < 0 {
                return Err(BufError::InvalidLength(len as i32).into());
            }
            let mut bytes = vec![0u8; len as usize];
            buf.read_bytes(&mut bytes)?;
            Bytes::from(bytes)
        };
        Ok(Self { channel, data })
    }
}

/// Any packet the proxy does not decode. Body bytes are kept verbatim
/// so forwarding is lossless.
#[derive(Clone, Debug)]
pub struct GenericPacket {
    pub id: i32,
    pub body: Bytes,
}

impl GenericPacket {
    /// Rewrites a leading VarInt entity id, translating `from` into
    /// `to` (and the reverse when `swap` is set). Returns whether the
    /// body was changed.
    ///
    /// Only called for packet ids the current version's id map marks
    /// as entity-id-leading; anything else is forwarded untouched.
    pub fn swap_entities(&mut self, from: i32, to: i32, swap: bool) -> bool {
        if from == to {
            return false;
        }
        let mut head = ReadBuf::new(self.body.clone());
        let Ok(entity_id) = head.read_varint() else {
            return false;
        };
        let replacement = if entity_id == from {
            to
        } else if swap && entity_id == to {
            from
        } else {
            return false;
        };
        let mut rewritten = WriteBuf::new();
        rewritten.write_varint(replacement);
        rewritten.write_bytes(&head.read_rest());
        self.body = rewritten.0.freeze();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: WireCtx = WireCtx {
        varint_arrays: true,
    };
    const LEGACY: WireCtx = WireCtx {
        varint_arrays: false,
    };

    #[test]
    fn handshake_roundtrip() {
        let packet = Handshake {
            protocol_version: 340,
            server_address: "lobby.example".into(),
            server_port: 25565,
            next_state: NEXT_STATE_LOGIN,
        };
        let mut buf = WriteBuf::new();
        packet.serialize(MODERN, &mut buf).unwrap();
        let mut read = ReadBuf::new(buf.0.freeze());
        let decoded = Handshake::deserialize(MODERN, &mut read).unwrap();
        assert_eq!(decoded.protocol_version, 340);
        assert_eq!(decoded.server_address, "lobby.example");
        assert_eq!(decoded.server_port, 25565);
        assert_eq!(decoded.next_state, NEXT_STATE_LOGIN);
    }

    #[test]
    fn encrypt_request_array_prefixes() {
        let packet = EncryptRequest {
            server_id: "a1b2c3".into(),
            public_key: vec![7; 162],
            verify_token: vec![1, 2, 3, 4],
        };
        for ctx in [MODERN, LEGACY] {
            let mut buf = WriteBuf::new();
            packet.serialize(ctx, &mut buf).unwrap();
            let mut read = ReadBuf::new(buf.0.freeze());
            let decoded = EncryptRequest::deserialize(ctx, &mut read).unwrap();
            assert_eq!(decoded.public_key.len(), 162);
            assert_eq!(decoded.verify_token, vec![1, 2, 3, 4]);
            assert_eq!(read.remaining(), 0);
        }
    }

    #[test]
    fn plugin_message_legacy_prefix() {
        let packet = PluginMessage {
            channel: "REGISTER".into(),
            data: Bytes::from_static(b"a|b\0c|d"),
        };
        let mut buf = WriteBuf::new();
        packet.serialize(LEGACY, &mut buf).unwrap();
        let mut read = ReadBuf::new(buf.0.freeze());
        let decoded = PluginMessage::deserialize(LEGACY, &mut read).unwrap();
        assert_eq!(decoded.channel, "REGISTER");
        assert_eq!(decoded.data, Bytes::from_static(b"a|b\0c|d"));
    }

    #[test]
    fn swap_entities_translates_and_back() {
        let mut buf = WriteBuf::new();
        buf.write_varint(42);
        buf.write_u8(1);
        let mut packet = GenericPacket {
            id: 0x0A,
            body: buf.0.freeze(),
        };
        assert!(packet.swap_entities(42, 7, false));
        let mut read = ReadBuf::new(packet.body.clone());
        assert_eq!(read.read_varint().unwrap(), 7);

        // swap=true translates the other direction too
        assert!(packet.swap_entities(42, 7, true));
        let mut read = ReadBuf::new(packet.body.clone());
        assert_eq!(read.read_varint().unwrap(), 42);
    }

    #[test]
    fn swap_entities_ignores_other_ids() {
        let mut buf = WriteBuf::new();
        buf.write_varint(99);
        let mut packet = GenericPacket {
            id: 0x0A,
            body: buf.0.freeze(),
        };
        assert!(!packet.swap_entities(42, 7, false));
    }
}
