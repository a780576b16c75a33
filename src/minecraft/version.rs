//! Protocol version descriptors.
//!
//! Each supported version family gets one descriptor carrying its packet
//! id map and encoding quirks. Selection is floor-based: the descriptor
//! with the greatest floor not exceeding the advertised protocol number
//! wins, the oldest descriptor being the fallback.

use super::packet::WireCtx;

/// Packet ids for one protocol version family.
///
/// Handshake and status ids never moved, so only login and play ids
/// live here. `None` means the version's registry simply does not have
/// the packet.
#[derive(Debug)]
pub struct IdMap {
    // login, clientbound
    pub login_disconnect: i32,
    pub login_encrypt_request: i32,
    pub login_success: i32,
    pub login_set_compression: Option<i32>,
    // login, serverbound
    pub login_start: i32,
    pub login_encrypt_response: i32,
    // play, clientbound
    pub play_disconnect: i32,
    pub play_join_game: i32,
    pub play_set_compression: Option<i32>,
    pub play_plugin_message_cb: i32,
    // play, serverbound
    pub play_client_settings: i32,
    pub play_plugin_message_sb: i32,
    /// Serverbound play ids whose body starts with a VarInt entity id
    /// (use-entity / entity-action family). These get rewritten when
    /// client and server entity ids diverge after a redirect.
    pub entity_id_leading_sb: &'static [i32],
    /// Clientbound equivalents, rewritten by the out bridge.
    pub entity_id_leading_cb: &'static [i32],
}

/// One supported protocol version family.
#[derive(Debug)]
pub struct Version {
    pub name: &'static str,
    /// Lowest protocol number of the family.
    pub floor: i32,
    pub id_map: IdMap,
    /// Whether the play registry carries a SetCompression packet.
    /// Versions past these negotiate compression during login only.
    pub legacy_play_compression: bool,
    /// Whether byte arrays are VarInt-prefixed.
    pub varint_arrays: bool,
}

impl Version {
    pub fn wire_ctx(&self) -> WireCtx {
        WireCtx {
            varint_arrays: self.varint_arrays,
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.floor == other.floor
    }
}

/// First protocol number whose LoginSuccess carries a hyphenated UUID.
pub const HYPHENATED_UUID_VERSION: i32 = 5;

/// First protocol number that negotiates compression during login.
/// Its play registry no longer has a SetCompression packet, so the
/// threshold is pinned once at login and never re-announced.
pub const COMPRESSION_IN_LOGIN_VERSION: i32 = 107;

pub static V1_7: Version = Version {
    name: "1.7",
    floor: 4,
    id_map: IdMap {
        login_disconnect: 0x00,
        login_encrypt_request: 0x01,
        login_success: 0x02,
        login_set_compression: None,
        login_start: 0x00,
        login_encrypt_response: 0x01,
        play_disconnect: 0x40,
        play_join_game: 0x01,
        play_set_compression: None,
        play_plugin_message_cb: 0x3F,
        play_client_settings: 0x15,
        play_plugin_message_sb: 0x17,
        entity_id_leading_sb: &[0x02, 0x0B],
        entity_id_leading_cb: &[0x18, 0x1A, 0x1B, 0x1C],
    },
    legacy_play_compression: true,
    varint_arrays: false,
};

pub static V1_8: Version = Version {
    name: "1.8",
    floor: 47,
    id_map: IdMap {
        login_disconnect: 0x00,
        login_encrypt_request: 0x01,
        login_success: 0x02,
        login_set_compression: Some(0x03),
        login_start: 0x00,
        login_encrypt_response: 0x01,
        play_disconnect: 0x40,
        play_join_game: 0x01,
        play_set_compression: Some(0x46),
        play_plugin_message_cb: 0x3F,
        play_client_settings: 0x15,
        play_plugin_message_sb: 0x17,
        entity_id_leading_sb: &[0x02, 0x0B],
        entity_id_leading_cb: &[0x18, 0x1A, 0x1B, 0x1C],
    },
    legacy_play_compression: true,
    varint_arrays: true,
};

pub static V1_9: Version = Version {
    name: "1.9",
    floor: 107,
    id_map: IdMap {
        login_disconnect: 0x00,
        login_encrypt_request: 0x01,
        login_success: 0x02,
        login_set_compression: Some(0x03),
        login_start: 0x00,
        login_encrypt_response: 0x01,
        play_disconnect: 0x1A,
        play_join_game: 0x23,
        play_set_compression: None,
        play_plugin_message_cb: 0x18,
        play_client_settings: 0x04,
        play_plugin_message_sb: 0x09,
        entity_id_leading_sb: &[0x0A, 0x14],
        entity_id_leading_cb: &[0x28, 0x29, 0x2A, 0x30],
    },
    legacy_play_compression: false,
    varint_arrays: true,
};

pub static V1_12: Version = Version {
    name: "1.12",
    floor: 335,
    id_map: IdMap {
        login_disconnect: 0x00,
        login_encrypt_request: 0x01,
        login_success: 0x02,
        login_set_compression: Some(0x03),
        login_start: 0x00,
        login_encrypt_response: 0x01,
        play_disconnect: 0x1A,
        play_join_game: 0x23,
        play_set_compression: None,
        play_plugin_message_cb: 0x18,
        play_client_settings: 0x04,
        play_plugin_message_sb: 0x09,
        entity_id_leading_sb: &[0x0A, 0x15],
        entity_id_leading_cb: &[0x25, 0x26, 0x27, 0x30],
    },
    legacy_play_compression: false,
    varint_arrays: true,
};

pub static V1_12_1: Version = Version {
    name: "1.12.1",
    floor: 338,
    id_map: IdMap {
        login_disconnect: 0x00,
        login_encrypt_request: 0x01,
        login_success: 0x02,
        login_set_compression: Some(0x03),
        login_start: 0x00,
        login_encrypt_response: 0x01,
        play_disconnect: 0x1A,
        play_join_game: 0x23,
        play_set_compression: None,
        play_plugin_message_cb: 0x18,
        play_client_settings: 0x04,
        play_plugin_message_sb: 0x09,
        entity_id_leading_sb: &[0x0A, 0x15],
        entity_id_leading_cb: &[0x26, 0x27, 0x28, 0x30],
    },
    legacy_play_compression: false,
    varint_arrays: true,
};

pub static V1_13: Version = Version {
    name: "1.13",
    floor: 393,
    id_map: IdMap {
        login_disconnect: 0x00,
        login_encrypt_request: 0x01,
        login_success: 0x02,
        login_set_compression: Some(0x03),
        login_start: 0x00,
        login_encrypt_response: 0x01,
        play_disconnect: 0x1B,
        play_join_game: 0x25,
        play_set_compression: None,
        play_plugin_message_cb: 0x19,
        play_client_settings: 0x04,
        play_plugin_message_sb: 0x0A,
        entity_id_leading_sb: &[0x0D, 0x19],
        entity_id_leading_cb: &[0x28, 0x29, 0x2A, 0x33],
    },
    legacy_play_compression: false,
    varint_arrays: true,
};

/// Descriptor table, ascending by floor. Selection relies on the order.
pub static VERSIONS: &[&Version] = &[&V1_7, &V1_8, &V1_9, &V1_12, &V1_12_1, &V1_13];

/// Exact protocol numbers the proxy accepts for login.
pub static SUPPORTED: &[i32] = &[
    4, 5, 47, 107, 108, 109, 110, 210, 315, 316, 335, 338, 340, 393, 401, 404,
];

pub fn is_supported(protocol_version: i32) -> bool {
    SUPPORTED.contains(&protocol_version)
}

/// Protocol number used to answer status requests from versions the
/// proxy does not support, so those clients render a version mismatch
/// instead of choking on the frame.
pub fn fallback_version() -> i32 {
    *SUPPORTED.last().expect("supported version set is not empty")
}

/// Picks the descriptor for an advertised protocol number: greatest
/// floor not exceeding it, the oldest descriptor as fallback.
pub fn select(protocol_version: i32) -> &'static Version {
    let idx = VERSIONS.partition_point(|version| version.floor <= protocol_version);
    VERSIONS[idx.saturating_sub(1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_by_floor() {
        assert!(VERSIONS.windows(2).all(|pair| pair[0].floor < pair[1].floor));
    }

    #[test]
    fn select_picks_greatest_floor_below() {
        assert_eq!(select(4).floor, 4);
        assert_eq!(select(5).floor, 4);
        assert_eq!(select(47).floor, 47);
        assert_eq!(select(106).floor, 47);
        assert_eq!(select(107).floor, 107);
        assert_eq!(select(340).floor, 338);
        assert_eq!(select(404).floor, 393);
        assert_eq!(select(9999).floor, 393);
    }

    #[test]
    fn select_falls_back_to_oldest() {
        assert_eq!(select(0).floor, 4);
        assert_eq!(select(-1).floor, 4);
    }

    #[test]
    fn fallback_is_supported() {
        assert!(is_supported(fallback_version()));
    }
}
