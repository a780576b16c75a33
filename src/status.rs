//! Status (server list) response assembly.
//!
//! Everything here is best-effort: a missing sample file yields an
//! empty sample, a missing icon drops the favicon field. Only the
//! JSON document itself can fail.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use rand::Rng;
use serde_json::json;

use crate::minecraft::colorize;
use crate::proxy::ProxyServer;

/// UUID reported for sample entries; they are display lines, not players.
const SAMPLE_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Assembles the status JSON document for one request.
///
/// ## Arguments
///
/// * `server` - Shared proxy services
/// * `virtual_host` - Routing key from the handshake
/// * `protocol_version` - Version number to echo back to the client
pub async fn build_status(
    server: &Arc<ProxyServer>,
    virtual_host: &str,
    protocol_version: i32,
) -> anyhow::Result<String> {
    let sample = match server.router.route_sample(virtual_host).await {
        Some(path) => read_sample(&path).await,
        None => Vec::new(),
    };

    let max_players = if server.sync_max_players().await {
        server.directory.max_players().await as i64
    } else {
        server.max_players().await as i64
    };
    let online = server.directory.player_count().await as i64;

    let motds = server.router.route_motds(virtual_host).await;
    let motd = &motds[rand::thread_rng().gen_range(0..motds.len())];

    let mut response = json!({
        "version": {
            "name": server.brand().await,
            "protocol": protocol_version,
        },
        "players": {
            "max": max_players,
            "online": online,
            "sample": sample,
        },
        "description": {
            "text": colorize(motd),
        },
        "modinfo": {
            "type": "FML",
            "modList": [],
        },
    });

    let icons = server.router.route_icons(virtual_host).await;
    if !icons.is_empty() {
        let icon_path = &icons[rand::thread_rng().gen_range(0..icons.len())];
        match tokio::fs::read(icon_path).await {
            Ok(icon) => {
                let favicon = format!("data:image/png;base64,{}", BASE64_ENGINE.encode(icon));
                response["favicon"] = json!(favicon);
            }
            Err(err) => {
                log::debug!("Could not read status icon {}: {:?}", icon_path, err);
            }
        }
    }

    Ok(serde_json::to_string(&response)?)
}

/// Reads the player-sample file: one entry per non-blank line.
async fn read_sample(path: &str) -> Vec<serde_json::Value> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) => {
            log::debug!("Could not read status sample {}: {:?}", path, err);
            return Vec::new();
        }
    };
    contents
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            json!({
                "name": colorize(line),
                "id": SAMPLE_UUID,
            })
        })
        .collect()
}
