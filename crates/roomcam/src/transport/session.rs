use std::sync::Arc;

use super::room_url::{RoomUrl, SessionMode};
use super::TransportError;

/// Open the Zenoh session backing a room.
///
/// Client mode routes through the zenohd router at the room endpoint; peer
/// mode connects straight to the peer listening there. Scouting is disabled in
/// both so the bot only ever talks to the configured endpoint. A room token,
/// when given, is presented as the password for the bot's user name.
pub async fn open_room_session(
    url: &RoomUrl,
    user: &str,
    token: Option<&str>,
) -> Result<Arc<zenoh::Session>, TransportError> {
    log::info!(
        "Connecting to room '{}' at {} ({} mode)",
        url.room(),
        url.endpoint(),
        url.mode().as_str()
    );

    let config = session_config(url, user, token)?;
    let session = zenoh::open(config)
        .await
        .map_err(|e| TransportError::Zenoh(format!("Failed to open Zenoh session: {}", e)))?;

    log::info!("Connected to Zenoh");
    Ok(Arc::new(session))
}

fn session_config(
    url: &RoomUrl,
    user: &str,
    token: Option<&str>,
) -> Result<zenoh::Config, TransportError> {
    let mut config = zenoh::Config::default();
    insert(&mut config, "mode", &format!(r#""{}""#, url.mode().as_str()))?;
    insert(
        &mut config,
        "connect/endpoints",
        &format!(r#"["{}"]"#, url.endpoint()),
    )?;
    // Disable scouting to prevent connecting to remote peers via Tailscale/VPN
    insert(&mut config, "scouting/multicast/enabled", "false")?;
    insert(&mut config, "scouting/gossip/enabled", "false")?;
    if url.mode() == SessionMode::Peer {
        // peers must not accept inbound connections from other rooms
        insert(&mut config, "listen/endpoints", "[]")?;
    }

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        insert(
            &mut config,
            "transport/auth/usrpwd/user",
            &serde_json::to_string(user).map_err(|e| TransportError::Zenoh(e.to_string()))?,
        )?;
        insert(
            &mut config,
            "transport/auth/usrpwd/password",
            &serde_json::to_string(token).map_err(|e| TransportError::Zenoh(e.to_string()))?,
        )?;
    }
    Ok(config)
}

fn insert(config: &mut zenoh::Config, key: &str, value: &str) -> Result<(), TransportError> {
    config
        .insert_json5(key, value)
        .map_err(|e| TransportError::Zenoh(format!("Failed to set Zenoh '{}': {}", key, e)))
}
