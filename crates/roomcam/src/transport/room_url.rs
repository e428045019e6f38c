use url::Url;

use super::TransportError;

const DEFAULT_PORT: u16 = 7447;

/// Zenoh session mode used to reach the room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// Route through a zenohd router (default)
    #[default]
    Client,
    /// Connect directly to another peer, no router needed
    Peer,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Client => "client",
            SessionMode::Peer => "peer",
        }
    }
}

/// Address of a room: `tcp://host[:port]/room[?mode=peer]`
///
/// The scheme and authority select the Zenoh endpoint, the single path
/// segment names the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomUrl {
    endpoint: String,
    room: String,
    mode: SessionMode,
}

impl RoomUrl {
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidUrl(format!("{}: {}", input, reason));

        let url = Url::parse(input).map_err(|e| invalid(&e.to_string()))?;

        let scheme = url.scheme();
        if !matches!(scheme, "tcp" | "udp" | "tls" | "quic") {
            return Err(invalid("scheme must be tcp, udp, tls or quic"));
        }

        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let mut segments = url
            .path_segments()
            .ok_or_else(|| invalid("missing room name"))?
            .filter(|s| !s.is_empty());
        let room = segments.next().ok_or_else(|| invalid("missing room name"))?;
        if segments.next().is_some() {
            return Err(invalid("room name must be a single path segment"));
        }
        if !is_valid_chunk(room) {
            return Err(invalid("room name contains reserved characters"));
        }

        let mut mode = SessionMode::default();
        for (key, value) in url.query_pairs() {
            if key == "mode" {
                mode = match value.as_ref() {
                    "client" => SessionMode::Client,
                    "peer" => SessionMode::Peer,
                    other => return Err(invalid(&format!("unknown mode '{}'", other))),
                };
            }
        }

        Ok(Self {
            endpoint: format!("{}/{}:{}", scheme, host, port),
            room: room.to_string(),
            mode,
        })
    }

    /// Zenoh endpoint, e.g. `tcp/127.0.0.1:7447`
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Key prefix of everything published in the room
    pub fn key_prefix(&self) -> String {
        format!("roomcam/{}", self.room)
    }
}

impl std::fmt::Display for RoomUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.room, self.endpoint)
    }
}

/// Whether `chunk` can be used as one segment of a key expression
pub fn is_valid_chunk(chunk: &str) -> bool {
    !chunk.is_empty()
        && !chunk.starts_with('@')
        && !chunk
            .chars()
            .any(|c| matches!(c, '/' | '*' | '$' | '#' | '?') || c.is_whitespace())
}

/// Replace characters that are not allowed in a key chunk
pub fn sanitize_chunk(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if matches!(c, '/' | '*' | '$' | '#' | '?' | '@') || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
