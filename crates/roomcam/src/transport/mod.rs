//! Conferencing room transport over Zenoh.
//!
//! A room is a Zenoh key space `roomcam/{room}`. Every member declares a
//! liveliness token `roomcam/{room}/participants/{id}/{name}`, so joins and
//! leaves (including crashes) are observed through liveliness. The bot
//! publishes its camera and microphone under `roomcam/{room}/media/{id}/`.
//!
//! ```rust,ignore
//! let transport = RoomTransport::new("tcp://127.0.0.1:7447/lobby", None, "bot", params)?;
//! transport.on_first_participant_joined(|p| log::info!("First participant joined: {}", p.id));
//! let pipeline = Pipeline::new(vec![Box::new(source), Box::new(transport.output())]);
//! ```

mod output;
mod room_url;
mod roster;
mod session;

pub use output::TransportOutput;
pub use room_url::{is_valid_chunk, sanitize_chunk, RoomUrl, SessionMode};
pub use roster::{Participant, Roster, RosterEvent, LEFT_REASON};
pub use session::open_room_session;

use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::config::TransportParams;

/// Errors raised by the room transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid room URL {0}")]
    InvalidUrl(String),

    #[error("Zenoh error: {0}")]
    Zenoh(String),

    #[error("Not joined to a room")]
    NotJoined,
}

impl From<zenoh::Error> for TransportError {
    fn from(err: zenoh::Error) -> Self {
        TransportError::Zenoh(err.to_string())
    }
}

type RoomHandler = Arc<dyn Fn(&str) + Send + Sync>;
type ParticipantHandler = Arc<dyn Fn(&Participant) + Send + Sync>;
type ParticipantLeftHandler = Arc<dyn Fn(&Participant, &str) + Send + Sync>;

#[derive(Default)]
struct EventHandlers {
    joined: Vec<RoomHandler>,
    left: Vec<RoomHandler>,
    first_participant_joined: Vec<ParticipantHandler>,
    participant_joined: Vec<ParticipantHandler>,
    participant_left: Vec<ParticipantLeftHandler>,
}

pub(crate) struct TransportInner {
    url: RoomUrl,
    token: Option<String>,
    bot_name: String,
    participant_id: String,
    params: TransportParams,
    handlers: RwLock<EventHandlers>,
}

impl TransportInner {
    pub(crate) fn url(&self) -> &RoomUrl {
        &self.url
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub(crate) fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub(crate) fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub(crate) fn params(&self) -> &TransportParams {
        &self.params
    }

    pub(crate) fn presence_key(&self) -> String {
        Roster::key_for(&self.url.key_prefix(), &self.participant_id, &self.bot_name)
    }

    pub(crate) fn media_key(&self, track: &str) -> String {
        format!(
            "{}/media/{}/{}",
            self.url.key_prefix(),
            self.participant_id,
            track
        )
    }

    /// Snapshot handlers so callbacks run without holding the lock
    fn with_handlers<T>(&self, pick: impl FnOnce(&EventHandlers) -> Vec<T>) -> Vec<T> {
        match self.handlers.read() {
            Ok(handlers) => pick(&handlers),
            Err(poisoned) => pick(&poisoned.into_inner()),
        }
    }

    fn register(&self, add: impl FnOnce(&mut EventHandlers)) {
        match self.handlers.write() {
            Ok(mut handlers) => add(&mut handlers),
            Err(poisoned) => add(&mut poisoned.into_inner()),
        }
    }

    pub(crate) fn emit_joined(&self) {
        log::info!("Joined room {}", self.url);
        for handler in self.with_handlers(|h| h.joined.clone()) {
            handler(self.url.room());
        }
    }

    pub(crate) fn emit_left(&self) {
        log::info!("Left room {}", self.url);
        for handler in self.with_handlers(|h| h.left.clone()) {
            handler(self.url.room());
        }
    }

    pub(crate) fn emit(&self, event: &RosterEvent) {
        match event {
            RosterEvent::FirstParticipantJoined(participant) => {
                for handler in self.with_handlers(|h| h.first_participant_joined.clone()) {
                    handler(participant);
                }
            }
            RosterEvent::ParticipantJoined(participant) => {
                log::debug!("Participant joined: {} ({})", participant.name, participant.id);
                for handler in self.with_handlers(|h| h.participant_joined.clone()) {
                    handler(participant);
                }
            }
            RosterEvent::ParticipantLeft(participant, reason) => {
                log::debug!(
                    "Participant left: {} ({}), reason: {}",
                    participant.name,
                    participant.id,
                    reason
                );
                for handler in self.with_handlers(|h| h.participant_left.clone()) {
                    handler(participant, reason);
                }
            }
        }
    }
}

/// Handle to a conferencing room.
///
/// Construction only validates the address; the room is joined when the
/// [`TransportOutput`] stage sees the start frame and left on end or cancel.
#[derive(Clone)]
pub struct RoomTransport {
    inner: Arc<TransportInner>,
}

impl RoomTransport {
    pub fn new(
        room_url: &str,
        token: Option<String>,
        bot_name: &str,
        params: TransportParams,
    ) -> Result<Self, TransportError> {
        let url = RoomUrl::parse(room_url)?;
        let bot_name = sanitize_chunk(bot_name);
        let participant_id = uuid::Uuid::new_v4().simple().to_string();

        log::debug!(
            "Room transport for {} as '{}' ({})",
            url,
            bot_name,
            participant_id
        );

        Ok(Self {
            inner: Arc::new(TransportInner {
                url,
                token,
                bot_name,
                participant_id,
                params,
                handlers: RwLock::new(EventHandlers::default()),
            }),
        })
    }

    pub fn room_url(&self) -> &RoomUrl {
        self.inner.url()
    }

    /// Identity of the bot in the room
    pub fn participant_id(&self) -> &str {
        self.inner.participant_id()
    }

    /// Output stage publishing frames to the room
    pub fn output(&self) -> TransportOutput {
        TransportOutput::new(self.inner.clone())
    }

    /// The bot joined the room
    pub fn on_joined<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.register(|h| h.joined.push(Arc::new(handler)));
    }

    /// The bot left the room
    pub fn on_left<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.register(|h| h.left.push(Arc::new(handler)));
    }

    /// The first other participant joined; fired once per session
    pub fn on_first_participant_joined<F>(&self, handler: F)
    where
        F: Fn(&Participant) + Send + Sync + 'static,
    {
        self.inner
            .register(|h| h.first_participant_joined.push(Arc::new(handler)));
    }

    pub fn on_participant_joined<F>(&self, handler: F)
    where
        F: Fn(&Participant) + Send + Sync + 'static,
    {
        self.inner
            .register(|h| h.participant_joined.push(Arc::new(handler)));
    }

    /// A participant left; the handler gets the reason
    pub fn on_participant_left<F>(&self, handler: F)
    where
        F: Fn(&Participant, &str) + Send + Sync + 'static,
    {
        self.inner
            .register(|h| h.participant_left.push(Arc::new(handler)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transport() -> RoomTransport {
        RoomTransport::new(
            "tcp://127.0.0.1:7447/lobby",
            None,
            "lobby bot",
            TransportParams::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_keys() {
        let transport = transport();
        let id = transport.participant_id().to_string();
        assert_eq!(id.len(), 32);
        assert_eq!(
            transport.inner.presence_key(),
            format!("roomcam/lobby/participants/{}/lobby_bot", id)
        );
        assert_eq!(
            transport.inner.media_key("camera"),
            format!("roomcam/lobby/media/{}/camera", id)
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            RoomTransport::new("lobby", None, "bot", TransportParams::default()),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_handlers_dispatch() {
        let transport = transport();
        let first = Arc::new(AtomicUsize::new(0));
        let joined = Arc::new(AtomicUsize::new(0));
        let left = Arc::new(std::sync::Mutex::new(Vec::new()));

        transport.on_first_participant_joined({
            let first = first.clone();
            move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            }
        });
        transport.on_participant_joined({
            let joined = joined.clone();
            move |_| {
                joined.fetch_add(1, Ordering::SeqCst);
            }
        });
        transport.on_participant_left({
            let left = left.clone();
            move |p, reason| left.lock().unwrap().push((p.id.clone(), reason.to_string()))
        });

        let mut roster = Roster::new(&transport.room_url().key_prefix(), "me");
        for key in [
            "roomcam/lobby/participants/a1/alice",
            "roomcam/lobby/participants/b2/bob",
        ] {
            for event in roster.on_put(key) {
                transport.inner.emit(&event);
            }
        }
        if let Some(event) = roster.on_delete("roomcam/lobby/participants/a1/alice") {
            transport.inner.emit(&event);
        }

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(joined.load(Ordering::SeqCst), 2);
        assert_eq!(
            *left.lock().unwrap(),
            vec![("a1".to_string(), "left".to_string())]
        );
    }
}
