use std::collections::HashMap;

/// Reason reported when a participant's presence disappears
pub const LEFT_REASON: &str = "left";

/// A member of the room other than the bot itself
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

/// Presence change derived from liveliness samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    /// First remote participant of the session, fired once
    FirstParticipantJoined(Participant),
    ParticipantJoined(Participant),
    ParticipantLeft(Participant, String),
}

/// Tracks who is in the room.
///
/// Presence keys look like `{prefix}/participants/{id}/{name}`.
#[derive(Debug)]
pub struct Roster {
    participants_prefix: String,
    own_id: String,
    participants: HashMap<String, Participant>,
    first_joined: bool,
}

impl Roster {
    pub fn new(key_prefix: &str, own_id: &str) -> Self {
        Self {
            participants_prefix: format!("{}/participants/", key_prefix),
            own_id: own_id.to_string(),
            participants: HashMap::new(),
            first_joined: false,
        }
    }

    /// Presence key of a participant
    pub fn key_for(key_prefix: &str, id: &str, name: &str) -> String {
        format!("{}/participants/{}/{}", key_prefix, id, name)
    }

    /// Key expression matching every presence key of the room
    pub fn selector(key_prefix: &str) -> String {
        format!("{}/participants/*/*", key_prefix)
    }

    pub fn parse_key(&self, key: &str) -> Option<Participant> {
        let rest = key.strip_prefix(&self.participants_prefix)?;
        let (id, name) = rest.split_once('/')?;
        if id.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Participant {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    /// A presence key appeared
    pub fn on_put(&mut self, key: &str) -> Vec<RosterEvent> {
        let Some(participant) = self.parse_key(key) else {
            log::debug!("Ignoring unexpected presence key '{}'", key);
            return Vec::new();
        };
        if participant.id == self.own_id || self.participants.contains_key(&participant.id) {
            return Vec::new();
        }

        self.participants
            .insert(participant.id.clone(), participant.clone());

        let mut events = Vec::with_capacity(2);
        if !self.first_joined {
            self.first_joined = true;
            events.push(RosterEvent::FirstParticipantJoined(participant.clone()));
        }
        events.push(RosterEvent::ParticipantJoined(participant));
        events
    }

    /// A presence key disappeared
    pub fn on_delete(&mut self, key: &str) -> Option<RosterEvent> {
        let participant = self.parse_key(key)?;
        let participant = self.participants.remove(&participant.id)?;
        Some(RosterEvent::ParticipantLeft(
            participant,
            LEFT_REASON.to_string(),
        ))
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
