use crate::envelope::ReadyPayload;
use crate::types::events::Dispatch;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const VOICE_STATE_UPDATE: &str = "voice.state_update";

/// A user joined to a voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceParticipant {
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

/// Body of `voice.state_update`. A null `channel_id` means the user left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub user_id: String,
    pub channel_id: Option<String>,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

/// Who is in which voice channel. One entry per user.
#[derive(Debug, Default)]
pub struct VoiceRegistry {
    participants: HashMap<String, VoiceParticipant>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: VoiceStateUpdate) {
        match update.channel_id {
            Some(channel_id) => {
                debug!(target: "Voice", "{} in voice channel {channel_id}", update.user_id);
                self.participants.insert(
                    update.user_id.clone(),
                    VoiceParticipant {
                        user_id: update.user_id,
                        channel_id,
                        self_mute: update.self_mute,
                        self_deaf: update.self_deaf,
                    },
                );
            }
            None => {
                debug!(target: "Voice", "{} left voice", update.user_id);
                self.participants.remove(&update.user_id);
            }
        }
    }

    /// Applies a session dispatch if it is a voice state update.
    /// Returns whether the registry consumed it.
    pub fn apply_dispatch(&mut self, dispatch: &Dispatch) -> bool {
        if dispatch.event != VOICE_STATE_UPDATE {
            return false;
        }
        match serde_json::from_value::<VoiceStateUpdate>(dispatch.data.clone()) {
            Ok(update) => self.apply(update),
            Err(e) => warn!(target: "Voice", "Bad {VOICE_STATE_UPDATE} payload: {e}"),
        }
        true
    }

    /// Replaces the registry with the `voice_states` list of a ready snapshot.
    pub fn load_snapshot(&mut self, ready: &ReadyPayload) {
        self.participants.clear();
        let Some(states) = ready.snapshot.get("voice_states") else {
            return;
        };
        match serde_json::from_value::<Vec<VoiceParticipant>>(states.clone()) {
            Ok(states) => {
                for participant in states {
                    self.participants
                        .insert(participant.user_id.clone(), participant);
                }
            }
            Err(e) => warn!(target: "Voice", "Bad voice_states in snapshot: {e}"),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&VoiceParticipant> {
        self.participants.get(user_id)
    }

    /// Participants of `channel_id`, ordered by user id.
    pub fn in_channel(&self, channel_id: &str) -> Vec<&VoiceParticipant> {
        let mut members: Vec<_> = self
            .participants
            .values()
            .filter(|p| p.channel_id == channel_id)
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
