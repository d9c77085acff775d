//! Voice participants, active speaker selection and grid layout.

pub mod layout;
pub mod participants;
pub mod speaker;

pub use layout::{GridLayout, GridSlot, GridTier, SCREEN_SHARE_SUFFIX, compute_grid_layout};
pub use participants::{VoiceParticipant, VoiceRegistry, VoiceStateUpdate};
pub use speaker::{ActiveSpeakerSelector, ActivitySample, ActivitySignals, spawn_speaker_poll};
