use serde::Deserialize;
use std::time::Duration;

use crate::types::events::DEFAULT_CHANNEL_CAPACITY;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long `connect`/`resume` may take before failing with a timeout.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Window for `send_throttled`: one send per key per window.
    #[serde(with = "duration_ms")]
    pub throttle_window: Duration,
    pub event_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            throttle_window: Duration::from_secs(5),
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Score removed per tick from a participant that is not speaking.
    pub decay_step: f32,
    /// Lead a challenger needs over the current speaker to take the floor.
    pub switch_margin: f32,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            decay_step: 0.3,
            switch_margin: 3.0,
        }
    }
}

/// Top-level client configuration, one section per subsystem.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub calls: crate::calls::CallManagerConfig,
    pub speaker: SpeakerConfig,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.session.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.session.throttle_window, Duration::from_secs(5));
        assert_eq!(config.speaker.poll_interval, Duration::from_millis(200));
        assert_eq!(config.speaker.switch_margin, 3.0);
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"session": {"connect_timeout": 2500}}"#).unwrap();
        assert_eq!(config.session.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.session.throttle_window, Duration::from_secs(5));
        assert_eq!(config.speaker.decay_step, 0.3);
    }
}
