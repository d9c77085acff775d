//! Active speaker selection with hysteresis.
//!
//! Each poll, a speaking participant gains `level` points and a silent one
//! loses `decay_step`, floored at zero, and is forgotten once it hits zero.
//! The floor only changes hands when the challenger leads by more than
//! `switch_margin`, or when the current speaker has gone quiet entirely
//! while someone else is talking.

use crate::config::SpeakerConfig;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One participant's audio activity at poll time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySample {
    pub speaking: bool,
    pub level: f32,
}

impl ActivitySample {
    pub fn speaking(level: f32) -> Self {
        Self {
            speaking: true,
            level,
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }
}

pub type ActivitySignals = HashMap<String, ActivitySample>;

#[derive(Debug)]
pub struct ActiveSpeakerSelector {
    decay_step: f32,
    switch_margin: f32,
    scores: HashMap<String, f32>,
    current: Option<String>,
}

impl ActiveSpeakerSelector {
    pub fn new(config: &SpeakerConfig) -> Self {
        Self {
            decay_step: config.decay_step,
            switch_margin: config.switch_margin,
            scores: HashMap::new(),
            current: None,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn score(&self, id: &str) -> f32 {
        self.scores.get(id).copied().unwrap_or(0.0)
    }

    /// Forgets a participant that left; drops the floor if it was theirs.
    pub fn remove(&mut self, id: &str) {
        self.scores.remove(id);
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
    }

    /// Runs one poll and returns the current speaker.
    pub fn tick(&mut self, signals: &ActivitySignals) -> Option<&str> {
        let mut anyone_speaking = false;
        for (id, sample) in signals.iter().filter(|(_, s)| s.speaking) {
            anyone_speaking = true;
            *self.scores.entry(id.clone()).or_insert(0.0) += sample.level;
        }

        let decay = self.decay_step;
        self.scores.retain(|id, score| {
            if signals.get(id).is_some_and(|s| s.speaking) {
                return true;
            }
            *score = (*score - decay).max(0.0);
            *score > 0.0
        });

        let candidate = self
            .scores
            .iter()
            .filter(|(_, score)| **score > 0.0)
            .max_by(|(a_id, a), (b_id, b)| a.total_cmp(b).then_with(|| b_id.cmp(a_id)))
            .map(|(id, score)| (id.clone(), *score));

        if let Some((candidate, candidate_score)) = candidate {
            let switch = match self.current.as_deref() {
                None => true,
                Some(current) if current == candidate => false,
                Some(current) => {
                    let current_score = self.score(current);
                    candidate_score > current_score + self.switch_margin
                        || (current_score == 0.0 && anyone_speaking)
                }
            };
            if switch {
                debug!(
                    target: "Voice/Speaker",
                    "Active speaker {:?} -> {candidate} ({candidate_score:.1})",
                    self.current
                );
                self.current = Some(candidate);
            }
        }

        trace!(target: "Voice/Speaker", "scores: {:?}", self.scores);
        self.current.as_deref()
    }
}

/// Runs a selector every `poll_interval` over the latest `signals` and
/// publishes the current speaker. The task ends when the signal sender is
/// dropped.
pub fn spawn_speaker_poll(
    config: &SpeakerConfig,
    mut signals: watch::Receiver<ActivitySignals>,
) -> (watch::Receiver<Option<String>>, JoinHandle<()>) {
    let (speaker_tx, speaker_rx) = watch::channel(None);
    let mut selector = ActiveSpeakerSelector::new(config);
    let poll_interval = config.poll_interval;

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if signals.has_changed().is_err() {
                debug!(target: "Voice/Speaker", "Activity source gone, stopping speaker poll");
                return;
            }
            let snapshot = signals.borrow_and_update().clone();
            let current = selector.tick(&snapshot).map(str::to_owned);
            speaker_tx.send_if_modified(|published| {
                if *published == current {
                    return false;
                }
                *published = current;
                true
            });
        }
    });
    (speaker_rx, task)
}
