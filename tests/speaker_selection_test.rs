use parley::SpeakerConfig;
use parley::voice::{ActiveSpeakerSelector, ActivitySample, ActivitySignals, spawn_speaker_poll};
use std::time::Duration;
use tokio::sync::watch;

fn speaking(entries: &[(&str, f32)]) -> ActivitySignals {
    entries
        .iter()
        .map(|(id, level)| (id.to_string(), ActivitySample::speaking(*level)))
        .collect()
}

#[test]
fn test_steady_speaker_needs_margin_to_lose_floor() {
    let mut selector = ActiveSpeakerSelector::new(&SpeakerConfig::default());
    selector.tick(&speaking(&[("alice", 5.0)]));
    assert_eq!(selector.current(), Some("alice"));

    // Bob climbs to 8: ties the margin, does not exceed it.
    for _ in 0..8 {
        selector.tick(&speaking(&[("alice", 0.0), ("bob", 1.0)]));
    }
    assert_eq!(selector.score("bob"), 8.0);
    assert_eq!(selector.current(), Some("alice"));

    selector.tick(&speaking(&[("alice", 0.0), ("bob", 0.1)]));
    assert_eq!(selector.current(), Some("bob"));
}

#[test]
fn test_silent_speaker_at_zero_hands_over_immediately() {
    let mut selector = ActiveSpeakerSelector::new(&SpeakerConfig::default());
    selector.tick(&speaking(&[("alice", 0.6)]));

    // Two silent polls take alice from 0.6 to 0.
    let mut quiet = ActivitySignals::new();
    quiet.insert("alice".into(), ActivitySample::silent());
    selector.tick(&quiet);
    assert_eq!(selector.current(), Some("alice"));

    quiet.insert("bob".into(), ActivitySample::speaking(0.2));
    selector.tick(&quiet);
    assert_eq!(selector.score("alice"), 0.0);
    assert_eq!(selector.current(), Some("bob"));
}

#[test]
fn test_custom_margin() {
    let config = SpeakerConfig {
        switch_margin: 0.5,
        ..Default::default()
    };
    let mut selector = ActiveSpeakerSelector::new(&config);
    selector.tick(&speaking(&[("alice", 1.0)]));
    selector.tick(&speaking(&[("alice", 0.0), ("bob", 1.6)]));
    assert_eq!(selector.current(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn test_poll_task_follows_signals() {
    let config = SpeakerConfig::default();
    let (signals_tx, signals_rx) = watch::channel(ActivitySignals::new());
    let (mut current, task) = spawn_speaker_poll(&config, signals_rx);

    signals_tx.send_replace(speaking(&[("alice", 2.0)]));
    current.changed().await.unwrap();
    assert_eq!(current.borrow().as_deref(), Some("alice"));

    // Alice goes quiet while bob talks; bob takes over once he leads by the margin.
    let mut next = speaking(&[("bob", 1.0)]);
    next.insert("alice".into(), ActivitySample::silent());
    signals_tx.send_replace(next);
    tokio::time::timeout(Duration::from_secs(5), current.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.borrow().as_deref(), Some("bob"));

    drop(signals_tx);
    task.await.unwrap();
}
