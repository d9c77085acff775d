use parley::voice::{GridTier, compute_grid_layout};

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_empty_is_solo_without_slots() {
    let layout = compute_grid_layout(&[], Some("u1"), Some("u2"));
    assert_eq!(layout.tier, GridTier::Solo);
    assert!(layout.slots.is_empty());
}

#[test]
fn test_four_is_quad_without_aspect_enforcement() {
    let layout = compute_grid_layout(&ids(&["a", "b", "c", "d"]), None, Some("c"));
    assert_eq!(layout.tier, GridTier::Quad);
    assert_eq!(layout.slots.len(), 4);
    assert!(layout.slots.iter().all(|s| !s.enforce_aspect_ratio));
    assert!(layout.slots.iter().all(|s| !s.is_spotlight));
}

#[test]
fn test_six_with_screen_share_spotlights_screen() {
    let participants = ids(&["a", "b", "c", "d:screen", "e", "f"]);
    let layout = compute_grid_layout(&participants, None, Some("b"));

    assert_eq!(layout.tier, GridTier::Spotlight);
    assert_eq!(layout.slots[0].id, "d:screen");
    assert!(layout.slots[0].is_spotlight);
    assert_eq!(layout.slots.len(), 6);
    assert!(layout.slots[1..].iter().all(|s| !s.is_spotlight && s.enforce_aspect_ratio));
}

#[test]
fn test_large_room_spotlights_active_speaker() {
    let participants = ids(&["a", "b", "c", "d", "e"]);
    let layout = compute_grid_layout(&participants, None, Some("e"));
    assert_eq!(layout.tier, GridTier::Spotlight);
    assert_eq!(layout.slots[0].id, "e");
    let rest: Vec<_> = layout.slots[1..].iter().map(|s| s.id.as_str()).collect();
    assert_eq!(rest, vec!["a", "b", "c", "d"]);
}

#[test]
fn test_pin_overrides_count_tier() {
    let layout = compute_grid_layout(&ids(&["a", "b"]), Some("b"), Some("a"));
    assert_eq!(layout.tier, GridTier::Spotlight);
    assert_eq!(layout.slots[0].id, "b");
    assert!(layout.slots[0].is_spotlight);
    assert_eq!(layout.slots[1].id, "a");
    assert!(!layout.slots[1].is_spotlight);
    assert!(layout.slots[1].enforce_aspect_ratio);
}

#[test]
fn test_pin_beats_screen_share() {
    let participants = ids(&["a", "b:screen", "c", "d", "e"]);
    let layout = compute_grid_layout(&participants, Some("c"), None);
    assert_eq!(layout.slots[0].id, "c");
}
