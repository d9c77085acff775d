//! Participant grid tiering.

use serde::Serialize;

/// Participant ids ending in this are screen-share tiles.
pub const SCREEN_SHARE_SUFFIX: &str = ":screen";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GridTier {
    Solo,
    Duo,
    Trio,
    Quad,
    /// One large primary slot plus secondary tiles.
    Spotlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridSlot {
    pub id: String,
    pub is_spotlight: bool,
    pub enforce_aspect_ratio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridLayout {
    pub tier: GridTier,
    pub slots: Vec<GridSlot>,
}

pub fn is_screen_share(id: &str) -> bool {
    id.ends_with(SCREEN_SHARE_SUFFIX)
}

/// Maps participants plus pin/speaker state to a tiling.
///
/// A present pin always wins. Otherwise up to four participants get an even
/// grid; five or more get a spotlight on a screen share, else the active
/// speaker, else the first participant.
pub fn compute_grid_layout(
    participant_ids: &[String],
    pinned_id: Option<&str>,
    active_speaker_id: Option<&str>,
) -> GridLayout {
    if participant_ids.is_empty() {
        return GridLayout {
            tier: GridTier::Solo,
            slots: Vec::new(),
        };
    }

    let present = |id: &str| participant_ids.iter().any(|p| p == id);

    if let Some(pinned) = pinned_id.filter(|id| present(*id)) {
        return spotlight(participant_ids, pinned);
    }

    let tier = match participant_ids.len() {
        1 => GridTier::Solo,
        2 => GridTier::Duo,
        3 => GridTier::Trio,
        4 => GridTier::Quad,
        _ => {
            let featured = participant_ids
                .iter()
                .find(|id| is_screen_share(id))
                .map(String::as_str)
                .or(active_speaker_id.filter(|id| present(*id)))
                .unwrap_or(participant_ids[0].as_str());
            return spotlight(participant_ids, featured);
        }
    };

    let enforce_aspect_ratio = participant_ids.len() <= 3;
    GridLayout {
        tier,
        slots: participant_ids
            .iter()
            .map(|id| GridSlot {
                id: id.clone(),
                is_spotlight: false,
                enforce_aspect_ratio,
            })
            .collect(),
    }
}

/// Featured participant first, the rest as regular tiles in their original order.
fn spotlight(participant_ids: &[String], featured: &str) -> GridLayout {
    let mut slots = Vec::with_capacity(participant_ids.len());
    slots.push(GridSlot {
        id: featured.to_string(),
        is_spotlight: true,
        enforce_aspect_ratio: false,
    });
    slots.extend(
        participant_ids
            .iter()
            .filter(|id| id.as_str() != featured)
            .map(|id| GridSlot {
                id: id.clone(),
                is_spotlight: false,
                enforce_aspect_ratio: true,
            }),
    );
    GridLayout {
        tier: GridTier::Spotlight,
        slots,
    }
}
