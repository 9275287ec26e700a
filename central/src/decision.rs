//! Presence-override decision engine.
//!
//! Pure adjustment of the forecast before it is dispatched to hardware:
//! live occupancy from the radars overrides the predicted light levels,
//! with a per-light policy for which direction the override may go.

use std::collections::{HashMap, HashSet};

use log::warn;

use crate::models::Forecast;

/// Lights that occupancy may turn on but absence must never turn off.
pub const DEFAULT_HOLD_ON: [&str; 2] = ["l5", "l6"];

/// Level forced when occupancy contradicts a predicted "off".
const PRESENCE_ON_LEVEL: i64 = 2;

/// Merge the forecast with live presence. Lights without a presence entry
/// keep their prediction; temperatures pass through unmodified.
pub fn adjust(
    forecast: &Forecast,
    presence: &HashMap<String, bool>,
    hold_on: &HashSet<String>,
) -> Forecast {
    let mut adjusted = forecast.clone();
    for (name, level) in adjusted.lights.iter_mut() {
        let Some(&present) = presence.get(name) else {
            continue;
        };
        if *level == 0 && present {
            *level = PRESENCE_ON_LEVEL;
        } else if (1..=3).contains(level) && !present && !hold_on.contains(name) {
            *level = 0;
        }
    }
    adjusted
}

/// Pair each light with its room's radar sample. Lights and radars are both
/// ordered by name (room i hosts light i); a count mismatch is tolerated but
/// flagged, and unpaired lights simply keep their prediction in `adjust`.
pub fn presence_by_light(
    light_names: &[String],
    radar_samples: &[(String, bool)],
) -> HashMap<String, bool> {
    if light_names.len() != radar_samples.len() {
        warn!(
            "{} lights but {} radar rooms; unpaired lights keep their prediction",
            light_names.len(),
            radar_samples.len()
        );
    }
    light_names
        .iter()
        .zip(radar_samples.iter())
        .map(|(light, (_room, present))| (light.clone(), *present))
        .collect()
}
