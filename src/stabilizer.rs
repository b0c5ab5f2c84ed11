//! Turns noisy (position, area) readings into discrete area-entry events.
//!
//! Reverse-geocoded area names flicker near boundaries and GPS jitters while
//! the device is still. A reading only counts once the device has moved at
//! least `min_displacement_m` since the last counted reading; an area is only
//! entered after `required_confirmations` consecutive counted readings agree;
//! and the same area cannot fire again until its cooldown has passed.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::location::PositionSample;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    EnterArea,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub area: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct StabilizerConfig {
    pub min_displacement_m: f64,
    pub required_confirmations: u32,
    pub cooldown: Duration,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            min_displacement_m: 40.0,
            required_confirmations: 2,
            cooldown: Duration::from_secs(30 * 60),
        }
    }
}

impl StabilizerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_displacement_m: config.geofence_min_displacement_m,
            required_confirmations: config.geofence_required_confirmations.max(1),
            cooldown: Duration::from_millis(config.geofence_cooldown_ms),
        }
    }
}

#[derive(Debug, Default)]
struct StabilizerState {
    candidate_area: Option<String>,
    consecutive_match_count: u32,
    last_sample: Option<PositionSample>,
    last_enter_by_area: HashMap<String, i64>,
}

pub struct GeofenceStabilizer {
    config: StabilizerConfig,
    active: bool,
    state: StabilizerState,
}

impl GeofenceStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            active: true,
            state: StabilizerState::default(),
        }
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Drops all per-session state, including cooldown timers.
    pub fn reset(&mut self) {
        self.state = StabilizerState::default();
    }

    pub fn candidate_area(&self) -> Option<&str> {
        self.state.candidate_area.as_deref()
    }

    pub fn last_enter_for(&self, area: &str) -> Option<i64> {
        self.state.last_enter_by_area.get(area).copied()
    }

    /// Evaluates one reading. `area` is `None` when geocoding failed; such
    /// readings leave the state untouched. The sample timestamp is the clock
    /// used for cooldowns.
    pub fn on_sample(&mut self, sample: PositionSample, area: Option<&str>) -> Option<AlertEvent> {
        let area = area?;
        if !self.active {
            return None;
        }

        if let Some(previous) = &self.state.last_sample {
            let moved = haversine_m(previous.lat, previous.lng, sample.lat, sample.lng);
            if moved < self.config.min_displacement_m {
                trace!(target: "geofence", moved, "below displacement gate");
                return None;
            }
        }
        self.state.last_sample = Some(sample);

        if self.state.candidate_area.as_deref() == Some(area) {
            self.state.consecutive_match_count =
                self.state.consecutive_match_count.saturating_add(1);
        } else {
            self.state.candidate_area = Some(area.to_string());
            self.state.consecutive_match_count = 1;
        }

        if self.state.consecutive_match_count < self.config.required_confirmations {
            return None;
        }

        let now = sample.timestamp_ms;
        let cooldown_ms = i64::try_from(self.config.cooldown.as_millis()).unwrap_or(i64::MAX);
        if let Some(&last) = self.state.last_enter_by_area.get(area) {
            let since_ms = now.saturating_sub(last);
            if since_ms <= cooldown_ms {
                debug!(target: "geofence", area, since_ms, "area still cooling down");
                return None;
            }
        }

        self.state.last_enter_by_area.insert(area.to_string(), now);
        debug!(target: "geofence", area, "area entry confirmed");
        Some(AlertEvent {
            kind: AlertKind::EnterArea,
            area: area.to_string(),
            lat: sample.lat,
            lng: sample.lng,
            timestamp_ms: now,
        })
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: i64 = 60 * 1000;
    // Roughly 111 m of latitude.
    const STEP: f64 = 0.001;

    fn sample(step: u32, at_ms: i64) -> PositionSample {
        PositionSample::new(37.5 + STEP * f64::from(step), 127.0, at_ms)
    }

    fn stabilizer() -> GeofenceStabilizer {
        GeofenceStabilizer::new(StabilizerConfig::default())
    }

    #[test]
    fn haversine_matches_known_distance() {
        let one_degree = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((one_degree - 111_194.9).abs() < 1.0);
        assert_eq!(haversine_m(37.5, 127.0, 37.5, 127.0), 0.0);
        assert!(haversine_m(37.5, 127.0, 37.5 + STEP, 127.0) > 100.0);
    }

    #[test]
    fn two_moving_matches_fire_once() {
        let mut stabilizer = stabilizer();
        assert!(stabilizer.on_sample(sample(0, 0), Some("B")).is_none());
        let event = stabilizer.on_sample(sample(1, 1_000), Some("B")).unwrap();
        assert_eq!(event.area, "B");
        assert_eq!(event.kind, AlertKind::EnterArea);
        assert_eq!(event.timestamp_ms, 1_000);
        assert!(stabilizer.on_sample(sample(2, 2_000), Some("B")).is_none());
    }

    #[test]
    fn stationary_jitter_never_fires() {
        let mut stabilizer = stabilizer();
        assert!(stabilizer.on_sample(sample(0, 0), Some("A")).is_none());
        for i in 1..50 {
            let lat = 37.5 + 0.0001 * f64::from(i % 3);
            let jitter = PositionSample::new(lat, 127.0, i64::from(i) * 1_000);
            assert!(stabilizer.on_sample(jitter, Some("A")).is_none());
        }
        assert_eq!(stabilizer.candidate_area(), Some("A"));
    }

    #[test]
    fn displacement_gate_admits_exact_threshold() {
        let start = PositionSample::new(37.5, 127.0, 0);
        let next = PositionSample::new(37.5 + (40.0 / EARTH_RADIUS_M).to_degrees(), 127.0, 1_000);
        let moved = haversine_m(start.lat, start.lng, next.lat, next.lng);
        assert!((moved - 40.0).abs() < 1e-6);

        let mut stabilizer = GeofenceStabilizer::new(StabilizerConfig {
            min_displacement_m: moved,
            ..StabilizerConfig::default()
        });
        assert!(stabilizer.on_sample(start, Some("A")).is_none());
        assert!(stabilizer.on_sample(next, Some("A")).is_some());
    }

    #[test]
    fn displacement_just_under_threshold_is_ignored() {
        let start = PositionSample::new(37.5, 127.0, 0);
        let near = PositionSample::new(37.5 + (39.9 / EARTH_RADIUS_M).to_degrees(), 127.0, 1_000);
        let mut stabilizer = stabilizer();
        assert!(stabilizer.on_sample(start, Some("A")).is_none());
        assert!(stabilizer.on_sample(near, Some("A")).is_none());
        assert_eq!(stabilizer.candidate_area(), Some("A"));
    }

    #[test]
    fn cooldown_logging_survives_extreme_timestamps() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut stabilizer = stabilizer();
            stabilizer.on_sample(sample(0, i64::MAX - 1), Some("A"));
            assert!(stabilizer.on_sample(sample(1, i64::MAX), Some("A")).is_some());
            assert!(stabilizer.on_sample(sample(2, i64::MIN), Some("A")).is_none());
        });
    }

    #[test]
    fn boundary_flip_does_not_leak() {
        let mut stabilizer = stabilizer();
        let areas = ["A", "B", "A", "B", "A"];
        for (i, area) in areas.iter().enumerate() {
            let event = stabilizer.on_sample(sample(i as u32, i as i64 * 1_000), Some(area));
            assert!(event.is_none(), "flip {i} leaked an event");
        }
    }

    #[test]
    fn cooldown_blocks_repeat_entries_per_area() {
        let mut stabilizer = stabilizer();
        let mut step = 0;
        let mut feed = |stabilizer: &mut GeofenceStabilizer, area: &str, at_ms: i64| {
            step += 1;
            stabilizer.on_sample(sample(step, at_ms), Some(area))
        };

        feed(&mut stabilizer, "A", 0);
        assert!(feed(&mut stabilizer, "A", MINUTE_MS).is_some());

        feed(&mut stabilizer, "B", 2 * MINUTE_MS);
        assert!(feed(&mut stabilizer, "B", 3 * MINUTE_MS).is_some());

        feed(&mut stabilizer, "A", 4 * MINUTE_MS);
        assert!(feed(&mut stabilizer, "A", 5 * MINUTE_MS).is_none());
        assert!(feed(&mut stabilizer, "A", 31 * MINUTE_MS).is_none());
        assert!(feed(&mut stabilizer, "A", 31 * MINUTE_MS + 1).is_some());

        assert_eq!(stabilizer.last_enter_for("B"), Some(3 * MINUTE_MS));
    }

    #[test]
    fn missing_area_and_inactive_leave_state_untouched() {
        let mut stabilizer = stabilizer();
        stabilizer.on_sample(sample(0, 0), Some("A"));
        assert!(stabilizer.on_sample(sample(1, 1_000), None).is_none());

        stabilizer.deactivate();
        assert!(stabilizer.on_sample(sample(2, 2_000), Some("A")).is_none());
        stabilizer.activate();

        let event = stabilizer.on_sample(sample(3, 3_000), Some("A"));
        assert!(event.is_some());
    }

    #[test]
    fn reset_clears_cooldowns() {
        let mut stabilizer = stabilizer();
        stabilizer.on_sample(sample(0, 0), Some("A"));
        assert!(stabilizer.on_sample(sample(1, 1), Some("A")).is_some());
        stabilizer.reset();
        assert_eq!(stabilizer.last_enter_for("A"), None);
        stabilizer.on_sample(sample(2, 2), Some("A"));
        assert!(stabilizer.on_sample(sample(3, 3), Some("A")).is_some());
    }
}
