use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// What kind of boundary crossing fires the alarm for a place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Enter,
    Exit,
}

/// A user-defined alarm place. This is the persisted record shape; the
/// coarse/fine radii are derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f32,
    pub trigger_kind: TriggerKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Place {
    /// Wide approach boundary used in IDLE (500 m - 2 km).
    pub fn coarse_radius(&self) -> f32 {
        (self.radius_meters * 7.0).clamp(500.0, 2000.0)
    }

    /// Tight boundary used in ARMED (150 - 500 m).
    pub fn fine_radius(&self) -> f32 {
        (self.radius_meters * 1.5).clamp(150.0, 500.0)
    }
}

/// Runtime crossing state for one place. Rebuilt from scratch on every
/// place-list replacement; only the `triggered` flag survives a process
/// restart (via the store).
#[derive(Debug, Clone, Default)]
pub struct PlaceStatus {
    /// Unknown until the first usable sample.
    pub inside_now: Option<bool>,
    /// Gates exit confirmation: an exit can never fire for a place the
    /// engine never observed the user inside.
    pub ever_inside: bool,
    /// Start of the current uninterrupted inside streak.
    pub inside_since: Option<Instant>,
    pub consecutive_inside: u32,
    pub consecutive_outside: u32,
    /// One-shot dedup flag. Set on confirmation, cleared by the host or by
    /// a full place-list replacement.
    pub triggered: bool,
}

impl PlaceStatus {
    pub fn reset_streaks(&mut self) {
        self.consecutive_inside = 0;
        self.consecutive_outside = 0;
        self.inside_since = None;
    }
}

/// The monitored place set plus per-place runtime status.
///
/// Full-replace semantics: `replace` swaps the whole set and discards every
/// status record, so a place that disappears and later re-appears starts
/// fresh (`ever_inside = false`, untriggered).
#[derive(Debug, Default)]
pub struct PlaceRegistry {
    places: BTreeMap<String, Place>,
    status: BTreeMap<String, PlaceStatus>,
}

impl PlaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, places: Vec<Place>) {
        self.places.clear();
        self.status.clear();
        for place in places {
            self.status.insert(place.id.clone(), PlaceStatus::default());
            self.places.insert(place.id.clone(), place);
        }
    }

    pub fn clear(&mut self) {
        self.places.clear();
        self.status.clear();
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Place> {
        self.places.get(id)
    }

    pub fn status(&self, id: &str) -> Option<&PlaceStatus> {
        self.status.get(id)
    }

    pub fn status_mut(&mut self, id: &str) -> Option<&mut PlaceStatus> {
        self.status.get_mut(id)
    }

    pub fn places(&self) -> impl Iterator<Item = &Place> {
        self.places.values()
    }

    /// Enabled places of the given kind, in id order.
    pub fn enabled_of_kind(&self, kind: TriggerKind) -> Vec<Place> {
        self.places
            .values()
            .filter(|p| p.enabled && p.trigger_kind == kind)
            .cloned()
            .collect()
    }

    /// Record an inside/outside observation outside the confirmation engine
    /// (passive fixes, guard polls, one-shot checks).
    pub fn observe_inside(&mut self, id: &str, inside: bool) {
        if let Some(status) = self.status.get_mut(id) {
            status.inside_now = Some(inside);
            if inside {
                status.ever_inside = true;
            }
        }
    }

    pub fn set_triggered(&mut self, id: &str) {
        if let Some(status) = self.status.get_mut(id) {
            status.triggered = true;
        }
    }

    pub fn clear_triggered(&mut self, id: &str) {
        if let Some(status) = self.status.get_mut(id) {
            status.triggered = false;
        }
    }

    pub fn clear_all_triggered(&mut self) {
        for status in self.status.values_mut() {
            status.triggered = false;
        }
    }

    /// Drop every in-flight confirmation streak. Inside/triggered knowledge
    /// is kept; only the counters and dwell clocks are wiped.
    pub fn reset_all_streaks(&mut self) {
        for status in self.status.values_mut() {
            status.reset_streaks();
        }
    }

    pub fn triggered_ids(&self) -> BTreeSet<String> {
        self.status
            .iter()
            .filter(|(_, s)| s.triggered)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Per-place inside flags keyed by display name, for status reporting.
    pub fn inside_by_name(&self) -> BTreeMap<String, bool> {
        self.status
            .iter()
            .filter_map(|(id, s)| {
                let name = self.places.get(id)?.name.clone();
                s.inside_now.map(|inside| (name, inside))
            })
            .collect()
    }
}
