//! Motion assists: accelerometer shake/still detection and the IDLE
//! inside-guard movement check.
//!
//! These cover the gap where the platform's motion-transition signal lags a
//! user who was resting inside an exit place and just started moving.

use std::time::Duration;

use tokio::time::Instant;

use crate::events::LocationFix;
use crate::geo;

const GRAVITY_ALPHA: f32 = 0.8;
const SHAKE_TRIGGER: f32 = 2.2;
const STILL_THRESHOLD: f32 = 0.6;
const SHAKE_COOLDOWN: Duration = Duration::from_millis(1500);

const GUARD_MOVE_METERS: f64 = 12.0;
const GUARD_MOVE_SPEED_MPS: f64 = 1.0;

/// What one accelerometer sample amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionSignal {
    /// Jerk above the shake threshold, outside the cooldown window.
    Shake,
    /// Jerk below the still threshold; carries how long since the last
    /// motion was seen.
    Still { quiet_for: Duration },
    Neutral,
}

/// Gravity-subtracted jerk detector with a shake cooldown.
#[derive(Debug, Default)]
pub struct MotionDetector {
    gravity: [f32; 3],
    warmed: bool,
    last_motion: Option<Instant>,
    last_shake: Option<Instant>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the motion clock, so a silent sensor cannot read as stillness.
    pub fn note_motion(&mut self, now: Instant) {
        self.last_motion = Some(now);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn process(&mut self, x: f32, y: f32, z: f32, now: Instant) -> MotionSignal {
        if !self.warmed {
            // First sample seeds the gravity estimate; no jerk to judge yet.
            self.gravity = [x, y, z];
            self.warmed = true;
            return MotionSignal::Neutral;
        }

        self.gravity[0] = GRAVITY_ALPHA * self.gravity[0] + (1.0 - GRAVITY_ALPHA) * x;
        self.gravity[1] = GRAVITY_ALPHA * self.gravity[1] + (1.0 - GRAVITY_ALPHA) * y;
        self.gravity[2] = GRAVITY_ALPHA * self.gravity[2] + (1.0 - GRAVITY_ALPHA) * z;

        let jx = x - self.gravity[0];
        let jy = y - self.gravity[1];
        let jz = z - self.gravity[2];
        let magnitude = (jx * jx + jy * jy + jz * jz).sqrt();

        if magnitude >= SHAKE_TRIGGER {
            self.last_motion = Some(now);
            let cooled = self
                .last_shake
                .map_or(true, |t| now.saturating_duration_since(t) >= SHAKE_COOLDOWN);
            if cooled {
                self.last_shake = Some(now);
                return MotionSignal::Shake;
            }
            return MotionSignal::Neutral;
        }

        if magnitude <= STILL_THRESHOLD {
            let since = match self.last_motion {
                Some(t) => t,
                None => {
                    self.last_motion = Some(now);
                    return MotionSignal::Neutral;
                }
            };
            return MotionSignal::Still {
                quiet_for: now.saturating_duration_since(since),
            };
        }

        MotionSignal::Neutral
    }
}

/// Displacement/speed check between consecutive inside-guard polls.
#[derive(Debug, Default)]
pub struct GuardTracker {
    last: Option<(LocationFix, Instant)>,
}

impl GuardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Record a guard poll and report whether it amounts to movement
    /// (>= 12 m displacement or >= 1.0 m/s between polls).
    pub fn movement(&mut self, fix: &LocationFix, now: Instant) -> bool {
        let previous = self.last.replace((*fix, now));
        let (prev_fix, prev_at) = match previous {
            Some(p) => p,
            None => return false,
        };

        let moved = geo::distance_meters(
            prev_fix.latitude,
            prev_fix.longitude,
            fix.latitude,
            fix.longitude,
        );
        let dt = now.saturating_duration_since(prev_at).as_secs_f64().max(1.0);
        let speed = moved / dt;

        moved >= GUARD_MOVE_METERS || speed >= GUARD_MOVE_SPEED_MPS
    }
}
