//! Crossing confirmation: noisy distance samples in, at most one debounced
//! Enter/Exit decision out.
//!
//! A single fix is not trustworthy given GPS accuracy variance. Entry needs
//! two consecutive inside samples plus a sustained dwell; exit needs two
//! consecutive outside samples and prior evidence the user was ever inside.
//! Samples above the accuracy ceiling defer judgement without touching any
//! counter.

use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::place::{Place, PlaceStatus, TriggerKind};

/// A confirmed boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Enter,
    Exit,
}

/// What one sample did to the confirmation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleVerdict {
    /// Accuracy above the ceiling; counters untouched.
    Deferred,
    /// Counted, no decision yet.
    Pending,
    /// Decision reached; `triggered` is now set on the status.
    Confirmed(Crossing),
    /// Place already fired; caller should drop back to IDLE.
    AlreadyTriggered,
}

#[derive(Debug, Clone)]
pub struct CrossingConfirmer {
    /// Consecutive agreeing samples needed for either decision.
    pub confirm_count: u32,
    /// Minimum continuous inside time before an Enter confirms.
    pub entry_dwell: Duration,
    /// Accuracy ceiling for Enter judgement (a bit more lenient).
    pub enter_accuracy_max: f32,
    /// Accuracy ceiling for Exit judgement.
    pub exit_accuracy_max: f32,
}

impl Default for CrossingConfirmer {
    fn default() -> Self {
        Self {
            confirm_count: 2,
            entry_dwell: Duration::from_secs(15),
            enter_accuracy_max: 120.0,
            exit_accuracy_max: 80.0,
        }
    }
}

impl CrossingConfirmer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one high-accuracy sample for the hot target.
    ///
    /// `distance` is meters from the fix to the place center. Updates the
    /// status record in place; on confirmation the status is marked
    /// triggered and both streaks are reset.
    pub fn evaluate(
        &self,
        place: &Place,
        status: &mut PlaceStatus,
        distance: f32,
        accuracy: f32,
        now: Instant,
    ) -> SampleVerdict {
        if status.triggered {
            return SampleVerdict::AlreadyTriggered;
        }

        let ceiling = match place.trigger_kind {
            TriggerKind::Enter => self.enter_accuracy_max,
            TriggerKind::Exit => self.exit_accuracy_max,
        };
        if accuracy > ceiling {
            debug!(
                "[confirm] {} accuracy {:.0}m above {:.0}m ceiling, deferring",
                place.name, accuracy, ceiling
            );
            return SampleVerdict::Deferred;
        }

        let inside = distance <= place.radius_meters;
        if inside {
            status.ever_inside = true;
        }

        let verdict = match place.trigger_kind {
            TriggerKind::Enter => {
                if inside {
                    let since = *status.inside_since.get_or_insert(now);
                    status.consecutive_inside += 1;
                    status.consecutive_outside = 0;
                    let dwell = now.saturating_duration_since(since);
                    debug!(
                        "[confirm] {} enter streak {}/{}, dwell {:.0}s",
                        place.name,
                        status.consecutive_inside,
                        self.confirm_count,
                        dwell.as_secs_f64()
                    );
                    if status.consecutive_inside >= self.confirm_count && dwell >= self.entry_dwell
                    {
                        SampleVerdict::Confirmed(Crossing::Enter)
                    } else {
                        SampleVerdict::Pending
                    }
                } else {
                    status.consecutive_outside += 1;
                    status.consecutive_inside = 0;
                    status.inside_since = None;
                    SampleVerdict::Pending
                }
            }
            TriggerKind::Exit => {
                if !status.ever_inside {
                    // No inside history: every outside sample is noise.
                    debug!("[confirm] {} exit check skipped, never inside", place.name);
                    status.consecutive_outside = 0;
                    status.inside_now = Some(inside);
                    return SampleVerdict::Pending;
                }
                if inside {
                    status.consecutive_inside += 1;
                    status.consecutive_outside = 0;
                    SampleVerdict::Pending
                } else {
                    status.consecutive_outside += 1;
                    status.consecutive_inside = 0;
                    debug!(
                        "[confirm] {} exit streak {}/{}",
                        place.name, status.consecutive_outside, self.confirm_count
                    );
                    if status.consecutive_outside >= self.confirm_count {
                        SampleVerdict::Confirmed(Crossing::Exit)
                    } else {
                        SampleVerdict::Pending
                    }
                }
            }
        };

        status.inside_now = Some(inside);

        if let SampleVerdict::Confirmed(_) = verdict {
            status.triggered = true;
            status.reset_streaks();
        }
        verdict
    }
}
