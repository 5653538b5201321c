//! Tagged events flowing into the single engine channel.
//!
//! Every external signal source (geofence callbacks, location fixes,
//! sensor samples, timers, host commands) is adapted to post one of these
//! variants instead of invoking ad hoc callbacks. The monitor consumes them
//! on one serialized loop, so no internal state ever needs a lock.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::place::{Place, TriggerKind};

/// A location fix as delivered by any of the three feed tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f32,
}

/// Which power tier produced a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedTier {
    Passive,
    LowPower,
    HighAccuracy,
}

/// Why a one-shot fix was requested; the answer is routed back by purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixPurpose {
    /// Motion started: refresh inside status for exit places.
    MotionCheck,
    /// First fix after (re)registration, to seed `inside_now`.
    InitialStatus,
    /// Coarse ENTER arrived while `inside_now` was unknown.
    CoarseEnterCheck { place_id: String },
    /// Several inside exit places shook at once; pick the nearest.
    ShakeArbitration,
}

/// Which timeout fired. Timer events carry the transition generation they
/// were armed under; a mismatch means the tier was already exited and the
/// event is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ArmedTimeout,
    HotTimeout,
    Settle,
}

/// Everything the monitor loop can receive.
#[derive(Debug)]
pub enum EngineEvent {
    MotionTransition {
        is_moving: bool,
    },
    GeofenceCrossed {
        place_id: String,
        entered: bool,
        coarse: bool,
    },
    Fix {
        tier: FeedTier,
        fix: LocationFix,
    },
    FixResult {
        purpose: FixPurpose,
        fix: Option<LocationFix>,
    },
    AccelSample {
        x: f32,
        y: f32,
        z: f32,
    },
    TimerFired {
        kind: TimerKind,
        generation: u64,
    },
    StartMonitoring {
        places: Vec<Place>,
        ack: oneshot::Sender<()>,
    },
    StopMonitoring {
        ack: oneshot::Sender<()>,
    },
    UpdatePlaces {
        places: Vec<Place>,
        ack: oneshot::Sender<()>,
    },
    ClearTriggered {
        place_id: String,
    },
    MarkTriggered {
        place_id: String,
    },
    ClearAllTriggered,
    QueryStatus {
        reply: oneshot::Sender<MonitorStatus>,
    },
}

/// A confirmed crossing, pushed to the host's alarm channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub place_id: String,
    pub place_name: String,
    pub trigger_kind: TriggerKind,
    pub latitude: f64,
    pub longitude: f64,
}

/// Current tier, without the target payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModeKind {
    Idle,
    Armed,
    Hot,
}

/// Snapshot answered to `QueryStatus`.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub mode: ModeKind,
    pub target_place: Option<String>,
    pub place_count: usize,
    pub inside: BTreeMap<String, bool>,
    pub triggered: Vec<String>,
}
