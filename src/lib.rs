//! Battery-tiered geofence alarm engine.
//!
//! Detects that the user entered or left one of several configured places
//! and delivers a confirmed alarm exactly once per qualifying crossing,
//! while keeping background power draw near zero. Monitoring walks between
//! three tiers: IDLE (motion transitions, coarse geofences, passive fixes),
//! ARMED (fine geofence plus periodic low-power fixes) and HOT (a short
//! high-accuracy burst feeding the confirmation engine). A small JSON place
//! store lets a killed process resume coverage on relaunch.
//!
//! The host supplies the platform signals by implementing
//! [`LocationFeeds`] and posting the resulting events into the engine
//! channel; confirmed crossings come back on an alarm channel.

pub mod confirm;
pub mod error;
pub mod events;
pub mod feeds;
pub mod geo;
pub mod monitor;
pub mod motion;
pub mod place;
pub mod sim;
pub mod store;

pub use confirm::{Crossing, CrossingConfirmer, SampleVerdict};
pub use error::MonitorError;
pub use events::{
    AlarmEvent, EngineEvent, FeedTier, FixPurpose, LocationFix, ModeKind, MonitorStatus, TimerKind,
};
pub use feeds::{FeedError, LocationFeeds};
pub use monitor::{Mode, MonitorConfig, MonitorHandle, SmartMonitor};
pub use motion::{GuardTracker, MotionDetector, MotionSignal};
pub use place::{Place, PlaceRegistry, PlaceStatus, TriggerKind};
pub use sim::{Route, SimulatedFeeds, Waypoint};
pub use store::{PlaceStore, StoreError};
