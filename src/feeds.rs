use std::time::Duration;

use thiserror::Error;

use crate::events::FixPurpose;
use crate::place::Place;

/// Errors the platform feed layer can surface on a subscription attempt.
///
/// None of these are fatal to the engine: a failed subscription is logged
/// and the monitor stays in its current tier. There is no in-place retry;
/// the next natural transition attempts the subscription again.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("feed subscription failed: {0}")]
    SubscriptionFailed(String),
}

/// The power-tiered platform boundary.
///
/// Every method is a fire-and-forget request: nothing here blocks, and
/// results (fixes, geofence crossings, motion transitions, sensor samples,
/// one-shot fix answers) arrive asynchronously as [`EngineEvent`]s posted by
/// the host adapter into the engine channel.
///
/// [`EngineEvent`]: crate::events::EngineEvent
pub trait LocationFeeds: Send {
    fn subscribe_motion_transitions(&mut self) -> Result<(), FeedError>;
    fn unsubscribe_motion_transitions(&mut self);

    fn register_coarse_geofences(&mut self, places: &[Place]) -> Result<(), FeedError>;
    fn register_fine_geofence(&mut self, place: &Place) -> Result<(), FeedError>;
    fn remove_fine_geofence(&mut self, place_id: &str);
    fn remove_all_fine(&mut self);
    fn remove_all_coarse(&mut self);

    fn start_passive_feed(&mut self) -> Result<(), FeedError>;
    fn stop_passive_feed(&mut self);

    fn start_low_power_feed(&mut self, interval: Duration) -> Result<(), FeedError>;
    fn stop_low_power_feed(&mut self);

    fn start_high_accuracy_burst(
        &mut self,
        interval: Duration,
        max_duration: Duration,
    ) -> Result<(), FeedError>;
    fn stop_burst(&mut self);

    /// Request a fresh fix; the answer comes back as `FixResult { purpose }`.
    fn request_current_fix(&mut self, purpose: FixPurpose);
    /// Request the platform's cached fix, if any; same answer path.
    fn request_last_known_fix(&mut self, purpose: FixPurpose);

    /// OS-level liveness guard held only while in HOT.
    fn start_foreground_guard(&mut self);
    fn stop_foreground_guard(&mut self);

    fn subscribe_accelerometer(&mut self) -> Result<(), FeedError>;
    fn unsubscribe_accelerometer(&mut self);
}
