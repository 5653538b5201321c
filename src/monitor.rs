//! The three-tier mode controller.
//!
//! IDLE (nearly all the time): motion transitions + coarse geofences +
//! passive fixes, essentially free. ARMED (approach detected): fine geofence
//! + periodic low-power fixes. HOT (crossing imminent): a short
//! high-accuracy burst feeding the confirmation engine, never longer than
//! the burst timeout.
//!
//! All state lives in one `SmartMonitor` consuming one event channel, so
//! transition guards can read-then-write counters without locks. Timers are
//! spawned tasks that post back into the same channel stamped with the
//! transition generation they were armed under; a stale timer is detected
//! and dropped, never acted on.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::confirm::{Crossing, CrossingConfirmer, SampleVerdict};
use crate::error::MonitorError;
use crate::events::{
    AlarmEvent, EngineEvent, FeedTier, FixPurpose, LocationFix, ModeKind, MonitorStatus, TimerKind,
};
use crate::feeds::{FeedError, LocationFeeds};
use crate::geo;
use crate::motion::{GuardTracker, MotionDetector, MotionSignal};
use crate::place::{Place, PlaceRegistry, TriggerKind};
use crate::store::PlaceStore;

/// Tunable timeouts and thresholds. Defaults match the production values;
/// tests keep them and drive the paused clock instead.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// ARMED gives up and returns to IDLE after this long without promotion.
    pub armed_timeout: Duration,
    /// Hard ceiling on a HOT burst; also its feed max duration.
    pub hot_timeout: Duration,
    /// Grace period after a confirmation before dropping back to IDLE.
    pub settle_delay: Duration,
    /// High-accuracy fix interval during HOT.
    pub burst_interval: Duration,
    /// Low-power fix interval while ARMED for an enter place.
    pub armed_enter_interval: Duration,
    /// Low-power fix interval while ARMED for an exit place.
    pub armed_exit_interval: Duration,
    /// Inside-guard poll interval while resting inside an exit place.
    pub guard_interval: Duration,
    /// Sustained low jerk for this long demotes HOT back to IDLE.
    pub still_to_idle: Duration,
    /// ARMED fast entry: accuracy ceiling for promoting on a single fix.
    pub armed_fast_accuracy_max: f32,
    /// ARMED fast entry: distance margin beyond the alarm radius.
    pub armed_fast_margin: f32,
    /// Engine channel depth.
    pub event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            armed_timeout: Duration::from_secs(10 * 60),
            hot_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(3),
            burst_interval: Duration::from_secs(5),
            armed_enter_interval: Duration::from_secs(10),
            armed_exit_interval: Duration::from_secs(30),
            guard_interval: Duration::from_secs(20),
            still_to_idle: Duration::from_secs(8),
            armed_fast_accuracy_max: 40.0,
            armed_fast_margin: 10.0,
            event_capacity: 256,
        }
    }
}

/// Current monitoring tier. Exactly one target place is meaningful outside
/// IDLE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Armed { place_id: String },
    Hot { place_id: String },
}

impl Mode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::Idle => ModeKind::Idle,
            Mode::Armed { .. } => ModeKind::Armed,
            Mode::Hot { .. } => ModeKind::Hot,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Mode::Idle => None,
            Mode::Armed { place_id } | Mode::Hot { place_id } => Some(place_id),
        }
    }
}

/// Host-side handle. Cheap to clone; every call posts into the engine
/// channel, so effects are observed in submission order.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl MonitorHandle {
    /// Sender for host feed adapters to post fixes, geofence crossings,
    /// sensor samples and motion transitions with.
    pub fn event_sender(&self) -> mpsc::Sender<EngineEvent> {
        self.tx.clone()
    }

    pub async fn start_monitoring(&self, places: Vec<Place>) -> Result<(), MonitorError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(EngineEvent::StartMonitoring { places, ack })
            .await
            .map_err(|_| MonitorError::Stopped)?;
        done.await.map_err(|_| MonitorError::Stopped)
    }

    /// Tear everything down. Returns only after every feed is unsubscribed,
    /// every timer cancelled, and the persisted place state cleared.
    pub async fn stop_monitoring(&self) -> Result<(), MonitorError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(EngineEvent::StopMonitoring { ack })
            .await
            .map_err(|_| MonitorError::Stopped)?;
        done.await.map_err(|_| MonitorError::Stopped)
    }

    /// Full-replace the place set.
    pub async fn update_places(&self, places: Vec<Place>) -> Result<(), MonitorError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(EngineEvent::UpdatePlaces { places, ack })
            .await
            .map_err(|_| MonitorError::Stopped)?;
        done.await.map_err(|_| MonitorError::Stopped)
    }

    pub async fn clear_triggered(&self, place_id: &str) -> Result<(), MonitorError> {
        self.tx
            .send(EngineEvent::ClearTriggered {
                place_id: place_id.to_string(),
            })
            .await
            .map_err(|_| MonitorError::Stopped)
    }

    pub async fn mark_triggered(&self, place_id: &str) -> Result<(), MonitorError> {
        self.tx
            .send(EngineEvent::MarkTriggered {
                place_id: place_id.to_string(),
            })
            .await
            .map_err(|_| MonitorError::Stopped)
    }

    pub async fn clear_all_triggered(&self) -> Result<(), MonitorError> {
        self.tx
            .send(EngineEvent::ClearAllTriggered)
            .await
            .map_err(|_| MonitorError::Stopped)
    }

    pub async fn status(&self) -> Result<MonitorStatus, MonitorError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(EngineEvent::QueryStatus { reply })
            .await
            .map_err(|_| MonitorError::Stopped)?;
        answer.await.map_err(|_| MonitorError::Stopped)
    }
}

/// The mode controller. Owns every piece of mutable monitoring state and
/// the only loop that touches it.
pub struct SmartMonitor {
    config: MonitorConfig,
    feeds: Box<dyn LocationFeeds>,
    store: PlaceStore,
    alarms: mpsc::Sender<AlarmEvent>,
    events: mpsc::Receiver<EngineEvent>,
    /// Weak so pending timers never keep a dead engine's channel open.
    self_tx: mpsc::WeakSender<EngineEvent>,

    registry: PlaceRegistry,
    mode: Mode,
    monitoring: bool,
    /// Bumped on every tier transition; timer events carry the value they
    /// were armed under.
    generation: u64,
    armed_timer: Option<JoinHandle<()>>,
    hot_timer: Option<JoinHandle<()>>,
    settle_timer: Option<JoinHandle<()>>,
    /// Confirmation-in-progress latch: blocks re-entrant transitions and
    /// further samples until the settle delay elapses.
    confirming: bool,

    confirmer: CrossingConfirmer,
    motion: MotionDetector,
    guard: GuardTracker,
    guard_active: bool,
}

impl SmartMonitor {
    /// Construct the engine, restore any persisted place set, and run it on
    /// a spawned task. The returned handle is the only way in.
    ///
    /// `feeds` is a factory so the platform adapter can capture the engine's
    /// own event sender and post fixes/crossings back into it.
    pub fn spawn(
        config: MonitorConfig,
        feeds: impl FnOnce(mpsc::Sender<EngineEvent>) -> Box<dyn LocationFeeds>,
        store: PlaceStore,
        alarms: mpsc::Sender<AlarmEvent>,
    ) -> MonitorHandle {
        let (tx, events) = mpsc::channel(config.event_capacity);
        let feeds = feeds(tx.clone());
        let monitor = SmartMonitor {
            self_tx: tx.downgrade(),
            events,
            config,
            feeds,
            store,
            alarms,
            registry: PlaceRegistry::new(),
            mode: Mode::Idle,
            monitoring: false,
            generation: 0,
            armed_timer: None,
            hot_timer: None,
            settle_timer: None,
            confirming: false,
            confirmer: CrossingConfirmer::new(),
            motion: MotionDetector::new(),
            guard: GuardTracker::new(),
            guard_active: false,
        };
        tokio::spawn(monitor.run());
        MonitorHandle { tx }
    }

    async fn run(mut self) {
        self.restore();
        while let Some(event) = self.events.recv().await {
            self.handle_event(event);
        }
        debug!("[monitor] event channel closed, loop ending");
    }

    /// Pick up where a killed process left off: reload the place set and the
    /// already-fired dedup set, then resume IDLE coverage. Runs before any
    /// event is consumed.
    fn restore(&mut self) {
        let places = self.store.load_places();
        if places.is_empty() {
            return;
        }
        info!(
            "[monitor] restored {} place(s) from store, resuming monitoring",
            places.len()
        );
        self.registry.replace(places);
        for id in self.store.load_triggered() {
            self.registry.set_triggered(&id);
        }
        self.monitoring = true;
        self.feeds.request_last_known_fix(FixPurpose::InitialStatus);
        self.switch_to_idle();
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::MotionTransition { is_moving } => self.on_motion_transition(is_moving),
            EngineEvent::GeofenceCrossed {
                place_id,
                entered,
                coarse,
            } => self.on_geofence(&place_id, entered, coarse),
            EngineEvent::Fix { tier, fix } => self.on_fix(tier, fix),
            EngineEvent::FixResult { purpose, fix } => self.on_fix_result(purpose, fix),
            EngineEvent::AccelSample { x, y, z } => self.on_accel(x, y, z),
            EngineEvent::TimerFired { kind, generation } => self.on_timer(kind, generation),
            EngineEvent::StartMonitoring { places, ack } => {
                self.on_start(places);
                let _ = ack.send(());
            }
            EngineEvent::StopMonitoring { ack } => {
                self.do_stop();
                let _ = ack.send(());
            }
            EngineEvent::UpdatePlaces { places, ack } => {
                self.on_update(places);
                let _ = ack.send(());
            }
            EngineEvent::ClearTriggered { place_id } => {
                self.registry.clear_triggered(&place_id);
                debug!("[monitor] cleared trigger record for {place_id}");
                self.persist_triggered();
            }
            EngineEvent::MarkTriggered { place_id } => {
                self.registry.set_triggered(&place_id);
                debug!("[monitor] marked {place_id} as triggered");
                self.persist_triggered();
            }
            EngineEvent::ClearAllTriggered => {
                self.registry.clear_all_triggered();
                self.persist_triggered();
            }
            EngineEvent::QueryStatus { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // ---------- host commands ----------

    fn on_start(&mut self, places: Vec<Place>) {
        info!("[monitor] start monitoring: {} place(s)", places.len());
        self.registry.replace(places);
        self.save_places();

        if self.registry.is_empty() {
            info!("[monitor] no active places, monitoring stopped");
            self.do_stop();
            return;
        }

        self.monitoring = true;
        // A supplied place list resets alarm eligibility.
        self.persist_triggered();
        self.feeds.request_last_known_fix(FixPurpose::InitialStatus);
        self.switch_to_idle();
    }

    fn on_update(&mut self, places: Vec<Place>) {
        info!("[monitor] place list replaced: {} place(s)", places.len());
        // Replacing the set wipes inside history and the trigger records, so
        // re-registered alarms become eligible again.
        self.registry.replace(places);
        self.save_places();
        self.persist_triggered();

        if !self.monitoring {
            return;
        }

        let stale_target = self
            .mode
            .target()
            .map(|id| self.registry.get(id).is_none())
            .unwrap_or(false);
        if stale_target {
            debug!("[monitor] armed/hot target no longer exists, back to IDLE");
            self.switch_to_idle();
        } else {
            let places: Vec<Place> = self.registry.places().cloned().collect();
            self.feed_result(
                "coarse geofence registration",
                |f| f.register_coarse_geofences(&places),
            );
        }

        self.feeds.request_last_known_fix(FixPurpose::InitialStatus);
        self.update_idle_guard();
    }

    fn do_stop(&mut self) {
        info!("[monitor] stop monitoring");
        self.cancel_all_timers();
        self.generation += 1;
        self.confirming = false;

        self.feeds.unsubscribe_motion_transitions();
        self.feeds.remove_all_fine();
        self.feeds.remove_all_coarse();
        self.feeds.stop_passive_feed();
        self.feeds.stop_low_power_feed();
        self.feeds.stop_burst();
        self.feeds.unsubscribe_accelerometer();
        self.feeds.stop_foreground_guard();

        self.mode = Mode::Idle;
        self.monitoring = false;
        self.guard_active = false;
        self.guard.reset();
        self.motion.reset();
        self.registry.clear();
        self.store.clear();
    }

    // ---------- external signals ----------

    fn on_motion_transition(&mut self, is_moving: bool) {
        if !self.monitoring {
            return;
        }
        if !is_moving {
            debug!("[monitor] motion stopped, no tier change");
            return;
        }

        // Worth a one-shot fix only if some place could promote: any exit
        // place, or an enter place whose recorded status says inside.
        let wants_check = self.registry.places().any(|p| {
            p.enabled
                && (p.trigger_kind == TriggerKind::Exit
                    || self.registry.status(&p.id).and_then(|s| s.inside_now) == Some(true))
        });
        if !wants_check {
            debug!("[monitor] movement started, passive watch continues");
            return;
        }

        // Refresh inside status with a fresh fix before deciding; the answer
        // comes back as a MotionCheck fix result.
        info!("[monitor] movement started, refreshing place status");
        self.feeds.request_current_fix(FixPurpose::MotionCheck);
    }

    fn on_geofence(&mut self, place_id: &str, entered: bool, coarse: bool) {
        if !self.monitoring {
            return;
        }
        let place = match self.registry.get(place_id) {
            Some(p) => p.clone(),
            None => {
                warn!("[monitor] geofence event for unknown place {place_id}");
                return;
            }
        };
        debug!(
            "[monitor] geofence: {} entered={entered} coarse={coarse}",
            place.name
        );

        let inside_now = self.registry.status(place_id).and_then(|s| s.inside_now);
        let ever_inside = self
            .registry
            .status(place_id)
            .map(|s| s.ever_inside)
            .unwrap_or(false);

        match (coarse, entered, place.trigger_kind) {
            (true, true, TriggerKind::Enter) => match inside_now {
                Some(true) => debug!("[monitor] coarse enter ignored, already inside"),
                // Unknown inside state: resolve with a cached fix first so we
                // do not arm for a place the user is already sitting in.
                None => self
                    .feeds
                    .request_last_known_fix(FixPurpose::CoarseEnterCheck {
                        place_id: place.id.clone(),
                    }),
                Some(false) => self.switch_to_armed(&place),
            },
            (true, false, TriggerKind::Exit) => {
                if !ever_inside {
                    debug!("[monitor] coarse exit ignored, no inside history");
                } else if matches!(self.mode, Mode::Idle | Mode::Armed { .. }) {
                    info!("[monitor] coarse exit for {}, confirming now", place.name);
                    self.promote_to_hot(&place.id);
                }
            }
            (false, true, TriggerKind::Enter) => {
                if inside_now == Some(true) {
                    debug!("[monitor] fine enter ignored, already inside");
                } else {
                    self.promote_to_hot(&place.id);
                }
            }
            (false, false, TriggerKind::Exit) => self.promote_to_hot(&place.id),
            _ => debug!("[monitor] geofence event has no matching rule, ignored"),
        }
    }

    fn on_fix(&mut self, tier: FeedTier, fix: LocationFix) {
        if !self.monitoring {
            return;
        }
        match (&self.mode, tier) {
            (Mode::Idle, FeedTier::Passive) => self.on_passive_fix(fix),
            (Mode::Idle, FeedTier::LowPower) if self.guard_active => self.on_guard_fix(fix),
            (Mode::Armed { place_id }, FeedTier::LowPower) => {
                let target = place_id.clone();
                self.on_armed_fix(&target, fix);
            }
            (Mode::Hot { place_id }, FeedTier::HighAccuracy) => {
                let target = place_id.clone();
                self.on_hot_fix(&target, fix);
            }
            _ => debug!(
                "[monitor] {tier:?} fix ignored in {:?}",
                self.mode.kind()
            ),
        }
    }

    fn on_fix_result(&mut self, purpose: FixPurpose, fix: Option<LocationFix>) {
        if !self.monitoring {
            return;
        }
        match purpose {
            FixPurpose::MotionCheck => self.on_motion_check_result(fix),
            FixPurpose::InitialStatus => self.on_initial_status_result(fix),
            FixPurpose::CoarseEnterCheck { place_id } => {
                self.on_coarse_enter_check_result(&place_id, fix)
            }
            FixPurpose::ShakeArbitration => self.on_shake_arbitration_result(fix),
        }
    }

    fn on_accel(&mut self, x: f32, y: f32, z: f32) {
        if !self.monitoring {
            return;
        }
        match self.motion.process(x, y, z, Instant::now()) {
            MotionSignal::Shake => self.on_shake(),
            MotionSignal::Still { quiet_for } => {
                if matches!(self.mode, Mode::Hot { .. })
                    && !self.confirming
                    && quiet_for >= self.config.still_to_idle
                {
                    info!(
                        "[monitor] still for {:.0}s in HOT, returning to IDLE",
                        quiet_for.as_secs_f64()
                    );
                    self.switch_to_idle();
                }
            }
            MotionSignal::Neutral => {}
        }
    }

    fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        if generation != self.generation {
            debug!(
                "[monitor] stale {kind:?} timer (gen {generation} != {}), dropped",
                self.generation
            );
            return;
        }
        match kind {
            TimerKind::ArmedTimeout => {
                if matches!(self.mode, Mode::Armed { .. }) {
                    info!("[monitor] ARMED timeout, back to IDLE");
                    self.switch_to_idle();
                }
            }
            TimerKind::HotTimeout => {
                if matches!(self.mode, Mode::Hot { .. }) && !self.confirming {
                    info!("[monitor] HOT timeout with no decision, back to IDLE");
                    self.switch_to_idle();
                }
            }
            TimerKind::Settle => {
                self.confirming = false;
                self.switch_to_idle();
            }
        }
    }

    // ---------- fix handlers per tier ----------

    fn on_passive_fix(&mut self, fix: LocationFix) {
        let places: Vec<Place> = self.registry.places().cloned().collect();
        let mut arm_target = None;

        for place in &places {
            if !place.enabled {
                continue;
            }
            let distance = distance_to(&fix, place);
            let inside = distance <= place.radius_meters as f64;
            if distance >= place.coarse_radius() as f64 {
                continue;
            }
            debug!(
                "[monitor] passive: {} at {:.0}m",
                place.name, distance
            );
            match place.trigger_kind {
                TriggerKind::Enter => {
                    if inside {
                        self.registry.observe_inside(&place.id, true);
                        debug!("[monitor] passive enter ignored, already inside");
                    } else {
                        arm_target = Some(place.clone());
                        break;
                    }
                }
                TriggerKind::Exit => {
                    if inside {
                        self.registry.observe_inside(&place.id, true);
                    }
                }
            }
        }

        if let Some(place) = arm_target {
            self.switch_to_armed(&place);
            return;
        }
        self.update_idle_guard();
    }

    fn on_guard_fix(&mut self, fix: LocationFix) {
        let now = Instant::now();
        let exit_places = self.registry.enabled_of_kind(TriggerKind::Exit);
        if exit_places.is_empty() {
            self.update_idle_guard();
            return;
        }

        // Places that just flipped inside -> outside are exit candidates.
        let mut crossing_candidates: Vec<(String, f64)> = Vec::new();
        for place in &exit_places {
            let distance = distance_to(&fix, place);
            let inside = distance <= place.radius_meters as f64;
            let was_inside =
                self.registry.status(&place.id).and_then(|s| s.inside_now) == Some(true);
            self.registry.observe_inside(&place.id, inside);
            if was_inside && !inside {
                crossing_candidates.push((place.id.clone(), distance));
            }
        }

        if self.guard.movement(&fix, now) {
            let mut nearest: Option<(String, f64)> = None;
            for place in &exit_places {
                let eligible = self
                    .registry
                    .status(&place.id)
                    .map(|s| s.inside_now == Some(true) && !s.triggered)
                    .unwrap_or(false);
                if !eligible {
                    continue;
                }
                let distance = distance_to(&fix, place);
                if nearest.as_ref().map_or(true, |(_, d)| distance < *d) {
                    nearest = Some((place.id.clone(), distance));
                }
            }
            if let Some((id, _)) = nearest {
                info!("[monitor] inside-guard movement detected, confirming exit");
                self.promote_to_hot(&id);
                return;
            }
        }

        if let Some((id, _)) = crossing_candidates
            .into_iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        {
            info!("[monitor] inside-guard predicted exit, confirming");
            self.promote_to_hot(&id);
            return;
        }

        self.update_idle_guard();
    }

    fn on_armed_fix(&mut self, target_id: &str, fix: LocationFix) {
        let place = match self.registry.get(target_id) {
            Some(p) => p.clone(),
            None => return,
        };
        let distance = distance_to(&fix, &place);
        let inside = distance <= place.radius_meters as f64;
        let was_inside = self.registry.status(target_id).and_then(|s| s.inside_now) == Some(true);
        self.registry.observe_inside(target_id, inside);
        debug!(
            "[monitor] low-power: {:.0}m to {} (acc {:.0}m, inside={inside})",
            distance, place.name, fix.accuracy_meters
        );

        // Fast entry: a single tight fix well inside the alarm radius is
        // convincing enough to skip straight to the burst.
        if place.trigger_kind == TriggerKind::Enter
            && inside
            && fix.accuracy_meters <= self.config.armed_fast_accuracy_max
            && distance <= (place.radius_meters + self.config.armed_fast_margin) as f64
        {
            info!("[monitor] tight fix inside {}, confirming entry", place.name);
            self.promote_to_hot(&place.id);
            return;
        }

        if distance < place.fine_radius() as f64 {
            if place.trigger_kind == TriggerKind::Enter && was_inside {
                debug!("[monitor] armed enter ignored, already inside");
                return;
            }
            self.promote_to_hot(&place.id);
        }
    }

    fn on_hot_fix(&mut self, target_id: &str, fix: LocationFix) {
        if self.confirming {
            debug!("[monitor] confirmation in progress, sample ignored");
            return;
        }
        let place = match self.registry.get(target_id) {
            Some(p) => p.clone(),
            None => return,
        };

        let distance = distance_to(&fix, &place) as f32;
        let now = Instant::now();
        let status = match self.registry.status_mut(target_id) {
            Some(s) => s,
            None => return,
        };
        let verdict =
            self.confirmer
                .evaluate(&place, status, distance, fix.accuracy_meters, now);

        match verdict {
            SampleVerdict::Confirmed(crossing) => self.confirm_alarm(&place, crossing),
            SampleVerdict::AlreadyTriggered => {
                debug!("[monitor] {} already fired, leaving HOT", place.name);
                self.switch_to_idle();
            }
            SampleVerdict::Pending | SampleVerdict::Deferred => {}
        }
    }

    // ---------- one-shot fix answers ----------

    fn on_motion_check_result(&mut self, fix: Option<LocationFix>) {
        if !matches!(self.mode, Mode::Idle | Mode::Armed { .. }) {
            return;
        }

        match fix {
            Some(fix) => {
                let places: Vec<Place> =
                    self.registry.places().filter(|p| p.enabled).cloned().collect();
                for place in &places {
                    let was_inside =
                        self.registry.status(&place.id).and_then(|s| s.inside_now) == Some(true);
                    let distance = distance_to(&fix, place);
                    let inside = distance <= place.radius_meters as f64;
                    self.registry.observe_inside(&place.id, inside);
                    debug!(
                        "[monitor] motion check: {} at {:.0}m, inside={inside}",
                        place.name, distance
                    );
                    // An exit place holding the user promotes outright; an
                    // enter place only when the fresh fix agrees with the
                    // recorded inside state.
                    let qualifies = match place.trigger_kind {
                        TriggerKind::Exit => inside,
                        TriggerKind::Enter => inside && was_inside,
                    };
                    if qualifies {
                        info!("[monitor] moving while inside {}, confirming", place.name);
                        self.promote_to_hot(&place.id);
                        return;
                    }
                }
                self.update_idle_guard();
            }
            None => {
                // No fix came back; trust the recorded inside flags for exit
                // places (an unconfirmed enter can wait for the normal path).
                let exit_places = self.registry.enabled_of_kind(TriggerKind::Exit);
                let candidate = exit_places.iter().find(|p| {
                    self.registry.status(&p.id).and_then(|s| s.inside_now) == Some(true)
                });
                if let Some(place) = candidate {
                    info!(
                        "[monitor] moving while inside {} (cached), confirming exit",
                        place.name
                    );
                    let id = place.id.clone();
                    self.promote_to_hot(&id);
                }
            }
        }
    }

    fn on_initial_status_result(&mut self, fix: Option<LocationFix>) {
        match fix {
            Some(fix) => {
                let places: Vec<Place> = self.registry.places().cloned().collect();
                for place in &places {
                    let distance = distance_to(&fix, place);
                    let inside = distance <= place.radius_meters as f64;
                    self.registry.observe_inside(&place.id, inside);
                    debug!(
                        "[monitor] initial status: {} inside={inside} ({:.0}m)",
                        place.name, distance
                    );
                }
            }
            None => warn!("[monitor] no initial fix, inside status undetermined"),
        }
        self.update_idle_guard();
    }

    fn on_coarse_enter_check_result(&mut self, place_id: &str, fix: Option<LocationFix>) {
        let place = match self.registry.get(place_id) {
            Some(p) => p.clone(),
            None => return,
        };
        if let Some(fix) = fix {
            let distance = distance_to(&fix, &place);
            let inside = distance <= place.radius_meters as f64;
            self.registry.observe_inside(place_id, inside);
            if inside {
                debug!("[monitor] coarse enter ignored, inside confirmed");
                return;
            }
        }
        self.switch_to_armed(&place);
    }

    fn on_shake_arbitration_result(&mut self, fix: Option<LocationFix>) {
        if matches!(self.mode, Mode::Hot { .. }) {
            return;
        }
        let candidates = self.inside_untriggered_exit_places();
        if candidates.is_empty() {
            return;
        }
        let chosen = match fix {
            Some(fix) => candidates
                .iter()
                .min_by(|a, b| distance_to(&fix, a).total_cmp(&distance_to(&fix, b)))
                .unwrap()
                .clone(),
            None => candidates[0].clone(),
        };
        info!("[monitor] shake detected, confirming exit of {}", chosen.name);
        self.promote_to_hot(&chosen.id);
    }

    fn on_shake(&mut self) {
        if matches!(self.mode, Mode::Hot { .. }) {
            return;
        }
        let candidates = self.inside_untriggered_exit_places();
        match candidates.len() {
            0 => {}
            1 => {
                info!(
                    "[monitor] shake detected, confirming exit of {}",
                    candidates[0].name
                );
                let id = candidates[0].id.clone();
                self.promote_to_hot(&id);
            }
            // Several inside exit places: let a cached fix pick the nearest.
            _ => self
                .feeds
                .request_last_known_fix(FixPurpose::ShakeArbitration),
        }
    }

    // ---------- transitions ----------

    /// Single entry point for every promotion path (motion fast path, coarse
    /// exit, fine crossing, inside-guard, shake). The shared guards live
    /// here so the paths cannot diverge.
    fn promote_to_hot(&mut self, place_id: &str) {
        if self.confirming {
            debug!("[monitor] confirmation in progress, promotion ignored");
            return;
        }
        let place = match self.registry.get(place_id) {
            Some(p) if p.enabled => p.clone(),
            _ => return,
        };
        if self
            .registry
            .status(place_id)
            .map(|s| s.triggered)
            .unwrap_or(false)
        {
            debug!("[monitor] {} already triggered, promotion ignored", place.name);
            return;
        }
        if matches!(&self.mode, Mode::Hot { place_id: id } if id == place_id) {
            debug!("[monitor] already HOT for {}", place.name);
            return;
        }
        self.switch_to_hot(&place);
    }

    fn switch_to_idle(&mut self) {
        debug!("[monitor] IDLE");
        self.mode = Mode::Idle;
        self.generation += 1;
        self.cancel_tier_timers();

        // ARMED/HOT resources down first, so at most one feed is ever live.
        self.feeds.stop_low_power_feed();
        self.feeds.stop_burst();
        self.feeds.remove_all_fine();
        self.feeds.stop_foreground_guard();
        self.feeds.unsubscribe_accelerometer();
        self.guard_active = false;
        self.guard.reset();
        self.motion.reset();
        self.registry.reset_all_streaks();

        self.feed_result("motion transition subscription", |f| {
            f.subscribe_motion_transitions()
        });
        let places: Vec<Place> = self.registry.places().cloned().collect();
        self.feed_result("coarse geofence registration", |f| {
            f.register_coarse_geofences(&places)
        });
        self.feed_result("passive feed", |f| f.start_passive_feed());
        self.update_idle_guard();
    }

    fn switch_to_armed(&mut self, place: &Place) {
        if matches!(self.mode, Mode::Hot { .. }) {
            debug!("[monitor] in HOT, not dropping to ARMED");
            return;
        }
        if self.confirming {
            debug!("[monitor] confirmation in progress, arming ignored");
            return;
        }
        info!(
            "[monitor] ARMED: {} ({:?})",
            place.name, place.trigger_kind
        );
        self.mode = Mode::Armed {
            place_id: place.id.clone(),
        };
        self.generation += 1;
        self.cancel_tier_timers();
        self.guard_active = false;
        self.guard.reset();
        if let Some(status) = self.registry.status_mut(&place.id) {
            status.ever_inside = false;
            status.reset_streaks();
        }

        // Coarse fences and motion transitions stay up; passive is replaced
        // by the periodic low-power feed.
        self.feeds.stop_passive_feed();
        self.feeds.stop_low_power_feed();
        self.feeds.unsubscribe_accelerometer();
        self.feed_result("fine geofence registration", |f| {
            f.register_fine_geofence(place)
        });
        let interval = match place.trigger_kind {
            TriggerKind::Enter => self.config.armed_enter_interval,
            TriggerKind::Exit => self.config.armed_exit_interval,
        };
        self.feed_result("low-power feed", |f| f.start_low_power_feed(interval));
        self.armed_timer =
            Some(self.spawn_timer(TimerKind::ArmedTimeout, self.config.armed_timeout));
    }

    fn switch_to_hot(&mut self, place: &Place) {
        info!("[monitor] HOT: {} ({:?})", place.name, place.trigger_kind);
        self.mode = Mode::Hot {
            place_id: place.id.clone(),
        };
        self.generation += 1;
        self.cancel_tier_timers();
        self.guard_active = false;
        self.guard.reset();
        if let Some(status) = self.registry.status_mut(&place.id) {
            status.inside_since = None;
        }
        self.motion.note_motion(Instant::now());

        self.feeds.stop_passive_feed();
        self.feeds.stop_low_power_feed();
        self.feeds.start_foreground_guard();
        let interval = self.config.burst_interval;
        let max_duration = self.config.hot_timeout;
        self.feed_result("high-accuracy burst", |f| {
            f.start_high_accuracy_burst(interval, max_duration)
        });
        self.feed_result("accelerometer", |f| f.subscribe_accelerometer());
        self.hot_timer = Some(self.spawn_timer(TimerKind::HotTimeout, self.config.hot_timeout));
    }

    fn confirm_alarm(&mut self, place: &Place, crossing: Crossing) {
        if self.confirming {
            return;
        }
        self.confirming = true;
        let kind = match crossing {
            Crossing::Enter => TriggerKind::Enter,
            Crossing::Exit => TriggerKind::Exit,
        };
        info!("[monitor] alarm confirmed: {} ({kind:?})", place.name);
        self.persist_triggered();

        let event = AlarmEvent {
            place_id: place.id.clone(),
            place_name: place.name.clone(),
            trigger_kind: kind,
            latitude: place.latitude,
            longitude: place.longitude,
        };
        if let Err(e) = self.alarms.try_send(event) {
            warn!("[monitor] alarm delivery failed: {e}");
        }

        self.feeds.stop_burst();
        if let Some(timer) = self.hot_timer.take() {
            timer.abort();
        }
        self.settle_timer = Some(self.spawn_timer(TimerKind::Settle, self.config.settle_delay));
    }

    /// Swap IDLE between passive coverage and the low-power inside-guard,
    /// depending on whether any enabled exit place currently holds the user.
    fn update_idle_guard(&mut self) {
        if !matches!(self.mode, Mode::Idle) || !self.monitoring {
            return;
        }
        let has_inside_exit = self
            .registry
            .places()
            .any(|p| {
                p.enabled
                    && p.trigger_kind == TriggerKind::Exit
                    && self.registry.status(&p.id).and_then(|s| s.inside_now) == Some(true)
            });

        if has_inside_exit && !self.guard_active {
            info!(
                "[monitor] inside-guard on ({}s low-power poll)",
                self.config.guard_interval.as_secs()
            );
            self.feeds.stop_passive_feed();
            let interval = self.config.guard_interval;
            self.feed_result("inside-guard feed", |f| f.start_low_power_feed(interval));
            self.feed_result("accelerometer", |f| f.subscribe_accelerometer());
            self.guard_active = true;
        } else if !has_inside_exit && self.guard_active {
            info!("[monitor] inside-guard off");
            self.feeds.stop_low_power_feed();
            self.feeds.unsubscribe_accelerometer();
            self.guard_active = false;
            self.guard.reset();
            self.feed_result("passive feed", |f| f.start_passive_feed());
        }
    }

    // ---------- plumbing ----------

    fn inside_untriggered_exit_places(&self) -> Vec<Place> {
        self.registry
            .places()
            .filter(|p| {
                p.enabled
                    && p.trigger_kind == TriggerKind::Exit
                    && self
                        .registry
                        .status(&p.id)
                        .map(|s| s.inside_now == Some(true) && !s.triggered)
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn spawn_timer(&self, kind: TimerKind, delay: Duration) -> JoinHandle<()> {
        let tx = self.self_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(EngineEvent::TimerFired { kind, generation }).await;
            }
        })
    }

    fn cancel_tier_timers(&mut self) {
        for timer in [self.armed_timer.take(), self.hot_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_tier_timers();
        if let Some(timer) = self.settle_timer.take() {
            timer.abort();
        }
    }

    /// Run a feed request; failure is logged and the current tier is kept.
    fn feed_result(
        &mut self,
        what: &str,
        request: impl FnOnce(&mut dyn LocationFeeds) -> Result<(), FeedError>,
    ) {
        if let Err(e) = request(self.feeds.as_mut()) {
            warn!("[monitor] {what} failed: {e}");
        }
    }

    fn save_places(&mut self) {
        let places: Vec<Place> = self.registry.places().cloned().collect();
        if let Err(e) = self.store.save_places(&places) {
            warn!("[monitor] failed to persist places: {e}");
        }
    }

    fn persist_triggered(&mut self) {
        if !self.monitoring {
            return;
        }
        if let Err(e) = self.store.save_triggered(&self.registry.triggered_ids()) {
            warn!("[monitor] failed to persist trigger records: {e}");
        }
    }

    fn snapshot(&self) -> MonitorStatus {
        MonitorStatus {
            mode: self.mode.kind(),
            target_place: self
                .mode
                .target()
                .and_then(|id| self.registry.get(id))
                .map(|p| p.name.clone()),
            place_count: self.registry.len(),
            inside: self.registry.inside_by_name(),
            triggered: self.registry.triggered_ids().into_iter().collect(),
        }
    }
}

fn distance_to(fix: &LocationFix, place: &Place) -> f64 {
    geo::distance_meters(fix.latitude, fix.longitude, place.latitude, place.longitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time;

    const LAT: f64 = 37.5665;
    const LON: f64 = 126.978;

    #[derive(Debug, Clone, PartialEq)]
    enum FeedCall {
        MotionSubscribe,
        MotionUnsubscribe,
        CoarseRegister(usize),
        FineRegister(String),
        FineRemoveAll,
        CoarseRemoveAll,
        PassiveStart,
        PassiveStop,
        LowPowerStart(Duration),
        LowPowerStop,
        BurstStart,
        BurstStop,
        CurrentFix(FixPurpose),
        LastKnownFix(FixPurpose),
        ForegroundStart,
        ForegroundStop,
        AccelSubscribe,
        AccelUnsubscribe,
    }

    #[derive(Debug, Default)]
    struct FeedState {
        calls: Vec<FeedCall>,
        passive: bool,
        low_power: bool,
        burst: bool,
        /// Every time a feed starts while another is live. The mutual
        /// exclusion invariant says this stays empty forever.
        violations: Vec<String>,
    }

    impl FeedState {
        fn saw(&self, call: &FeedCall) -> bool {
            self.calls.contains(call)
        }

        fn active_feeds(&self) -> usize {
            [self.passive, self.low_power, self.burst]
                .iter()
                .filter(|on| **on)
                .count()
        }
    }

    #[derive(Clone)]
    struct MockFeeds {
        state: Arc<Mutex<FeedState>>,
    }

    impl MockFeeds {
        fn new() -> (Self, Arc<Mutex<FeedState>>) {
            let state = Arc::new(Mutex::new(FeedState::default()));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }

        fn record(&self, call: FeedCall) {
            self.state.lock().unwrap().calls.push(call);
        }
    }

    impl LocationFeeds for MockFeeds {
        fn subscribe_motion_transitions(&mut self) -> Result<(), FeedError> {
            self.record(FeedCall::MotionSubscribe);
            Ok(())
        }

        fn unsubscribe_motion_transitions(&mut self) {
            self.record(FeedCall::MotionUnsubscribe);
        }

        fn register_coarse_geofences(&mut self, places: &[Place]) -> Result<(), FeedError> {
            self.record(FeedCall::CoarseRegister(places.len()));
            Ok(())
        }

        fn register_fine_geofence(&mut self, place: &Place) -> Result<(), FeedError> {
            self.record(FeedCall::FineRegister(place.id.clone()));
            Ok(())
        }

        fn remove_fine_geofence(&mut self, _place_id: &str) {}

        fn remove_all_fine(&mut self) {
            self.record(FeedCall::FineRemoveAll);
        }

        fn remove_all_coarse(&mut self) {
            self.record(FeedCall::CoarseRemoveAll);
        }

        fn start_passive_feed(&mut self) -> Result<(), FeedError> {
            let mut s = self.state.lock().unwrap();
            if s.low_power || s.burst {
                s.violations
                    .push("passive started while another feed active".to_string());
            }
            s.passive = true;
            s.calls.push(FeedCall::PassiveStart);
            Ok(())
        }

        fn stop_passive_feed(&mut self) {
            let mut s = self.state.lock().unwrap();
            s.passive = false;
            s.calls.push(FeedCall::PassiveStop);
        }

        fn start_low_power_feed(&mut self, interval: Duration) -> Result<(), FeedError> {
            let mut s = self.state.lock().unwrap();
            if s.passive || s.burst {
                s.violations
                    .push("low-power started while another feed active".to_string());
            }
            s.low_power = true;
            s.calls.push(FeedCall::LowPowerStart(interval));
            Ok(())
        }

        fn stop_low_power_feed(&mut self) {
            let mut s = self.state.lock().unwrap();
            s.low_power = false;
            s.calls.push(FeedCall::LowPowerStop);
        }

        fn start_high_accuracy_burst(
            &mut self,
            _interval: Duration,
            _max_duration: Duration,
        ) -> Result<(), FeedError> {
            let mut s = self.state.lock().unwrap();
            if s.passive || s.low_power {
                s.violations
                    .push("burst started while another feed active".to_string());
            }
            s.burst = true;
            s.calls.push(FeedCall::BurstStart);
            Ok(())
        }

        fn stop_burst(&mut self) {
            let mut s = self.state.lock().unwrap();
            s.burst = false;
            s.calls.push(FeedCall::BurstStop);
        }

        fn request_current_fix(&mut self, purpose: FixPurpose) {
            self.record(FeedCall::CurrentFix(purpose));
        }

        fn request_last_known_fix(&mut self, purpose: FixPurpose) {
            self.record(FeedCall::LastKnownFix(purpose));
        }

        fn start_foreground_guard(&mut self) {
            self.record(FeedCall::ForegroundStart);
        }

        fn stop_foreground_guard(&mut self) {
            self.record(FeedCall::ForegroundStop);
        }

        fn subscribe_accelerometer(&mut self) -> Result<(), FeedError> {
            self.record(FeedCall::AccelSubscribe);
            Ok(())
        }

        fn unsubscribe_accelerometer(&mut self) {
            self.record(FeedCall::AccelUnsubscribe);
        }
    }

    struct Rig {
        handle: MonitorHandle,
        events: mpsc::Sender<EngineEvent>,
        alarms: mpsc::Receiver<AlarmEvent>,
        feeds: Arc<Mutex<FeedState>>,
    }

    static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    fn scratch_store() -> PlaceStore {
        let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "geofence_alarm_monitor_test_{}_{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        PlaceStore::new(dir)
    }

    fn rig_with_store(store: PlaceStore) -> Rig {
        let (alarm_tx, alarms) = mpsc::channel(16);
        let (mock, feeds) = MockFeeds::new();
        let handle = SmartMonitor::spawn(
            MonitorConfig::default(),
            move |_| Box::new(mock),
            store,
            alarm_tx,
        );
        let events = handle.event_sender();
        Rig {
            handle,
            events,
            alarms,
            feeds,
        }
    }

    fn rig() -> Rig {
        rig_with_store(scratch_store())
    }

    fn place(id: &str, kind: TriggerKind) -> Place {
        Place {
            id: id.to_string(),
            name: format!("{id} place"),
            latitude: LAT,
            longitude: LON,
            radius_meters: 150.0,
            trigger_kind: kind,
            enabled: true,
        }
    }

    /// A fix `east` meters east of the place center.
    fn fix_at(east: f64) -> LocationFix {
        let (latitude, longitude) = geo::offset_by_meters(LAT, LON, east, 0.0);
        LocationFix {
            latitude,
            longitude,
            accuracy_meters: 20.0,
        }
    }

    async fn seed_status(rig: &Rig, fix: Option<LocationFix>) {
        rig.events
            .send(EngineEvent::FixResult {
                purpose: FixPurpose::InitialStatus,
                fix,
            })
            .await
            .unwrap();
    }

    async fn geofence(rig: &Rig, id: &str, entered: bool, coarse: bool) {
        rig.events
            .send(EngineEvent::GeofenceCrossed {
                place_id: id.to_string(),
                entered,
                coarse,
            })
            .await
            .unwrap();
    }

    async fn hot_fix(rig: &Rig, east: f64) {
        rig.events
            .send(EngineEvent::Fix {
                tier: FeedTier::HighAccuracy,
                fix: fix_at(east),
            })
            .await
            .unwrap();
    }

    /// Let spawned timer tasks run after a clock advance.
    async fn yield_tasks() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Walks an exit place from inside to a confirmed exit alarm.
    async fn run_exit_confirmation(rig: &mut Rig) -> AlarmEvent {
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        seed_status(rig, Some(fix_at(0.0))).await;
        geofence(rig, "home", false, true).await;
        hot_fix(rig, 250.0).await;
        hot_fix(rig, 260.0).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.triggered, vec!["home".to_string()]);
        rig.alarms.try_recv().expect("exit alarm should have fired")
    }

    #[tokio::test(start_paused = true)]
    async fn start_monitoring_brings_up_idle_resources() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Enter)])
            .await
            .unwrap();

        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        assert_eq!(status.place_count, 1);
        assert_eq!(status.target_place, None);

        let feeds = rig.feeds.lock().unwrap();
        assert!(feeds.saw(&FeedCall::MotionSubscribe));
        assert!(feeds.saw(&FeedCall::CoarseRegister(1)));
        assert!(feeds.saw(&FeedCall::PassiveStart));
        assert!(feeds.saw(&FeedCall::LastKnownFix(FixPurpose::InitialStatus)));
        assert!(feeds.violations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn coarse_enter_arms_with_fine_fence_and_low_power() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Enter)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(5000.0))).await;

        geofence(&rig, "home", true, true).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Armed);
        assert_eq!(status.target_place, Some("home place".to_string()));

        let feeds = rig.feeds.lock().unwrap();
        assert!(feeds.saw(&FeedCall::FineRegister("home".to_string())));
        assert!(feeds.saw(&FeedCall::LowPowerStart(Duration::from_secs(10))));
        assert!(feeds.low_power && !feeds.passive && !feeds.burst);
        assert!(feeds.violations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fine_enter_confirms_entry_after_dwell() {
        let mut rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Enter)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(5000.0))).await;
        geofence(&rig, "home", true, true).await;

        geofence(&rig, "home", true, false).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);
        {
            let feeds = rig.feeds.lock().unwrap();
            assert!(feeds.burst);
            assert!(feeds.saw(&FeedCall::ForegroundStart));
        }

        // First inside sample starts the dwell clock; the second, 16 s
        // later, completes both the streak and the dwell.
        hot_fix(&rig, 0.0).await;
        let status = rig.handle.status().await.unwrap();
        assert!(status.triggered.is_empty());

        time::advance(Duration::from_secs(16)).await;
        yield_tasks().await;
        hot_fix(&rig, 10.0).await;

        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.triggered, vec!["home".to_string()]);
        let alarm = rig.alarms.try_recv().unwrap();
        assert_eq!(alarm.place_id, "home");
        assert_eq!(alarm.trigger_kind, TriggerKind::Enter);

        // Settle delay elapses, engine drops back to IDLE.
        time::advance(Duration::from_secs(4)).await;
        yield_tasks().await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        assert!(rig.feeds.lock().unwrap().violations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hot_timeout_returns_to_idle_without_alarm() {
        let mut rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(0.0))).await;
        geofence(&rig, "home", false, true).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);

        // No resolving samples for the whole burst window.
        time::advance(Duration::from_secs(61)).await;
        yield_tasks().await;

        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        assert!(status.triggered.is_empty());
        assert!(rig.alarms.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timeout_returns_to_idle() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Enter)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(5000.0))).await;
        geofence(&rig, "home", true, true).await;

        time::advance(Duration::from_secs(10 * 60 + 1)).await;
        yield_tasks().await;

        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        let feeds = rig.feeds.lock().unwrap();
        assert!(feeds.saw(&FeedCall::LowPowerStop));
        assert!(feeds.passive && !feeds.low_power);
        assert!(feeds.violations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn coarse_exit_without_inside_history_is_ignored() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(5000.0))).await;

        geofence(&rig, "home", false, true).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        assert!(!rig.feeds.lock().unwrap().saw(&FeedCall::BurstStart));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_fires_exactly_once_per_registration() {
        let mut rig = rig();
        let alarm = run_exit_confirmation(&mut rig).await;
        assert_eq!(alarm.trigger_kind, TriggerKind::Exit);
        assert_eq!(alarm.place_name, "home place");

        // Samples during the settle window change nothing.
        hot_fix(&rig, 300.0).await;
        hot_fix(&rig, 310.0).await;
        assert!(rig.alarms.try_recv().is_err());

        time::advance(Duration::from_secs(4)).await;
        yield_tasks().await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);

        // A fresh coarse exit cannot re-fire a triggered place.
        geofence(&rig, "home", false, true).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        assert!(rig.alarms.try_recv().is_err());
        assert!(rig.feeds.lock().unwrap().violations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_triggered_restores_eligibility() {
        let mut rig = rig();
        run_exit_confirmation(&mut rig).await;
        time::advance(Duration::from_secs(4)).await;
        yield_tasks().await;

        rig.handle.clear_triggered("home").await.unwrap();
        let status = rig.handle.status().await.unwrap();
        assert!(status.triggered.is_empty());

        // Inside history survived the idle transition, so the place can
        // confirm again.
        geofence(&rig, "home", false, true).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);
    }

    #[tokio::test(start_paused = true)]
    async fn update_places_resets_trigger_records() {
        let mut rig = rig();
        run_exit_confirmation(&mut rig).await;
        time::advance(Duration::from_secs(4)).await;
        yield_tasks().await;

        rig.handle
            .update_places(vec![place("work", TriggerKind::Enter)])
            .await
            .unwrap();
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.place_count, 1);
        assert!(status.triggered.is_empty());

        // The old place re-appearing starts with no inside history, so a
        // coarse exit for it is ignored again.
        rig.handle
            .update_places(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        geofence(&rig, "home", false, true).await;
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        assert!(status.triggered.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_restores_places_and_dedup_records() {
        let store = scratch_store();
        {
            let mut rig = rig_with_store(store.clone());
            run_exit_confirmation(&mut rig).await;
            time::advance(Duration::from_secs(4)).await;
            yield_tasks().await;
            // Process death: every handle drops, no teardown runs.
        }
        yield_tasks().await;

        let rig = rig_with_store(store);
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.place_count, 1);
        assert_eq!(status.mode, ModeKind::Idle);
        // The alarm that fired before the crash stays fired.
        assert_eq!(status.triggered, vec!["home".to_string()]);

        let feeds = rig.feeds.lock().unwrap();
        assert!(feeds.saw(&FeedCall::LastKnownFix(FixPurpose::InitialStatus)));
        assert!(feeds.saw(&FeedCall::CoarseRegister(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitoring_tears_everything_down() {
        let store = scratch_store();
        let rig = rig_with_store(store.clone());
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Enter)])
            .await
            .unwrap();
        rig.handle.stop_monitoring().await.unwrap();

        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.place_count, 0);
        assert_eq!(status.mode, ModeKind::Idle);
        {
            let feeds = rig.feeds.lock().unwrap();
            assert!(feeds.saw(&FeedCall::MotionUnsubscribe));
            assert!(feeds.saw(&FeedCall::CoarseRemoveAll));
            assert!(feeds.saw(&FeedCall::FineRemoveAll));
            assert_eq!(feeds.active_feeds(), 0);
        }

        // The persisted set was cleared too: a relaunch restores nothing.
        drop(rig);
        yield_tasks().await;
        let rig = rig_with_store(store);
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.place_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_from_previous_tier_is_dropped() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Enter)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(5000.0))).await;
        geofence(&rig, "home", true, true).await;

        // A timeout armed under an older generation must not fire.
        rig.events
            .send(EngineEvent::TimerFired {
                kind: TimerKind::ArmedTimeout,
                generation: 0,
            })
            .await
            .unwrap();
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn motion_start_inside_exit_place_goes_hot() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(0.0))).await;

        rig.events
            .send(EngineEvent::MotionTransition { is_moving: true })
            .await
            .unwrap();
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Idle);
        assert!(rig
            .feeds
            .lock()
            .unwrap()
            .saw(&FeedCall::CurrentFix(FixPurpose::MotionCheck)));

        // The fresh fix confirms we are still inside: straight to HOT.
        rig.events
            .send(EngineEvent::FixResult {
                purpose: FixPurpose::MotionCheck,
                fix: Some(fix_at(10.0)),
            })
            .await
            .unwrap();
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_fast_entry_promotes_on_tight_fix() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Enter)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(5000.0))).await;
        geofence(&rig, "home", true, true).await;

        rig.events
            .send(EngineEvent::Fix {
                tier: FeedTier::LowPower,
                fix: fix_at(50.0),
            })
            .await
            .unwrap();
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);
    }

    #[tokio::test(start_paused = true)]
    async fn inside_guard_movement_promotes_to_hot() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(0.0))).await;
        {
            let feeds = rig.feeds.lock().unwrap();
            assert!(feeds.low_power, "inside-guard should be polling");
            assert!(feeds.saw(&FeedCall::AccelSubscribe));
        }

        // Baseline poll, then a 20 m displacement on the next one.
        rig.events
            .send(EngineEvent::Fix {
                tier: FeedTier::LowPower,
                fix: fix_at(0.0),
            })
            .await
            .unwrap();
        time::advance(Duration::from_secs(20)).await;
        yield_tasks().await;
        rig.events
            .send(EngineEvent::Fix {
                tier: FeedTier::LowPower,
                fix: fix_at(20.0),
            })
            .await
            .unwrap();

        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);
        assert!(rig.feeds.lock().unwrap().violations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inside_guard_predicted_exit_promotes_to_hot() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(0.0))).await;

        // Single poll already outside the radius: inside -> outside flip.
        rig.events
            .send(EngineEvent::Fix {
                tier: FeedTier::LowPower,
                fix: fix_at(200.0),
            })
            .await
            .unwrap();
        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);
    }

    #[tokio::test(start_paused = true)]
    async fn shake_while_resting_inside_exit_place_goes_hot() {
        let rig = rig();
        rig.handle
            .start_monitoring(vec![place("home", TriggerKind::Exit)])
            .await
            .unwrap();
        seed_status(&rig, Some(fix_at(0.0))).await;

        // Settle the gravity filter, then jolt it.
        for _ in 0..5 {
            rig.events
                .send(EngineEvent::AccelSample {
                    x: 0.0,
                    y: 0.0,
                    z: 9.81,
                })
                .await
                .unwrap();
        }
        rig.events
            .send(EngineEvent::AccelSample {
                x: 8.0,
                y: 0.0,
                z: 9.81,
            })
            .await
            .unwrap();

        let status = rig.handle.status().await.unwrap();
        assert_eq!(status.mode, ModeKind::Hot);
    }
}
