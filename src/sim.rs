//! Scripted feed simulation.
//!
//! Implements the platform boundary against a timed route instead of real
//! hardware: feed subscriptions become spawned tasks that sample the route,
//! and registered geofences are watched by a polling task that posts
//! crossing events. Used by the replay binary and the end-to-end tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::events::{EngineEvent, FeedTier, FixPurpose, LocationFix};
use crate::feeds::{FeedError, LocationFeeds};
use crate::geo;
use crate::place::Place;

/// A timed waypoint along a simulated walk.
#[derive(Debug, Clone)]
pub struct Waypoint {
    pub at: Duration,
    pub latitude: f64,
    pub longitude: f64,
}

impl Waypoint {
    pub fn new(at: Duration, latitude: f64, longitude: f64) -> Self {
        Self {
            at,
            latitude,
            longitude,
        }
    }
}

/// Piecewise-linear position over elapsed time.
#[derive(Debug, Clone)]
pub struct Route {
    waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn new(mut waypoints: Vec<Waypoint>) -> Self {
        assert!(!waypoints.is_empty(), "route needs at least one waypoint");
        waypoints.sort_by_key(|w| w.at);
        Self { waypoints }
    }

    pub fn position_at(&self, elapsed: Duration) -> (f64, f64) {
        let first = &self.waypoints[0];
        if elapsed <= first.at {
            return (first.latitude, first.longitude);
        }
        for pair in self.waypoints.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if elapsed <= b.at {
                let span = (b.at - a.at).as_secs_f64();
                if span == 0.0 {
                    return (b.latitude, b.longitude);
                }
                let t = (elapsed - a.at).as_secs_f64() / span;
                return (
                    a.latitude + (b.latitude - a.latitude) * t,
                    a.longitude + (b.longitude - a.longitude) * t,
                );
            }
        }
        let last = self.waypoints.last().unwrap();
        (last.latitude, last.longitude)
    }
}

#[derive(Debug)]
struct Fence {
    place_id: String,
    latitude: f64,
    longitude: f64,
    radius: f32,
    coarse: bool,
    was_inside: Option<bool>,
}

#[derive(Debug, Default)]
struct FenceSet {
    fences: Vec<Fence>,
}

/// A [`LocationFeeds`] implementation that replays a [`Route`].
pub struct SimulatedFeeds {
    events: mpsc::Sender<EngineEvent>,
    route: Arc<Route>,
    epoch: Instant,
    accuracy: f32,
    fences: Arc<Mutex<FenceSet>>,
    passive_task: Option<JoinHandle<()>>,
    low_power_task: Option<JoinHandle<()>>,
    burst_task: Option<JoinHandle<()>>,
    fence_task: Option<JoinHandle<()>>,
}

impl SimulatedFeeds {
    const PASSIVE_INTERVAL: Duration = Duration::from_secs(30);
    const FENCE_POLL: Duration = Duration::from_secs(2);

    pub fn new(events: mpsc::Sender<EngineEvent>, route: Route, accuracy: f32) -> Self {
        Self {
            events,
            route: Arc::new(route),
            epoch: Instant::now(),
            accuracy,
            fences: Arc::new(Mutex::new(FenceSet::default())),
            passive_task: None,
            low_power_task: None,
            burst_task: None,
            fence_task: None,
        }
    }

    fn current_fix(&self) -> LocationFix {
        let (latitude, longitude) = self.route.position_at(self.epoch.elapsed());
        LocationFix {
            latitude,
            longitude,
            accuracy_meters: self.accuracy,
        }
    }

    fn spawn_fix_task(
        &self,
        tier: FeedTier,
        period: Duration,
        deadline: Option<Duration>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let route = self.route.clone();
        let epoch = self.epoch;
        let accuracy = self.accuracy;
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(max) = deadline {
                    if started.elapsed() >= max {
                        break;
                    }
                }
                let (latitude, longitude) = route.position_at(epoch.elapsed());
                let fix = LocationFix {
                    latitude,
                    longitude,
                    accuracy_meters: accuracy,
                };
                if events.send(EngineEvent::Fix { tier, fix }).await.is_err() {
                    break;
                }
            }
        })
    }

    fn ensure_fence_task(&mut self) {
        if self.fence_task.is_some() {
            return;
        }
        let events = self.events.clone();
        let route = self.route.clone();
        let epoch = self.epoch;
        let fences = self.fences.clone();
        self.fence_task = Some(tokio::spawn(async move {
            let mut ticker = interval(Self::FENCE_POLL);
            loop {
                ticker.tick().await;
                let (lat, lon) = route.position_at(epoch.elapsed());
                let mut crossings = Vec::new();
                {
                    let mut set = fences.lock().unwrap();
                    for fence in &mut set.fences {
                        let inside = geo::distance_meters(lat, lon, fence.latitude, fence.longitude)
                            <= fence.radius as f64;
                        if let Some(prev) = fence.was_inside {
                            if prev != inside {
                                crossings.push(EngineEvent::GeofenceCrossed {
                                    place_id: fence.place_id.clone(),
                                    entered: inside,
                                    coarse: fence.coarse,
                                });
                            }
                        }
                        fence.was_inside = Some(inside);
                    }
                }
                for event in crossings {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }));
    }

    fn answer_fix(&self, purpose: FixPurpose) {
        // Called from inside the monitor loop, so only a non-blocking send
        // is safe here.
        let _ = self.events.try_send(EngineEvent::FixResult {
            purpose,
            fix: Some(self.current_fix()),
        });
    }
}

fn stop_task(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

impl Drop for SimulatedFeeds {
    fn drop(&mut self) {
        stop_task(&mut self.passive_task);
        stop_task(&mut self.low_power_task);
        stop_task(&mut self.burst_task);
        stop_task(&mut self.fence_task);
    }
}

impl LocationFeeds for SimulatedFeeds {
    fn subscribe_motion_transitions(&mut self) -> Result<(), FeedError> {
        // Motion transitions are scripted by the scenario driver.
        Ok(())
    }

    fn unsubscribe_motion_transitions(&mut self) {}

    fn register_coarse_geofences(&mut self, places: &[Place]) -> Result<(), FeedError> {
        let mut set = self.fences.lock().unwrap();
        set.fences.retain(|f| !f.coarse);
        for place in places {
            set.fences.push(Fence {
                place_id: place.id.clone(),
                latitude: place.latitude,
                longitude: place.longitude,
                radius: place.coarse_radius(),
                coarse: true,
                was_inside: None,
            });
        }
        drop(set);
        self.ensure_fence_task();
        Ok(())
    }

    fn register_fine_geofence(&mut self, place: &Place) -> Result<(), FeedError> {
        let mut set = self.fences.lock().unwrap();
        set.fences
            .retain(|f| f.coarse || f.place_id != place.id);
        set.fences.push(Fence {
            place_id: place.id.clone(),
            latitude: place.latitude,
            longitude: place.longitude,
            radius: place.fine_radius(),
            coarse: false,
            was_inside: None,
        });
        drop(set);
        self.ensure_fence_task();
        Ok(())
    }

    fn remove_fine_geofence(&mut self, place_id: &str) {
        let mut set = self.fences.lock().unwrap();
        set.fences.retain(|f| f.coarse || f.place_id != place_id);
    }

    fn remove_all_fine(&mut self) {
        self.fences.lock().unwrap().fences.retain(|f| f.coarse);
    }

    fn remove_all_coarse(&mut self) {
        self.fences.lock().unwrap().fences.retain(|f| !f.coarse);
    }

    fn start_passive_feed(&mut self) -> Result<(), FeedError> {
        stop_task(&mut self.passive_task);
        self.passive_task =
            Some(self.spawn_fix_task(FeedTier::Passive, Self::PASSIVE_INTERVAL, None));
        Ok(())
    }

    fn stop_passive_feed(&mut self) {
        stop_task(&mut self.passive_task);
    }

    fn start_low_power_feed(&mut self, interval: Duration) -> Result<(), FeedError> {
        stop_task(&mut self.low_power_task);
        self.low_power_task = Some(self.spawn_fix_task(FeedTier::LowPower, interval, None));
        Ok(())
    }

    fn stop_low_power_feed(&mut self) {
        stop_task(&mut self.low_power_task);
    }

    fn start_high_accuracy_burst(
        &mut self,
        interval: Duration,
        max_duration: Duration,
    ) -> Result<(), FeedError> {
        stop_task(&mut self.burst_task);
        self.burst_task =
            Some(self.spawn_fix_task(FeedTier::HighAccuracy, interval, Some(max_duration)));
        Ok(())
    }

    fn stop_burst(&mut self) {
        stop_task(&mut self.burst_task);
    }

    fn request_current_fix(&mut self, purpose: FixPurpose) {
        self.answer_fix(purpose);
    }

    fn request_last_known_fix(&mut self, purpose: FixPurpose) {
        self.answer_fix(purpose);
    }

    fn start_foreground_guard(&mut self) {
        debug!("[sim] foreground guard up");
    }

    fn stop_foreground_guard(&mut self) {
        debug!("[sim] foreground guard down");
    }

    fn subscribe_accelerometer(&mut self) -> Result<(), FeedError> {
        // No jerk stream in the simulation; the shake path is covered by
        // unit tests against the detector directly.
        Ok(())
    }

    fn unsubscribe_accelerometer(&mut self) {}
}
