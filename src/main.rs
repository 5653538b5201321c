use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Local;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::interval;

use geofence_alarm_rs::geo::offset_by_meters;
use geofence_alarm_rs::monitor::{MonitorConfig, SmartMonitor};
use geofence_alarm_rs::place::{Place, TriggerKind};
use geofence_alarm_rs::sim::{Route, SimulatedFeeds, Waypoint};
use geofence_alarm_rs::store::PlaceStore;

#[derive(Parser, Debug)]
#[command(name = "geofence_alarm")]
#[command(about = "Geofence alarm engine - scripted walk replay", long_about = None)]
struct Args {
    /// Scenario to replay (enter, exit)
    #[arg(long, default_value = "exit")]
    scenario: String,

    /// Simulated fix accuracy in meters
    #[arg(long, default_value = "15.0")]
    accuracy: f32,

    /// Give up after this many seconds without an alarm
    #[arg(long, default_value = "600")]
    max_wait: u64,

    /// State directory for the place store
    #[arg(long, default_value = "geofence_alarm_state")]
    state_dir: PathBuf,
}

const LAT: f64 = 37.5665;
const LON: f64 = 126.978;

fn demo_place(kind: TriggerKind) -> Place {
    Place {
        id: "home".to_string(),
        name: "home".to_string(),
        latitude: LAT,
        longitude: LON,
        radius_meters: 150.0,
        trigger_kind: kind,
        enabled: true,
    }
}

fn wp(at_secs: u64, east_m: f64) -> Waypoint {
    let (lat, lon) = offset_by_meters(LAT, LON, east_m, 0.0);
    Waypoint::new(Duration::from_secs(at_secs), lat, lon)
}

fn build_scenario(name: &str) -> Result<(Place, Route)> {
    match name {
        // Rest at home for a moment, then walk away at ~3 m/s.
        "exit" => Ok((
            demo_place(TriggerKind::Exit),
            Route::new(vec![wp(0, 0.0), wp(10, 0.0), wp(180, 510.0), wp(600, 510.0)]),
        )),
        // Approach from 1.5 km out, then stay at the center.
        "enter" => Ok((
            demo_place(TriggerKind::Enter),
            Route::new(vec![wp(0, 1500.0), wp(190, 0.0), wp(600, 0.0)]),
        )),
        other => bail!("unknown scenario: {other} (expected enter or exit)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let (place, route) = build_scenario(&args.scenario)?;

    println!("[{}] geofence alarm replay starting", ts_now());
    println!("  Scenario: {}", args.scenario);
    println!(
        "  Place: {} ({:?}, r={}m, coarse={}m, fine={}m)",
        place.name,
        place.trigger_kind,
        place.radius_meters,
        place.coarse_radius(),
        place.fine_radius()
    );
    println!("  State dir: {}", args.state_dir.display());

    let (alarm_tx, mut alarms) = mpsc::channel(16);
    let accuracy = args.accuracy;
    let handle = SmartMonitor::spawn(
        MonitorConfig::default(),
        move |tx| Box::new(SimulatedFeeds::new(tx, route, accuracy)),
        PlaceStore::new(&args.state_dir),
        alarm_tx,
    );
    handle.start_monitoring(vec![place]).await?;

    let mut status_ticker = interval(Duration::from_secs(10));
    status_ticker.tick().await;
    let deadline = tokio::time::sleep(Duration::from_secs(args.max_wait));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            alarm = alarms.recv() => match alarm {
                Some(alarm) => {
                    println!(
                        "[{}] ALARM: {} {:?} at ({:.5}, {:.5})",
                        ts_now(),
                        alarm.place_name,
                        alarm.trigger_kind,
                        alarm.latitude,
                        alarm.longitude
                    );
                    break;
                }
                None => break,
            },
            _ = status_ticker.tick() => {
                let status = handle.status().await?;
                println!(
                    "[{}] mode={:?} target={:?} inside={:?}",
                    ts_now(),
                    status.mode,
                    status.target_place,
                    status.inside
                );
            }
            _ = &mut deadline => {
                println!("[{}] no alarm within {}s, giving up", ts_now(), args.max_wait);
                break;
            }
        }
    }

    handle.stop_monitoring().await?;
    println!("[{}] monitoring stopped", ts_now());
    Ok(())
}

fn ts_now() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
