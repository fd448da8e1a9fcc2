//! SITL-style demo session.
//!
//! Wires the full stack against the built-in simulated vehicle: telemetry
//! manager, mode arbitration, keyboard bridge (idle unless a device feeds
//! it), a synthetic detection source that wanders a target across the frame,
//! the HTTP control surface, and the control dispatcher.
//!
//! ## Flow
//! 1. Start simulated link + telemetry manager + HTTP server.
//! 2. Arm and take off to the configured altitude.
//! 3. Run the control loop for the session duration; enable tracking via
//!    `--auto-enable` or `curl -X POST http://localhost:<port>/toggle`.
//! 4. Land, disarm, shut everything down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use drone_teleop::config::Config;
use drone_teleop::control::keyboard::KeyBindings;
use drone_teleop::control::tracking::detection_channel;
use drone_teleop::control::{
    ControlDispatcher, KeyboardController, ModeManager, Observation, TrackingController,
};
use drone_teleop::flight;
use drone_teleop::http::ControlServer;
use drone_teleop::telemetry::TelemetryManager;
use drone_teleop::vehicle::sim::SimVehicle;

const DEFAULT_SESSION_SECS: u64 = 30;
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const SIM_TELEMETRY_RATE_HZ: f64 = 50.0;
const DETECTION_RATE_HZ: f64 = 30.0;

struct Args {
    session_secs: u64,
    http_addr: String,
    auto_enable: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        session_secs: DEFAULT_SESSION_SECS,
        http_addr: DEFAULT_HTTP_ADDR.to_string(),
        auto_enable: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seconds" => {
                if let Some(v) = iter.next().and_then(|v| v.parse().ok()) {
                    args.session_secs = v;
                }
            }
            "--http" => {
                if let Some(v) = iter.next() {
                    args.http_addr = v;
                }
            }
            "--auto-enable" => args.auto_enable = true,
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("usage: drone_teleop [--seconds N] [--http ADDR:PORT] [--auto-enable]");
                std::process::exit(2);
            }
        }
    }
    args
}

/// Synthetic detection source: a target drifting sinusoidally across the
/// frame, occasionally dropping out to exercise the track-loss path.
fn spawn_detection_source(
    tx: tokio::sync::watch::Sender<Option<Observation>>,
    running: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(1.0 / DETECTION_RATE_HZ);
        let mut ticker = tokio::time::interval(period);
        let mut t = 0.0_f64;
        while running.load(Ordering::Relaxed) {
            ticker.tick().await;
            t += period.as_secs_f64();

            // ~5% dropped frames, plus a full blind second every 20s
            let blind = rand::random_range(0.0..1.0) < 0.05 || (t % 20.0) > 19.0;
            let observation = (!blind).then(|| Observation {
                center_x_norm: 0.6 * (t * 0.4).sin(),
                center_y_norm: 0.0,
                bbox_height_ratio: 0.20 + 0.08 * (t * 0.15).cos(),
                confidence: rand::random_range(0.55..0.95),
            });
            let _ = tx.send(observation);
        }
    });
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = parse_args();

    let config = Config::default();
    if let Err(e) = config.validate() {
        log::error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    log::info!("=== drone_teleop demo session ({}s) ===", args.session_secs);

    // Simulated vehicle + telemetry ingestion.
    let link = Arc::new(SimVehicle::new(SIM_TELEMETRY_RATE_HZ));
    link.start_streams();
    let mut telemetry_manager = TelemetryManager::start(Arc::clone(&link));
    let telemetry = telemetry_manager.handle();

    // Arbitration + control surfaces.
    let mode = Arc::new(ModeManager::new(config.mode.clone()));
    let mut http = match ControlServer::spawn(&args.http_addr, Arc::clone(&mode)) {
        Ok(server) => Some(server),
        Err(e) => {
            log::warn!("HTTP control surface unavailable: {e}");
            None
        }
    };

    // Keyboard bridge: wired but idle, no capture device in the demo. A
    // real deployment hands the sender half to the input adapter.
    let (key_tx, key_rx) = crossbeam::channel::bounded(64);
    let keyboard = KeyboardController::new(
        config.keyboard.clone(),
        KeyBindings::default(),
        Arc::clone(&mode),
    );
    let capture_thread = keyboard.spawn_capture(key_rx);

    let running = Arc::new(AtomicBool::new(true));
    let (detection_tx, detection_rx) = detection_channel();
    spawn_detection_source(detection_tx, Arc::clone(&running));

    if args.auto_enable {
        mode.enable();
    }

    // Get airborne before the control loop takes over the setpoint stream.
    if let Err(e) = flight::arm_and_takeoff(
        link.as_ref(),
        &telemetry,
        config.dispatch.takeoff_altitude_m,
    )
    .await
    {
        log::error!("takeoff failed, aborting session: {e}");
        std::process::exit(1);
    }

    let dispatcher = ControlDispatcher::new(
        Arc::clone(&link),
        telemetry.clone(),
        Arc::clone(&mode),
        Arc::clone(&keyboard),
        TrackingController::new(config.tracking.clone()),
        detection_rx,
        config.dispatch.clone(),
        Arc::clone(&running),
    );
    let control_loop = tokio::spawn(dispatcher.run());

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.session_secs)) => {
            log::info!("session time elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted");
        }
    }

    // Orderly shutdown: the dispatcher lands and disarms on its way out.
    running.store(false, Ordering::Relaxed);
    if let Err(e) = control_loop.await {
        log::error!("control loop task failed: {e}");
    }

    let status = mode.status();
    log::info!(
        "final status: {}",
        serde_json::to_string(&status).unwrap_or_else(|_| "<unserializable>".into())
    );

    telemetry_manager.stop();
    link.stop_streams();
    if let Some(server) = http.as_mut() {
        server.stop();
    }
    drop(key_tx);
    let _ = capture_thread.join();
    log::info!("=== session complete ===");
}
