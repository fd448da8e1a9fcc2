use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use tokio::time::Instant;

use drone_teleop::config::{ModeConfig, TrackingConfig};
use drone_teleop::control::{ModeManager, Observation, TrackingController};
use drone_teleop::telemetry::RcChannels;

// Per-tick cost of the hot control path: one tracking update plus one
// arbitration pass. At 20 Hz the budget is 50 ms; these should sit in the
// tens of nanoseconds.

fn tracking_update_bench(c: &mut Criterion) {
    let mut controller = TrackingController::new(TrackingConfig::default());
    let observation = Observation {
        center_x_norm: 0.4,
        center_y_norm: 0.0,
        bbox_height_ratio: 0.18,
        confidence: 0.9,
    };

    c.bench_function("tracking_update", |b| {
        b.iter(|| {
            let cmd = controller.update(black_box(Some(&observation)), Instant::now());
            black_box(cmd)
        })
    });
}

fn mode_evaluate_bench(c: &mut Criterion) {
    let mode = ModeManager::new(ModeConfig::default());
    mode.enable();
    let frame = RcChannels { values: vec![0.1; 8], timestamp: Instant::now() };

    c.bench_function("mode_evaluate", |b| {
        b.iter(|| black_box(mode.evaluate(black_box(Some(&frame)), true, Instant::now())))
    });
}

criterion_group!(benches, tracking_update_bench, mode_evaluate_bench);
criterion_main!(benches);
