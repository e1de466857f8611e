use std::hint::black_box;
use std::time::Instant;

use glam::Vec3;
use streamer_common::{ObserverId, WorldPartition};
use streamer_engine::{
    Budget, EntityDefinition, EntityRegistry, RealizationMode, SimulatedBackend, Streamer,
    StreamerConfig, StreamingPolicy,
};

const SPACING: f32 = 8.0;

fn grid_position(i: usize, count: usize) -> Vec3 {
    let side = (count as f32).sqrt().ceil() as usize;
    Vec3::new((i % side) as f32 * SPACING, 0.0, (i / side) as f32 * SPACING)
}

fn make_registry(entity_count: usize, observer_count: usize) -> EntityRegistry {
    let mut registry = EntityRegistry::new(64.0);
    for i in 0..entity_count {
        registry
            .register(EntityDefinition::new(400, grid_position(i, entity_count)))
            .expect("finite position");
    }
    for o in 0..observer_count {
        let position = grid_position(o * entity_count / observer_count.max(1), entity_count);
        registry.update_observer(ObserverId(o as u64), position, WorldPartition::MAIN);
    }
    registry
}

fn bench_nearest(entity_count: usize, radius: f32, iterations: usize) {
    let registry = make_registry(entity_count, 0);
    let index = registry.spatial();

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = black_box(index.nearest_entities(
            black_box(Vec3::ZERO),
            WorldPartition::MAIN,
            black_box(radius),
        ));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  nearest ({entity_count} entities, r={radius}, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn bench_policy(entity_count: usize, observer_count: usize, iterations: usize) {
    let registry = make_registry(entity_count, observer_count);
    let policy = StreamingPolicy::new(RealizationMode::Global, 300.0);
    let budget = Budget::new(1000);

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = black_box(policy.desired(black_box(&registry), black_box(&budget)));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  policy ({entity_count} entities, {observer_count} observers, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn bench_tick(entity_count: usize, iterations: usize) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let config = StreamerConfig {
        budget: 500,
        ..StreamerConfig::default()
    };
    let mut streamer =
        Streamer::new("bench", &config, SimulatedBackend::new()).expect("valid config");
    for i in 0..entity_count {
        streamer
            .add_entity(EntityDefinition::new(400, grid_position(i, entity_count)))
            .expect("finite position");
    }

    let start = Instant::now();
    for i in 0..iterations {
        // Walk the observer across the grid so every tick has churn.
        let x = (i % 50) as f32 * SPACING * 4.0;
        streamer
            .update_observer(ObserverId(0), Vec3::new(x, 0.0, x), WorldPartition::MAIN)
            .expect("finite position");
        let _ = black_box(runtime.block_on(streamer.tick()));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  tick ({entity_count} entities, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn main() {
    println!("=== Stream Policy Benchmarks ===\n");

    println!("Proximity query:");
    bench_nearest(10_000, 50.0, 10_000);
    bench_nearest(10_000, 300.0, 1_000);
    bench_nearest(100_000, 300.0, 100);

    println!("\nPolicy evaluation:");
    bench_policy(1_000, 10, 1_000);
    bench_policy(10_000, 50, 100);
    bench_policy(10_000, 200, 20);

    println!("\nFull tick (simulated backend):");
    bench_tick(1_000, 1_000);
    bench_tick(10_000, 100);

    println!("\n=== Done ===");
}
