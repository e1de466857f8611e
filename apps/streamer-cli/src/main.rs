use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::{Args, Parser, Subcommand};
use glam::Vec3;
use streamer_common::{ObserverId, WorldPartition};
use streamer_engine::{
    BackendHandle, EntityDefinition, InstanceKey, ObserverFeed, Priority, SchedulerHandle,
    SimulatedBackend, Streamer, StreamerConfig, observer_channel,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "streamer-cli", about = "Run simulated entity streaming sessions")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and default configuration
    Info,
    /// Stream a random world past a handful of wandering observers
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// JSON streamer configuration; missing fields take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of ticks to run
    #[arg(short, long, default_value = "20")]
    ticks: u64,
    /// Number of logical entities to register
    #[arg(short, long, default_value = "2000")]
    entities: usize,
    /// Number of wandering observers
    #[arg(short, long, default_value = "8")]
    observers: u64,
    /// How many entities are always realized
    #[arg(long, default_value = "0")]
    pinned: usize,
    /// Override the realization budget
    #[arg(long)]
    budget: Option<usize>,
    /// Override the streaming distance
    #[arg(long)]
    distance: Option<f32>,
    /// Engine-side object cap of the simulated backend
    #[arg(long)]
    engine_cap: Option<usize>,
    /// Edge length of the square world
    #[arg(long, default_value = "3000")]
    world_size: f32,
    /// Seed for entity placement and observer movement
    #[arg(short, long, default_value = "42")]
    seed: u64,
    /// Drive ticks from the scheduler timer instead of stepping them
    #[arg(long)]
    realtime: bool,
}

/// Deterministic placement and movement source.
struct SplitMix(u64);

impl SplitMix {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform value in `[0, 1)`.
    fn next_unit(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

struct Walker {
    id: ObserverId,
    position: Vec3,
    heading: Vec3,
}

/// Observers wandering around the world, bouncing off its edges.
struct Crowd {
    walkers: Vec<Walker>,
    world_size: f32,
    speed: f32,
}

impl Crowd {
    fn new(count: u64, world_size: f32, rng: &mut SplitMix) -> Self {
        let walkers = (0..count)
            .map(|i| {
                let angle = rng.next_unit() * std::f32::consts::TAU;
                Walker {
                    id: ObserverId(i),
                    position: Vec3::new(
                        rng.next_unit() * world_size,
                        0.0,
                        rng.next_unit() * world_size,
                    ),
                    heading: Vec3::new(angle.cos(), 0.0, angle.sin()),
                }
            })
            .collect();
        Self {
            walkers,
            world_size,
            speed: 40.0,
        }
    }

    fn step(&mut self, feed: &ObserverFeed) {
        for walker in &mut self.walkers {
            let mut next = walker.position + walker.heading * self.speed;
            if !(0.0..=self.world_size).contains(&next.x) {
                walker.heading.x = -walker.heading.x;
                next.x = next.x.clamp(0.0, self.world_size);
            }
            if !(0.0..=self.world_size).contains(&next.z) {
                walker.heading.z = -walker.heading.z;
                next.z = next.z.clamp(0.0, self.world_size);
            }
            walker.position = next;
            feed.moved(walker.id, next, WorldPartition::MAIN);
        }
    }
}

fn load_config(args: &SimulateArgs) -> anyhow::Result<StreamerConfig> {
    let mut config = match &args.config {
        Some(path) => StreamerConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => StreamerConfig::default(),
    };
    if let Some(budget) = args.budget {
        config.budget = budget;
    }
    if let Some(distance) = args.distance {
        config.streaming_distance = distance;
    }
    config.validate()?;
    Ok(config)
}

fn build_streamer(
    args: &SimulateArgs,
    config: &StreamerConfig,
    rng: &mut SplitMix,
    callbacks: Arc<AtomicUsize>,
) -> anyhow::Result<(Streamer<SimulatedBackend>, ObserverFeed)> {
    let backend = match args.engine_cap {
        Some(cap) => SimulatedBackend::with_capacity(cap),
        None => SimulatedBackend::new(),
    };
    let (feed, source) = observer_channel();
    let mut streamer = Streamer::new("vehicles", config, backend)?
        .with_observer_source(source)
        .with_synchronizer(move |_: InstanceKey, _: BackendHandle| {
            callbacks.fetch_add(1, Ordering::Relaxed);
        });

    for i in 0..args.entities {
        let position = Vec3::new(
            rng.next_unit() * args.world_size,
            0.0,
            rng.next_unit() * args.world_size,
        );
        let priority = if i < args.pinned {
            Priority::Always
        } else {
            Priority::Proximity
        };
        let model_id = 400 + (rng.next_u64() % 212) as u32;
        streamer.add_entity(EntityDefinition::new(model_id, position).with_priority(priority))?;
    }
    Ok((streamer, feed))
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let mut rng = SplitMix(args.seed);
    let callbacks = Arc::new(AtomicUsize::new(0));
    let (mut streamer, feed) = build_streamer(&args, &config, &mut rng, Arc::clone(&callbacks))?;
    let mut crowd = Crowd::new(args.observers, args.world_size, &mut rng);

    println!(
        "Simulating {} entities, {} observers: budget={}, distance={}, mode={:?}",
        args.entities, args.observers, config.budget, config.streaming_distance, config.mode
    );

    if args.realtime {
        let handle = SchedulerHandle::spawn(streamer);
        for _ in 0..args.ticks {
            crowd.step(&feed);
            tokio::time::sleep(config.tick_interval()).await;
        }
        handle.dispose();
        tracing::info!(ticks = args.ticks, "scheduler disposed");
        let stats = handle.stats().await;
        println!(
            "Scheduler: ticks={}, realized={}, avg_tick={:?}, max_tick={:?}",
            stats.ticks, stats.realized, stats.average_tick, stats.max_tick
        );
        let shared = handle.streamer();
        let streamer = shared.lock().await;
        print_backend(streamer.backend(), callbacks.load(Ordering::Relaxed));
        return Ok(());
    }

    for _ in 0..args.ticks {
        crowd.step(&feed);
        let report = streamer.tick().await;
        println!(
            "tick {:>4}: desired={:>5} +{:<4} -{:<4} failed={:<3} total={:>5} ({:?})",
            report.tick,
            report.desired,
            report.realized,
            report.derealized,
            report.failed_creates,
            report.realized_total,
            report.duration
        );
    }

    let stats = streamer.stats();
    println!(
        "Done: ticks={}, registered={}, realized={}, avg_tick={:?}, max_tick={:?}",
        stats.ticks, stats.registered, stats.realized, stats.average_tick, stats.max_tick
    );
    print_backend(streamer.backend(), callbacks.load(Ordering::Relaxed));
    Ok(())
}

fn print_backend(backend: &SimulatedBackend, callbacks: usize) {
    println!(
        "Backend: live={}, peak={}, creates={}, destroys={}, on_realized={}",
        backend.live_count(),
        backend.peak_live(),
        backend.create_calls(),
        backend.destroy_calls(),
        callbacks
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("streamer-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("engine: {}", streamer_engine::crate_info());
            println!("defaults: {:?}", StreamerConfig::default());
        }
        Commands::Simulate(args) => simulate(args).await?,
    }

    Ok(())
}
