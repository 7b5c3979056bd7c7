//! `posigen` — publish a synthetic position stream to a sink address.
//!
//! The one generator type, `rand2d`, integrates Gaussian random
//! accelerations inside a rectangular arena, which gives downstream filters
//! and recorders something kinematically plausible to chew on.

use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use shmemdf::config::load_config;
use shmemdf::{Point2D, Position2D, SegmentConfig, ShmemDfError, Sink};

#[derive(Parser, Debug)]
#[command(
    name = "posigen",
    version,
    about = "Serve a synthetic position stream to a position SINK"
)]
struct Opts {
    /// Generator type. `rand2d`: random-acceleration wander in a box.
    #[arg(value_name = "TYPE")]
    kind: String,

    /// Sink address to publish on.
    #[arg(value_name = "SINK")]
    sink: String,

    /// Samples per second.
    #[arg(short = 'r', long = "rate-hz", default_value_t = 100.0)]
    rate_hz: f64,

    /// Stop after this many samples; 0 runs until interrupted.
    #[arg(short = 'n', long = "num-samples", default_value_t = 0)]
    num_samples: u64,

    /// Arena width/height in pixels.
    #[arg(long = "arena", default_value_t = 512.0)]
    arena: f64,

    /// Standard deviation of the per-tick acceleration.
    #[arg(long = "sigma", default_value_t = 40.0)]
    sigma: f64,

    /// TOML configuration file.
    #[arg(short = 'c', long = "config-file")]
    config_file: Option<PathBuf>,

    /// Table inside the configuration file to read.
    #[arg(short = 'k', long = "config-key")]
    config_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    rate_hz: Option<f64>,
    arena: Option<f64>,
    sigma: Option<f64>,
    segment: SegmentConfig,
}

/// Random-acceleration 2D wander, reflected at the arena walls.
struct RandomAccel2D {
    position: Point2D,
    velocity: Point2D,
    accel: Normal<f64>,
    arena: f64,
    rng: StdRng,
}

impl RandomAccel2D {
    fn new(arena: f64, sigma: f64) -> Result<RandomAccel2D, ShmemDfError> {
        let accel = Normal::new(0.0, sigma).map_err(|_| {
            ShmemDfError::Config(format!("sigma must be finite and non-negative, got {}", sigma))
        })?;
        let mut rng = StdRng::from_entropy();
        Ok(RandomAccel2D {
            position: Point2D {
                x: rng.gen_range(0.0..arena),
                y: rng.gen_range(0.0..arena),
            },
            velocity: Point2D::default(),
            accel,
            arena,
            rng,
        })
    }

    fn step(&mut self, dt: f64) -> (Point2D, Point2D) {
        self.velocity.x += self.accel.sample(&mut self.rng) * dt;
        self.velocity.y += self.accel.sample(&mut self.rng) * dt;
        self.position.x += self.velocity.x * dt;
        self.position.y += self.velocity.y * dt;

        // A wanderer leaving the arena teleports to the opposite wall with
        // its velocity intact; reflection would oscillate endlessly once
        // the velocity grows past the arena per tick.
        for p in [&mut self.position.x, &mut self.position.y] {
            if *p < 0.0 {
                *p = self.arena;
            } else if *p > self.arena {
                *p = 0.0;
            }
        }
        (self.position, self.velocity)
    }
}

fn main() {
    env_logger::init();

    let opts = match Opts::try_parse() {
        Ok(o) => o,
        Err(e) => {
            if e.use_stderr() {
                e.print().ok();
                exit(-1);
            }
            e.print().ok();
            exit(0);
        }
    };

    if opts.kind != "rand2d" {
        eprintln!("posigen: unknown generator TYPE '{}' (try rand2d)", opts.kind);
        exit(-1);
    }

    let quit = Arc::new(AtomicBool::new(false));
    if signal_hook::flag::register(signal_hook::consts::SIGINT, quit.clone()).is_err() {
        eprintln!("posigen: cannot install signal handler");
        exit(1);
    }

    match run(opts, quit) {
        Ok(n) => {
            log::info!("published {} samples", n);
            exit(0);
        }
        Err(ShmemDfError::Config(msg)) => {
            eprintln!("posigen: {}", msg);
            exit(-1);
        }
        Err(e) => {
            eprintln!("posigen: {}", e);
            exit(1);
        }
    }
}

fn run(opts: Opts, quit: Arc<AtomicBool>) -> Result<u64, ShmemDfError> {
    let file_cfg = match &opts.config_file {
        Some(path) => load_config::<FileConfig>(path, opts.config_key.as_deref())?,
        None => FileConfig::default(),
    };
    let rate_hz = file_cfg.rate_hz.unwrap_or(opts.rate_hz);
    let arena = file_cfg.arena.unwrap_or(opts.arena);
    let sigma = file_cfg.sigma.unwrap_or(opts.sigma);
    if rate_hz <= 0.0 {
        return Err(ShmemDfError::Config(format!(
            "sample rate must be positive, got {}",
            rate_hz
        )));
    }

    let mut sink = Sink::<Position2D>::new(file_cfg.segment);
    let label = opts.sink.clone();
    sink.bind_with(&opts.sink, 0, |p| {
        p.set_label(&label);
        p.sample_mut().set_rate_hz(rate_hz);
    })?;
    log::info!(
        "serving rand2d positions on '{}' at {} Hz",
        opts.sink,
        rate_hz
    );

    let period = Duration::from_secs_f64(1.0 / rate_hz);
    let mut generator = RandomAccel2D::new(arena, sigma)?;
    let start = Instant::now();
    let mut next_tick = start + period;
    let mut published = 0u64;

    while !quit.load(Ordering::SeqCst) {
        if opts.num_samples > 0 && published >= opts.num_samples {
            break;
        }
        let (position, velocity) = generator.step(period.as_secs_f64());
        {
            let p = sink.retrieve()?;
            p.position = position;
            p.velocity = velocity;
            p.position_valid = true;
            p.velocity_valid = true;
            p.sample_mut()
                .increment(start.elapsed().as_micros() as u64);
        }
        sink.post()?;
        published += 1;
        if sink.wait()? == shmemdf::NodeState::End {
            break;
        }

        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }
        next_tick += period;
    }
    Ok(published)
}
