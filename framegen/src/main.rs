//! `framegen` — publish a synthetic test-pattern frame stream to a sink
//! address. Stands in for a camera server when exercising consumers.

use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Deserialize;

use shmemdf::config::load_config;
use shmemdf::{FrameSink, NodeState, PixelFormat, SegmentConfig, ShmemDfError};

#[derive(Parser, Debug)]
#[command(
    name = "framegen",
    version,
    about = "Serve a synthetic image stream to a frame SINK"
)]
struct Opts {
    /// Sink address to publish on.
    #[arg(value_name = "SINK")]
    sink: String,

    #[arg(long = "width", default_value_t = 640)]
    width: u32,

    #[arg(long = "height", default_value_t = 480)]
    height: u32,

    /// Pixel format: gray8 or bgr8.
    #[arg(long = "format", default_value = "gray8")]
    format: String,

    /// Frames per second.
    #[arg(short = 'r', long = "fps", default_value_t = 30.0)]
    fps: f64,

    /// Stop after this many frames; 0 runs until interrupted.
    #[arg(short = 'n', long = "num-frames", default_value_t = 0)]
    num_frames: u64,

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
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    segment: SegmentConfig,
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

    let quit = Arc::new(AtomicBool::new(false));
    if signal_hook::flag::register(signal_hook::consts::SIGINT, quit.clone()).is_err() {
        eprintln!("framegen: cannot install signal handler");
        exit(1);
    }

    match run(opts, quit) {
        Ok(n) => {
            log::info!("served {} frames", n);
            exit(0);
        }
        Err(ShmemDfError::Config(msg)) => {
            eprintln!("framegen: {}", msg);
            exit(-1);
        }
        Err(e) => {
            eprintln!("framegen: {}", e);
            exit(1);
        }
    }
}

fn run(opts: Opts, quit: Arc<AtomicBool>) -> Result<u64, ShmemDfError> {
    let file_cfg = match &opts.config_file {
        Some(path) => load_config::<FileConfig>(path, opts.config_key.as_deref())?,
        None => FileConfig::default(),
    };
    let width = file_cfg.width.unwrap_or(opts.width);
    let height = file_cfg.height.unwrap_or(opts.height);
    let fps = file_cfg.fps.unwrap_or(opts.fps);
    let format = match opts.format.as_str() {
        "gray8" => PixelFormat::Gray8,
        "bgr8" => PixelFormat::Bgr8,
        other => {
            return Err(ShmemDfError::Config(format!(
                "unknown pixel format '{}' (try gray8 or bgr8)",
                other
            )))
        }
    };
    if fps <= 0.0 {
        return Err(ShmemDfError::Config(format!(
            "frame rate must be positive, got {}",
            fps
        )));
    }

    let mut sink = FrameSink::new(file_cfg.segment);
    sink.bind(&opts.sink, width, height, format, fps)?;
    log::info!(
        "serving {}x{} {:?} frames on '{}' at {} fps",
        width,
        height,
        format,
        opts.sink,
        fps
    );

    let period = Duration::from_secs_f64(1.0 / fps);
    let start = Instant::now();
    let mut next_tick = start + period;
    let mut served = 0u64;

    while !quit.load(Ordering::SeqCst) {
        if opts.num_frames > 0 && served >= opts.num_frames {
            break;
        }
        fill_test_pattern(sink.pixels_mut()?, width, format, served);
        sink.header_mut()?
            .sample_mut()
            .increment(start.elapsed().as_micros() as u64);
        sink.post()?;
        served += 1;
        if sink.wait()? == NodeState::End {
            break;
        }

        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }
        next_tick += period;
    }
    Ok(served)
}

/// A moving diagonal gradient; pixel (0,0)'s first byte is the frame index
/// mod 256 so consumers can verify they missed nothing.
fn fill_test_pattern(pixels: &mut [u8], width: u32, format: PixelFormat, index: u64) {
    let bpp = format.bytes_per_pixel();
    let stride = width as usize * bpp;
    for (i, px) in pixels.chunks_exact_mut(bpp).enumerate() {
        let x = (i % (stride / bpp)) as u64;
        let y = (i / (stride / bpp)) as u64;
        let v = ((x + y + index) % 256) as u8;
        px.fill(v);
    }
    pixels[0] = (index % 256) as u8;
}
