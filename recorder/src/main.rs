//! `record` — drain any number of position and frame streams into files.
//!
//! The main thread owns every source and runs the lock-step reader loop; one
//! writer thread per frame source drains its bounded queue. Ctrl-C and
//! upstream end-of-stream both unwind through the same graceful path.

mod recorder;
mod writer;

use std::io::BufRead;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;

use shmemdf::config::load_config;
use shmemdf::{SegmentConfig, ShmemDfError};

use crate::recorder::{Recorder, RecorderOptions, DEFAULT_QUEUE_CAPACITY};

#[derive(Parser, Debug)]
#[command(
    name = "record",
    version,
    about = "Record position and frame streams from shared-memory sources",
    after_help = "COMMANDS (stdin while running):\n  \
                  start   resume recording\n  \
                  pause   keep draining sources but stop writing\n  \
                  new     finish the current files and start new ones\n  \
                  quit    finish files and exit\n  \
                  help    print this list"
)]
struct Opts {
    /// Position source address (repeatable).
    #[arg(short = 'p', long = "position-source")]
    position_sources: Vec<String>,

    /// Frame source address (repeatable).
    #[arg(short = 'f', long = "frame-source")]
    frame_sources: Vec<String>,

    /// Directory to write output files into.
    #[arg(short = 'd', long = "save-dir", default_value = ".")]
    save_dir: PathBuf,

    /// Base name for output files; source addresses are prepended.
    #[arg(short = 'n', long = "file-name")]
    file_name: Option<String>,

    /// Prepend a timestamp to output file names.
    #[arg(long = "timestamp")]
    prepend_timestamp: bool,

    /// Overwrite existing output files.
    #[arg(long = "overwrite")]
    allow_overwrite: bool,

    /// Start with recording paused; resume with `start` on stdin.
    #[arg(long = "paused")]
    paused: bool,

    /// Bound of each per-frame-source queue.
    #[arg(short = 'q', long = "queue-capacity", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Emit indeterminate position fields in every row.
    #[arg(long = "verbose-rows")]
    verbose_rows: bool,

    /// TOML configuration file.
    #[arg(short = 'c', long = "config-file")]
    config_file: Option<PathBuf>,

    /// Table inside the configuration file to read.
    #[arg(short = 'k', long = "config-key")]
    config_key: Option<String>,
}

/// File-side mirror of the CLI options; any field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    position_sources: Vec<String>,
    frame_sources: Vec<String>,
    save_dir: Option<PathBuf>,
    file_name: Option<String>,
    prepend_timestamp: Option<bool>,
    allow_overwrite: Option<bool>,
    queue_capacity: Option<usize>,
    verbose_rows: Option<bool>,
    segment: SegmentConfig,
}

fn main() {
    env_logger::init();

    let opts = match Opts::try_parse() {
        Ok(o) => o,
        Err(e) => {
            // Help and version are informational exits, not usage errors.
            if e.use_stderr() {
                e.print().ok();
                exit(-1);
            }
            e.print().ok();
            exit(0);
        }
    };

    let quit = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, quit.clone()) {
        eprintln!("record: cannot install signal handler: {}", e);
        exit(1);
    }
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, quit.clone());

    match run(opts, quit) {
        Ok(()) => exit(0),
        Err(ShmemDfError::Config(msg)) => {
            eprintln!("record: {}", msg);
            exit(-1);
        }
        Err(e) => {
            eprintln!("record: {}", e);
            exit(1);
        }
    }
}

fn run(opts: Opts, quit: Arc<AtomicBool>) -> Result<(), ShmemDfError> {
    let file_cfg = match &opts.config_file {
        Some(path) => load_config::<FileConfig>(path, opts.config_key.as_deref())?,
        None => FileConfig::default(),
    };

    let mut position_sources = file_cfg.position_sources.clone();
    position_sources.extend(opts.position_sources.iter().cloned());
    let mut frame_sources = file_cfg.frame_sources.clone();
    frame_sources.extend(opts.frame_sources.iter().cloned());

    let options = RecorderOptions {
        segment: file_cfg.segment.clone(),
        save_dir: file_cfg.save_dir.unwrap_or(opts.save_dir),
        file_name: opts.file_name.or(file_cfg.file_name),
        prepend_timestamp: opts.prepend_timestamp
            || file_cfg.prepend_timestamp.unwrap_or(false),
        allow_overwrite: opts.allow_overwrite || file_cfg.allow_overwrite.unwrap_or(false),
        queue_capacity: file_cfg.queue_capacity.unwrap_or(opts.queue_capacity),
        verbose_rows: opts.verbose_rows || file_cfg.verbose_rows.unwrap_or(false),
        ..Default::default()
    };

    let mut recorder = Recorder::new(options, &position_sources, &frame_sources)?;
    let record_on = recorder.record_flag();
    record_on.store(!opts.paused, Ordering::SeqCst);

    let rotate = Arc::new(AtomicBool::new(false));
    spawn_control_thread(record_on, rotate.clone(), quit.clone());

    log::info!(
        "connecting to {} position and {} frame source(s)",
        position_sources.len(),
        frame_sources.len()
    );
    recorder.connect()?;
    log::info!("effective sample rate: {} Hz", recorder.sample_rate_hz());
    recorder.initialize_recording()?;

    let mut eof = false;
    while !quit.load(Ordering::SeqCst) && !eof {
        if rotate.swap(false, Ordering::SeqCst) {
            recorder.rotate()?;
        }
        eof = recorder.write_streams()?;
    }
    if eof {
        log::info!("upstream end-of-stream");
    } else {
        log::info!("interrupted; shutting down");
    }
    recorder.shutdown()
}

/// Interactive record control on stdin. The thread is detached: it parks in
/// `read_line` and dies with the process.
fn spawn_control_thread(
    record_on: Arc<AtomicBool>,
    rotate: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
) {
    std::thread::Builder::new()
        .name("record-control".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(_) => break,
                };
                match line.trim() {
                    "start" => {
                        record_on.store(true, Ordering::SeqCst);
                        println!("recording");
                    }
                    "pause" => {
                        record_on.store(false, Ordering::SeqCst);
                        println!("paused (sources still draining)");
                    }
                    "new" => {
                        rotate.store(true, Ordering::SeqCst);
                        println!("starting new output files");
                    }
                    "quit" => {
                        quit.store(true, Ordering::SeqCst);
                        break;
                    }
                    "help" => {
                        println!("commands: start pause new quit help");
                    }
                    "" => {}
                    other => println!("unknown command '{}'; try help", other),
                }
            }
        })
        .ok();
}
