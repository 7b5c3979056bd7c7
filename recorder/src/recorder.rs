//! The recorder proper: N position sources and M frame sources drained in
//! lock step by one reader loop, with a writer worker per frame source.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender, TrySendError};

use shmemdf::source::{FrameSource, Source};
use shmemdf::{Frame, NodeState, Position2D, SegmentConfig, ShmemDfError};

use crate::writer::{Encoder, FrameWriter, PositionWriter, RawEncoder};

/// Builds one encoder per frame source. Swappable so a real codec stack can
/// slot in behind the same recorder.
pub type EncoderFactory = Box<dyn Fn() -> Box<dyn Encoder>>;

/// Default bound of each per-source frame queue. Overrun is fatal, not a
/// silent drop: a queue this deep only fills when the disk cannot keep up.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

pub struct RecorderOptions {
    pub segment: SegmentConfig,
    pub save_dir: PathBuf,
    pub file_name: Option<String>,
    pub prepend_timestamp: bool,
    pub allow_overwrite: bool,
    pub queue_capacity: usize,
    /// Emit indeterminate position fields in every row for column-aligned
    /// post-processing.
    pub verbose_rows: bool,
    /// Builds one encoder per frame source; swap to put a real codec stack
    /// behind the recorder.
    pub encoder_factory: EncoderFactory,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        RecorderOptions {
            segment: SegmentConfig::default(),
            save_dir: PathBuf::from("."),
            file_name: None,
            prepend_timestamp: false,
            allow_overwrite: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            verbose_rows: false,
            encoder_factory: Box::new(|| Box::new(RawEncoder::new())),
        }
    }
}

struct FrameStream {
    address: String,
    source: FrameSource,
    queue: Option<Sender<Frame>>,
    writer: Option<FrameWriter>,
}

struct PositionStream {
    address: String,
    source: Source<Position2D>,
    latest: Position2D,
    write_number: u64,
    /// Whether this source yielded a sample in the current reader pass.
    fresh: bool,
}

/// Connects the configured sources, forwards every sample it receives and
/// never resamples. Recording can be toggled while the streams keep
/// draining, so upstream producers are never back-pressured by a pause.
pub struct Recorder {
    opts: RecorderOptions,
    frames: Vec<FrameStream>,
    positions: Vec<PositionStream>,
    position_writer: Option<PositionWriter>,
    record_on: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    sample_rate_hz: f64,
    source_eof: bool,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").finish_non_exhaustive()
    }
}

impl Recorder {
    pub fn new(
        opts: RecorderOptions,
        position_addresses: &[String],
        frame_addresses: &[String],
    ) -> Result<Recorder, ShmemDfError> {
        if position_addresses.is_empty() && frame_addresses.is_empty() {
            return Err(ShmemDfError::Config(
                "recorder needs at least one position or frame source".into(),
            ));
        }

        let positions = position_addresses
            .iter()
            .map(|addr| PositionStream {
                address: addr.clone(),
                source: Source::new(opts.segment.clone()),
                latest: Position2D::new(addr),
                write_number: 0,
                fresh: false,
            })
            .collect();

        let frames = frame_addresses
            .iter()
            .map(|addr| FrameStream {
                address: addr.clone(),
                source: FrameSource::new(opts.segment.clone()),
                queue: None,
                writer: None,
            })
            .collect();

        Ok(Recorder {
            opts,
            frames,
            positions,
            position_writer: None,
            record_on: Arc::new(AtomicBool::new(true)),
            running: Arc::new(AtomicBool::new(true)),
            sample_rate_hz: 0.0,
            source_eof: false,
        })
    }

    pub fn record_flag(&self) -> Arc<AtomicBool> {
        self.record_on.clone()
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Attach and connect every source, then reconcile their advertised
    /// sample rates: on disagreement the slowest rate wins for writer
    /// metadata, with a warning — samples themselves are never dropped.
    pub fn connect(&mut self) -> Result<(), ShmemDfError> {
        for fs in &mut self.frames {
            fs.source.touch(&fs.address)?;
        }
        for ps in &mut self.positions {
            ps.source.touch(&ps.address)?;
        }

        let mut period: f64 = -1.0;
        let mut consistent = true;
        for fs in &mut self.frames {
            fs.source.connect()?;
            let ts = fs.source.advertised_sample()?.period_sec();
            reconcile_period(&mut period, ts, &mut consistent);
        }
        for ps in &mut self.positions {
            ps.source.connect()?;
            let ts = ps.source.advertised_sample()?.period_sec();
            reconcile_period(&mut period, ts, &mut consistent);
        }

        self.sample_rate_hz = if period > 0.0 { 1.0 / period } else { 0.0 };
        if !consistent {
            log::warn!(
                "sample rates of sources are inconsistent; forcing synchronization at the \
                 slowest rate ({} Hz). Consider separate recorders per rate.",
                self.sample_rate_hz
            );
        }
        Ok(())
    }

    /// Create the output files and spawn one writer worker per frame source.
    pub fn initialize_recording(&mut self) -> Result<(), ShmemDfError> {
        let stamp = timestamp_secs();

        if !self.positions.is_empty() {
            let path = self.output_path("json", None, stamp)?;
            let sources: Vec<String> =
                self.positions.iter().map(|p| p.address.clone()).collect();
            self.position_writer = Some(PositionWriter::create(
                &path,
                self.sample_rate_hz,
                &sources,
                self.opts.verbose_rows,
            )?);
            log::info!("writing positions to {}", path.display());
        }

        let rate = self.sample_rate_hz;
        let capacity = self.opts.queue_capacity;
        let paths = self
            .frames
            .iter()
            .map(|fs| self.output_path("raw", Some(&fs.address), stamp))
            .collect::<Result<Vec<_>, _>>()?;
        for (fs, path) in self.frames.iter_mut().zip(paths) {
            let (tx, rx) = bounded::<Frame>(capacity);
            fs.queue = Some(tx);
            fs.writer = Some(FrameWriter::spawn(
                fs.address.clone(),
                path,
                rate,
                rx,
                (self.opts.encoder_factory)(),
                self.running.clone(),
            ));
        }
        Ok(())
    }

    /// Finish the current output files and start new ones using the
    /// configured folder and file-name options, without detaching from any
    /// source (the `new` record command).
    pub fn rotate(&mut self) -> Result<(), ShmemDfError> {
        for fs in &mut self.frames {
            drop(fs.queue.take());
            if let Some(w) = fs.writer.take() {
                let written = w.join()?;
                log::info!("'{}': {} frames written; rotating", fs.address, written);
            }
        }
        if let Some(w) = self.position_writer.take() {
            log::info!("{} position rows written; rotating", w.rows());
            w.finish()?;
        }
        self.initialize_recording()
    }

    fn output_path(
        &self,
        ext: &str,
        source: Option<&str>,
        stamp: u64,
    ) -> Result<PathBuf, ShmemDfError> {
        let mut base = String::new();
        if let Some(src) = source {
            base.push_str(src);
        }
        if let Some(name) = &self.opts.file_name {
            if !base.is_empty() {
                base.push('_');
            }
            base.push_str(name);
        }
        if base.is_empty() {
            base.push_str(
                self.positions
                    .first()
                    .map(|p| p.address.as_str())
                    .unwrap_or("recording"),
            );
        }
        let file = if self.opts.prepend_timestamp {
            format!("{}_{}.{}", stamp, base, ext)
        } else {
            format!("{}.{}", base, ext)
        };
        let path = self.opts.save_dir.join(file);
        if path.exists() && !self.opts.allow_overwrite {
            return Err(ShmemDfError::Config(format!(
                "output file {} exists (pass --overwrite to replace it)",
                path.display()
            )));
        }
        Ok(path)
    }

    /// One pass of the reader loop: drain one sample from every source.
    /// Returns `true` once any source reports end-of-stream.
    pub fn write_streams(&mut self) -> Result<bool, ShmemDfError> {
        let record_on = self.record_on.load(Ordering::SeqCst);

        for fs in &mut self.frames {
            if fs.source.wait()? == NodeState::End {
                self.source_eof = true;
                continue;
            }
            if record_on {
                let queue = fs.queue.as_ref().ok_or_else(|| {
                    ShmemDfError::Config("recording was never initialized".into())
                })?;
                let frame = fs.source.clone_frame()?;
                match queue.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        return Err(ShmemDfError::QueueOverrun {
                            addr: fs.address.clone(),
                            capacity: self.opts.queue_capacity,
                        });
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        return Err(ShmemDfError::Io(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            format!("frame writer for '{}' exited", fs.address),
                        )));
                    }
                }
            }
            fs.source.post()?;
        }

        for ps in &mut self.positions {
            ps.fresh = false;
            if ps.source.wait()? == NodeState::End {
                self.source_eof = true;
                continue;
            }
            let label_kept = ps.address.clone();
            ps.latest = ps.source.clone_value()?;
            // The label column identifies the stream, not whatever the
            // upstream component called itself.
            ps.latest.set_label(&label_kept);
            ps.write_number = ps.source.write_number();
            ps.fresh = true;
            ps.source.post()?;
        }

        // A sibling source hitting end-of-stream does not invalidate the
        // samples the others produced this pass; the row carries whichever
        // sources were fresh.
        if record_on {
            if let Some(w) = &mut self.position_writer {
                let row: Vec<(String, Position2D)> = self
                    .positions
                    .iter()
                    .filter(|p| p.fresh)
                    .map(|p| (p.address.clone(), p.latest))
                    .collect();
                if !row.is_empty() {
                    w.push_row(&row)?;
                }
            }
        }

        Ok(self.source_eof)
    }

    /// Stop the workers, flush the position epilogue and report totals.
    pub fn shutdown(mut self) -> Result<(), ShmemDfError> {
        self.running.store(false, Ordering::SeqCst);
        for fs in &mut self.frames {
            // Dropping the sender lets the worker drain and exit.
            drop(fs.queue.take());
            if let Some(w) = fs.writer.take() {
                let written = w.join()?;
                log::info!("'{}': {} frames written", fs.address, written);
            }
        }
        for ps in &self.positions {
            log::debug!(
                "'{}': last observed write number {}",
                ps.address,
                ps.write_number
            );
        }
        if let Some(w) = self.position_writer.take() {
            log::info!("{} position rows written", w.rows());
            w.finish()?;
        }
        Ok(())
    }
}

fn reconcile_period(period: &mut f64, ts: f64, consistent: &mut bool) {
    if *period < 0.0 {
        *period = ts;
    } else if (ts - *period).abs() > f64::EPSILON {
        *period = period.max(ts);
        *consistent = false;
    }
}

fn timestamp_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use shmemdf::sink::{FrameSink, Sink};
    use shmemdf::{PixelFormat, Point2D};

    fn test_segment_config() -> (SegmentConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            SegmentConfig {
                data_dir: dir.path().to_str().unwrap().to_owned(),
                attach_timeout_ms: 5_000,
            },
            dir,
        )
    }

    #[test]
    fn records_positions_and_frames_end_to_end() {
        let (seg_cfg, _seg_dir) = test_segment_config();
        let out_dir = tempfile::tempdir().unwrap();
        const SAMPLES: u64 = 20;

        let pos_addr = format!("rec-pos-{}", std::process::id());
        let frame_addr = format!("rec-frame-{}", std::process::id());

        // Producers bind first, then hold at the gate until the recorder
        // has attached, so the recorder observes the whole stream.
        let gate = Arc::new(Barrier::new(3));

        let pos_producer = {
            let cfg = seg_cfg.clone();
            let addr = pos_addr.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut sink = Sink::<shmemdf::Position2D>::new(cfg);
                sink.bind_with(&addr, 0, |p| p.sample_mut().set_rate_hz(200.0))
                    .unwrap();
                gate.wait();
                for i in 0..SAMPLES {
                    {
                        let p = sink.retrieve().unwrap();
                        p.position = Point2D {
                            x: i as f64,
                            y: 0.0,
                        };
                        p.position_valid = true;
                        p.sample_mut().increment(i * 5_000);
                    }
                    sink.post().unwrap();
                    sink.wait().unwrap();
                }
            })
        };

        let frame_producer = {
            let cfg = seg_cfg.clone();
            let addr = frame_addr.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut sink = FrameSink::new(cfg);
                sink.bind(&addr, 16, 16, PixelFormat::Gray8, 200.0).unwrap();
                gate.wait();
                for i in 0..SAMPLES {
                    sink.pixels_mut().unwrap().fill((i % 256) as u8);
                    sink.post().unwrap();
                    sink.wait().unwrap();
                }
            })
        };

        let opts = RecorderOptions {
            segment: seg_cfg,
            save_dir: out_dir.path().to_path_buf(),
            file_name: Some("run".into()),
            allow_overwrite: true,
            ..Default::default()
        };
        let mut recorder =
            Recorder::new(opts, &[pos_addr.clone()], &[frame_addr.clone()]).unwrap();
        recorder.connect().unwrap();
        assert!((recorder.sample_rate_hz() - 200.0).abs() < 1e-9);
        recorder.initialize_recording().unwrap();
        gate.wait();

        let mut eof = false;
        while !eof {
            eof = recorder.write_streams().unwrap();
        }
        recorder.shutdown().unwrap();
        pos_producer.join().unwrap();
        frame_producer.join().unwrap();

        let json_path = out_dir.path().join(format!("{}_run.json", pos_addr));
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        let rows = doc["positions"].as_array().unwrap();
        assert!(!rows.is_empty() && rows.len() as u64 <= SAMPLES);
        assert_eq!(rows[0][pos_addr.as_str()]["pos_ok"], true);

        let raw_path = out_dir.path().join(format!("{}_run.raw", frame_addr));
        let raw = std::fs::read(&raw_path).unwrap();
        assert!(raw.len() > 16 * 16, "raw file should hold at least one frame");
    }

    #[test]
    fn final_round_keeps_rows_from_live_sources() {
        let (seg_cfg, _seg_dir) = test_segment_config();
        let out_dir = tempfile::tempdir().unwrap();

        let addr_a = format!("rec-mixed-a-{}", std::process::id());
        let addr_b = format!("rec-mixed-b-{}", std::process::id());
        let gate = Arc::new(Barrier::new(3));

        // Source A ends after 3 samples; B keeps publishing past that.
        let producer_a = {
            let cfg = seg_cfg.clone();
            let addr = addr_a.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut sink = Sink::<Position2D>::new(cfg);
                sink.bind_with(&addr, 0, |p| p.sample_mut().set_rate_hz(100.0))
                    .unwrap();
                gate.wait();
                for i in 0..3u64 {
                    {
                        let p = sink.retrieve().unwrap();
                        p.position_valid = true;
                        p.position.x = i as f64;
                    }
                    sink.post().unwrap();
                    sink.wait().unwrap();
                }
            })
        };
        let producer_b = {
            let cfg = seg_cfg.clone();
            let addr = addr_b.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut sink = Sink::<Position2D>::new(cfg);
                sink.bind_with(&addr, 0, |p| p.sample_mut().set_rate_hz(100.0))
                    .unwrap();
                gate.wait();
                for i in 0..7u64 {
                    {
                        let p = sink.retrieve().unwrap();
                        p.position_valid = true;
                        p.position.x = i as f64;
                    }
                    sink.post().unwrap();
                    if sink.wait().unwrap() == NodeState::End {
                        break;
                    }
                }
            })
        };

        let opts = RecorderOptions {
            segment: seg_cfg,
            save_dir: out_dir.path().to_path_buf(),
            file_name: Some("mixed".into()),
            allow_overwrite: true,
            ..Default::default()
        };
        let mut recorder =
            Recorder::new(opts, &[addr_a.clone(), addr_b.clone()], &[]).unwrap();
        recorder.connect().unwrap();
        recorder.initialize_recording().unwrap();
        gate.wait();

        let mut eof = false;
        while !eof {
            eof = recorder.write_streams().unwrap();
        }
        recorder.shutdown().unwrap();
        producer_a.join().unwrap();
        producer_b.join().unwrap();

        let json_path = out_dir.path().join(format!("{}_mixed.json", addr_a));
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        let rows = doc["positions"].as_array().unwrap();
        // Three full rows, plus the round where A ended but B's fresh
        // sample must still be logged.
        assert_eq!(rows.len(), 4);
        assert!(rows[2].get(addr_a.as_str()).is_some());
        let last = rows.last().unwrap();
        assert!(last.get(addr_a.as_str()).is_none());
        assert_eq!(last[addr_b.as_str()]["pos_xy"][0], 3.0);
    }

    #[test]
    fn rotate_finishes_and_reopens_the_position_log() {
        let (seg_cfg, _seg_dir) = test_segment_config();
        let out_dir = tempfile::tempdir().unwrap();
        let addr = format!("rec-rotate-{}", std::process::id());
        let gate = Arc::new(Barrier::new(2));

        let producer = {
            let cfg = seg_cfg.clone();
            let addr = addr.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut sink = Sink::<Position2D>::new(cfg);
                sink.bind_with(&addr, 0, |p| p.sample_mut().set_rate_hz(100.0))
                    .unwrap();
                gate.wait();
                for i in 0..6u64 {
                    sink.retrieve().unwrap().position.x = i as f64;
                    sink.post().unwrap();
                    sink.wait().unwrap();
                }
            })
        };

        let opts = RecorderOptions {
            segment: seg_cfg,
            save_dir: out_dir.path().to_path_buf(),
            file_name: Some("rotating".into()),
            allow_overwrite: true,
            ..Default::default()
        };
        let mut recorder = Recorder::new(opts, &[addr.clone()], &[]).unwrap();
        recorder.connect().unwrap();
        recorder.initialize_recording().unwrap();
        gate.wait();

        for _ in 0..3 {
            assert!(!recorder.write_streams().unwrap());
        }
        // Same path with overwrite: the rotated-out file is replaced, and
        // the log must pick up cleanly with only the post-rotation rows.
        recorder.rotate().unwrap();
        let mut eof = false;
        while !eof {
            eof = recorder.write_streams().unwrap();
        }
        recorder.shutdown().unwrap();
        producer.join().unwrap();

        let json_path = out_dir.path().join(format!("{}_rotating.json", addr));
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        let rows = doc["positions"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][addr.as_str()]["tick"], 0);
    }

    struct StalledEncoder;

    impl Encoder for StalledEncoder {
        fn open(
            &mut self,
            _path: &Path,
            _width: u32,
            _height: u32,
            _format: PixelFormat,
            _rate_hz: f64,
        ) -> std::io::Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn write(&mut self, _frame: &Frame) -> std::io::Result<()> {
            // Models a wedged disk: each frame takes far longer than the
            // producer's period.
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        }
    }

    #[test]
    fn stalled_writer_raises_queue_overrun() {
        let (seg_cfg, _seg_dir) = test_segment_config();
        let out_dir = tempfile::tempdir().unwrap();
        let addr = format!("rec-overrun-{}", std::process::id());

        let gate = Arc::new(Barrier::new(2));
        let stop = Arc::new(AtomicBool::new(false));

        let producer = {
            let cfg = seg_cfg.clone();
            let addr = addr.clone();
            let gate = gate.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut sink = FrameSink::new(cfg);
                sink.bind(&addr, 8, 8, PixelFormat::Gray8, 1000.0).unwrap();
                gate.wait();
                // Unthrottled: the recorder's queue fills as soon as its
                // writer stalls.
                while !stop.load(Ordering::SeqCst) {
                    sink.post().unwrap();
                    if sink.wait().unwrap() == NodeState::End {
                        break;
                    }
                }
            })
        };

        let opts = RecorderOptions {
            segment: seg_cfg,
            save_dir: out_dir.path().to_path_buf(),
            allow_overwrite: true,
            queue_capacity: 16,
            ..Default::default()
        };
        let opts = RecorderOptions {
            encoder_factory: Box::new(|| Box::new(StalledEncoder)),
            ..opts
        };
        let mut recorder = Recorder::new(opts, &[], &[addr.clone()]).unwrap();
        recorder.connect().unwrap();
        recorder.initialize_recording().unwrap();
        gate.wait();

        let started = std::time::Instant::now();
        let err = loop {
            match recorder.write_streams() {
                Ok(false) => continue,
                Ok(true) => panic!("stream ended before the queue overran"),
                Err(e) => break e,
            }
        };
        match err {
            ShmemDfError::QueueOverrun { addr: a, capacity } => {
                assert_eq!(a, addr);
                assert_eq!(capacity, 16);
            }
            other => panic!("expected QueueOverrun, got {}", other),
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "overrun must surface in bounded time"
        );

        stop.store(true, Ordering::SeqCst);
        producer.join().unwrap();
    }

    #[test]
    fn slowest_rate_wins_on_disagreement() {
        let mut period = -1.0;
        let mut consistent = true;
        reconcile_period(&mut period, 0.01, &mut consistent);
        assert!(consistent);
        reconcile_period(&mut period, 0.01, &mut consistent);
        assert!(consistent);
        reconcile_period(&mut period, 0.04, &mut consistent);
        assert!(!consistent);
        assert_eq!(period, 0.04);
        // A faster source later never raises the effective rate back up.
        reconcile_period(&mut period, 0.002, &mut consistent);
        assert_eq!(period, 0.04);
    }

    #[test]
    fn recorder_requires_a_source() {
        let err = Recorder::new(RecorderOptions::default(), &[], &[]).unwrap_err();
        assert!(matches!(err, ShmemDfError::Config(_)));
    }

    #[test]
    fn output_paths_compose_source_name_and_stamp() {
        let opts = RecorderOptions {
            save_dir: PathBuf::from("/tmp/rec"),
            file_name: Some("run1".into()),
            prepend_timestamp: true,
            allow_overwrite: true,
            ..Default::default()
        };
        let rec = Recorder::new(opts, &["pos".to_owned()], &[]).unwrap();
        let p = rec.output_path("json", Some("cam0"), 1234).unwrap();
        assert_eq!(p, PathBuf::from("/tmp/rec/1234_cam0_run1.json"));
        let p = rec.output_path("json", None, 1234).unwrap();
        assert_eq!(p, PathBuf::from("/tmp/rec/1234_run1.json"));
    }
}
