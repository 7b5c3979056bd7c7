//! File writers fed by the recorder's main loop.
//!
//! Frame writing runs off the sample clock: the main loop clones frames into
//! a bounded queue and a worker thread per frame source drains it into an
//! [`Encoder`]. Position rows are written inline by the main loop, one JSON
//! object per row, flushed per row so a killed process truncates at most the
//! last record.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde_json::json;

use shmemdf::{Frame, PixelFormat, Position2D};

/// Sink for encoded video. The real encoder is an external collaborator;
/// implementations only need lazy open-on-first-frame semantics.
pub trait Encoder: Send {
    fn open(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        format: PixelFormat,
        rate_hz: f64,
    ) -> io::Result<()>;

    fn is_open(&self) -> bool;

    fn write(&mut self, frame: &Frame) -> io::Result<()>;
}

/// Stand-in encoder appending raw pixel data behind a one-line header.
/// Keeps the recorder exercisable without a codec stack.
pub struct RawEncoder {
    out: Option<BufWriter<File>>,
}

impl RawEncoder {
    pub fn new() -> RawEncoder {
        RawEncoder { out: None }
    }
}

impl Default for RawEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for RawEncoder {
    fn open(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        format: PixelFormat,
        rate_hz: f64,
    ) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "rawvideo {}x{} {:?} {} fps", width, height, format, rate_hz)?;
        self.out = Some(out);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.out.is_some()
    }

    fn write(&mut self, frame: &Frame) -> io::Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "encoder not opened"))?;
        out.write_all(&frame.data)
    }
}

/// Worker thread draining one frame source's queue into its encoder.
pub struct FrameWriter {
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl FrameWriter {
    /// Spawn the writer for one frame source. The encoder opens lazily on
    /// the first drained frame, using that frame's geometry and the
    /// recorder's effective sample rate.
    pub fn spawn(
        name: String,
        path: PathBuf,
        rate_hz: f64,
        rx: Receiver<Frame>,
        mut encoder: Box<dyn Encoder>,
        running: Arc<AtomicBool>,
    ) -> FrameWriter {
        let handle = std::thread::Builder::new()
            .name(format!("frame-writer-{}", name))
            .spawn(move || -> io::Result<u64> {
                let mut written = 0u64;
                loop {
                    match rx.recv_timeout(Duration::from_millis(10)) {
                        Ok(frame) => {
                            if !encoder.is_open() {
                                encoder.open(
                                    &path,
                                    frame.width,
                                    frame.height,
                                    frame.format,
                                    rate_hz,
                                )?;
                                log::info!(
                                    "writing '{}' frames to {} ({}x{} @ {} Hz)",
                                    name,
                                    path.display(),
                                    frame.width,
                                    frame.height,
                                    rate_hz
                                );
                            }
                            encoder.write(&frame)?;
                            written += 1;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if !running.load(Ordering::SeqCst) && rx.is_empty() {
                                return Ok(written);
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => return Ok(written),
                    }
                }
            })
            .expect("spawn frame writer");
        FrameWriter {
            handle: Some(handle),
        }
    }

    /// Join the worker, returning how many frames it wrote.
    pub fn join(mut self) -> io::Result<u64> {
        match self.handle.take() {
            Some(h) => h.join().unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::Other, "frame writer panicked"))
            }),
            None => Ok(0),
        }
    }
}

/// Streaming position log: a JSON prologue, one row object per sample line,
/// and an epilogue written at shutdown.
pub struct PositionWriter {
    out: BufWriter<File>,
    rows: u64,
    verbose: bool,
}

impl PositionWriter {
    pub fn create(
        path: &Path,
        sample_rate_hz: f64,
        sources: &[String],
        verbose: bool,
    ) -> io::Result<PositionWriter> {
        let mut out = BufWriter::new(File::create(path)?);
        let header = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "header": {
                "date_unix": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                "sample_rate_hz": sample_rate_hz,
                "position_sources": sources,
            }
        });
        // Open the surrounding object by hand so rows can stream out below
        // it; a truncated file is still recoverable line-by-line.
        let header_text = serde_json::to_string(&header)?;
        // Strip the closing brace to keep the object open for "positions".
        write!(out, "{},\n\"positions\": [\n", &header_text[..header_text.len() - 1])?;
        out.flush()?;
        Ok(PositionWriter {
            out,
            rows: 0,
            verbose,
        })
    }

    /// Append one row: every position source's current sample, keyed by
    /// source address.
    pub fn push_row(&mut self, labeled: &[(String, Position2D)]) -> io::Result<()> {
        let mut row = serde_json::Map::new();
        for (label, p) in labeled {
            row.insert(label.clone(), p.to_json(self.verbose));
        }
        if self.rows > 0 {
            self.out.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.out, &serde_json::Value::Object(row))?;
        self.out.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.write_epilogue()
    }

    fn write_epilogue(&mut self) -> io::Result<()> {
        self.out.write_all(b"\n]}\n")?;
        self.out.flush()
    }
}
