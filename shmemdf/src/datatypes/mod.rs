//! Fixed-layout value types placed in shared memory, plus their
//! process-private owned counterparts.
//!
//! Everything here is `repr(C)` and `Copy` with no interior pointers, so a
//! payload reads identically in every process mapping the segment. The one
//! indirection — a frame's pixel buffer — is an intra-segment offset handle,
//! never a host address.

use serde_json::json;

/// Marker for types that may occupy a segment's payload slot.
///
/// Implementors are `repr(C)` and self-contained; the tag is recorded in the
/// node header at segment creation and checked by every attacher.
pub trait SharedPayload: Copy + 'static {
    /// Distinguishes payload types sharing an address by accident.
    const TYPE_TAG: u64;

    /// The value placed in the slot when the segment is created, before the
    /// producer's first sample.
    fn placement_default() -> Self;

    /// Sample metadata carried by every payload.
    fn sample(&self) -> &Sample;
}

/// Per-sample metadata: sequence count, wall-clock offset and nominal period.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    count: u64,
    usec: u64,
    period_sec: f64,
}

impl Sample {
    pub fn set_rate_hz(&mut self, rate_hz: f64) {
        debug_assert!(rate_hz > 0.0);
        self.period_sec = 1.0 / rate_hz;
    }

    pub fn rate_hz(&self) -> f64 {
        if self.period_sec > 0.0 {
            1.0 / self.period_sec
        } else {
            0.0
        }
    }

    pub fn period_sec(&self) -> f64 {
        self.period_sec
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn usec(&self) -> u64 {
        self.usec
    }

    /// Advance to the next sample at `usec` microseconds since stream start.
    pub fn increment(&mut self, usec: u64) {
        self.count += 1;
        self.usec = usec;
    }
}

/// A 2D point or vector.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

/// Unit of length a position is measured in.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceUnit {
    /// Measured in pixels; origin upper left.
    Pixels = 0,
    /// Measured in world units via a homography applied upstream.
    World = 1,
}

impl From<u32> for DistanceUnit {
    fn from(v: u32) -> Self {
        match v {
            1 => DistanceUnit::World,
            _ => DistanceUnit::Pixels,
        }
    }
}

pub const POSITION_LABEL_LEN: usize = 100;
pub const POSITION_REGION_LEN: usize = 10;

/// A tracked 2D position sample.
///
/// Validity flags qualify each kinematic field: a detector that lost its
/// target publishes a sample with `position_valid = false` rather than
/// skipping the tick, keeping every stream in lock step.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Position2D {
    label: [u8; POSITION_LABEL_LEN],
    unit_of_length: u32,
    sample: Sample,

    pub position_valid: bool,
    pub velocity_valid: bool,
    pub heading_valid: bool,
    pub region_valid: bool,

    pub position: Point2D,
    pub velocity: Point2D,
    pub heading: Point2D,

    /// Categorical position label (e.g. a named region of the arena).
    region: [u8; POSITION_REGION_LEN],
}

impl Position2D {
    pub fn new(label: &str) -> Position2D {
        let mut p = Self::placement_default();
        p.set_label(label);
        p
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = [0; POSITION_LABEL_LEN];
        let n = label.len().min(POSITION_LABEL_LEN - 1);
        self.label[..n].copy_from_slice(&label.as_bytes()[..n]);
    }

    pub fn label(&self) -> &str {
        str_from_fixed(&self.label)
    }

    pub fn set_region(&mut self, region: &str) {
        self.region = [0; POSITION_REGION_LEN];
        let n = region.len().min(POSITION_REGION_LEN - 1);
        self.region[..n].copy_from_slice(&region.as_bytes()[..n]);
        self.region_valid = !region.is_empty();
    }

    pub fn region(&self) -> &str {
        str_from_fixed(&self.region)
    }

    pub fn unit_of_length(&self) -> DistanceUnit {
        self.unit_of_length.into()
    }

    pub fn set_unit_of_length(&mut self, unit: DistanceUnit) {
        self.unit_of_length = unit as u32;
    }

    pub fn sample_mut(&mut self) -> &mut Sample {
        &mut self.sample
    }

    /// Serialize one sample row.
    ///
    /// With `verbose`, indeterminate fields are emitted anyway (flagged
    /// invalid) so post-processing can align samples column-wise.
    pub fn to_json(&self, verbose: bool) -> serde_json::Value {
        let mut row = serde_json::Map::new();
        row.insert("tick".into(), json!(self.sample.count()));
        row.insert("usec".into(), json!(self.sample.usec()));
        row.insert("unit".into(), json!(self.unit_of_length));
        row.insert("pos_ok".into(), json!(self.position_valid));
        if self.position_valid || verbose {
            row.insert("pos_xy".into(), json!([self.position.x, self.position.y]));
        }
        row.insert("vel_ok".into(), json!(self.velocity_valid));
        if self.velocity_valid || verbose {
            row.insert("vel_xy".into(), json!([self.velocity.x, self.velocity.y]));
        }
        row.insert("head_ok".into(), json!(self.heading_valid));
        if self.heading_valid || verbose {
            row.insert("head_xy".into(), json!([self.heading.x, self.heading.y]));
        }
        row.insert("reg_ok".into(), json!(self.region_valid));
        if self.region_valid || verbose {
            row.insert("reg".into(), json!(self.region()));
        }
        serde_json::Value::Object(row)
    }
}

impl SharedPayload for Position2D {
    const TYPE_TAG: u64 = 0x706f_7332_6400_0001;

    fn placement_default() -> Self {
        Position2D {
            label: [0; POSITION_LABEL_LEN],
            unit_of_length: DistanceUnit::Pixels as u32,
            sample: Sample::default(),
            position_valid: false,
            velocity_valid: false,
            heading_valid: false,
            region_valid: false,
            position: Point2D::default(),
            velocity: Point2D::default(),
            heading: Point2D::default(),
            region: [0; POSITION_REGION_LEN],
        }
    }

    fn sample(&self) -> &Sample {
        &self.sample
    }
}

impl std::fmt::Debug for Position2D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Position2D")
            .field("label", &self.label())
            .field("tick", &self.sample.count())
            .field("position_valid", &self.position_valid)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

fn str_from_fixed(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Pixel layout of a frame stream.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8 = 0,
    Bgr8 = 1,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgr8 => 3,
        }
    }
}

impl From<u32> for PixelFormat {
    fn from(v: u32) -> Self {
        match v {
            1 => PixelFormat::Bgr8,
            _ => PixelFormat::Gray8,
        }
    }
}

/// Shared descriptor of a frame whose pixels live in the same segment.
///
/// `data_handle` is a byte offset from the segment base; each process
/// resolves it against its own mapping, so the header never carries a host
/// pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    format: u32,
    data_handle: u64,
    sample: Sample,
}

impl FrameHeader {
    pub fn format(&self) -> PixelFormat {
        self.format.into()
    }

    pub(crate) fn set_geometry(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        data_handle: u64,
    ) {
        self.width = width;
        self.height = height;
        self.format = format as u32;
        self.data_handle = data_handle;
    }

    pub(crate) fn data_handle(&self) -> u64 {
        self.data_handle
    }

    pub fn data_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format().bytes_per_pixel()
    }

    pub fn sample_mut(&mut self) -> &mut Sample {
        &mut self.sample
    }
}

impl SharedPayload for FrameHeader {
    const TYPE_TAG: u64 = 0x6672_616d_6500_0001;

    fn placement_default() -> Self {
        FrameHeader {
            width: 0,
            height: 0,
            format: PixelFormat::Gray8 as u32,
            data_handle: 0,
            sample: Sample::default(),
        }
    }

    fn sample(&self) -> &Sample {
        &self.sample
    }
}

/// A process-private deep copy of one frame sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sample: Sample,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let off = (y as usize * self.width as usize + x as usize) * bpp;
        &self.data[off..off + bpp]
    }
}
