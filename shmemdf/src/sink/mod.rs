//! Producer endpoints.
//!
//! A [`Sink`] is the unique producer for an address. Binding finds or
//! creates the segment, initializes the payload slot and marks the node
//! bound. [`FrameSink`] additionally sizes and stamps the pixel region so a
//! consumer's `connect` always observes valid frame geometry.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::time::Duration;

use shared_memory::ShmemError;

use crate::config::SegmentConfig;
use crate::core::{data_offset, payload_offset, segment_bytes, Segment};
use crate::datatypes::{FrameHeader, PixelFormat, SharedPayload};
use crate::node::{Node, NodeState, SinkState};
use crate::ShmemDfError;

/// Default bound on waiting for unresponsive consumers before the producer
/// reconciles and continues.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

struct BoundSegment {
    // Declaration order matters: the node handle goes before the mapping it
    // points into.
    node: Node,
    segment: Segment,
}

/// The unique producer endpoint for a segment.
pub struct Sink<T: SharedPayload> {
    cfg: SegmentConfig,
    bound: Option<BoundSegment>,
    stall_timeout: Duration,
    _payload: PhantomData<T>,
}

impl<T: SharedPayload> Sink<T> {
    pub fn new(cfg: SegmentConfig) -> Sink<T> {
        Sink {
            cfg,
            bound: None,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            _payload: PhantomData,
        }
    }

    /// See [`Node::wait_write`](crate::node::Node) — how long `wait` tolerates
    /// consumers that stopped posting before reconciling past them.
    pub fn set_stall_timeout(&mut self, timeout: Duration) {
        self.stall_timeout = timeout;
    }

    /// Bind this sink to `address`, creating the segment if needed.
    ///
    /// The segment is sized for the node, one `T` and `extra_bytes` of raw
    /// data. Fails with `AlreadyBound` if a live sink holds the address; a
    /// stale segment left by a previous run (no bound sink, no attached
    /// sources) is removed and recreated.
    pub fn bind(&mut self, address: &str, extra_bytes: usize) -> Result<(), ShmemDfError> {
        self.bind_with(address, extra_bytes, |_| {})
    }

    /// Bind, running `init` on the payload slot before the node is marked
    /// bound — anything `init` writes is visible to sources by the time
    /// their `connect` returns.
    pub fn bind_with(
        &mut self,
        address: &str,
        extra_bytes: usize,
        init: impl FnOnce(&mut T),
    ) -> Result<(), ShmemDfError> {
        if self.bound.is_some() {
            return Err(ShmemDfError::AlreadyBound(address.to_owned()));
        }
        if address.is_empty() {
            return Err(ShmemDfError::Config("empty segment address".into()));
        }

        let total = segment_bytes::<T>(extra_bytes);
        let mut init = Some(init);
        // One retry: first pass may find and clear a stale segment.
        for _ in 0..2 {
            match Segment::create(&self.cfg, address, total) {
                Ok(segment) => {
                    let node = Node::create(
                        &segment,
                        T::TYPE_TAG,
                        mem::size_of::<T>() as u64,
                        extra_bytes as u64,
                    )?;
                    let obj = payload_ptr::<T>(&segment);
                    unsafe {
                        ptr::write(obj, T::placement_default());
                        if let Some(f) = init.take() {
                            f(&mut *obj);
                        }
                    }
                    node.set_sink_state(SinkState::Bound)?;
                    log::info!("sink bound to '{}' ({} bytes)", address, total);
                    self.bound = Some(BoundSegment { node, segment });
                    return Ok(());
                }
                Err(ShmemDfError::SharedMemory(ShmemError::LinkExists)) => {
                    match Segment::open(&self.cfg, address)? {
                        Some(mut segment) => {
                            let node = Node::open(&segment)?;
                            if node.sink_state() == SinkState::Bound
                                || node.source_ref_count() > 0
                            {
                                return Err(ShmemDfError::AlreadyBound(address.to_owned()));
                            }
                            // Stale leftover from a previous run: remove and
                            // recreate on the next pass.
                            log::warn!(
                                "sink '{}': removing stale segment from a previous run",
                                address
                            );
                            segment.mark_remove_on_drop();
                            drop(node);
                            drop(segment);
                        }
                        // The link vanished between create and open; retry.
                        None => {}
                    }
                }
                Err(ShmemDfError::SegmentGone(_)) => {
                    crate::core::remove_dangling_link(&self.cfg, address)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ShmemDfError::AlreadyBound(address.to_owned()))
    }

    fn bound(&self) -> Result<&BoundSegment, ShmemDfError> {
        self.bound
            .as_ref()
            .ok_or_else(|| ShmemDfError::NotBound("(unbound sink)".into()))
    }

    /// Exclusive reference for in-place sample population. Valid whenever
    /// the previous `wait` has completed (always, before the first post).
    pub fn retrieve(&mut self) -> Result<&mut T, ShmemDfError> {
        let st = self
            .bound
            .as_ref()
            .ok_or_else(|| ShmemDfError::NotBound("(unbound sink)".into()))?;
        Ok(unsafe { &mut *payload_ptr::<T>(&st.segment) })
    }

    /// Publish the current sample to every attached consumer.
    pub fn post(&mut self) -> Result<u64, ShmemDfError> {
        self.bound()?.node.publish()
    }

    /// Block until all consumers of the last sample have read it. Returns
    /// immediately when the sample had no audience.
    pub fn wait(&mut self) -> Result<NodeState, ShmemDfError> {
        self.bound()?.node.wait_write(self.stall_timeout)
    }

    pub fn write_number(&self) -> u64 {
        self.bound.as_ref().map(|b| b.node.write_number()).unwrap_or(0)
    }

    pub fn source_ref_count(&self) -> u16 {
        self.bound
            .as_ref()
            .map(|b| b.node.source_ref_count())
            .unwrap_or(0)
    }

    pub(crate) fn segment(&self) -> Result<&Segment, ShmemDfError> {
        Ok(&self.bound()?.segment)
    }
}

impl<T: SharedPayload> Drop for Sink<T> {
    fn drop(&mut self) {
        if let Some(mut st) = self.bound.take() {
            if st.node.end_stream().is_err() {
                log::warn!(
                    "sink '{}': failed to signal end-of-stream",
                    st.segment.address()
                );
            }
            let remaining = st.node.source_ref_count();
            if remaining == 0 {
                st.segment.mark_remove_on_drop();
            } else {
                log::debug!(
                    "sink '{}': leaving segment for {} draining source(s)",
                    st.segment.address(),
                    remaining
                );
            }
        }
    }
}

fn payload_ptr<T: SharedPayload>(segment: &Segment) -> *mut T {
    unsafe { segment.base_ptr().add(payload_offset::<T>()) as *mut T }
}

/// Producer endpoint for frame streams.
///
/// Owns a pixel region inside the segment sized `width × height ×
/// bytes_per_pixel`; the header's offset handle points at it. Frame
/// dimensions are fixed for the segment's lifetime.
pub struct FrameSink {
    inner: Sink<FrameHeader>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl FrameSink {
    pub fn new(cfg: SegmentConfig) -> FrameSink {
        FrameSink {
            inner: Sink::new(cfg),
            width: 0,
            height: 0,
            format: PixelFormat::Gray8,
        }
    }

    pub fn set_stall_timeout(&mut self, timeout: Duration) {
        self.inner.set_stall_timeout(timeout);
    }

    pub fn bind(
        &mut self,
        address: &str,
        width: u32,
        height: u32,
        format: PixelFormat,
        rate_hz: f64,
    ) -> Result<(), ShmemDfError> {
        let extra = width as usize * height as usize * format.bytes_per_pixel();
        if extra == 0 {
            return Err(ShmemDfError::Config(format!(
                "frame sink '{}': zero-sized frame geometry {}x{}",
                address, width, height
            )));
        }
        self.inner.bind_with(address, extra, |hdr| {
            hdr.set_geometry(width, height, format, data_offset::<FrameHeader>() as u64);
            if rate_hz > 0.0 {
                hdr.sample_mut().set_rate_hz(rate_hz);
            }
        })?;
        self.width = width;
        self.height = height;
        self.format = format;
        Ok(())
    }

    pub fn header_mut(&mut self) -> Result<&mut FrameHeader, ShmemDfError> {
        self.inner.retrieve()
    }

    /// The mutable pixel span. Safe to write between a completed `wait` and
    /// the next `post`, like the header itself.
    pub fn pixels_mut(&mut self) -> Result<&mut [u8], ShmemDfError> {
        let len = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        let segment = self.inner.segment()?;
        let base = unsafe { segment.base_ptr().add(data_offset::<FrameHeader>()) };
        Ok(unsafe { std::slice::from_raw_parts_mut(base, len) })
    }

    pub fn post(&mut self) -> Result<u64, ShmemDfError> {
        self.inner.post()
    }

    pub fn wait(&mut self) -> Result<NodeState, ShmemDfError> {
        self.inner.wait()
    }

    pub fn write_number(&self) -> u64 {
        self.inner.write_number()
    }

    pub fn source_ref_count(&self) -> u16 {
        self.inner.source_ref_count()
    }
}
