//! Consumer endpoints.
//!
//! A [`Source`] attaches to an address, claims a consumer slot on the node
//! and participates in the barrier cycle. [`FrameSource`] additionally
//! materializes a non-owning view over the segment's pixel region from the
//! header's offset handle.

use std::marker::PhantomData;
use std::mem;
use std::time::Instant;

use crate::config::SegmentConfig;
use crate::core::{payload_offset, Segment};
use crate::datatypes::{Frame, FrameHeader, PixelFormat, Sample, SharedPayload};
use crate::node::{Node, NodeState, SinkState, POLL_PERIOD};
use crate::ShmemDfError;

struct AttachedSegment {
    node: Node,
    segment: Segment,
    slot: usize,
}

/// A consumer endpoint. Several may attach to the same address; each gets
/// its own barrier slot and observes every sample published after it
/// attached, in order, exactly once.
pub struct Source<T: SharedPayload> {
    cfg: SegmentConfig,
    address: String,
    attached: Option<AttachedSegment>,
    connected: bool,
    /// Write number of the newest sample this source has observed.
    read_number: u64,
    /// True between a successful `wait` and the matching `post`: the window
    /// in which `retrieve`/`clone_value` are defined.
    in_sample: bool,
    _payload: PhantomData<T>,
}

impl<T: SharedPayload> Source<T> {
    pub fn new(cfg: SegmentConfig) -> Source<T> {
        Source {
            cfg,
            address: String::new(),
            attached: None,
            connected: false,
            read_number: 0,
            in_sample: false,
            _payload: PhantomData,
        }
    }

    /// Attach to the segment at `address`, claiming a consumer slot.
    ///
    /// Only producers create segments (a consumer cannot size the data
    /// region), so this polls at the node period until the segment appears,
    /// bounded by the configured attach timeout.
    pub fn touch(&mut self, address: &str) -> Result<(), ShmemDfError> {
        if self.attached.is_some() {
            return Err(ShmemDfError::Config(format!(
                "source already attached to '{}'",
                self.address
            )));
        }
        self.address = address.to_owned();
        let deadline = self.cfg.attach_deadline().map(|d| Instant::now() + d);
        loop {
            match Segment::open(&self.cfg, address) {
                Ok(Some(segment)) => {
                    let node = Node::open(&segment)?;
                    node.verify_payload(T::TYPE_TAG, mem::size_of::<T>() as u64)?;
                    let slot = node.increment_source_ref_count()?;
                    log::debug!("source attached to '{}' (slot {})", address, slot);
                    self.attached = Some(AttachedSegment {
                        node,
                        segment,
                        slot,
                    });
                    return Ok(());
                }
                // Not created yet, or a dangling link the producer will
                // clear on bind: keep polling.
                Ok(None) | Err(ShmemDfError::SegmentGone(_)) => {}
                Err(e) => return Err(e),
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(ShmemDfError::SegmentGone(address.to_owned()));
                }
            }
            std::thread::sleep(POLL_PERIOD);
        }
    }

    /// Block until the producer has bound the node (so the payload header is
    /// populated), bounded by the configured attach timeout.
    pub fn connect(&mut self) -> Result<(), ShmemDfError> {
        let st = self.attached()?;
        let deadline = self.cfg.attach_deadline().map(|d| Instant::now() + d);
        loop {
            match st.node.sink_state() {
                SinkState::Bound | SinkState::End => break,
                SinkState::Undefined => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Err(ShmemDfError::NotBound(self.address.clone()));
                        }
                    }
                    std::thread::sleep(POLL_PERIOD);
                }
            }
        }
        self.connected = true;
        Ok(())
    }

    fn attached(&self) -> Result<&AttachedSegment, ShmemDfError> {
        self.attached
            .as_ref()
            .ok_or_else(|| ShmemDfError::NotBound(self.address.clone()))
    }

    /// Block until the producer posts the next sample. On `Ok`, the caller
    /// holds read access to the sample until it calls [`post`](Self::post).
    pub fn wait(&mut self) -> Result<NodeState, ShmemDfError> {
        debug_assert!(self.connected, "wait() before connect()");
        debug_assert!(!self.in_sample, "wait() without post() for previous sample");
        let st = self.attached()?;
        let (state, wn) = st.node.wait_read(st.slot, self.read_number)?;
        if state == NodeState::Ok {
            self.read_number = wn;
            self.in_sample = true;
        }
        Ok(state)
    }

    /// The current sample. Defined only between `wait` and `post`; the
    /// reference is stable for that window.
    pub fn retrieve(&self) -> Result<&T, ShmemDfError> {
        debug_assert!(self.in_sample, "retrieve() outside wait()/post() window");
        let st = self.attached()?;
        Ok(unsafe { &*(payload_slot::<T>(&st.segment)) })
    }

    /// Deep-copy the current sample into process-private memory.
    pub fn clone_value(&self) -> Result<T, ShmemDfError> {
        Ok(*self.retrieve()?)
    }

    /// Metadata stamped by the producer at bind time (rate, etc.).
    /// Readable once `connect` has returned, before the first sample.
    pub fn advertised_sample(&self) -> Result<Sample, ShmemDfError> {
        debug_assert!(self.connected, "advertised_sample() before connect()");
        let st = self.attached()?;
        Ok(*unsafe { &*(payload_slot::<T>(&st.segment)) }.sample())
    }

    pub fn sample(&self) -> Result<Sample, ShmemDfError> {
        Ok(*self.retrieve()?.sample())
    }

    /// Write number of the newest observed sample.
    pub fn write_number(&self) -> u64 {
        self.read_number
    }

    /// Release the current sample; the last consumer to do so unblocks the
    /// producer.
    pub fn post(&mut self) -> Result<(), ShmemDfError> {
        debug_assert!(self.in_sample, "post() without a matching wait()");
        let st = self.attached()?;
        st.node.increment_source_read_count()?;
        self.in_sample = false;
        Ok(())
    }

    pub(crate) fn segment(&self) -> Result<&Segment, ShmemDfError> {
        Ok(&self.attached()?.segment)
    }
}

impl<T: SharedPayload> Drop for Source<T> {
    fn drop(&mut self) {
        if let Some(mut st) = self.attached.take() {
            // A sample we waited on but never posted still counts against
            // the producer; settle it as part of detaching.
            let last_finished = if self.in_sample {
                self.read_number.saturating_sub(1)
            } else {
                self.read_number
            };
            match st.node.detach_source(st.slot, last_finished) {
                Ok(0) if st.node.sink_state() != SinkState::Bound => {
                    // Last handle on a sink-less segment removes it.
                    st.segment.mark_remove_on_drop();
                }
                Ok(_) => {}
                Err(e) => log::warn!("source '{}': detach failed: {}", self.address, e),
            }
        }
    }
}

fn payload_slot<T: SharedPayload>(segment: &Segment) -> *const T {
    unsafe { segment.base_ptr().add(payload_offset::<T>()) as *const T }
}

/// A non-owning view of the current frame sample. Borrows the source, so it
/// cannot outlive the consumer's read window.
pub struct FrameRef<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sample: Sample,
    pub data: &'a [u8],
}

impl FrameRef<'_> {
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let off = (y as usize * self.width as usize + x as usize) * bpp;
        &self.data[off..off + bpp]
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            width: self.width,
            height: self.height,
            format: self.format,
            sample: self.sample,
            data: self.data.to_vec(),
        }
    }
}

/// Consumer endpoint for frame streams: a [`Source<FrameHeader>`] plus a
/// zero-copy view over the pixel region the header's handle points at.
pub struct FrameSource {
    inner: Source<FrameHeader>,
    data_handle: u64,
    data_len: usize,
}

impl FrameSource {
    pub fn new(cfg: SegmentConfig) -> FrameSource {
        FrameSource {
            inner: Source::new(cfg),
            data_handle: 0,
            data_len: 0,
        }
    }

    pub fn touch(&mut self, address: &str) -> Result<(), ShmemDfError> {
        self.inner.touch(address)
    }

    /// Connect and materialize the pixel view from the header's geometry.
    pub fn connect(&mut self) -> Result<(), ShmemDfError> {
        self.inner.connect()?;
        let st = self.inner.attached()?;
        let hdr = unsafe { &*payload_slot::<FrameHeader>(&st.segment) };
        let handle = hdr.data_handle();
        let len = hdr.data_len();
        let declared = st.node.data_bytes() as usize;
        if len == 0
            || len > declared
            || (handle as usize)
                .checked_add(len)
                .map_or(true, |end| end > st.segment.len())
        {
            return Err(ShmemDfError::CorruptSegment {
                addr: self.inner.address.clone(),
                detail: format!(
                    "pixel handle {:#x} + {} bytes exceeds segment ({} declared data bytes)",
                    handle,
                    len,
                    declared
                ),
            });
        }
        self.data_handle = handle;
        self.data_len = len;
        Ok(())
    }

    pub fn wait(&mut self) -> Result<NodeState, ShmemDfError> {
        self.inner.wait()
    }

    /// The current frame, without copying pixels.
    pub fn retrieve(&self) -> Result<FrameRef<'_>, ShmemDfError> {
        let hdr = self.inner.retrieve()?;
        let segment = self.inner.segment()?;
        let data = unsafe {
            std::slice::from_raw_parts(segment.ptr_from_handle(self.data_handle), self.data_len)
        };
        Ok(FrameRef {
            width: hdr.width,
            height: hdr.height,
            format: hdr.format(),
            sample: *hdr.sample(),
            data,
        })
    }

    /// Deep-copy the current frame, pixels included.
    pub fn clone_frame(&self) -> Result<Frame, ShmemDfError> {
        Ok(self.retrieve()?.to_frame())
    }

    pub fn advertised_sample(&self) -> Result<Sample, ShmemDfError> {
        self.inner.advertised_sample()
    }

    pub fn write_number(&self) -> u64 {
        self.inner.write_number()
    }

    pub fn post(&mut self) -> Result<(), ShmemDfError> {
        self.inner.post()
    }
}
