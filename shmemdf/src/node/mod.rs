//! Per-segment coordination: sink state, consumer slots, barriers and the
//! sample sequence.
//!
//! The [`NodeHeader`] lives inside the shared segment at a fixed offset and
//! is shared by every attached process. A [`Node`] is a process-local handle
//! that pairs the header with the segment's inter-process mutex and events.
//!
//! Field updates happen under the segment mutex; the barriers are signaled
//! outside of it. No caller ever holds the mutex across a barrier wait.

use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockImpl, LockInit, Mutex};
use raw_sync::Timeout;

use crate::core::{header_offset, read_barrier_offset, write_barrier_offset, Segment};
use crate::ShmemDfError;

/// Upper bound on consumers per node. One read barrier is laid out per slot.
pub const MAX_SOURCES: usize = 16;

/// Granularity of every timed barrier wait. Bounds how long end-of-stream
/// and SIGINT can go unobserved.
pub const POLL_PERIOD: Duration = Duration::from_millis(10);

/// Bound on acquiring the segment mutex; crossing it means a peer died while
/// holding the lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an opener waits for the segment creator to finish initializing
/// the node before giving up.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

const NODE_MAGIC: u64 = 0x7368_6d64_665f_6e64;

const SLOT_MASK_ALL: u16 = ((1u32 << MAX_SOURCES) - 1) as u16;

/// Lifecycle of the unique producer for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SinkState {
    Undefined = 0,
    Bound = 1,
    End = 2,
}

impl From<u8> for SinkState {
    fn from(v: u8) -> Self {
        match v {
            1 => SinkState::Bound,
            2 => SinkState::End,
            _ => SinkState::Undefined,
        }
    }
}

/// Outcome of a barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// A sample is available (source side) or all consumers finished
    /// reading (sink side).
    Ok,
    /// The producer reached end-of-stream; no further samples will arrive.
    End,
}

/// The coordination header placed in shared memory.
///
/// `repr(C)` with shared-memory atomics: the layout is identical in every
/// process linking the same build, and the fields read outside the mutex
/// (sink state, write number, published set) stay tear-free.
#[repr(C)]
pub struct NodeHeader {
    magic: AtomicU64,
    payload_tag: AtomicU64,
    payload_size: AtomicU64,
    data_bytes: AtomicU64,
    write_number: AtomicU64,
    sink_state: AtomicU8,
    source_slots: AtomicU16,
    source_read_count: AtomicU16,
    /// Slot set the current sample was posted to. Snapshotted at post time
    /// so consumers attaching mid-sample do not change the sample's
    /// completion target.
    published_mask: AtomicU16,
    published_count: AtomicU16,
}

/// Process-local handle to a segment's node.
pub struct Node {
    address: String,
    header: *const NodeHeader,
    mutex: Box<dyn LockImpl>,
    write_barrier: Box<dyn EventImpl>,
    read_barriers: Vec<Box<dyn EventImpl>>,
}

impl Node {
    /// Initialize the node inside a freshly created segment.
    ///
    /// Constructs the mutex and barrier primitives in place, records the
    /// payload identity, and publishes the magic word last so that openers
    /// polling [`Node::open`] never observe a half-built node.
    pub(crate) fn create(
        seg: &Segment,
        payload_tag: u64,
        payload_size: u64,
        data_bytes: u64,
    ) -> Result<Node, ShmemDfError> {
        let base = seg.base_ptr();
        unsafe {
            let (mutex, _) = Mutex::new(base, base.add(header_offset()))
                .map_err(ShmemDfError::lock)?;
            let (write_barrier, _) = Event::new(base.add(write_barrier_offset()), true)
                .map_err(ShmemDfError::lock)?;
            let mut read_barriers = Vec::with_capacity(MAX_SOURCES);
            for i in 0..MAX_SOURCES {
                let (ev, _) = Event::new(base.add(read_barrier_offset(i)), true)
                    .map_err(ShmemDfError::lock)?;
                read_barriers.push(ev);
            }

            let header = base.add(header_offset()) as *const NodeHeader;
            let h = &*header;
            h.payload_tag.store(payload_tag, Ordering::SeqCst);
            h.payload_size.store(payload_size, Ordering::SeqCst);
            h.data_bytes.store(data_bytes, Ordering::SeqCst);
            h.write_number.store(0, Ordering::SeqCst);
            h.sink_state.store(SinkState::Undefined as u8, Ordering::SeqCst);
            h.source_slots.store(0, Ordering::SeqCst);
            h.source_read_count.store(0, Ordering::SeqCst);
            h.published_mask.store(0, Ordering::SeqCst);
            h.published_count.store(0, Ordering::SeqCst);
            h.magic.store(NODE_MAGIC, Ordering::Release);

            Ok(Node {
                address: seg.address().to_owned(),
                header,
                mutex,
                write_barrier,
                read_barriers,
            })
        }
    }

    /// Attach to the node of an existing segment, waiting (bounded) for the
    /// creator to finish initialization.
    pub(crate) fn open(seg: &Segment) -> Result<Node, ShmemDfError> {
        let base = seg.base_ptr();
        let header = unsafe { base.add(header_offset()) } as *const NodeHeader;

        let deadline = Instant::now() + INIT_TIMEOUT;
        while unsafe { &*header }.magic.load(Ordering::Acquire) != NODE_MAGIC {
            if Instant::now() >= deadline {
                return Err(ShmemDfError::Lock(format!(
                    "node at '{}' was never initialized",
                    crate::core::node_address(seg.address())
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        unsafe {
            let (mutex, _) = Mutex::from_existing(base, base.add(header_offset()))
                .map_err(ShmemDfError::lock)?;
            let (write_barrier, _) = Event::from_existing(base.add(write_barrier_offset()))
                .map_err(ShmemDfError::lock)?;
            let mut read_barriers = Vec::with_capacity(MAX_SOURCES);
            for i in 0..MAX_SOURCES {
                let (ev, _) = Event::from_existing(base.add(read_barrier_offset(i)))
                    .map_err(ShmemDfError::lock)?;
                read_barriers.push(ev);
            }
            Ok(Node {
                address: seg.address().to_owned(),
                header,
                mutex,
                write_barrier,
                read_barriers,
            })
        }
    }

    fn header(&self) -> &NodeHeader {
        unsafe { &*self.header }
    }

    /// Run `f` with the segment mutex held. Critical sections are a handful
    /// of field updates; barrier signaling happens after the guard drops.
    fn locked<R>(&self, f: impl FnOnce(&NodeHeader) -> R) -> Result<R, ShmemDfError> {
        let guard = self
            .mutex
            .try_lock(Timeout::Val(LOCK_TIMEOUT))
            .map_err(ShmemDfError::lock)?;
        let r = f(self.header());
        drop(guard);
        Ok(r)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check the payload identity recorded by the segment creator against
    /// the caller's payload type.
    pub(crate) fn verify_payload(&self, tag: u64, size: u64) -> Result<(), ShmemDfError> {
        let h = self.header();
        let found_tag = h.payload_tag.load(Ordering::SeqCst);
        let found_size = h.payload_size.load(Ordering::SeqCst);
        if found_tag != tag || found_size != size {
            return Err(ShmemDfError::PayloadTypeMismatch {
                addr: self.address.clone(),
                expected_tag: tag,
                expected_size: size,
                found_tag,
                found_size,
            });
        }
        Ok(())
    }

    pub fn sink_state(&self) -> SinkState {
        self.header().sink_state.load(Ordering::SeqCst).into()
    }

    pub fn set_sink_state(&self, state: SinkState) -> Result<(), ShmemDfError> {
        self.locked(|h| h.sink_state.store(state as u8, Ordering::SeqCst))
    }

    pub fn write_number(&self) -> u64 {
        self.header().write_number.load(Ordering::SeqCst)
    }

    pub(crate) fn data_bytes(&self) -> u64 {
        self.header().data_bytes.load(Ordering::SeqCst)
    }

    pub fn source_ref_count(&self) -> u16 {
        self.header()
            .source_slots
            .load(Ordering::SeqCst)
            .count_ones() as u16
    }

    /// Claim a consumer slot. Returns the slot index used for the caller's
    /// read barrier.
    pub fn increment_source_ref_count(&self) -> Result<usize, ShmemDfError> {
        let claimed = self.locked(|h| {
            let slots = h.source_slots.load(Ordering::SeqCst);
            let free = !slots & SLOT_MASK_ALL;
            if free == 0 {
                return None;
            }
            let slot = free.trailing_zeros() as usize;
            // The barrier may carry a stale signal from a previous occupant
            // of this slot; clearing it here, before the slot becomes
            // visible to the producer's snapshot, keeps a fresh consumer
            // from waking on a sample published before it attached.
            let _ = self.read_barriers[slot].set(EventState::Clear);
            h.source_slots
                .store(slots | (1 << slot), Ordering::SeqCst);
            Some(slot)
        })?;
        claimed.ok_or_else(|| ShmemDfError::TooManySources {
            addr: self.address.clone(),
            max: MAX_SOURCES,
        })
    }

    /// Release a consumer slot without sample bookkeeping. Returns the
    /// remaining attached count.
    pub fn decrement_source_ref_count(&self, slot: usize) -> Result<u16, ShmemDfError> {
        self.locked(|h| {
            let slots = h.source_slots.load(Ordering::SeqCst) & !(1u16 << slot);
            h.source_slots.store(slots, Ordering::SeqCst);
            slots.count_ones() as u16
        })
    }

    /// Release a consumer slot, settling the slot's obligations toward the
    /// in-flight sample so the producer never waits on a departed consumer.
    ///
    /// `last_seen` is the write number of the last sample the consumer
    /// finished. Returns the remaining attached count.
    pub fn detach_source(
        &self,
        slot: usize,
        last_seen: u64,
    ) -> Result<u16, ShmemDfError> {
        let bit = 1u16 << slot;
        let (remaining, post_wb) = self.locked(|h| {
            let mut post = false;
            let pmask = h.published_mask.load(Ordering::SeqCst);
            if pmask & bit != 0 {
                let pcount = h.published_count.load(Ordering::SeqCst);
                let rcount = h.source_read_count.load(Ordering::SeqCst);
                let wn = h.write_number.load(Ordering::SeqCst);
                let new_count = pcount.saturating_sub(1);
                h.published_mask.store(pmask & !bit, Ordering::SeqCst);
                h.published_count.store(new_count, Ordering::SeqCst);
                if last_seen < wn {
                    // The sample is still outstanding for this slot: stand
                    // in for the post it will never make.
                    if rcount >= new_count {
                        h.source_read_count.store(0, Ordering::SeqCst);
                        post = true;
                    }
                } else if rcount > 0 {
                    // Already posted for the current sample; retract that
                    // contribution along with the slot.
                    let r = rcount - 1;
                    h.source_read_count.store(r, Ordering::SeqCst);
                    if new_count > 0 && r >= new_count {
                        h.source_read_count.store(0, Ordering::SeqCst);
                        post = true;
                    }
                }
            }
            let slots = h.source_slots.load(Ordering::SeqCst) & !bit;
            h.source_slots.store(slots, Ordering::SeqCst);
            (slots.count_ones() as u16, post)
        })?;
        if post_wb {
            self.write_barrier
                .set(EventState::Signaled)
                .map_err(ShmemDfError::lock)?;
        }
        Ok(remaining)
    }

    /// Record that one consumer finished the current sample. The consumer
    /// completing the published set resets the count and releases the
    /// producer.
    pub fn increment_source_read_count(&self) -> Result<u16, ShmemDfError> {
        let (n, post) = self.locked(|h| {
            let n = h.source_read_count.load(Ordering::SeqCst) + 1;
            if n >= h.published_count.load(Ordering::SeqCst) {
                h.source_read_count.store(0, Ordering::SeqCst);
                (n, true)
            } else {
                h.source_read_count.store(n, Ordering::SeqCst);
                (n, false)
            }
        })?;
        if post {
            self.write_barrier
                .set(EventState::Signaled)
                .map_err(ShmemDfError::lock)?;
        }
        Ok(n)
    }

    pub fn reset_source_read_count(&self) -> Result<(), ShmemDfError> {
        self.locked(|h| h.source_read_count.store(0, Ordering::SeqCst))
    }

    /// Producer post: advance the write number, snapshot the attached slot
    /// set as this sample's audience, then signal each snapshotted slot's
    /// read barrier. Fire-and-forget with no consumers attached.
    pub fn publish(&self) -> Result<u64, ShmemDfError> {
        let (wn, mask) = self.locked(|h| {
            let wn = h.write_number.load(Ordering::SeqCst) + 1;
            h.write_number.store(wn, Ordering::SeqCst);
            h.source_read_count.store(0, Ordering::SeqCst);
            let mask = h.source_slots.load(Ordering::SeqCst);
            h.published_mask.store(mask, Ordering::SeqCst);
            h.published_count
                .store(mask.count_ones() as u16, Ordering::SeqCst);
            (wn, mask)
        })?;
        for slot in 0..MAX_SOURCES {
            if mask & (1 << slot) != 0 {
                self.read_barriers[slot]
                    .set(EventState::Signaled)
                    .map_err(ShmemDfError::lock)?;
            }
        }
        Ok(wn)
    }

    /// Consumer wait: block (10 ms timed polls) until a sample addressed to
    /// `slot` arrives or the stream ends. Returns the new state and, on
    /// `Ok`, the sample's write number.
    pub fn wait_read(
        &self,
        slot: usize,
        last_seen: u64,
    ) -> Result<(NodeState, u64), ShmemDfError> {
        let bit = 1u16 << slot;
        loop {
            let signaled = self.read_barriers[slot]
                .wait(Timeout::Val(POLL_PERIOD))
                .is_ok();
            let h = self.header();
            if signaled {
                let wn = h.write_number.load(Ordering::SeqCst);
                let pmask = h.published_mask.load(Ordering::SeqCst);
                if pmask & bit != 0 && wn > last_seen {
                    return Ok((NodeState::Ok, wn));
                }
                // A wake-up with nothing addressed to us is either the
                // end-of-stream broadcast or a stale signal for a previous
                // occupant of this slot.
                if self.sink_state() == SinkState::End {
                    return Ok((NodeState::End, last_seen));
                }
            } else if self.sink_state() == SinkState::End {
                return Ok((NodeState::End, last_seen));
            }
        }
    }

    /// Producer wait: block until every consumer in the current published
    /// set has posted. Fast-returns when the sample was published to nobody.
    ///
    /// A consumer that dies between wait and post would stall this forever;
    /// after `stall_timeout` the read count is reconciled under the mutex
    /// and the producer proceeds with a warning.
    pub fn wait_write(&self, stall_timeout: Duration) -> Result<NodeState, ShmemDfError> {
        if self.header().published_count.load(Ordering::SeqCst) == 0 {
            return Ok(NodeState::Ok);
        }
        let mut waited = Duration::ZERO;
        loop {
            if self.sink_state() == SinkState::End {
                return Ok(NodeState::End);
            }
            if self
                .write_barrier
                .wait(Timeout::Val(POLL_PERIOD))
                .is_ok()
            {
                return Ok(NodeState::Ok);
            }
            waited += POLL_PERIOD;
            if waited >= stall_timeout {
                log::warn!(
                    "sink '{}': consumers unresponsive for {:?}; reconciling and continuing",
                    self.address,
                    stall_timeout
                );
                self.locked(|h| {
                    h.source_read_count.store(0, Ordering::SeqCst);
                    h.published_mask.store(0, Ordering::SeqCst);
                    h.published_count.store(0, Ordering::SeqCst);
                })?;
                return Ok(NodeState::Ok);
            }
        }
    }

    /// Mark end-of-stream and release every waiter. Safe to call more than
    /// once; repeated signals merge.
    pub fn end_stream(&self) -> Result<(), ShmemDfError> {
        let mask = self.locked(|h| {
            h.sink_state.store(SinkState::End as u8, Ordering::SeqCst);
            h.source_slots.load(Ordering::SeqCst)
        })?;
        for slot in 0..MAX_SOURCES {
            if mask & (1 << slot) != 0 {
                self.read_barriers[slot]
                    .set(EventState::Signaled)
                    .map_err(ShmemDfError::lock)?;
            }
        }
        self.write_barrier
            .set(EventState::Signaled)
            .map_err(ShmemDfError::lock)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{test_config, unique_address};
    use crate::core::segment_bytes;
    use crate::datatypes::Position2D;
    use crate::datatypes::SharedPayload;

    fn new_node() -> (Node, Segment, tempfile::TempDir) {
        let (cfg, dir) = test_config();
        let addr = unique_address("node");
        let seg = Segment::create(&cfg, &addr, segment_bytes::<Position2D>(0)).unwrap();
        let node = Node::create(
            &seg,
            Position2D::TYPE_TAG,
            std::mem::size_of::<Position2D>() as u64,
            0,
        )
        .unwrap();
        (node, seg, dir)
    }

    #[test]
    fn slots_are_claimed_lowest_first_and_bounded() {
        let (node, _seg, _dir) = new_node();
        for expect in 0..MAX_SOURCES {
            assert_eq!(node.increment_source_ref_count().unwrap(), expect);
        }
        assert_eq!(node.source_ref_count(), MAX_SOURCES as u16);
        match node.increment_source_ref_count() {
            Err(ShmemDfError::TooManySources { max, .. }) => assert_eq!(max, MAX_SOURCES),
            other => panic!("expected TooManySources, got {:?}", other),
        }

        // Freed slots are reused.
        assert_eq!(
            node.decrement_source_ref_count(3).unwrap(),
            MAX_SOURCES as u16 - 1
        );
        assert_eq!(node.increment_source_ref_count().unwrap(), 3);
    }

    #[test]
    fn payload_identity_is_checked() {
        let (node, _seg, _dir) = new_node();
        node.verify_payload(
            Position2D::TYPE_TAG,
            std::mem::size_of::<Position2D>() as u64,
        )
        .unwrap();
        match node.verify_payload(0xdead_beef, 16) {
            Err(ShmemDfError::PayloadTypeMismatch { expected_tag, .. }) => {
                assert_eq!(expected_tag, 0xdead_beef)
            }
            other => panic!("expected PayloadTypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn publish_snapshots_the_attached_set() {
        let (node, _seg, _dir) = new_node();
        let a = node.increment_source_ref_count().unwrap();
        assert_eq!(node.publish().unwrap(), 1);

        // A consumer attaching after the post is not part of the sample's
        // audience and must not change its completion target.
        let _b = node.increment_source_ref_count().unwrap();
        node.increment_source_read_count().unwrap();
        // Consumer `a` completed the snapshot: producer wait fast-path.
        assert_eq!(
            node.wait_write(Duration::from_millis(100)).unwrap(),
            NodeState::Ok
        );
        let _ = a;
    }

    #[test]
    fn wait_read_observes_publish_and_end() {
        let (node, _seg, _dir) = new_node();
        let slot = node.increment_source_ref_count().unwrap();
        node.set_sink_state(SinkState::Bound).unwrap();

        node.publish().unwrap();
        let (state, wn) = node.wait_read(slot, 0).unwrap();
        assert_eq!(state, NodeState::Ok);
        assert_eq!(wn, 1);

        node.end_stream().unwrap();
        let (state, wn) = node.wait_read(slot, 1).unwrap();
        assert_eq!(state, NodeState::End);
        assert_eq!(wn, 1);
        // End is idempotent.
        node.end_stream().unwrap();
        assert_eq!(node.wait_read(slot, 1).unwrap().0, NodeState::End);
    }

    #[test]
    fn fresh_slot_does_not_wake_on_a_stale_signal() {
        let (node, _seg, _dir) = new_node();
        let slot = node.increment_source_ref_count().unwrap();
        node.publish().unwrap();
        // Leave the signal unconsumed and detach; the next occupant of the
        // slot must join at the *next* post, not see sample 1.
        node.detach_source(slot, 0).unwrap();

        let slot2 = node.increment_source_ref_count().unwrap();
        assert_eq!(slot, slot2);
        node.publish().unwrap();
        let (state, wn) = node.wait_read(slot2, 0).unwrap();
        assert_eq!(state, NodeState::Ok);
        assert_eq!(wn, 2);
    }

    #[test]
    fn detach_of_outstanding_reader_releases_the_producer() {
        let (node, _seg, _dir) = new_node();
        let a = node.increment_source_ref_count().unwrap();
        let b = node.increment_source_ref_count().unwrap();
        node.publish().unwrap();

        // `a` reads and posts; `b` detaches without reading.
        let (_, wn) = node.wait_read(a, 0).unwrap();
        assert_eq!(wn, 1);
        node.increment_source_read_count().unwrap();
        node.detach_source(b, 0).unwrap();

        assert_eq!(
            node.wait_write(Duration::from_millis(100)).unwrap(),
            NodeState::Ok
        );
    }

    #[test]
    fn detach_after_posting_retracts_the_contribution() {
        let (node, _seg, _dir) = new_node();
        let a = node.increment_source_ref_count().unwrap();
        let b = node.increment_source_ref_count().unwrap();
        let c = node.increment_source_ref_count().unwrap();
        node.publish().unwrap();

        // `a` finishes and posts, then detaches: 1 of 3 done -> 0 of 2.
        let (_, wn_a) = node.wait_read(a, 0).unwrap();
        node.increment_source_read_count().unwrap();
        node.detach_source(a, wn_a).unwrap();

        // The remaining two complete the sample.
        node.wait_read(b, 0).unwrap();
        node.increment_source_read_count().unwrap();
        node.wait_read(c, 0).unwrap();
        node.increment_source_read_count().unwrap();

        assert_eq!(
            node.wait_write(Duration::from_millis(100)).unwrap(),
            NodeState::Ok
        );
    }

    #[test]
    fn stalled_consumer_trips_the_stall_timeout() {
        let (node, _seg, _dir) = new_node();
        let _slot = node.increment_source_ref_count().unwrap();
        node.publish().unwrap();
        // Nobody posts; the producer reconciles after the timeout instead
        // of deadlocking.
        let state = node.wait_write(Duration::from_millis(30)).unwrap();
        assert_eq!(state, NodeState::Ok);
    }

    #[test]
    fn reopened_node_shares_state() {
        let (cfg, _dir) = test_config();
        let addr = unique_address("node-reopen");
        let seg = Segment::create(&cfg, &addr, segment_bytes::<Position2D>(0)).unwrap();
        let node = Node::create(
            &seg,
            Position2D::TYPE_TAG,
            std::mem::size_of::<Position2D>() as u64,
            0,
        )
        .unwrap();

        let seg2 = Segment::open(&cfg, &addr).unwrap().unwrap();
        let node2 = Node::open(&seg2).unwrap();
        node2
            .verify_payload(
                Position2D::TYPE_TAG,
                std::mem::size_of::<Position2D>() as u64,
            )
            .unwrap();

        node.set_sink_state(SinkState::Bound).unwrap();
        assert_eq!(node2.sink_state(), SinkState::Bound);
        node.publish().unwrap();
        assert_eq!(node2.write_number(), 1);
    }
}
