//! A shared memory dataflow substrate (`shmemdf`) for coupling the processes
//! of a real-time tracking pipeline: frame servers, detectors, filters and
//! recorders exchange video frames and tracked positions through named
//! shared-memory segments without copying.
//!
//! # Overview
//! Each stream lives in one OS shared-memory segment identified by a string
//! address. The segment holds a coordination header (the [`Node`](node::Node)),
//! one payload slot of the stream's sample type, and, for frame streams, a
//! raw pixel region addressed by an intra-segment offset handle.
//!
//! Key components:
//! - [`SegmentConfig`](config::SegmentConfig): where segment file links live
//!   and how long attachment may block.
//! - [`Sink`](sink::Sink) / [`FrameSink`](sink::FrameSink): the unique
//!   producer endpoint for an address.
//! - [`Source`](source::Source) / [`FrameSource`](source::FrameSource):
//!   consumer endpoints; up to [`MAX_SOURCES`](node::MAX_SOURCES) may attach
//!   to the same address.
//! - [`Position2D`](datatypes::Position2D) and
//!   [`FrameHeader`](datatypes::FrameHeader): the two payload types placed in
//!   shared memory.
//! - [`ShmemDfError`](errors::ShmemDfError): library error type.
//!
//! # Concurrency model
//!
//! The producer and its consumers run in lock step, one sample at a time:
//!
//! - **Producer post** (`Sink::post`): under the segment mutex, advance the
//!   write number, zero the read count and snapshot the set of attached
//!   consumer slots; then signal each snapshotted consumer's read barrier.
//!   With no consumers attached the post is fire-and-forget.
//! - **Consumer wait** (`Source::wait`): timed wait on the consumer's own
//!   read barrier with a 10 ms poll period, re-checking for end-of-stream on
//!   every timeout. A consumer that returns `Ok` holds read access to the
//!   sample at exactly the node's current write number until it calls
//!   `post`.
//! - **Consumer post** (`Source::post`): bump the read count; the consumer
//!   that completes the snapshot signals the producer's write barrier.
//! - **Producer wait** (`Sink::wait`): timed wait on the write barrier.
//!   When it returns, every snapshotted consumer has finished the previous
//!   sample and the payload is safe to mutate.
//!
//! The payload itself is never accessed under the mutex. It is guarded
//! entirely by the barrier cycle: the producer may mutate it only after its
//! wait completes, and consumers may read it only between their wait and
//! post. Consumers that attach mid-stream join at the next post and never
//! observe earlier samples.
//!
//! End-of-stream is a terminal producer state. Dropping a sink marks the
//! node `End` and signals every barrier; consumers observe this from their
//! next wait (within one poll period) and wind down. The last endpoint to
//! detach from a sink-less segment removes the OS object.
//!
//! # Crash tolerance
//!
//! The barriers are plain inter-process primitives, not robust against a
//! consumer dying between wait and post. The producer therefore bounds its
//! write-barrier wait with a stall timeout (default 5 s): on expiry it logs
//! a warning, reconciles the read count and keeps serving the remaining
//! consumers. See `Sink::set_stall_timeout`.

pub mod config;
pub mod core;
pub mod datatypes;
pub mod errors;
pub mod node;
pub mod sink;
pub mod source;

pub use config::SegmentConfig;
pub use datatypes::{Frame, FrameHeader, PixelFormat, Point2D, Position2D, Sample};
pub use errors::ShmemDfError;
pub use node::{NodeState, MAX_SOURCES, POLL_PERIOD};
pub use sink::{FrameSink, Sink};
pub use source::{FrameSource, Source};

#[cfg(test)]
mod tests;
