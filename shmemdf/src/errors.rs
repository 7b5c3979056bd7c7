use std::io;

use thiserror::Error;

/// Errors surfaced by the dataflow substrate.
///
/// All of these are fatal to the calling component; there is no in-process
/// recovery from a corrupted segment. End-of-stream is not an error — it is
/// reported as [`NodeState::End`](crate::node::NodeState).
#[derive(Error, Debug)]
pub enum ShmemDfError {
    /// A second sink tried to bind an address that already has a live node.
    #[error("sink is already bound to '{0}'")]
    AlreadyBound(String),

    /// A source operation requires a bound sink, but none ever bound.
    #[error("no sink bound to '{0}'")]
    NotBound(String),

    /// The OS segment is missing or was removed mid-use.
    #[error("shared memory segment '{0}' is gone")]
    SegmentGone(String),

    /// Attaching would exceed the per-node consumer slot table.
    #[error("too many sources attached to '{addr}' (max {max})")]
    TooManySources { addr: String, max: usize },

    /// The payload placed at `<addr>/shobj` does not match the caller's type.
    #[error(
        "payload type mismatch at '{addr}/shobj': expected tag {expected_tag:#x} \
         ({expected_size} bytes), found tag {found_tag:#x} ({found_size} bytes)"
    )]
    PayloadTypeMismatch {
        addr: String,
        expected_tag: u64,
        expected_size: u64,
        found_tag: u64,
        found_size: u64,
    },

    /// The segment's contents are inconsistent with its own header
    /// (e.g. a pixel handle pointing outside the mapped region).
    #[error("corrupt segment '{addr}': {detail}")]
    CorruptSegment { addr: String, detail: String },

    /// A recorder's bounded frame queue filled up faster than its writer
    /// could drain it.
    #[error("queue overrun on '{addr}' (capacity {capacity}); decrease the frame rate or use faster storage")]
    QueueOverrun { addr: String, capacity: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    /// Inter-process lock or barrier failure. `raw_sync` reports boxed,
    /// non-`Send` errors; they are flattened to strings here so this enum
    /// stays `Send + Sync`.
    #[error("lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ShmemDfError {
    pub(crate) fn lock(e: Box<dyn std::error::Error>) -> Self {
        ShmemDfError::Lock(e.to_string())
    }
}
