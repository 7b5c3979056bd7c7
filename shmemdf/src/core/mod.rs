//! Named shared-memory segment management.
//!
//! One segment per stream address, file-linked inside the configured data
//! directory. The segment may be mapped at a different virtual address in
//! every attached process, so nothing inside it stores a host pointer: all
//! placement is by compile-time offset from the segment base, and the frame
//! pixel region is addressed by an offset handle kept in the frame header.
//!
//! Layout, in order:
//!
//! ```text
//! [ mutex meta      : MUTEX_BYTES                ]
//! [ NodeHeader      : repr(C)                    ]
//! [ write barrier   : EVENT_BYTES                ]
//! [ read barriers   : MAX_SOURCES * EVENT_BYTES  ]
//! [ payload T       : align 64                   ]
//! [ data region     : extra bytes, align 64      ]
//! ```

use std::mem;
use std::path::PathBuf;

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::config::SegmentConfig;
use crate::node::{NodeHeader, MAX_SOURCES};
use crate::ShmemDfError;

/// Space reserved for the inter-process mutex at the segment head.
/// pthread_mutex_t is far smaller on every supported platform; the slack
/// keeps the layout stable across libc versions.
pub(crate) const MUTEX_BYTES: usize = 128;

/// Space reserved for each inter-process event (read/write barriers).
pub(crate) const EVENT_BYTES: usize = 128;

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

pub(crate) const fn header_offset() -> usize {
    MUTEX_BYTES
}

pub(crate) const fn write_barrier_offset() -> usize {
    align_up(header_offset() + mem::size_of::<NodeHeader>(), 8)
}

pub(crate) const fn read_barrier_offset(i: usize) -> usize {
    write_barrier_offset() + EVENT_BYTES + i * EVENT_BYTES
}

/// Offset of the payload slot `<addr>/shobj` for payload type `T`.
pub(crate) const fn payload_offset<T>() -> usize {
    align_up(read_barrier_offset(MAX_SOURCES), 64)
}

/// Offset of the raw data region (pixel bytes) for payload type `T`.
pub(crate) const fn data_offset<T>() -> usize {
    align_up(payload_offset::<T>() + mem::size_of::<T>(), 64)
}

/// Total segment size for payload type `T` plus `extra` data bytes.
pub(crate) const fn segment_bytes<T>(extra: usize) -> usize {
    data_offset::<T>() + extra
}

/// Delete the file link left behind when a segment's OS object disappeared
/// without cleanup (e.g. a machine reboot with a persistent data dir).
pub(crate) fn remove_dangling_link(
    cfg: &SegmentConfig,
    address: &str,
) -> Result<(), ShmemDfError> {
    let path = flink_path(cfg, address);
    log::warn!("removing dangling segment link {}", path.display());
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Diagnostic name of the coordination header inside a segment.
pub fn node_address(addr: &str) -> String {
    format!("{}/shmgr", addr)
}

/// Diagnostic name of the payload slot inside a segment.
pub fn object_address(addr: &str) -> String {
    format!("{}/shobj", addr)
}

/// A mapped shared-memory segment.
///
/// Handles are non-owning by default: dropping one only unmaps. The single
/// endpoint elected to remove the OS object calls
/// [`mark_remove_on_drop`](Segment::mark_remove_on_drop) first.
pub struct Segment {
    shmem: Box<Shmem>,
    address: String,
}

fn flink_path(cfg: &SegmentConfig, address: &str) -> PathBuf {
    PathBuf::from(&cfg.data_dir).join(address)
}

impl Segment {
    /// Create the segment for `address`, sized for one node, one payload of
    /// `bytes` and `extra` raw data bytes.
    ///
    /// Fails with [`ShmemError::LinkExists`] (wrapped) if another process
    /// created it first; callers fall back to [`Segment::open`], mirroring
    /// open-or-create.
    pub fn create(
        cfg: &SegmentConfig,
        address: &str,
        total_bytes: usize,
    ) -> Result<Segment, ShmemDfError> {
        debug_assert!(!address.is_empty());
        let shmem = ShmemConf::new()
            .size(total_bytes)
            .flink(flink_path(cfg, address))
            .create()?;
        let mut shmem = Box::new(shmem);
        // Removal is refcount-driven, not creator-driven.
        shmem.set_owner(false);
        Ok(Segment {
            shmem,
            address: address.to_owned(),
        })
    }

    /// Open the existing segment for `address`.
    ///
    /// Returns `Ok(None)` when the file link does not exist yet, so sources
    /// can poll for a producer that has not arrived.
    pub fn open(cfg: &SegmentConfig, address: &str) -> Result<Option<Segment>, ShmemDfError> {
        match ShmemConf::new().flink(flink_path(cfg, address)).open() {
            Ok(shmem) => {
                let mut shmem = Box::new(shmem);
                shmem.set_owner(false);
                Ok(Some(Segment {
                    shmem,
                    address: address.to_owned(),
                }))
            }
            Err(ShmemError::LinkDoesNotExist) => Ok(None),
            // A dangling link (segment removed, link left behind after a
            // crash) reads as the segment being gone; the caller decides
            // whether to recreate.
            Err(ShmemError::LinkOpenFailed(_)) | Err(ShmemError::MapOpenFailed(_)) => {
                Err(ShmemDfError::SegmentGone(address.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shmem.len() == 0
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Resolve an intra-segment offset handle to a local pointer.
    ///
    /// The handle and `len` must have been bound-checked against the segment
    /// (the node header records the data region size for this purpose).
    pub(crate) unsafe fn ptr_from_handle(&self, handle: u64) -> *mut u8 {
        debug_assert!((handle as usize) < self.shmem.len());
        self.base_ptr().add(handle as usize)
    }

    /// Elect this handle to destroy the OS object and file link on drop.
    pub fn mark_remove_on_drop(&mut self) {
        self.shmem.set_owner(true);
        log::debug!("segment '{}' marked for removal", self.address);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datatypes::{FrameHeader, Position2D};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    static TEST_ID: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn test_config() -> (SegmentConfig, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = SegmentConfig {
            data_dir: dir.path().to_str().unwrap().to_owned(),
            attach_timeout_ms: 2_000,
        };
        (cfg, dir)
    }

    pub(crate) fn unique_address(stem: &str) -> String {
        format!(
            "{}-{}-{}",
            stem,
            std::process::id(),
            TEST_ID.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn layout_offsets_are_ordered_and_aligned() {
        assert_eq!(header_offset(), MUTEX_BYTES);
        assert!(write_barrier_offset() > header_offset());
        assert!(read_barrier_offset(0) == write_barrier_offset() + EVENT_BYTES);
        assert!(read_barrier_offset(MAX_SOURCES) > read_barrier_offset(MAX_SOURCES - 1));
        assert_eq!(payload_offset::<Position2D>() % 64, 0);
        assert_eq!(data_offset::<FrameHeader>() % 64, 0);
        assert!(segment_bytes::<FrameHeader>(64 * 48) > data_offset::<FrameHeader>());
    }

    #[test]
    fn create_then_open_maps_same_object() {
        let (cfg, _dir) = test_config();
        let addr = unique_address("core-create-open");
        let bytes = segment_bytes::<Position2D>(0);

        let seg = Segment::create(&cfg, &addr, bytes).unwrap();
        assert!(seg.len() >= bytes);

        let reopened = Segment::open(&cfg, &addr).unwrap().expect("link exists");
        assert_eq!(reopened.address(), addr);
        assert!(reopened.len() >= bytes);

        // Bytes written through one mapping are visible through the other.
        unsafe {
            *seg.base_ptr().add(bytes - 1) = 0xAB;
            assert_eq!(*reopened.base_ptr().add(bytes - 1), 0xAB);
        }
    }

    #[test]
    fn second_create_reports_link_exists() {
        let (cfg, _dir) = test_config();
        let addr = unique_address("core-dup-create");
        let bytes = segment_bytes::<Position2D>(0);

        let _first = Segment::create(&cfg, &addr, bytes).unwrap();
        match Segment::create(&cfg, &addr, bytes) {
            Err(ShmemDfError::SharedMemory(ShmemError::LinkExists)) => {}
            other => panic!("expected LinkExists, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn open_missing_returns_none() {
        let (cfg, _dir) = test_config();
        let addr = unique_address("core-missing");
        assert!(Segment::open(&cfg, &addr).unwrap().is_none());
    }

    #[test]
    fn owner_drop_removes_the_link() {
        let (cfg, _dir) = test_config();
        let addr = unique_address("core-remove");
        let bytes = segment_bytes::<Position2D>(0);

        let mut seg = Segment::create(&cfg, &addr, bytes).unwrap();
        seg.mark_remove_on_drop();
        drop(seg);

        assert!(Segment::open(&cfg, &addr).unwrap().is_none());
    }

    #[test]
    fn derived_names() {
        assert_eq!(node_address("raw"), "raw/shmgr");
        assert_eq!(object_address("raw"), "raw/shobj");
    }
}
