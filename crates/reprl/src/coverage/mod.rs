//! Edge-coverage bookkeeping for one worker.
//!
//! The target engine maps a per-worker POSIX shared-memory object (named via
//! the `SHM_ID` environment variable) and sets one bit per executed
//! instrumentation edge. [`CoverageMap`] owns the parent-side view of that
//! region together with the virgin bitmap: a 1-bit there means the edge has
//! never been observed, and the fuzzer learns by clearing bits.

use std::{fs::File, io, path::Path};

use memmap2::MmapMut;
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{
        mman::{shm_open, shm_unlink},
        stat::Mode,
    },
};
use tracing::{debug, info, warn};

pub(crate) mod bitmap;

/// Size of the shared-memory region: a `u32` edge count written by the
/// target during startup, followed by the packed edge bitmap.
pub const SHM_SIZE: usize = 0x100000;

/// Highest edge count the region can describe.
pub const MAX_EDGES: u32 = ((SHM_SIZE - EDGES_OFFSET) * 8) as u32;

const EDGES_OFFSET: usize = size_of::<u32>();

static_assertions::const_assert!(MAX_EDGES as u64 <= u32::MAX as u64);

#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    #[error("failed to set up shared memory region {name}: {source}")]
    ShmSetup { name: String, source: Errno },
    #[error("target reported no coverage edges; is it built with coverage instrumentation?")]
    NoEdges,
    #[error("target reported {0} edges, more than the region can hold ({MAX_EDGES})")]
    TooManyEdges(u32),
    #[error(
        "coverage bitmap of {actual} bytes does not match the expected {expected} bytes; \
         was it recorded with a different build of the target?"
    )]
    BitmapSizeMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parent-side coverage state of a single worker.
///
/// Created before the first child spawn (the target needs the shm name in its
/// environment) and finalized once the target has written its edge count.
/// Until then `bitmap_size` is zero and [`clear_bitmap`](Self::clear_bitmap)
/// is a no-op.
#[derive(Debug)]
pub struct CoverageMap {
    worker_id: usize,
    shm_name: String,
    shmem: MmapMut,
    /// Target-reported edge count plus one; index 0 is reserved and ignored.
    num_edges: u32,
    /// Bytes of the bitmaps below, a multiple of 8 so the diff loop can scan
    /// 64-bit words.
    bitmap_size: usize,
    virgin_bits: Vec<u8>,
    virgin_bits_backup: Vec<u8>,
    /// Snapshot space for the shared bitmap of one execution.
    coverage_map_backup: Vec<u8>,
    /// Per-edge hit counters, allocated iff edge tracking was requested.
    edge_counts: Option<Vec<u32>>,
    found_edges: u32,
}

impl CoverageMap {
    /// Reserves the per-worker shared-memory region and maps it.
    ///
    /// Any stale object left behind by a previous run under the same name is
    /// unlinked first. The backing descriptor is closed once the mapping
    /// exists; the child re-opens the object by name.
    pub fn new(worker_id: usize) -> Result<Self, CoverageError> {
        let shm_name = format!("/shm_id_{}_{}", std::process::id(), worker_id);
        let setup_err = |source| CoverageError::ShmSetup {
            name: shm_name.clone(),
            source,
        };

        match shm_unlink(shm_name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(err) => warn!(name = %shm_name, %err, "Failed to unlink stale shared memory"),
        }

        let fd = shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(setup_err)?;
        let file = File::from(fd);
        file.set_len(SHM_SIZE as u64)
            .map_err(|err| setup_err(Errno::from_raw(err.raw_os_error().unwrap_or(0))))?;
        // SAFETY: the mapping is backed by a freshly created shm object of
        // exactly SHM_SIZE bytes that outlives the mapping via its name.
        let shmem = unsafe { MmapMut::map_mut(&file) }?;
        debug!(name = %shm_name, "Coverage shared memory reserved");

        Ok(Self {
            worker_id,
            shm_name,
            shmem,
            num_edges: 0,
            bitmap_size: 0,
            virgin_bits: Vec::new(),
            virgin_bits_backup: Vec::new(),
            coverage_map_backup: Vec::new(),
            edge_counts: None,
            found_edges: 0,
        })
    }

    /// Name of the shared-memory object, the value the child expects in its
    /// `SHM_ID` environment variable.
    pub fn shm_id(&self) -> &str {
        &self.shm_name
    }

    pub fn is_finalized(&self) -> bool {
        self.bitmap_size != 0
    }

    /// Completes initialization once the target has populated the edge count
    /// during its first startup. Returns the final edge count, which includes
    /// the reserved index 0.
    pub fn finish_initialization(&mut self, track_edges: bool) -> Result<u32, CoverageError> {
        let mut reported = [0u8; EDGES_OFFSET];
        reported.copy_from_slice(&self.shmem[..EDGES_OFFSET]);
        let reported = u32::from_ne_bytes(reported);
        if reported == 0 {
            return Err(CoverageError::NoEdges);
        }
        if reported > MAX_EDGES {
            return Err(CoverageError::TooManyEdges(reported));
        }

        // Index 0 is reserved, so the usable range is 1..=reported.
        self.num_edges = reported + 1;
        self.bitmap_size = bitmap::padded_size(self.num_edges);
        self.virgin_bits = vec![0xFF; self.bitmap_size];
        bitmap::clear_edge(&mut self.virgin_bits, 0);
        self.virgin_bits_backup = self.virgin_bits.clone();
        self.coverage_map_backup = vec![0; self.bitmap_size];
        self.edge_counts = track_edges.then(|| vec![0u32; self.num_edges as usize]);
        self.found_edges = 0;

        info!(
            worker = self.worker_id,
            edges = self.num_edges,
            bitmap_bytes = self.bitmap_size,
            "Coverage map finalized"
        );
        Ok(self.num_edges)
    }

    /// Bytes of the shared bitmap covered by the scans. The padded bitmap
    /// size can exceed the region by one word at the `MAX_EDGES` boundary.
    fn scan_len(&self) -> usize {
        self.bitmap_size.min(SHM_SIZE - EDGES_OFFSET)
    }

    /// Zeroes the shared bitmap. Must run immediately before every execution;
    /// a no-op until the map is finalized.
    pub fn clear_bitmap(&mut self) {
        let len = self.scan_len();
        self.shmem[EDGES_OFFSET..EDGES_OFFSET + len].fill(0);
    }

    /// Diffs the target-written bitmap against the virgin map and returns the
    /// indices of newly discovered edges. Discovered edges stay non-virgin
    /// until [`restore_virgin_bits`](Self::restore_virgin_bits) or
    /// [`reset_state`](Self::reset_state).
    pub fn evaluate(&mut self) -> Vec<u32> {
        let mut new_edges = Vec::new();
        let len = self.scan_len();
        let shm_edges = &self.shmem[EDGES_OFFSET..EDGES_OFFSET + len];
        let num_edges = self.num_edges;

        for (word_index, (covered, virgin)) in shm_edges
            .chunks_exact(bitmap::WORD_BYTES)
            .zip(self.virgin_bits[..len].chunks_exact_mut(bitmap::WORD_BYTES))
            .enumerate()
        {
            let covered_word = bitmap::load_word(covered);
            if covered_word == 0 {
                continue;
            }
            let virgin_word = bitmap::load_word(virgin);
            if covered_word & virgin_word == 0 && self.edge_counts.is_none() {
                continue;
            }
            let base = word_index as u32 * u64::BITS;
            for bit in 0..u64::BITS {
                if covered_word >> bit & 1 == 0 {
                    continue;
                }
                let index = base + bit;
                if index == 0 || index >= num_edges {
                    continue;
                }
                if let Some(counts) = self.edge_counts.as_mut() {
                    counts[index as usize] += 1;
                }
                if virgin_word >> bit & 1 == 1 {
                    bitmap::clear_edge(virgin, bit);
                    new_edges.push(index);
                }
            }
        }

        self.found_edges += new_edges.len() as u32;
        new_edges
    }

    /// Checkpoints the virgin map, e.g. at a session boundary.
    pub fn backup_virgin_bits(&mut self) {
        self.virgin_bits_backup.copy_from_slice(&self.virgin_bits);
    }

    /// Restores the virgin map to the last checkpoint.
    pub fn restore_virgin_bits(&mut self) {
        self.virgin_bits.copy_from_slice(&self.virgin_bits_backup);
        self.found_edges = bitmap::cleared_bits(&self.virgin_bits);
    }

    /// Copies the shared bitmap of the last execution into the snapshot
    /// space.
    pub fn snapshot_coverage_map(&mut self) {
        let len = self.scan_len();
        self.coverage_map_backup[..len].copy_from_slice(&self.shmem[EDGES_OFFSET..EDGES_OFFSET + len]);
    }

    /// Writes the snapshot back into the shared bitmap.
    pub fn restore_coverage_map(&mut self) {
        let len = self.scan_len();
        self.shmem[EDGES_OFFSET..EDGES_OFFSET + len].copy_from_slice(&self.coverage_map_backup[..len]);
    }

    /// Dumps the virgin map to `path` and returns the discovered-edge count.
    ///
    /// The file is a raw `bitmap_size`-byte dump with no header.
    pub fn save_virgin_bits(&self, path: &Path) -> Result<u32, CoverageError> {
        std::fs::write(path, &self.virgin_bits)?;
        debug!(worker = self.worker_id, path = %path.display(), "Virgin bitmap saved");
        Ok(bitmap::cleared_bits(&self.virgin_bits))
    }

    /// Loads a virgin map previously written by
    /// [`save_virgin_bits`](Self::save_virgin_bits) and returns the
    /// discovered-edge count.
    ///
    /// A size mismatch means the dump was recorded against a differently
    /// instrumented target and cannot be reconciled; the error is fatal for
    /// this worker. On success the loaded map is checkpointed and the shared
    /// bitmap cleared, so a following execution only reports genuinely new
    /// edges.
    pub fn load_virgin_bits(&mut self, path: &Path) -> Result<u32, CoverageError> {
        let data = std::fs::read(path)?;
        if data.len() != self.bitmap_size {
            return Err(CoverageError::BitmapSizeMismatch {
                expected: self.bitmap_size,
                actual: data.len(),
            });
        }
        self.virgin_bits.copy_from_slice(&data);
        bitmap::clear_edge(&mut self.virgin_bits, 0);
        self.found_edges = bitmap::cleared_bits(&self.virgin_bits);
        self.backup_virgin_bits();
        self.clear_bitmap();
        info!(
            worker = self.worker_id,
            edges = self.found_edges,
            path = %path.display(),
            "Virgin bitmap loaded"
        );
        Ok(self.found_edges)
    }

    /// Records `index` as found without an execution, on behalf of a
    /// scheduler importing coverage. Idempotent.
    pub fn mark_edge_found(&mut self, index: u32) {
        if index == 0 || index >= self.num_edges || !bitmap::edge(&self.virgin_bits, index) {
            return;
        }
        bitmap::clear_edge(&mut self.virgin_bits, index);
        self.found_edges += 1;
        if let Some(counts) = self.edge_counts.as_mut() {
            counts[index as usize] = 1;
        }
    }

    /// Retires `index` back to virgin. Inverse of
    /// [`mark_edge_found`](Self::mark_edge_found), equally idempotent.
    pub fn mark_edge_virgin(&mut self, index: u32) {
        if index == 0 || index >= self.num_edges || bitmap::edge(&self.virgin_bits, index) {
            return;
        }
        bitmap::set_edge(&mut self.virgin_bits, index);
        self.found_edges -= 1;
        if let Some(counts) = self.edge_counts.as_mut() {
            counts[index as usize] = 0;
        }
    }

    /// Forgets all discovered coverage, returning the virgin map to its
    /// post-initialization state.
    pub fn reset_state(&mut self) {
        self.virgin_bits.fill(0xFF);
        bitmap::clear_edge(&mut self.virgin_bits, 0);
        if let Some(counts) = self.edge_counts.as_mut() {
            counts.fill(0);
        }
        self.found_edges = 0;
    }

    pub fn found_edges(&self) -> u32 {
        self.found_edges
    }

    pub fn num_edges(&self) -> u32 {
        self.num_edges
    }

    pub fn edge_counts(&self) -> Option<&[u32]> {
        self.edge_counts.as_deref()
    }
}

impl Drop for CoverageMap {
    fn drop(&mut self) {
        if let Err(err) = shm_unlink(self.shm_name.as_str()) {
            warn!(name = %self.shm_name, %err, "Failed to unlink coverage shared memory");
        }
    }
}
