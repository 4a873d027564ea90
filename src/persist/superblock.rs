//! The one-page mapped superblock: authoritative committed (root, epoch).
//!
//! Publish uses a seqlock (the counter goes odd while the payload fields
//! are written, even again when consistent) so readers never block the
//! writer and never observe a mixed pair. The magic is written only on the
//! first publish; its absence marks an un-initialized volume.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{Context, Result};
use log::warn;
use platform_fs::{MapMode, MappedRegion};

use super::checksums::Crc32c;
use super::config::superblock::{HEADER_SIZE, MAGIC, VERSION};
use super::node_id::NodeId;
use super::utils::unix_now;

// On-disk header offsets. 8-byte fields sit on 8-byte boundaries.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_HEADER_SIZE: usize = 12;
const OFF_SEQ: usize = 16;
const OFF_ROOT_ID: usize = 24;
const OFF_COMMIT_EPOCH: usize = 32;
const OFF_GENERATION: usize = 40;
const OFF_CREATED_UNIX: usize = 48;
const OFF_HEADER_CRC: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub root: NodeId,
    pub epoch: u64,
}

pub struct Superblock {
    path: PathBuf,
    region: Option<MappedRegion>,
}

impl Superblock {
    pub fn new(meta_path: &Path) -> Result<Self> {
        if let Some(parent) = meta_path.parent() {
            if !parent.as_os_str().is_empty() {
                platform_fs::ensure_directory(parent)?;
            }
        }

        let existed = meta_path.exists();
        match platform_fs::file_size(meta_path) {
            Ok(sz) if sz as usize != HEADER_SIZE => {
                platform_fs::truncate(meta_path, HEADER_SIZE as u64)?;
            }
            Ok(_) => {}
            Err(_) => {
                platform_fs::preallocate(meta_path, HEADER_SIZE as u64)?;
            }
        }

        let region = platform_fs::map_file(meta_path, 0, HEADER_SIZE, MapMode::ReadWrite)
            .with_context(|| format!("map superblock {}", meta_path.display()))?;

        let sb = Self {
            path: meta_path.to_path_buf(),
            region: Some(region),
        };

        // The mapped page is page-aligned, so these always hold; assert the
        // layout anyway because the atomics rely on it.
        assert_eq!(sb.base() as usize % 8, 0, "superblock mapping misaligned");
        assert_eq!(OFF_ROOT_ID % 8, 0);
        assert_eq!(OFF_COMMIT_EPOCH % 8, 0);
        assert_eq!(OFF_GENERATION % 8, 0);

        if !existed {
            // Fresh volume: zero-filled by creation. Magic stays unset until
            // the first publish so half-initialized volumes read as empty.
            sb.u32_at(OFF_VERSION).store(VERSION, Ordering::Relaxed);
            sb.u32_at(OFF_HEADER_SIZE)
                .store(HEADER_SIZE as u32, Ordering::Relaxed);
            sb.u64_at(OFF_GENERATION).store(1, Ordering::Relaxed);
            sb.u64_at(OFF_CREATED_UNIX)
                .store(unix_now() as u64, Ordering::Relaxed);
            sb.u32_at(OFF_SEQ).store(0, Ordering::Relaxed);
        }

        Ok(sb)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn valid(&self) -> bool {
        self.region.is_some()
    }

    fn base(&self) -> *mut u8 {
        self.region.as_ref().expect("superblock not mapped").addr()
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        unsafe { &*(self.base().add(off) as *const AtomicU32) }
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        unsafe { &*(self.base().add(off) as *const AtomicU64) }
    }

    pub fn generation(&self) -> u64 {
        self.u64_at(OFF_GENERATION).load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.u64_at(OFF_MAGIC).load(Ordering::Relaxed) == MAGIC
    }

    /// Seqlock read. Pre-first-publish volumes load as `(INVALID, 0)`.
    pub fn load(&self) -> Snapshot {
        if !self.valid() || !self.is_initialized() {
            return Snapshot {
                root: NodeId::INVALID,
                epoch: 0,
            };
        }

        let seq = self.u32_at(OFF_SEQ);
        let root = self.u64_at(OFF_ROOT_ID);
        let epoch = self.u64_at(OFF_COMMIT_EPOCH);

        loop {
            let seq1 = seq.load(Ordering::Acquire);
            if seq1 & 1 != 0 {
                std::thread::yield_now();
                continue;
            }
            let r = root.load(Ordering::Acquire);
            let e = epoch.load(Ordering::Acquire);
            let seq2 = seq.load(Ordering::Acquire);
            if seq1 == seq2 && seq2 & 1 == 0 {
                return Snapshot {
                    root: NodeId::from_raw(r),
                    epoch: e,
                };
            }
        }
    }

    /// Seqlock write, then durable flush. Single writer per volume; callers
    /// serialize publish.
    pub fn publish(&self, new_root: NodeId, new_epoch: u64) -> Result<()> {
        if !self.valid() {
            warn!("publish on unmapped superblock ignored");
            return Ok(());
        }

        let aseq = self.u32_at(OFF_SEQ);
        let seq = aseq.load(Ordering::Relaxed);

        // Odd: write in progress.
        aseq.store(seq + 1, Ordering::Release);

        self.u64_at(OFF_ROOT_ID)
            .store(new_root.raw(), Ordering::Relaxed);
        self.u64_at(OFF_COMMIT_EPOCH)
            .store(new_epoch, Ordering::Relaxed);
        self.u64_at(OFF_GENERATION).fetch_add(1, Ordering::Relaxed);

        // First publish stamps the magic: magic present means fully written.
        if !self.is_initialized() {
            self.u64_at(OFF_MAGIC).store(MAGIC, Ordering::Relaxed);
        }

        let crc = self.compute_header_crc(seq + 2);
        self.u32_at(OFF_HEADER_CRC).store(crc, Ordering::Relaxed);

        // Even again: consistent.
        aseq.store(seq + 2, Ordering::Release);

        let region = self.region.as_ref().unwrap();
        region.flush_view()?;
        region.flush_file()?;
        Ok(())
    }

    /// CRC over the whole header with the seq field substituted by the even
    /// value it will settle at and the CRC field treated as zero.
    fn compute_header_crc(&self, even_seq: u32) -> u32 {
        let bytes = self.region.as_ref().unwrap().as_slice();
        let mut crc = Crc32c::new();
        crc.update(&bytes[..OFF_SEQ]);
        crc.update(&even_seq.to_le_bytes());
        crc.update(&bytes[OFF_SEQ + 4..OFF_HEADER_CRC]);
        crc.update(&[0u8; 4]);
        crc.update(&bytes[OFF_HEADER_CRC + 4..]);
        crc.finalize()
    }

    /// Integrity check of the stored header. Only meaningful on a quiescent
    /// (no concurrent publish) superblock.
    pub fn verify_crc(&self) -> bool {
        if !self.valid() || !self.is_initialized() {
            return false;
        }
        let seq = self.u32_at(OFF_SEQ).load(Ordering::Acquire);
        if seq & 1 != 0 {
            return false;
        }
        let stored = self.u32_at(OFF_HEADER_CRC).load(Ordering::Relaxed);
        stored == self.compute_header_crc(seq)
    }
}
