//! Binary checkpoint of live object-table entries.
//!
//! Layout: 40-byte header (magic, version, row size, epoch, entry count,
//! header CRC), densely packed 48-byte rows, 8-byte footer (entries CRC,
//! footer CRC). Written to a `.tmp` file and renamed into place, so a crash
//! never exposes a partial checkpoint. Read side maps the file and hands
//! out rows without copying the entries region.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use platform_fs::{MapMode, MappedRegion};

use super::checksums::{crc32c, Crc32c};
use super::config::checkpoint::{MAGIC, ROW_SIZE, VERSION};
use super::config::files::CHECKPOINT_PREFIX;
use super::node_id::{OtEntry, PersistentEntry};
use super::object_table::ObjectTable;

const HEADER_SIZE: usize = 40;
const FOOTER_SIZE: usize = 8;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_ROW_SIZE: usize = 12;
const OFF_EPOCH: usize = 16;
const OFF_ENTRY_COUNT: usize = 24;
const OFF_HEADER_CRC: usize = 32;

pub fn serialize_persistent_entry(out: &mut Vec<u8>, pe: &PersistentEntry) {
    out.extend_from_slice(&pe.handle_idx.to_le_bytes());
    out.extend_from_slice(&pe.tag.to_le_bytes());
    out.push(pe.class_id);
    out.push(pe.kind);
    out.extend_from_slice(&pe.file_id.to_le_bytes());
    out.extend_from_slice(&pe.segment_id.to_le_bytes());
    out.extend_from_slice(&pe.offset.to_le_bytes());
    out.extend_from_slice(&pe.length.to_le_bytes());
    out.extend_from_slice(&pe.birth_epoch.to_le_bytes());
    out.extend_from_slice(&pe.retire_epoch.to_le_bytes());
}

pub fn deserialize_persistent_entry(buf: &[u8]) -> PersistentEntry {
    debug_assert!(buf.len() >= PersistentEntry::WIRE_SIZE);
    let u16_at = |o: usize| u16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
    let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
    let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
    PersistentEntry {
        handle_idx: u64_at(0),
        tag: u16_at(8),
        class_id: buf[10],
        kind: buf[11],
        file_id: u32_at(12),
        segment_id: u32_at(16),
        offset: u64_at(20),
        length: u32_at(28),
        birth_epoch: u64_at(32),
        retire_epoch: u64_at(40),
    }
}

const _: () = assert!(PersistentEntry::WIRE_SIZE == ROW_SIZE as usize);

#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub epoch: u64,
    pub entries: u64,
    pub size: u64,
    pub entries_crc32c: u32,
}

/// A validated, memory-mapped checkpoint.
#[derive(Debug)]
pub struct CheckpointView {
    region: MappedRegion,
    epoch: u64,
    entry_count: u64,
}

impl CheckpointView {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn entry(&self, i: u64) -> PersistentEntry {
        debug_assert!(i < self.entry_count);
        let off = HEADER_SIZE + (i as usize) * PersistentEntry::WIRE_SIZE;
        deserialize_persistent_entry(&self.region.as_slice()[off..])
    }

    pub fn iter(&self) -> impl Iterator<Item = PersistentEntry> + '_ {
        (0..self.entry_count).map(move |i| self.entry(i))
    }
}

pub struct OtCheckpoint {
    data_dir: PathBuf,
}

impl OtCheckpoint {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn file_name(epoch: u64) -> String {
        format!("{}_epoch-{}.bin", CHECKPOINT_PREFIX, epoch)
    }

    /// Snapshot every live entry at `epoch` and atomically install the file.
    pub fn write(&self, ot: &ObjectTable, epoch: u64) -> Result<CheckpointInfo> {
        platform_fs::ensure_directory(&self.data_dir)?;
        let final_path = self.data_dir.join(Self::file_name(epoch));
        let tmp_path = self.data_dir.join(format!("{}.tmp", Self::file_name(epoch)));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;

        // Placeholder header; entry count and CRC are backfilled below.
        file.write_all(&[0u8; HEADER_SIZE])?;

        let mut entries_crc = Crc32c::new();
        let mut entry_count = 0u64;
        let mut row = Vec::with_capacity(PersistentEntry::WIRE_SIZE);
        let mut write_err: Option<std::io::Error> = None;

        ot.iterate_live_snapshot(|handle_idx, e: &OtEntry| {
            if write_err.is_some() {
                return;
            }
            let pe = PersistentEntry {
                handle_idx,
                tag: e.tag as u16,
                class_id: e.class_id,
                kind: e.kind.into(),
                file_id: e.addr.file_id,
                segment_id: e.addr.segment_id,
                offset: e.addr.offset,
                length: e.addr.length,
                birth_epoch: e.birth_epoch,
                retire_epoch: e.retire_epoch,
            };
            row.clear();
            serialize_persistent_entry(&mut row, &pe);
            entries_crc.update(&row);
            if let Err(e) = file.write_all(&row) {
                write_err = Some(e);
            }
            entry_count += 1;
        });
        if let Some(e) = write_err {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).context("stream checkpoint entries");
        }

        let entries_crc = entries_crc.finalize();

        // Footer: entries CRC, then the footer's own CRC with its field
        // treated as zero.
        let mut footer = [0u8; FOOTER_SIZE];
        footer[0..4].copy_from_slice(&entries_crc.to_le_bytes());
        let footer_crc = crc32c(&footer);
        footer[4..8].copy_from_slice(&footer_crc.to_le_bytes());
        file.write_all(&footer)?;

        // Backfill the header.
        let mut header = [0u8; HEADER_SIZE];
        header[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC.to_le_bytes());
        header[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VERSION.to_le_bytes());
        header[OFF_ROW_SIZE..OFF_ROW_SIZE + 4].copy_from_slice(&ROW_SIZE.to_le_bytes());
        header[OFF_EPOCH..OFF_EPOCH + 8].copy_from_slice(&epoch.to_le_bytes());
        header[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 8].copy_from_slice(&entry_count.to_le_bytes());
        let header_crc = crc32c(&header);
        header[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&header_crc.to_le_bytes());

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.flush()?;
        platform_fs::flush_file(file.as_raw_fd())?;
        drop(file);

        platform_fs::atomic_replace(&tmp_path, &final_path)?;

        let size = platform_fs::file_size(&final_path)?;
        info!(
            "checkpoint epoch {} written: {} entries, {} bytes",
            epoch, entry_count, size
        );
        Ok(CheckpointInfo {
            path: final_path,
            epoch,
            entries: entry_count,
            size,
            entries_crc32c: entries_crc,
        })
    }

    /// Map a checkpoint read-only and validate every integrity field.
    pub fn map_for_read(path: &Path) -> Result<CheckpointView> {
        let size = platform_fs::file_size(path)? as usize;
        if size < HEADER_SIZE + FOOTER_SIZE {
            bail!("checkpoint {} too small ({} bytes)", path.display(), size);
        }

        let region = platform_fs::map_file(path, 0, size, MapMode::ReadOnly)?;
        let bytes = region.as_slice();

        let magic = u64::from_le_bytes(bytes[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic != MAGIC {
            bail!("checkpoint {} bad magic {:#x}", path.display(), magic);
        }
        let version = u32::from_le_bytes(bytes[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
        if version != VERSION {
            bail!("checkpoint {} unsupported version {}", path.display(), version);
        }
        let row_size = u32::from_le_bytes(bytes[OFF_ROW_SIZE..OFF_ROW_SIZE + 4].try_into().unwrap());
        if row_size != ROW_SIZE {
            bail!("checkpoint {} row size {} != {}", path.display(), row_size, ROW_SIZE);
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let stored_header_crc =
            u32::from_le_bytes(header[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].try_into().unwrap());
        header[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&[0u8; 4]);
        if crc32c(&header) != stored_header_crc {
            bail!("checkpoint {} header CRC mismatch", path.display());
        }

        let epoch = u64::from_le_bytes(bytes[OFF_EPOCH..OFF_EPOCH + 8].try_into().unwrap());
        let entry_count =
            u64::from_le_bytes(bytes[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 8].try_into().unwrap());

        let entries_bytes = size - HEADER_SIZE - FOOTER_SIZE;
        if entries_bytes % PersistentEntry::WIRE_SIZE != 0 {
            bail!(
                "checkpoint {} size not congruent with row size",
                path.display()
            );
        }
        if entries_bytes as u64 != entry_count * PersistentEntry::WIRE_SIZE as u64 {
            bail!(
                "checkpoint {} entry count {} does not match file size",
                path.display(),
                entry_count
            );
        }

        let footer = &bytes[size - FOOTER_SIZE..];
        let stored_entries_crc = u32::from_le_bytes(footer[0..4].try_into().unwrap());
        let stored_footer_crc = u32::from_le_bytes(footer[4..8].try_into().unwrap());

        let mut footer_check = [0u8; FOOTER_SIZE];
        footer_check[0..4].copy_from_slice(&footer[0..4]);
        if crc32c(&footer_check) != stored_footer_crc {
            bail!("checkpoint {} footer CRC mismatch", path.display());
        }

        let computed_entries_crc = crc32c(&bytes[HEADER_SIZE..size - FOOTER_SIZE]);
        if computed_entries_crc != stored_entries_crc {
            bail!("checkpoint {} entries CRC mismatch", path.display());
        }

        Ok(CheckpointView {
            region,
            epoch,
            entry_count,
        })
    }

    /// Epoch encoded in a checkpoint file name, if it is one.
    pub fn parse_epoch(name: &str) -> Option<u64> {
        let prefix = format!("{}_epoch-", CHECKPOINT_PREFIX);
        let rest = name.strip_prefix(&prefix)?;
        let digits = rest.strip_suffix(".bin")?;
        digits.parse().ok()
    }

    /// Highest-epoch checkpoint in `dir`, ignoring in-flight `.tmp` files.
    pub fn find_latest_checkpoint(dir: &Path) -> Option<PathBuf> {
        let mut best: Option<(u64, PathBuf)> = None;
        let entries = std::fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(epoch) = Self::parse_epoch(&name) {
                if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                    best = Some((epoch, entry.path()));
                }
            }
        }
        best.map(|(_, p)| p)
    }

    /// Keep the newest `keep` checkpoints by epoch, unlink the rest.
    pub fn cleanup_old_checkpoints(dir: &Path, keep: usize) -> Result<usize> {
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("read dir {}", dir.display()))?
            .flatten()
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(epoch) = Self::parse_epoch(&name) {
                found.push((epoch, entry.path()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (_, path) in found.into_iter().skip(keep) {
            if std::fs::remove_file(&path).is_ok() {
                debug!("removed old checkpoint {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::node_id::{NodeId, NodeKind, OtAddr, INVALID_EPOCH};
    use crate::persist::utils::testing::{cleanup, test_dir};

    fn populated_table(n: u64) -> (ObjectTable, Vec<NodeId>) {
        let ot = ObjectTable::with_entries_per_slab(256);
        let mut live = Vec::new();
        for i in 0..n {
            let id = ot.allocate(
                NodeKind::Leaf,
                2,
                OtAddr {
                    file_id: 1,
                    segment_id: (i / 64) as u32,
                    offset: i * 256,
                    length: 256,
                },
                i + 1,
            );
            if i % 3 == 0 {
                ot.retire(id, i + 2);
            } else {
                live.push(id);
            }
        }
        (ot, live)
    }

    fn flip_byte(path: &Path, offset: usize) {
        let mut bytes = std::fs::read(path).unwrap();
        bytes[offset] ^= 0xFF;
        std::fs::write(path, &bytes).unwrap();
    }

    #[test]
    fn empty_checkpoint_round_trips() -> Result<()> {
        let dir = test_dir("ckpt_empty");
        let ckpt = OtCheckpoint::new(&dir);
        let ot = ObjectTable::with_entries_per_slab(128);
        let info = ckpt.write(&ot, 5)?;
        assert_eq!(info.entries, 0);

        let view = OtCheckpoint::map_for_read(&info.path)?;
        assert_eq!(view.epoch(), 5);
        assert_eq!(view.entry_count(), 0);
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn live_entries_round_trip_preserving_handles() -> Result<()> {
        let dir = test_dir("ckpt_rt");
        let ckpt = OtCheckpoint::new(&dir);
        let (ot, live) = populated_table(300);
        let info = ckpt.write(&ot, 1000)?;
        assert_eq!(info.entries as usize, live.len());

        // Restore into a fresh table; every pre-restart NodeID must resolve
        // to the same address.
        let view = OtCheckpoint::map_for_read(&info.path)?;
        let ot2 = ObjectTable::with_entries_per_slab(256);
        for pe in view.iter() {
            assert!(pe.is_live());
            ot2.restore_handle(pe.handle_idx, &pe);
        }
        for id in &live {
            let before = ot.lookup(*id).unwrap();
            let after = ot2.lookup(*id).expect("NodeID lost across restart");
            assert_eq!(before.addr, after.addr);
            assert_eq!(before.birth_epoch, after.birth_epoch);
        }
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn file_size_matches_formula() -> Result<()> {
        let dir = test_dir("ckpt_size");
        let ckpt = OtCheckpoint::new(&dir);
        let (ot, live) = populated_table(100);
        let info = ckpt.write(&ot, 7)?;
        assert_eq!(
            info.size as usize,
            HEADER_SIZE + live.len() * PersistentEntry::WIRE_SIZE + FOOTER_SIZE
        );
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn corrupted_header_rejected() -> Result<()> {
        let dir = test_dir("ckpt_hdr");
        let ckpt = OtCheckpoint::new(&dir);
        let (ot, _) = populated_table(50);
        let info = ckpt.write(&ot, 9)?;

        flip_byte(&info.path, OFF_EPOCH);
        assert!(OtCheckpoint::map_for_read(&info.path).is_err());
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn corrupted_entry_rejected() -> Result<()> {
        let dir = test_dir("ckpt_entry");
        let ckpt = OtCheckpoint::new(&dir);
        let (ot, _) = populated_table(50);
        let info = ckpt.write(&ot, 9)?;

        flip_byte(&info.path, HEADER_SIZE + PersistentEntry::WIRE_SIZE + 3);
        let err = OtCheckpoint::map_for_read(&info.path).unwrap_err();
        assert!(err.to_string().contains("entries CRC"));
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn truncated_footer_rejected() -> Result<()> {
        let dir = test_dir("ckpt_foot");
        let ckpt = OtCheckpoint::new(&dir);
        let (ot, _) = populated_table(20);
        let info = ckpt.write(&ot, 9)?;

        // Chop the footer CRC field.
        platform_fs::truncate(&info.path, info.size - 4)?;
        assert!(OtCheckpoint::map_for_read(&info.path).is_err());
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn size_congruence_enforced() -> Result<()> {
        let dir = test_dir("ckpt_congr");
        let ckpt = OtCheckpoint::new(&dir);
        let (ot, _) = populated_table(20);
        let info = ckpt.write(&ot, 9)?;

        // Append a partial row's worth of bytes.
        let mut bytes = std::fs::read(&info.path)?;
        bytes.extend_from_slice(&[0u8; 17]);
        std::fs::write(&info.path, &bytes)?;
        let err = OtCheckpoint::map_for_read(&info.path).unwrap_err();
        assert!(err.to_string().contains("congruent") || err.to_string().contains("entry count"));
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn wrong_row_size_rejected_even_with_valid_crc() -> Result<()> {
        let dir = test_dir("ckpt_rowsz");
        let ckpt = OtCheckpoint::new(&dir);
        let (ot, _) = populated_table(10);
        let info = ckpt.write(&ot, 9)?;

        // Rewrite row_size and recompute the header CRC so only the row
        // size check can catch it.
        let mut bytes = std::fs::read(&info.path)?;
        bytes[OFF_ROW_SIZE..OFF_ROW_SIZE + 4].copy_from_slice(&999u32.to_le_bytes());
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        header[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&[0u8; 4]);
        let crc = crc32c(&header);
        bytes[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&crc.to_le_bytes());
        std::fs::write(&info.path, &bytes)?;

        let err = OtCheckpoint::map_for_read(&info.path).unwrap_err();
        assert!(err.to_string().contains("row size"));
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn discovery_and_cleanup() -> Result<()> {
        let dir = test_dir("ckpt_disc");
        let ckpt = OtCheckpoint::new(&dir);
        let ot = ObjectTable::with_entries_per_slab(128);

        for epoch in [10u64, 50, 30] {
            ckpt.write(&ot, epoch)?;
        }
        // An in-flight temp file must be ignored.
        std::fs::write(dir.join("ot_checkpoint_epoch-99.bin.tmp"), b"junk")?;

        let latest = OtCheckpoint::find_latest_checkpoint(&dir).unwrap();
        assert_eq!(OtCheckpoint::parse_epoch(
            latest.file_name().unwrap().to_str().unwrap()
        ), Some(50));

        let removed = OtCheckpoint::cleanup_old_checkpoints(&dir, 2)?;
        assert_eq!(removed, 1);
        assert!(!dir.join(OtCheckpoint::file_name(10)).exists());
        assert!(dir.join(OtCheckpoint::file_name(30)).exists());
        assert!(dir.join(OtCheckpoint::file_name(50)).exists());
        cleanup(&dir);
        Ok(())
    }
}
