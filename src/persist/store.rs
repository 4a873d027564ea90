//! DurableStore: the writer-facing assembly of the storage engine.
//!
//! The index layer talks to this facade: write a node's bytes, read them
//! back by NodeID, retire, commit a (root, epoch) pair, checkpoint. It owns
//! the policy the lower layers deliberately don't: when to checkpoint,
//! when to seal and rotate the delta log, when sealed logs become garbage.
//!
//! Single writer, many readers: `write_node`/`retire_node`/`commit`/
//! `checkpoint` come from one logical writer thread; `read_node` and
//! `node_ptr` are safe from any thread.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use log::{info, warn};

use super::checkpoint::{CheckpointInfo, OtCheckpoint};
use super::checksums::crc32c;
use super::config::{delta_log, files, StorageConfig};
use super::delta_log::{DeltaLog, DeltaWithPayload};
use super::file_registry::FileHandleRegistry;
use super::manifest::{CheckpointEntry, DeltaLogInfo, Manifest};
use super::mapping::MappingManager;
use super::node_id::{NodeId, NodeKind, OtDeltaRec, OtEntry, INVALID_EPOCH};
use super::object_table::ObjectTable;
use super::recovery::{Recovery, RecoveryReport};
use super::segment::{Allocation, SegmentAllocator};
use super::superblock::Superblock;

pub struct DurableStore {
    data_dir: PathBuf,
    config: StorageConfig,
    allocator: SegmentAllocator,
    object_table: ObjectTable,
    superblock: Superblock,
    manifest: Mutex<Manifest>,
    log: Mutex<Arc<DeltaLog>>,
    log_seq: AtomicU64,
}

impl DurableStore {
    /// Open a volume: run cold-start recovery (rehydrating WAL payloads),
    /// then resume appending to the active delta log.
    pub fn open(data_dir: &Path, config: StorageConfig) -> Result<(Self, RecoveryReport)> {
        Self::open_with_registries(
            data_dir,
            config,
            FileHandleRegistry::global(),
            MappingManager::global(),
        )
    }

    /// Like `open`, but with injected registries so tests and embedders can
    /// run private instances.
    pub fn open_with_registries(
        data_dir: &Path,
        config: StorageConfig,
        fhr: Arc<FileHandleRegistry>,
        mm: Arc<MappingManager>,
    ) -> Result<(Self, RecoveryReport)> {
        platform_fs::ensure_directory(data_dir)?;

        let allocator = SegmentAllocator::with_config(data_dir, fhr, mm, config.clone())?;
        let object_table = ObjectTable::new();
        let superblock = Superblock::new(&data_dir.join(files::META_FILE))?;
        let mut manifest = Manifest::new(data_dir);

        let report = Recovery::new(
            &mut manifest,
            &object_table,
            &superblock,
            Some(&allocator),
            config.clone(),
        )
        .cold_start_with_payloads()?;

        // Resume the active log named by the manifest; fall back to the
        // default name on a fresh volume.
        let (log_name, log_seq) = match manifest.delta_logs().iter().find(|l| !l.is_sealed()) {
            Some(active) => (active.path.clone(), log_sequence_of(&active.path)),
            None => (files::DELTA_LOG_FILE.to_string(), 0),
        };
        let log = Arc::new(DeltaLog::new(
            &data_dir.join(&log_name),
            delta_log::PREALLOC_CHUNK,
            log_seq,
        )?);
        if !manifest.delta_logs().iter().any(|l| l.path == log_name) {
            manifest.add_delta_log(DeltaLogInfo {
                path: log_name,
                start_epoch: report.snapshot.epoch + 1,
                end_epoch: None,
                size: log.size_bytes(),
            });
            manifest.store()?;
        }

        Ok((
            Self {
                data_dir: data_dir.to_path_buf(),
                config,
                allocator,
                object_table,
                superblock,
                manifest: Mutex::new(manifest),
                log: Mutex::new(log),
                log_seq: AtomicU64::new(log_seq),
            },
            report,
        ))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn allocator(&self) -> &SegmentAllocator {
        &self.allocator
    }

    pub fn object_table(&self) -> &ObjectTable {
        &self.object_table
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn active_log(&self) -> Arc<DeltaLog> {
        self.log.lock().unwrap().clone()
    }

    /// Store `bytes` as a new node: allocate a block, copy the bytes in,
    /// register the handle, and journal both through the WAL.
    pub fn write_node(&self, bytes: &[u8], kind: NodeKind, epoch: u64) -> Result<NodeId> {
        if bytes.is_empty() {
            bail!("refusing to write an empty node");
        }
        if bytes.len() > super::config::size_class::MAX_SIZE {
            bail!(
                "node of {} bytes exceeds the largest size class ({})",
                bytes.len(),
                super::config::size_class::MAX_SIZE
            );
        }
        let a = self.allocator.allocate(bytes.len(), kind)?;
        if !a.is_valid() {
            bail!("segment allocation of {} bytes failed", bytes.len());
        }

        let dst = self
            .allocator
            .get_ptr(&a)
            .context("allocated block is not addressable")?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        }

        let id = self
            .object_table
            .allocate(kind, a.class_id, a.into_addr(), epoch);

        let delta = OtDeltaRec {
            handle_idx: id.handle_idx(),
            tag: id.tag() as u16,
            class_id: a.class_id,
            kind: kind.into(),
            file_id: a.file_id,
            segment_id: a.segment_id,
            offset: a.offset,
            length: a.length,
            data_crc32c: crc32c(bytes),
            birth_epoch: epoch,
            retire_epoch: INVALID_EPOCH,
        };
        self.active_log().append_with_payloads(&[DeltaWithPayload {
            delta,
            payload: Some(bytes.to_vec()),
        }])?;

        Ok(id)
    }

    /// Borrow-free pointer to a node's bytes. The pointer stays valid while
    /// the segment stays pinned; callers that hold it across
    /// `release_cold_pins` must re-resolve.
    pub fn node_ptr(&self, id: NodeId) -> Option<(NonNull<u8>, u32)> {
        let entry = self.object_table.lookup(id)?;
        let a = Allocation {
            file_id: entry.addr.file_id,
            segment_id: entry.addr.segment_id,
            offset: entry.addr.offset,
            length: entry.addr.length,
            class_id: entry.class_id,
        };
        // A checkpoint-restored entry may address a segment this process
        // has not republished yet; the recovery path maps it on demand.
        let ptr = self.allocator.get_ptr(&a).or_else(|| {
            self.allocator.get_ptr_for_recovery(
                a.class_id,
                a.file_id,
                a.segment_id,
                a.offset,
                a.length,
            )
        })?;
        Some((ptr, entry.addr.length))
    }

    /// Copying read; always safe. The returned buffer is the full class
    /// block, so callers track logical lengths themselves.
    pub fn read_node(&self, id: NodeId) -> Option<Vec<u8>> {
        let (ptr, len) = self.node_ptr(id)?;
        let mut out = vec![0u8; len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), out.as_mut_ptr(), len as usize);
        }
        Some(out)
    }

    pub fn lookup(&self, id: NodeId) -> Option<OtEntry> {
        self.object_table.lookup(id)
    }

    /// Retire a node at `epoch` and journal the retirement.
    pub fn retire_node(&self, id: NodeId, epoch: u64) -> Result<bool> {
        let Some(entry) = self.object_table.lookup(id) else {
            return Ok(false);
        };
        if !self.object_table.retire(id, epoch) {
            return Ok(false);
        }
        let delta = OtDeltaRec {
            handle_idx: id.handle_idx(),
            tag: id.tag() as u16,
            class_id: entry.class_id,
            kind: entry.kind.into(),
            file_id: entry.addr.file_id,
            segment_id: entry.addr.segment_id,
            offset: entry.addr.offset,
            length: entry.addr.length,
            data_crc32c: 0,
            birth_epoch: entry.birth_epoch,
            retire_epoch: epoch,
        };
        self.active_log().append(&[delta])?;
        Ok(true)
    }

    /// Durably publish `(root, epoch)`: fsync the WAL, then flip the
    /// superblock. After this returns, recovery lands on exactly this
    /// state.
    pub fn commit(&self, root: NodeId, epoch: u64) -> Result<()> {
        self.active_log().sync()?;
        self.superblock.publish(root, epoch)?;
        Ok(())
    }

    /// Snapshot the object table at `epoch`, seal and rotate the delta log,
    /// and drop artifacts the checkpoint supersedes.
    ///
    /// Runs on the writer; callers quiesce writes for the duration.
    pub fn checkpoint(&self, epoch: u64) -> Result<CheckpointInfo> {
        let info = OtCheckpoint::new(&self.data_dir).write(&self.object_table, epoch)?;

        let mut manifest = self.manifest.lock().unwrap();
        manifest.set_checkpoint(CheckpointEntry {
            path: info
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            epoch: info.epoch,
            size: info.size,
            entries: info.entries,
            crc32c: info.entries_crc32c,
        });

        // Seal the active log at the checkpoint epoch and open a successor.
        let old_log = {
            let mut slot = self.log.lock().unwrap();
            let old = slot.clone();
            let seq = self.log_seq.fetch_add(1, Ordering::AcqRel) + 1;
            let new_name = rotated_log_name(seq);
            let new_log = Arc::new(DeltaLog::new(
                &self.data_dir.join(&new_name),
                delta_log::PREALLOC_CHUNK,
                seq,
            )?);
            manifest.seal_delta_log(
                &log_file_name(&old),
                epoch,
                old.size_bytes(),
            );
            manifest.add_delta_log(DeltaLogInfo {
                path: new_name,
                start_epoch: epoch + 1,
                end_epoch: None,
                size: 0,
            });
            *slot = new_log;
            old
        };
        old_log.sync()?;
        old_log.close();

        // Sealed logs covered by the checkpoint are garbage now.
        let dead: Vec<String> = manifest
            .delta_logs()
            .iter()
            .filter(|l| matches!(l.end_epoch, Some(end) if end <= epoch))
            .map(|l| l.path.clone())
            .collect();
        manifest.prune_old_delta_logs(epoch);
        manifest.store()?;
        drop(manifest);

        for name in dead {
            let path = self.data_dir.join(&name);
            if std::fs::remove_file(&path).is_ok() {
                info!("removed superseded delta log {}", path.display());
            }
        }
        if let Err(e) =
            OtCheckpoint::cleanup_old_checkpoints(&self.data_dir, self.config.checkpoint_keep_count)
        {
            warn!("checkpoint cleanup failed: {e:#}");
        }

        Ok(info)
    }

    /// Free object-table slots retired at or before `safe_epoch`.
    pub fn reclaim_before_epoch(&self, safe_epoch: u64) -> usize {
        self.object_table.reclaim_before_epoch(safe_epoch)
    }

    /// Periodic maintenance: drop segment pins idle past `threshold_ns` so
    /// the mapping layer's budget eviction can make progress.
    pub fn release_cold_pins(&self, threshold_ns: u64) -> usize {
        self.allocator.release_cold_pins(threshold_ns)
    }

    pub fn manifest(&self) -> std::sync::MutexGuard<'_, Manifest> {
        self.manifest.lock().unwrap()
    }

    /// Flush the WAL and stop accepting appends. The superblock stays
    /// mapped until drop.
    pub fn close(&self) -> Result<()> {
        let log = self.active_log();
        log.sync()?;
        log.close();
        self.allocator.close_all();
        Ok(())
    }
}

fn log_file_name(log: &DeltaLog) -> String {
    log.path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn rotated_log_name(seq: u64) -> String {
    format!("ot_delta-{seq}.wal")
}

fn log_sequence_of(name: &str) -> u64 {
    name.strip_prefix("ot_delta-")
        .and_then(|rest| rest.strip_suffix(".wal"))
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

impl Allocation {
    fn into_addr(self) -> super::node_id::OtAddr {
        super::node_id::OtAddr {
            file_id: self.file_id,
            segment_id: self.segment_id,
            offset: self.offset,
            length: self.length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::utils::testing::{cleanup, test_dir};

    fn open(dir: &Path) -> (DurableStore, RecoveryReport) {
        let fhr = Arc::new(FileHandleRegistry::new(64));
        let mm = Arc::new(MappingManager::new(fhr.clone(), 1 << 20, 256));
        DurableStore::open_with_registries(dir, StorageConfig::default(), fhr, mm).unwrap()
    }

    fn node_bytes(i: u64, len: usize) -> Vec<u8> {
        (0..len).map(|j| ((i as usize * 31 + j) % 251) as u8).collect()
    }

    #[test]
    fn write_commit_restart_read() -> Result<()> {
        let dir = test_dir("store_cycle");
        let mut ids = Vec::new();
        {
            let (store, report) = open(&dir);
            assert_eq!(report.snapshot.epoch, 0);
            for i in 1..=50u64 {
                ids.push(store.write_node(&node_bytes(i, 200), NodeKind::Leaf, i)?);
            }
            store.commit(ids[0], 50)?;
            store.close()?;
        }

        let (store, report) = open(&dir);
        assert_eq!(report.snapshot.epoch, 50);
        assert_eq!(report.snapshot.root, ids[0]);
        assert_eq!(report.deltas_replayed, 50);

        for (i, id) in ids.iter().enumerate() {
            let bytes = store.read_node(*id).expect("node lost across restart");
            // Class-rounded block: compare the logical prefix.
            assert_eq!(&bytes[..200], node_bytes(i as u64 + 1, 200).as_slice());
        }
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn checkpoint_bulk_load_preserves_node_ids() -> Result<()> {
        let dir = test_dir("store_ckpt");
        let mut live = Vec::new();
        let root;
        {
            let (store, _) = open(&dir);
            let mut epoch = 0;
            let mut all = Vec::new();
            for i in 1..=600u64 {
                epoch = i;
                all.push((store.write_node(&node_bytes(i, 128), NodeKind::Leaf, epoch)?, i));
            }
            // Retire every third node.
            for (idx, (id, _)) in all.iter().enumerate() {
                if idx % 3 == 0 {
                    epoch += 1;
                    store.retire_node(*id, epoch)?;
                } else {
                    live.push(*id);
                }
            }
            root = live[0];
            store.commit(root, epoch)?;
            store.checkpoint(epoch)?;
            store.commit(root, epoch)?;
            store.close()?;
        }

        let (store, report) = open(&dir);
        // Everything came from the checkpoint; the fresh log is empty.
        assert!(report.checkpoint_epoch > 0);
        assert_eq!(report.deltas_replayed, 0);
        assert_eq!(store.object_table().live_count(), live.len());
        for id in &live {
            assert!(store.lookup(*id).is_some(), "live NodeID lost");
            assert!(store.read_node(*id).is_some());
        }
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn checkpoint_rotates_and_deletes_covered_logs() -> Result<()> {
        let dir = test_dir("store_rotate");
        let (store, _) = open(&dir);

        let id = store.write_node(&node_bytes(1, 64), NodeKind::Leaf, 1)?;
        store.commit(id, 1)?;
        assert!(dir.join(files::DELTA_LOG_FILE).exists());

        store.checkpoint(1)?;

        // Old log sealed at epoch 1 and superseded; a fresh one is active.
        assert!(!dir.join(files::DELTA_LOG_FILE).exists());
        assert!(dir.join("ot_delta-1.wal").exists());
        let manifest = store.manifest();
        assert_eq!(manifest.delta_logs().len(), 1);
        assert_eq!(manifest.delta_logs()[0].path, "ot_delta-1.wal");
        assert!(manifest.checkpoint().is_set());
        drop(manifest);

        // Appends continue on the new log.
        drop(store);
        let (store, _) = open(&dir);
        let id2 = store.write_node(&node_bytes(2, 64), NodeKind::Leaf, 2)?;
        store.commit(id2, 2)?;
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn retired_nodes_vanish_after_restart() -> Result<()> {
        let dir = test_dir("store_retire");
        let keep;
        let gone;
        {
            let (store, _) = open(&dir);
            keep = store.write_node(&node_bytes(1, 64), NodeKind::Leaf, 1)?;
            gone = store.write_node(&node_bytes(2, 64), NodeKind::Leaf, 2)?;
            store.retire_node(gone, 3)?;
            store.commit(keep, 3)?;
            store.close()?;
        }

        let (store, _) = open(&dir);
        assert!(store.lookup(keep).is_some());
        let e = store.lookup(gone).expect("retired entry still visible pre-reclaim");
        assert!(!e.is_live());
        store.reclaim_before_epoch(3);
        assert!(store.lookup(gone).is_none());
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn write_after_close_fails() -> Result<()> {
        let dir = test_dir("store_closed");
        let (store, _) = open(&dir);
        store.write_node(&node_bytes(1, 64), NodeKind::Leaf, 1)?;
        store.close()?;
        assert!(store.write_node(&node_bytes(2, 64), NodeKind::Leaf, 2).is_err());
        cleanup(&dir);
        Ok(())
    }
}
