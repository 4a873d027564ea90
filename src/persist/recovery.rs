//! Cold-start recovery: rebuild live state from manifest, checkpoint, delta
//! logs and superblock, in that order.
//!
//! The checkpoint bulk-loads the object table while preserving NodeIDs; only
//! the delta suffix newer than the checkpoint is replayed, so recovery time
//! is bounded by write traffic since the last checkpoint, not by history.
//! A corrupt log is truncated at its last verified frame and replay stops;
//! frames past that point were never acknowledged durable.

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{debug, error, info, warn};

use super::checkpoint::OtCheckpoint;
use super::checksums::crc32c;
use super::config::StorageConfig;
use super::delta_log::{replay_file, replay_file_with_payloads, ReplayEnd};
use super::manifest::{DeltaLogInfo, Manifest};
use super::node_id::OtDeltaRec;
use super::object_table::ObjectTable;
use super::segment::SegmentAllocator;
use super::superblock::{Snapshot, Superblock};

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub snapshot: Snapshot,
    pub checkpoint_epoch: u64,
    pub checkpoint_entries: u64,
    pub deltas_replayed: u64,
    pub payloads_rehydrated: u64,
}

pub struct Recovery<'a> {
    manifest: &'a mut Manifest,
    object_table: &'a ObjectTable,
    superblock: &'a Superblock,
    allocator: Option<&'a SegmentAllocator>,
    config: StorageConfig,
}

impl<'a> Recovery<'a> {
    pub fn new(
        manifest: &'a mut Manifest,
        object_table: &'a ObjectTable,
        superblock: &'a Superblock,
        allocator: Option<&'a SegmentAllocator>,
        config: StorageConfig,
    ) -> Self {
        Self {
            manifest,
            object_table,
            superblock,
            allocator,
            config,
        }
    }

    /// Recovery without payload rehydration: checkpoint bulk-load plus
    /// delta-suffix replay.
    pub fn cold_start(&mut self) -> Result<RecoveryReport> {
        self.run(false)
    }

    /// Recovery for eventual-durability volumes: additionally copies each
    /// frame's payload back into its segment after verifying its CRC.
    pub fn cold_start_with_payloads(&mut self) -> Result<RecoveryReport> {
        self.run(true)
    }

    fn run(&mut self, with_payloads: bool) -> Result<RecoveryReport> {
        let start = std::time::Instant::now();
        let data_dir = self.manifest.data_dir().to_path_buf();

        // Step 1: manifest. Tolerate a missing or unreadable one; the
        // directory scan below reconstructs what we need.
        let manifest_loaded = match self.manifest.load() {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to load manifest, continuing with directory scan: {e:#}");
                false
            }
        };

        // Step 2: checkpoint bulk-load, preserving handle indices.
        let checkpoint_path = self.resolve_checkpoint_path(manifest_loaded, &data_dir);
        let mut checkpoint_epoch = 0u64;
        let mut checkpoint_entries = 0u64;
        if let Some(path) = &checkpoint_path {
            match OtCheckpoint::map_for_read(path) {
                Ok(view) => {
                    for pe in view.iter() {
                        // Checkpoints hold live entries only; be defensive.
                        if !pe.is_live() {
                            continue;
                        }
                        self.object_table.restore_handle(pe.handle_idx, &pe);
                        checkpoint_entries += 1;
                    }
                    checkpoint_epoch = view.epoch();
                    info!(
                        "loaded {} entries from checkpoint epoch {}",
                        checkpoint_entries, checkpoint_epoch
                    );
                }
                Err(e) => {
                    // Degrade to full replay.
                    warn!("failed to map checkpoint {}: {e:#}", path.display());
                    checkpoint_epoch = 0;
                }
            }
        } else {
            info!("no checkpoint found, starting from empty state");
        }

        // Step 3: collect and order the delta logs.
        let mut logs: Vec<DeltaLogInfo> = self.manifest.delta_logs().to_vec();
        if logs.is_empty() {
            logs = scan_for_wal_files(&data_dir);
            if !logs.is_empty() {
                warn!(
                    "manifest has no delta logs; directory scan found {}",
                    logs.len()
                );
            }
        }
        logs.sort_by_key(|l| l.start_epoch);

        // Step 4-6: replay the suffix.
        let mut deltas_replayed = 0u64;
        let mut payloads_rehydrated = 0u64;
        for log_info in &logs {
            if let Some(end) = log_info.end_epoch {
                if end <= checkpoint_epoch {
                    continue;
                }
            }
            if log_info.start_epoch <= checkpoint_epoch && checkpoint_epoch > 0 {
                // The epoch filter below drops the duplicates.
                debug!("delta log {} spans the checkpoint", log_info.path);
            }

            let log_path = data_dir.join(&log_info.path);
            if !log_path.exists() {
                warn!("delta log {} listed but missing", log_path.display());
                continue;
            }

            let report = if with_payloads {
                replay_file_with_payloads(&log_path, |rec, payload| {
                    if checkpoint_epoch > 0 && rec.birth_epoch <= checkpoint_epoch {
                        return;
                    }
                    self.object_table.apply_delta(rec);
                    deltas_replayed += 1;
                    if let Some(payload) = payload {
                        if self.rehydrate_payload(rec, payload) {
                            payloads_rehydrated += 1;
                        }
                    }
                })?
            } else {
                replay_file(&log_path, |rec| {
                    if checkpoint_epoch > 0 && rec.birth_epoch <= checkpoint_epoch {
                        return;
                    }
                    self.object_table.apply_delta(rec);
                    deltas_replayed += 1;
                })?
            };

            if let ReplayEnd::Corrupt { reason } = &report.end {
                error!(
                    "delta log {} replay failed ({}), truncating at offset {}",
                    log_path.display(),
                    reason,
                    report.last_good_offset
                );
                platform_fs::truncate(&log_path, report.last_good_offset)?;
                // Later logs would replay out of order past a hole; stop.
                break;
            }
            if report.is_torn_tail() {
                info!(
                    "delta log {} has a torn tail at offset {}",
                    log_path.display(),
                    report.last_good_offset
                );
            }
        }

        // Step 7: the superblock is the authoritative published state.
        let snapshot = if self.superblock.valid() {
            self.superblock.load()
        } else {
            Snapshot {
                root: super::node_id::NodeId::INVALID,
                epoch: 0,
            }
        };
        if snapshot.epoch < checkpoint_epoch {
            warn!(
                "superblock epoch {} < checkpoint epoch {} - using superblock as authoritative",
                snapshot.epoch, checkpoint_epoch
            );
        }

        info!(
            "recovery complete: root={:?} epoch={} ({} deltas, {} payloads, {} ms)",
            snapshot.root,
            snapshot.epoch,
            deltas_replayed,
            payloads_rehydrated,
            start.elapsed().as_millis()
        );

        // Step 8: hygiene.
        if checkpoint_epoch > 0 {
            if let Err(e) =
                OtCheckpoint::cleanup_old_checkpoints(&data_dir, self.config.checkpoint_keep_count)
            {
                warn!("checkpoint cleanup failed: {e:#}");
            }
        }
        remove_orphaned_tmp_files(&data_dir);
        if logs.len() > 10 {
            debug!(
                "recommendation: rotate delta logs ({} logs accumulated)",
                logs.len()
            );
        }

        Ok(RecoveryReport {
            snapshot,
            checkpoint_epoch,
            checkpoint_entries,
            deltas_replayed,
            payloads_rehydrated,
        })
    }

    fn resolve_checkpoint_path(&self, manifest_loaded: bool, data_dir: &Path) -> Option<PathBuf> {
        if manifest_loaded && self.manifest.checkpoint().is_set() {
            Some(data_dir.join(&self.manifest.checkpoint().path))
        } else {
            OtCheckpoint::find_latest_checkpoint(data_dir)
        }
    }

    /// Copy a WAL payload back into its segment, verifying the record's data
    /// CRC first. Returns true when bytes actually landed.
    fn rehydrate_payload(&self, rec: &OtDeltaRec, payload: &[u8]) -> bool {
        let Some(alloc) = self.allocator else {
            return false;
        };
        if rec.data_crc32c != 0 && crc32c(payload) != rec.data_crc32c {
            warn!(
                "payload CRC mismatch at epoch {}, skipping rehydration",
                rec.birth_epoch
            );
            return false;
        }
        match alloc.get_ptr_for_recovery(
            rec.class_id,
            rec.file_id,
            rec.segment_id,
            rec.offset,
            rec.length,
        ) {
            Some(dst) => {
                let n = payload.len().min(rec.length as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.as_ptr(), n);
                }
                true
            }
            None => {
                warn!(
                    "failed to resolve rehydration target file={} segment={} offset={}",
                    rec.file_id, rec.segment_id, rec.offset
                );
                false
            }
        }
    }
}

fn scan_for_wal_files(data_dir: &Path) -> Vec<DeltaLogInfo> {
    let mut logs = Vec::new();
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return logs;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_wal = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with(".wal"));
        if is_wal && path.is_file() {
            logs.push(DeltaLogInfo {
                path: entry.file_name().to_string_lossy().into_owned(),
                start_epoch: 0,
                end_epoch: None,
                size: platform_fs::file_size(&path).unwrap_or(0),
            });
        }
    }
    logs
}

fn remove_orphaned_tmp_files(data_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(false, |e| e == "tmp") {
            if std::fs::remove_file(&path).is_ok() {
                debug!("cleaned up orphaned temp file {}", path.display());
            }
        }
    }
}
