//! JSON catalog of every persistent artifact in a data directory.
//!
//! The manifest names the superblock, the latest checkpoint, every delta
//! log (active ones have a null end epoch), the per-class data files and an
//! optional root catalog for multi-field indexes. Stores are atomic:
//! temp file, fsync, rename, parent directory fsync.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::config::files::{MANIFEST_FILE, META_FILE};
use super::utils::unix_now;

mod hex_u32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:#010x}", v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let raw = String::deserialize(d)?;
        let digits = raw.trim_start_matches("0x");
        u32::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
    }
}

mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:#018x}", v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        let digits = raw.trim_start_matches("0x");
        u64::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
    }
}

fn u64_is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub entries: u64,
    #[serde(default, with = "hex_u32", skip_serializing_if = "is_zero_u32")]
    pub crc32c: u32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl CheckpointEntry {
    pub fn is_set(&self) -> bool {
        !self.path.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaLogInfo {
    pub path: String,
    pub start_epoch: u64,
    /// None while the log is still active.
    pub end_epoch: Option<u64>,
    pub size: u64,
}

impl DeltaLogInfo {
    pub fn is_sealed(&self) -> bool {
        self.end_epoch.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataFileInfo {
    #[serde(rename = "class")]
    pub class_id: u8,
    pub seq: u32,
    pub file: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootEntry {
    pub name: String,
    #[serde(with = "hex_u64")]
    pub node_id: u64,
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mbr: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ManifestDoc {
    version: u32,
    created_unix: i64,
    superblock: String,
    checkpoint: CheckpointEntry,
    delta_logs: Vec<DeltaLogInfo>,
    data_files: Vec<DataFileInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    roots: Vec<RootEntry>,
}

impl ManifestDoc {
    fn fresh() -> Self {
        Self {
            version: 1,
            created_unix: unix_now(),
            superblock: META_FILE.to_string(),
            checkpoint: CheckpointEntry::default(),
            delta_logs: Vec::new(),
            data_files: Vec::new(),
            roots: Vec::new(),
        }
    }
}

pub struct Manifest {
    data_dir: PathBuf,
    doc: ManifestDoc,
}

impl Manifest {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            doc: ManifestDoc::fresh(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    /// Read and parse the manifest from disk.
    pub fn load(&mut self) -> Result<()> {
        let path = self.manifest_path();
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        if json.is_empty() {
            bail!("manifest {} is empty", path.display());
        }
        self.doc = serde_json::from_str(&json)
            .with_context(|| format!("parse manifest {}", path.display()))?;
        Ok(())
    }

    /// Discard in-memory state and re-read from disk.
    pub fn reload(&mut self) -> Result<()> {
        self.doc = ManifestDoc::fresh();
        self.load()
    }

    /// Atomically persist: temp file, fsync, rename, directory fsync.
    pub fn store(&self) -> Result<()> {
        platform_fs::ensure_directory(&self.data_dir)?;
        let path = self.manifest_path();
        let tmp = self.data_dir.join(format!("{MANIFEST_FILE}.tmp"));

        let json = serde_json::to_string_pretty(&self.doc)?;
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.flush()?;
            platform_fs::flush_file(file.as_raw_fd())?;
        }
        platform_fs::atomic_replace(&tmp, &path)?;
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.doc.version
    }

    pub fn created_unix(&self) -> i64 {
        self.doc.created_unix
    }

    pub fn superblock_path(&self) -> &str {
        &self.doc.superblock
    }

    pub fn set_superblock_path(&mut self, path: &str) {
        self.doc.superblock = path.to_string();
    }

    pub fn checkpoint(&self) -> &CheckpointEntry {
        &self.doc.checkpoint
    }

    pub fn set_checkpoint(&mut self, entry: CheckpointEntry) {
        self.doc.checkpoint = entry;
    }

    pub fn delta_logs(&self) -> &[DeltaLogInfo] {
        &self.doc.delta_logs
    }

    pub fn add_delta_log(&mut self, info: DeltaLogInfo) {
        self.doc.delta_logs.push(info);
    }

    /// Seal the named log: record its end epoch and final size.
    pub fn seal_delta_log(&mut self, path: &str, end_epoch: u64, size: u64) -> bool {
        for log in &mut self.doc.delta_logs {
            if log.path == path {
                log.end_epoch = Some(end_epoch);
                log.size = size;
                return true;
            }
        }
        false
    }

    /// Drop catalog entries for logs entirely covered by the checkpoint.
    pub fn prune_old_delta_logs(&mut self, checkpoint_epoch: u64) {
        self.doc
            .delta_logs
            .retain(|log| match log.end_epoch {
                Some(end) => end > checkpoint_epoch,
                None => true,
            });
    }

    /// Logs whose replay is still needed after loading the checkpoint.
    pub fn get_logs_after_checkpoint(&self, checkpoint_epoch: u64) -> Vec<DeltaLogInfo> {
        self.doc
            .delta_logs
            .iter()
            .filter(|log| log.start_epoch > checkpoint_epoch)
            .cloned()
            .collect()
    }

    pub fn data_files(&self) -> &[DataFileInfo] {
        &self.doc.data_files
    }

    /// Insert or update the catalog entry for one data file.
    pub fn upsert_data_file(&mut self, info: DataFileInfo) {
        for df in &mut self.doc.data_files {
            if df.class_id == info.class_id && df.seq == info.seq && df.file == info.file {
                df.bytes = info.bytes;
                return;
            }
        }
        self.doc.data_files.push(info);
    }

    pub fn roots(&self) -> &[RootEntry] {
        &self.doc.roots
    }

    /// Publish a root for a named field, replacing any prior entry.
    pub fn set_root(&mut self, entry: RootEntry) {
        if let Some(existing) = self.doc.roots.iter_mut().find(|r| r.name == entry.name) {
            *existing = entry;
        } else {
            self.doc.roots.push(entry);
        }
    }

    pub fn find_root(&self, name: &str) -> Option<&RootEntry> {
        self.doc.roots.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::utils::testing::{cleanup, test_dir};

    fn sample(dir: &Path) -> Manifest {
        let mut m = Manifest::new(dir);
        m.set_checkpoint(CheckpointEntry {
            path: "ot_checkpoint_epoch-1000.bin".into(),
            epoch: 1000,
            size: 4096,
            entries: 84,
            crc32c: 0xDEADBEEF,
        });
        m.add_delta_log(DeltaLogInfo {
            path: "ot_delta.wal.1".into(),
            start_epoch: 1,
            end_epoch: Some(900),
            size: 1 << 16,
        });
        m.add_delta_log(DeltaLogInfo {
            path: "ot_delta.wal".into(),
            start_epoch: 901,
            end_epoch: None,
            size: 1 << 10,
        });
        m.upsert_data_file(DataFileInfo {
            class_id: 2,
            seq: 0,
            file: "xtree_c2_0.xi".into(),
            bytes: 1 << 21,
        });
        m.set_root(RootEntry {
            name: "location".into(),
            node_id: 0x0000_0300_0000_4D01,
            epoch: 1000,
            mbr: vec![-10.0, -20.0, 10.0, 20.0],
        });
        m
    }

    #[test]
    fn store_load_is_identity() -> Result<()> {
        let dir = test_dir("mf_identity");
        let m = sample(&dir);
        m.store()?;

        let mut loaded = Manifest::new(&dir);
        loaded.load()?;
        assert_eq!(loaded.doc, m.doc);
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn active_log_serializes_as_null_end_epoch() -> Result<()> {
        let dir = test_dir("mf_null");
        let m = sample(&dir);
        m.store()?;

        let raw = std::fs::read_to_string(m.manifest_path())?;
        let v: serde_json::Value = serde_json::from_str(&raw)?;
        let logs = v["delta_logs"].as_array().unwrap();
        assert!(logs[1]["end_epoch"].is_null());
        // Hex encodings are human-readable strings.
        assert!(v["checkpoint"]["crc32c"].as_str().unwrap().starts_with("0x"));
        assert!(v["roots"][0]["node_id"].as_str().unwrap().starts_with("0x"));
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn prune_removes_only_covered_logs() {
        let dir = test_dir("mf_prune");
        let mut m = sample(&dir);
        m.prune_old_delta_logs(900);
        assert_eq!(m.delta_logs().len(), 1);
        assert_eq!(m.delta_logs()[0].path, "ot_delta.wal");

        // Active logs survive any prune.
        m.prune_old_delta_logs(u64::MAX - 1);
        assert_eq!(m.delta_logs().len(), 1);
        cleanup(&dir);
    }

    #[test]
    fn logs_after_checkpoint_filters_by_start() {
        let dir = test_dir("mf_after");
        let m = sample(&dir);
        let after = m.get_logs_after_checkpoint(900);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].path, "ot_delta.wal");
        assert!(m.get_logs_after_checkpoint(0).len() == 2);
        cleanup(&dir);
    }

    #[test]
    fn seal_updates_in_place() {
        let dir = test_dir("mf_seal");
        let mut m = sample(&dir);
        assert!(m.seal_delta_log("ot_delta.wal", 1200, 2048));
        let log = m.delta_logs().iter().find(|l| l.path == "ot_delta.wal").unwrap();
        assert_eq!(log.end_epoch, Some(1200));
        assert_eq!(log.size, 2048);
        assert!(!m.seal_delta_log("nope.wal", 1, 1));
        cleanup(&dir);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = test_dir("mf_missing");
        let mut m = Manifest::new(&dir);
        assert!(m.load().is_err());
        cleanup(&dir);
    }

    #[test]
    fn empty_checkpoint_serializes_as_empty_object() -> Result<()> {
        let dir = test_dir("mf_emptyckpt");
        let m = Manifest::new(&dir);
        m.store()?;
        let raw = std::fs::read_to_string(m.manifest_path())?;
        let v: serde_json::Value = serde_json::from_str(&raw)?;
        assert!(v["checkpoint"].as_object().unwrap().is_empty());
        cleanup(&dir);
        Ok(())
    }
}
