//! Catalog of registered field indexes with lazy load/unload.
//!
//! Registration is cheap and happens up front (usually from the manifest's
//! root catalog); the index itself is built on first access and torn down
//! again under memory pressure, LRU first. Load and unload of one index are
//! serialized by a per-index mutex so concurrent readers cannot race a
//! loader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use lazy_static::lazy_static;
use log::{debug, info, warn};

use super::manifest::Manifest;

/// A loaded index instance, type-erased. The concrete tree type lives in
/// the index layer above this crate.
pub trait FieldIndex: Send + Sync {
    fn estimated_memory(&self) -> usize;
}

pub type IndexLoader = Arc<dyn Fn(&IndexConfig) -> Result<Box<dyn FieldIndex>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLoadState {
    Registered,
    Loading,
    Loaded,
    Unloading,
    Failed,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub field_name: String,
    pub data_dir: PathBuf,
    pub dimension: u16,
    pub precision: u16,
    pub read_only: bool,
    pub dimension_labels: Vec<String>,
}

impl IndexConfig {
    pub fn new(field_name: &str, data_dir: &std::path::Path) -> Self {
        Self {
            field_name: field_name.to_string(),
            data_dir: data_dir.to_path_buf(),
            dimension: 2,
            precision: 32,
            read_only: false,
            dimension_labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexMetadata {
    pub state: IndexLoadState,
    pub estimated_memory: usize,
    pub access_count: u64,
    pub load_count: u64,
    pub last_access: Instant,
    pub loaded_at: Option<Instant>,
}

struct EntryState {
    state: IndexLoadState,
    index: Option<Arc<dyn FieldIndex>>,
    estimated_memory: usize,
    last_access: Instant,
    loaded_at: Option<Instant>,
}

struct IndexEntry {
    config: IndexConfig,
    loader: IndexLoader,
    state: Mutex<EntryState>,
    /// Serializes load/unload for this index.
    load_mutex: Mutex<()>,
    access_count: AtomicU64,
    load_count: AtomicU64,
}

type Callback = Box<dyn Fn(&str) + Send + Sync>;

pub struct IndexRegistry {
    entries: Mutex<HashMap<String, Arc<IndexEntry>>>,
    on_load: Mutex<Option<Callback>>,
    on_unload: Mutex<Option<Callback>>,
}

lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<IndexRegistry> = Arc::new(IndexRegistry::new());
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRegistry {
    pub fn global() -> Arc<IndexRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            on_load: Mutex::new(None),
            on_unload: Mutex::new(None),
        }
    }

    /// Register without loading. Returns false if the name is taken.
    pub fn register_index(&self, config: IndexConfig, loader: IndexLoader) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&config.field_name) {
            return false;
        }
        let name = config.field_name.clone();
        entries.insert(
            name,
            Arc::new(IndexEntry {
                config,
                loader,
                state: Mutex::new(EntryState {
                    state: IndexLoadState::Registered,
                    index: None,
                    estimated_memory: 0,
                    last_access: Instant::now(),
                    loaded_at: None,
                }),
                load_mutex: Mutex::new(()),
                access_count: AtomicU64::new(0),
                load_count: AtomicU64::new(0),
            }),
        );
        true
    }

    /// Register every field named in the manifest's root catalog. The
    /// serverless initialization path.
    pub fn register_from_manifest(
        &self,
        manifest: &Manifest,
        defaults: &IndexConfig,
        loader: IndexLoader,
    ) -> usize {
        let mut registered = 0;
        for root in manifest.roots() {
            let mut config = defaults.clone();
            config.field_name = root.name.clone();
            config.data_dir = manifest.data_dir().to_path_buf();
            if self.register_index(config, loader.clone()) {
                registered += 1;
            }
        }
        info!("registered {registered} indexes from manifest");
        registered
    }

    pub fn is_registered(&self, field_name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(field_name)
    }

    pub fn get_state(&self, field_name: &str) -> Option<IndexLoadState> {
        let entry = self.entry(field_name)?;
        let state = entry.state.lock().unwrap().state;
        Some(state)
    }

    pub fn get_metadata(&self, field_name: &str) -> Option<IndexMetadata> {
        let entry = self.entry(field_name)?;
        let st = entry.state.lock().unwrap();
        Some(IndexMetadata {
            state: st.state,
            estimated_memory: st.estimated_memory,
            access_count: entry.access_count.load(Ordering::Relaxed),
            load_count: entry.load_count.load(Ordering::Relaxed),
            last_access: st.last_access,
            loaded_at: st.loaded_at,
        })
    }

    pub fn is_loaded(&self, field_name: &str) -> bool {
        self.get_state(field_name) == Some(IndexLoadState::Loaded)
    }

    /// Primary access path: load on first use, touch the LRU clock on every
    /// use.
    pub fn get_or_load(&self, field_name: &str) -> Result<Arc<dyn FieldIndex>> {
        let entry = self
            .entry(field_name)
            .ok_or_else(|| anyhow!("index {field_name} is not registered"))?;

        entry.access_count.fetch_add(1, Ordering::Relaxed);

        {
            let mut st = entry.state.lock().unwrap();
            if st.state == IndexLoadState::Loaded {
                st.last_access = Instant::now();
                return Ok(st.index.clone().expect("loaded index missing"));
            }
        }

        // Serialize the load; a concurrent caller either loads or waits
        // here and finds the index ready.
        let _load_guard = entry.load_mutex.lock().unwrap();
        {
            let mut st = entry.state.lock().unwrap();
            if st.state == IndexLoadState::Loaded {
                st.last_access = Instant::now();
                return Ok(st.index.clone().expect("loaded index missing"));
            }
            st.state = IndexLoadState::Loading;
        }

        let loaded = (entry.loader)(&entry.config);
        let mut st = entry.state.lock().unwrap();
        match loaded {
            Ok(index) => {
                let index: Arc<dyn FieldIndex> = Arc::from(index);
                st.state = IndexLoadState::Loaded;
                st.estimated_memory = index.estimated_memory();
                st.index = Some(index.clone());
                st.last_access = Instant::now();
                st.loaded_at = Some(Instant::now());
                entry.load_count.fetch_add(1, Ordering::Relaxed);
                drop(st);

                if let Some(cb) = self.on_load.lock().unwrap().as_ref() {
                    cb(field_name);
                }
                info!("loaded index {field_name}");
                Ok(index)
            }
            Err(e) => {
                st.state = IndexLoadState::Failed;
                st.index = None;
                warn!("loading index {field_name} failed: {e:#}");
                Err(e)
            }
        }
    }

    /// Unload one index; it stays registered and reloads on next access.
    /// Returns bytes freed.
    pub fn unload_index(&self, field_name: &str) -> usize {
        let Some(entry) = self.entry(field_name) else {
            return 0;
        };
        let _load_guard = entry.load_mutex.lock().unwrap();
        let freed = {
            let mut st = entry.state.lock().unwrap();
            if st.state != IndexLoadState::Loaded {
                return 0;
            }
            st.state = IndexLoadState::Unloading;
            let freed = st.estimated_memory;
            st.index = None;
            st.estimated_memory = 0;
            st.loaded_at = None;
            st.state = IndexLoadState::Registered;
            freed
        };
        if let Some(cb) = self.on_unload.lock().unwrap().as_ref() {
            cb(field_name);
        }
        debug!("unloaded index {field_name} ({freed} bytes)");
        freed
    }

    /// Unload least-recently-used indexes until `target_bytes` are freed.
    pub fn unload_cold_indexes(&self, target_bytes: usize) -> usize {
        let mut loaded: Vec<(String, Instant)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter_map(|(name, e)| {
                    let st = e.state.lock().unwrap();
                    (st.state == IndexLoadState::Loaded).then(|| (name.clone(), st.last_access))
                })
                .collect()
        };
        loaded.sort_by_key(|(_, at)| *at);

        let mut freed = 0;
        for (name, _) in loaded {
            if freed >= target_bytes {
                break;
            }
            freed += self.unload_index(&name);
        }
        freed
    }

    /// Unload indexes idle for longer than `max_idle`. Returns the count.
    pub fn unload_idle_indexes(&self, max_idle: Duration) -> usize {
        let idle: Vec<String> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter_map(|(name, e)| {
                    let st = e.state.lock().unwrap();
                    (st.state == IndexLoadState::Loaded && st.last_access.elapsed() >= max_idle)
                        .then(|| name.clone())
                })
                .collect()
        };
        let mut unloaded = 0;
        for name in idle {
            self.unload_index(&name);
            if !self.is_loaded(&name) {
                unloaded += 1;
            }
        }
        unloaded
    }

    pub fn registered_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn loaded_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.state.lock().unwrap().state == IndexLoadState::Loaded)
            .count()
    }

    pub fn total_loaded_memory(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.state.lock().unwrap().estimated_memory)
            .sum()
    }

    pub fn get_registered_fields(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn get_loaded_fields(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.state.lock().unwrap().state == IndexLoadState::Loaded)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn set_on_load_callback(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_load.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_on_unload_callback(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_unload.lock().unwrap() = Some(Box::new(cb));
    }

    /// Remove an index entirely. Test hook; production unloads instead.
    pub fn remove_index(&self, field_name: &str) {
        self.entries.lock().unwrap().remove(field_name);
    }

    /// Drop everything. Test hook.
    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
        *self.on_load.lock().unwrap() = None;
        *self.on_unload.lock().unwrap() = None;
    }

    /// Retry a failed load by resetting its state.
    pub fn clear_failed(&self, field_name: &str) -> Result<()> {
        let entry = self
            .entry(field_name)
            .ok_or_else(|| anyhow!("index {field_name} is not registered"))?;
        let mut st = entry.state.lock().unwrap();
        if st.state != IndexLoadState::Failed {
            bail!("index {field_name} is not in the failed state");
        }
        st.state = IndexLoadState::Registered;
        Ok(())
    }

    fn entry(&self, field_name: &str) -> Option<Arc<IndexEntry>> {
        self.entries.lock().unwrap().get(field_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::manifest::RootEntry;
    use crate::persist::utils::testing::{cleanup, test_dir};
    use std::sync::atomic::AtomicUsize;

    struct MockIndex {
        bytes: usize,
    }

    impl FieldIndex for MockIndex {
        fn estimated_memory(&self) -> usize {
            self.bytes
        }
    }

    fn mock_loader(bytes: usize, loads: Arc<AtomicUsize>) -> IndexLoader {
        Arc::new(move |_cfg: &IndexConfig| {
            loads.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(MockIndex { bytes }) as Box<dyn FieldIndex>)
        })
    }

    #[test]
    fn lazy_load_on_first_access() -> Result<()> {
        let dir = test_dir("reg_lazy");
        let reg = IndexRegistry::new();
        let loads = Arc::new(AtomicUsize::new(0));
        assert!(reg.register_index(IndexConfig::new("geo", &dir), mock_loader(100, loads.clone())));
        assert!(!reg.register_index(IndexConfig::new("geo", &dir), mock_loader(100, loads.clone())));

        assert_eq!(reg.get_state("geo"), Some(IndexLoadState::Registered));
        assert_eq!(loads.load(Ordering::Relaxed), 0);

        let idx = reg.get_or_load("geo")?;
        assert_eq!(idx.estimated_memory(), 100);
        assert_eq!(loads.load(Ordering::Relaxed), 1);
        assert!(reg.is_loaded("geo"));

        // Second access does not reload.
        let _ = reg.get_or_load("geo")?;
        assert_eq!(loads.load(Ordering::Relaxed), 1);

        let meta = reg.get_metadata("geo").unwrap();
        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.load_count, 1);
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn unload_frees_and_reload_works() -> Result<()> {
        let dir = test_dir("reg_unload");
        let reg = IndexRegistry::new();
        let loads = Arc::new(AtomicUsize::new(0));
        reg.register_index(IndexConfig::new("geo", &dir), mock_loader(4096, loads.clone()));

        reg.get_or_load("geo")?;
        assert_eq!(reg.total_loaded_memory(), 4096);
        assert_eq!(reg.unload_index("geo"), 4096);
        assert_eq!(reg.total_loaded_memory(), 0);
        assert_eq!(reg.get_state("geo"), Some(IndexLoadState::Registered));

        reg.get_or_load("geo")?;
        assert_eq!(loads.load(Ordering::Relaxed), 2);
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn cold_unload_is_lru_ordered() -> Result<()> {
        let dir = test_dir("reg_cold");
        let reg = IndexRegistry::new();
        let loads = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            reg.register_index(IndexConfig::new(name, &dir), mock_loader(1000, loads.clone()));
        }
        reg.get_or_load("a")?;
        std::thread::sleep(Duration::from_millis(5));
        reg.get_or_load("b")?;
        std::thread::sleep(Duration::from_millis(5));
        reg.get_or_load("c")?;
        // Touch "a" so "b" becomes the coldest.
        std::thread::sleep(Duration::from_millis(5));
        reg.get_or_load("a")?;

        let freed = reg.unload_cold_indexes(1);
        assert_eq!(freed, 1000);
        assert!(!reg.is_loaded("b"), "coldest index should unload first");
        assert!(reg.is_loaded("a") && reg.is_loaded("c"));
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn idle_unload_by_duration() -> Result<()> {
        let dir = test_dir("reg_idle");
        let reg = IndexRegistry::new();
        let loads = Arc::new(AtomicUsize::new(0));
        reg.register_index(IndexConfig::new("x", &dir), mock_loader(64, loads.clone()));
        reg.get_or_load("x")?;

        assert_eq!(reg.unload_idle_indexes(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(reg.unload_idle_indexes(Duration::from_millis(1)), 1);
        assert!(!reg.is_loaded("x"));
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn failed_load_is_sticky_until_cleared() -> Result<()> {
        let dir = test_dir("reg_fail");
        let reg = IndexRegistry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let loader: IndexLoader = Arc::new(move |_cfg| {
            let n = attempts2.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                anyhow::bail!("disk on fire");
            }
            Ok(Box::new(MockIndex { bytes: 8 }) as Box<dyn FieldIndex>)
        });
        reg.register_index(IndexConfig::new("flaky", &dir), loader);

        assert!(reg.get_or_load("flaky").is_err());
        assert_eq!(reg.get_state("flaky"), Some(IndexLoadState::Failed));

        reg.clear_failed("flaky")?;
        assert!(reg.get_or_load("flaky").is_ok());
        cleanup(&dir);
        Ok(())
    }

    #[test]
    fn register_from_manifest_roots() -> Result<()> {
        let dir = test_dir("reg_manifest");
        let mut manifest = Manifest::new(&dir);
        manifest.set_root(RootEntry {
            name: "loc".into(),
            node_id: 0x101,
            epoch: 1,
            mbr: vec![],
        });
        manifest.set_root(RootEntry {
            name: "time".into(),
            node_id: 0x202,
            epoch: 1,
            mbr: vec![],
        });

        let reg = IndexRegistry::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let n = reg.register_from_manifest(
            &manifest,
            &IndexConfig::new("", &dir),
            mock_loader(1, loads),
        );
        assert_eq!(n, 2);
        assert!(reg.is_registered("loc") && reg.is_registered("time"));
        cleanup(&dir);
        Ok(())
    }
}
