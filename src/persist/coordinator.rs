//! Adaptive memory budget balancer between the hot-node cache and the
//! mapping layer.
//!
//! Both consumers have independent budgets; set naively they can add up to
//! more than the machine has. The coordinator owns one total budget and
//! splits it by observed utilization and eviction pressure, nudging the
//! ratio a step at a time inside hard clamps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, info};

use super::mapping::MappingManager;

/// Metrics the external hot-node cache exposes to the coordinator. The
/// cache itself lives outside this crate.
pub trait CacheMetricsSource: Send + Sync {
    fn memory_used(&self) -> usize;
    fn memory_budget(&self) -> usize;
    fn entries(&self) -> usize;
    fn evictable(&self) -> usize;
    fn evictions_total(&self) -> u64;
    fn set_memory_budget(&self, bytes: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadHint {
    Auto,
    BulkIngestion,
    QueryHeavy,
    Mixed,
    MemoryConstrained,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryMetrics {
    pub cache_memory_used: usize,
    pub cache_memory_budget: usize,
    pub cache_entries: usize,
    pub cache_evictable: usize,
    pub cache_evictions_since_last: u64,

    pub mmap_memory_used: usize,
    pub mmap_memory_budget: usize,
    pub mmap_extents: usize,
    pub mmap_evictions_since_last: u64,

    pub cache_utilization: f64,
    pub mmap_utilization: f64,
    pub cache_pressure: f64,
    pub mmap_pressure: f64,
}

const PRESSURE_THRESHOLD: f64 = 0.8;
const HIGH_EVICTION_RATE: f64 = 100.0;
const REBALANCE_STEP: f32 = 0.05;
const MIN_RATIO: f32 = 0.20;
const MAX_RATIO: f32 = 0.80;

struct CoordState {
    total_budget: usize,
    cache_ratio: f32,
    mmap_ratio: f32,
    rebalance_interval: Duration,
    hint: WorkloadHint,
    cache: Option<Arc<dyn CacheMetricsSource>>,
    mapping: Option<Arc<MappingManager>>,
    metrics: MemoryMetrics,
    prev_cache_evictions: u64,
    prev_mmap_evictions: u64,
    last_rebalance: Option<Instant>,
}

pub struct MemoryCoordinator {
    state: Mutex<CoordState>,
    rebalance_count: AtomicUsize,
}

lazy_static! {
    static ref GLOBAL_COORD: Arc<MemoryCoordinator> = Arc::new(MemoryCoordinator::new());
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn global() -> Arc<MemoryCoordinator> {
        GLOBAL_COORD.clone()
    }

    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordState {
                total_budget: 0,
                cache_ratio: 0.40,
                mmap_ratio: 0.60,
                rebalance_interval: Duration::from_secs(5),
                hint: WorkloadHint::Auto,
                cache: None,
                mapping: None,
                metrics: MemoryMetrics::default(),
                prev_cache_evictions: 0,
                prev_mmap_evictions: 0,
                last_rebalance: None,
            }),
            rebalance_count: AtomicUsize::new(0),
        }
    }

    pub fn attach_cache(&self, cache: Arc<dyn CacheMetricsSource>) {
        self.state.lock().unwrap().cache = Some(cache);
    }

    pub fn attach_mapping(&self, mapping: Arc<MappingManager>) {
        self.state.lock().unwrap().mapping = Some(mapping);
    }

    /// Total budget in bytes; 0 disables coordination.
    pub fn set_total_budget(&self, bytes: usize) {
        let mut st = self.state.lock().unwrap();
        st.total_budget = bytes;
        Self::apply_budgets(&st);
        info!(
            "memory coordinator budget {} bytes ({:.0}% cache / {:.0}% mmap)",
            bytes,
            st.cache_ratio * 100.0,
            st.mmap_ratio * 100.0
        );
    }

    pub fn get_total_budget(&self) -> usize {
        self.state.lock().unwrap().total_budget
    }

    pub fn set_rebalance_interval(&self, interval: Duration) {
        self.state.lock().unwrap().rebalance_interval = interval;
    }

    /// Ratios should sum to 1; each side is clamped to [0.2, 0.8].
    pub fn set_initial_ratios(&self, cache_ratio: f32, mmap_ratio: f32) {
        let mut st = self.state.lock().unwrap();
        st.cache_ratio = cache_ratio.clamp(MIN_RATIO, MAX_RATIO);
        st.mmap_ratio = mmap_ratio.clamp(MIN_RATIO, MAX_RATIO);
        Self::apply_budgets(&st);
    }

    pub fn set_workload_hint(&self, hint: WorkloadHint) {
        let mut st = self.state.lock().unwrap();
        st.hint = hint;
        Self::apply_preset(&mut st);
        Self::apply_budgets(&st);
    }

    pub fn get_workload_hint(&self) -> WorkloadHint {
        self.state.lock().unwrap().hint
    }

    pub fn get_cache_ratio(&self) -> f32 {
        self.state.lock().unwrap().cache_ratio
    }

    pub fn get_mmap_ratio(&self) -> f32 {
        self.state.lock().unwrap().mmap_ratio
    }

    pub fn get_rebalance_count(&self) -> usize {
        self.rebalance_count.load(Ordering::Relaxed)
    }

    pub fn get_metrics(&self) -> MemoryMetrics {
        self.state.lock().unwrap().metrics
    }

    /// Cheap to call from anywhere; internally throttled by the rebalance
    /// interval.
    pub fn tick(&self) {
        let mut st = self.state.lock().unwrap();
        if st.total_budget == 0 {
            return;
        }
        if let Some(last) = st.last_rebalance {
            if last.elapsed() < st.rebalance_interval {
                return;
            }
        }
        self.rebalance_locked(&mut st);
    }

    /// Rebalance regardless of the interval. Testing and workload-change
    /// escape hatch.
    pub fn force_rebalance(&self) {
        let mut st = self.state.lock().unwrap();
        if st.total_budget == 0 {
            return;
        }
        self.rebalance_locked(&mut st);
    }

    /// Back to defaults; used by tests.
    pub fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.total_budget = 0;
        st.cache_ratio = 0.40;
        st.mmap_ratio = 0.60;
        st.hint = WorkloadHint::Auto;
        st.metrics = MemoryMetrics::default();
        st.prev_cache_evictions = 0;
        st.prev_mmap_evictions = 0;
        st.last_rebalance = None;
        self.rebalance_count.store(0, Ordering::Relaxed);
    }

    fn rebalance_locked(&self, st: &mut CoordState) {
        Self::collect_metrics(st);

        match st.hint {
            WorkloadHint::Auto => Self::auto_policy(st),
            _ => Self::apply_preset(st),
        }

        Self::apply_budgets(st);
        st.last_rebalance = Some(Instant::now());
        self.rebalance_count.fetch_add(1, Ordering::Relaxed);
    }

    fn collect_metrics(st: &mut CoordState) {
        let mut m = MemoryMetrics::default();

        if let Some(cache) = &st.cache {
            m.cache_memory_used = cache.memory_used();
            m.cache_memory_budget = cache.memory_budget();
            m.cache_entries = cache.entries();
            m.cache_evictable = cache.evictable();
            let total = cache.evictions_total();
            m.cache_evictions_since_last = total.saturating_sub(st.prev_cache_evictions);
            st.prev_cache_evictions = total;
        }
        if let Some(mapping) = &st.mapping {
            let stats = mapping.get_stats();
            m.mmap_memory_used = stats.total_memory_mapped;
            m.mmap_memory_budget = stats.max_memory_budget;
            m.mmap_extents = stats.total_extents;
            m.mmap_evictions_since_last =
                stats.evictions_count.saturating_sub(st.prev_mmap_evictions);
            st.prev_mmap_evictions = stats.evictions_count;
        }

        m.cache_utilization = ratio(m.cache_memory_used, m.cache_memory_budget);
        m.mmap_utilization = ratio(m.mmap_memory_used, m.mmap_memory_budget);
        m.cache_pressure = m
            .cache_utilization
            .max((m.cache_evictions_since_last as f64 / HIGH_EVICTION_RATE).min(1.0));
        m.mmap_pressure = m
            .mmap_utilization
            .max((m.mmap_evictions_since_last as f64 / HIGH_EVICTION_RATE).min(1.0));

        st.metrics = m;
    }

    fn auto_policy(st: &mut CoordState) {
        let m = &st.metrics;
        let cache_hot = m.cache_pressure > PRESSURE_THRESHOLD;
        let mmap_hot = m.mmap_pressure > PRESSURE_THRESHOLD;

        if cache_hot && !mmap_hot {
            st.cache_ratio = (st.cache_ratio + REBALANCE_STEP).clamp(MIN_RATIO, MAX_RATIO);
            st.mmap_ratio = 1.0 - st.cache_ratio;
            debug!(
                "shifting budget toward cache: {:.2}/{:.2}",
                st.cache_ratio, st.mmap_ratio
            );
        } else if mmap_hot && !cache_hot {
            st.mmap_ratio = (st.mmap_ratio + REBALANCE_STEP).clamp(MIN_RATIO, MAX_RATIO);
            st.cache_ratio = 1.0 - st.mmap_ratio;
            debug!(
                "shifting budget toward mmap: {:.2}/{:.2}",
                st.cache_ratio, st.mmap_ratio
            );
        }
    }

    fn apply_preset(st: &mut CoordState) {
        let (cache, mmap) = match st.hint {
            WorkloadHint::Auto => return,
            WorkloadHint::BulkIngestion => (0.25, 0.75),
            WorkloadHint::QueryHeavy => (0.65, 0.35),
            WorkloadHint::Mixed => (0.50, 0.50),
            WorkloadHint::MemoryConstrained => (0.30, 0.70),
        };
        st.cache_ratio = cache;
        st.mmap_ratio = mmap;
    }

    fn apply_budgets(st: &CoordState) {
        if st.total_budget == 0 {
            return;
        }
        let cache_budget = (st.total_budget as f64 * st.cache_ratio as f64).round() as usize;
        let mmap_budget = (st.total_budget as f64 * st.mmap_ratio as f64).round() as usize;
        if let Some(cache) = &st.cache {
            cache.set_memory_budget(cache_budget);
        }
        if let Some(mapping) = &st.mapping {
            mapping.set_memory_budget(mmap_budget, 0.1);
        }
    }
}

fn ratio(used: usize, budget: usize) -> f64 {
    if budget > 0 {
        used as f64 / budget as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::file_registry::FileHandleRegistry;
    use std::sync::atomic::AtomicU64;

    struct MockCache {
        used: AtomicUsize,
        budget: AtomicUsize,
        evictions: AtomicU64,
    }

    impl MockCache {
        fn new() -> Self {
            Self {
                used: AtomicUsize::new(0),
                budget: AtomicUsize::new(1),
                evictions: AtomicU64::new(0),
            }
        }
    }

    impl CacheMetricsSource for MockCache {
        fn memory_used(&self) -> usize {
            self.used.load(Ordering::Relaxed)
        }
        fn memory_budget(&self) -> usize {
            self.budget.load(Ordering::Relaxed)
        }
        fn entries(&self) -> usize {
            0
        }
        fn evictable(&self) -> usize {
            0
        }
        fn evictions_total(&self) -> u64 {
            self.evictions.load(Ordering::Relaxed)
        }
        fn set_memory_budget(&self, bytes: usize) {
            self.budget.store(bytes, Ordering::Relaxed);
        }
    }

    fn mk() -> (Arc<MemoryCoordinator>, Arc<MockCache>, Arc<MappingManager>) {
        let coord = Arc::new(MemoryCoordinator::new());
        let cache = Arc::new(MockCache::new());
        let fhr = Arc::new(FileHandleRegistry::new(16));
        let mm = Arc::new(MappingManager::new(fhr, 1 << 20, 64));
        coord.attach_cache(cache.clone());
        coord.attach_mapping(mm.clone());
        (coord, cache, mm)
    }

    #[test]
    fn presets_split_the_budget() {
        let (coord, cache, mm) = mk();
        coord.set_total_budget(1000);

        coord.set_workload_hint(WorkloadHint::BulkIngestion);
        assert_eq!(cache.memory_budget(), 250);
        assert_eq!(mm.get_memory_budget(), 750);

        coord.set_workload_hint(WorkloadHint::QueryHeavy);
        assert_eq!(cache.memory_budget(), 650);
        assert_eq!(mm.get_memory_budget(), 350);

        coord.set_workload_hint(WorkloadHint::Mixed);
        assert_eq!(cache.memory_budget(), 500);
    }

    #[test]
    fn auto_policy_shifts_toward_pressured_side() {
        let (coord, cache, _mm) = mk();
        coord.set_total_budget(1000);
        let start = coord.get_cache_ratio();

        // Cache at 100% utilization, mmap idle.
        cache.used.store(1000, Ordering::Relaxed);
        cache.budget.store(1000, Ordering::Relaxed);
        coord.force_rebalance();

        assert!((coord.get_cache_ratio() - (start + REBALANCE_STEP)).abs() < 1e-6);
        assert!((coord.get_cache_ratio() + coord.get_mmap_ratio() - 1.0).abs() < 1e-6);
        assert_eq!(coord.get_rebalance_count(), 1);
    }

    #[test]
    fn ratios_are_clamped() {
        let (coord, cache, _mm) = mk();
        coord.set_total_budget(1000);
        cache.used.store(1000, Ordering::Relaxed);
        cache.budget.store(1000, Ordering::Relaxed);

        for _ in 0..50 {
            // Keep the cache side saturated relative to its shrinking share.
            cache.used.store(cache.memory_budget().max(1), Ordering::Relaxed);
            coord.force_rebalance();
        }
        assert!(coord.get_cache_ratio() <= MAX_RATIO + 1e-6);
        assert!(coord.get_mmap_ratio() >= MIN_RATIO - 1e-6);
    }

    #[test]
    fn tick_is_throttled() {
        let (coord, cache, _mm) = mk();
        coord.set_total_budget(1000);
        coord.set_rebalance_interval(Duration::from_secs(3600));
        cache.used.store(1000, Ordering::Relaxed);
        cache.budget.store(1000, Ordering::Relaxed);

        coord.tick();
        coord.tick();
        coord.tick();
        // First tick rebalances (no prior timestamp); the rest are inside
        // the interval.
        assert_eq!(coord.get_rebalance_count(), 1);
    }

    #[test]
    fn zero_budget_disables_coordination() {
        let (coord, _cache, _mm) = mk();
        coord.tick();
        coord.force_rebalance();
        assert_eq!(coord.get_rebalance_count(), 0);
    }

    #[test]
    fn metrics_report_eviction_deltas() {
        let (coord, cache, _mm) = mk();
        coord.set_total_budget(1000);

        cache.evictions.store(40, Ordering::Relaxed);
        coord.force_rebalance();
        assert_eq!(coord.get_metrics().cache_evictions_since_last, 40);

        cache.evictions.store(55, Ordering::Relaxed);
        coord.force_rebalance();
        assert_eq!(coord.get_metrics().cache_evictions_since_last, 15);
    }
}
