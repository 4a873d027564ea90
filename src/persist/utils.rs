//! Small shared helpers: logging init, clocks, test fixtures.

use std::sync::OnceLock;
use std::time::Instant;

/// Initialize env_logger once; safe to call from every test or embedding.
pub fn init_logs() {
    let _ = env_logger::builder().format_timestamp_micros().try_init();
}

/// Monotonic nanoseconds since process start. Used for LRU clocks only;
/// never persisted.
pub fn now_ns() -> u64 {
    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Wall-clock seconds for `created_unix` fields.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Unique scratch directory per test invocation.
    pub fn test_dir(tag: &str) -> PathBuf {
        use rand::Rng;
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::thread_rng().gen_range(10000..99999);
        let dir = std::env::temp_dir().join(format!(
            "xtree_{}_{}_{}_{}",
            tag,
            std::process::id(),
            n,
            suffix
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn cleanup(dir: &std::path::Path) {
        let _ = std::fs::remove_dir_all(dir);
    }
}
