//! Process-wide cache of open file descriptors.
//!
//! Paths are canonicalized so every alias of a file shares one handle.
//! Unpinned handles are evicted in LRU order when the open count reaches the
//! configured cap (itself capped below the OS soft limit). If everything is
//! pinned the cap is exceeded temporarily; the OS limit is the backstop.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use log::{debug, info, warn};

use super::utils::now_ns;

pub struct FileHandle {
    fd: AtomicI32,
    path: String,
    size_bytes: AtomicU64,
    last_use_ns: AtomicU64,
    pins: AtomicU32,
    writable: AtomicBool,
}

impl FileHandle {
    pub fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    pub fn last_use_ns(&self) -> u64 {
        self.last_use_ns.load(Ordering::Relaxed)
    }

    pub fn update_last_use(&self) {
        self.last_use_ns.store(now_ns(), Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.fd() >= 0
    }

    fn close_fd(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close_fd();
    }
}

fn open_raw(path: &str, writable: bool, create: bool) -> Result<i32> {
    let c = CString::new(path).map_err(|_| anyhow!("path contains NUL: {}", path))?;
    let mut flags = if writable { libc::O_RDWR } else { libc::O_RDONLY };
    if create {
        flags |= libc::O_CREAT;
    }
    flags |= libc::O_CLOEXEC;
    let fd = unsafe { libc::open(c.as_ptr(), flags, 0o644) };
    if fd < 0 {
        return Err(anyhow::Error::new(std::io::Error::last_os_error())
            .context(format!("open {}", path)));
    }
    Ok(fd)
}

fn fstat_size(fd: i32) -> Result<u64> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc != 0 {
        return Err(anyhow::Error::new(std::io::Error::last_os_error()).context("fstat"));
    }
    Ok(st.st_size as u64)
}

struct RegistryState {
    table: HashMap<String, Arc<FileHandle>>,
    total_opens: u64,
    total_evictions: u64,
}

pub struct FileHandleRegistry {
    max_open_files: usize,
    state: Mutex<RegistryState>,
}

lazy_static! {
    static ref GLOBAL_FHR: Arc<FileHandleRegistry> = Arc::new(FileHandleRegistry::new(512));
}

impl FileHandleRegistry {
    /// Process-wide default registry.
    pub fn global() -> Arc<FileHandleRegistry> {
        GLOBAL_FHR.clone()
    }

    pub fn new(max_open_files: usize) -> Self {
        let mut cap = max_open_files.max(4);

        // Leave headroom below the soft FD limit for sockets and stdio.
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } == 0 {
            let cur = rlim.rlim_cur as usize;
            let safe_limit = if cur > 64 { cur - 64 } else { cur / 2 };
            if cap > safe_limit {
                cap = safe_limit.max(4);
                info!("FileHandleRegistry capped max_open_files to {cap} (rlimit)");
            }
        }

        Self {
            max_open_files: cap,
            state: Mutex::new(RegistryState {
                table: HashMap::new(),
                total_opens: 0,
                total_evictions: 0,
            }),
        }
    }

    pub fn max_open_files(&self) -> usize {
        self.max_open_files
    }

    /// Open (or fetch the shared handle for) `path`. The returned handle is
    /// pinned once; pair with `release`.
    pub fn acquire(&self, path: &str, writable: bool, create: bool) -> Result<Arc<FileHandle>> {
        let canonical = self.canonicalize_path(path);
        let mut st = self.state.lock().unwrap();

        if let Some(fh) = st.table.get(&canonical).cloned() {
            if fh.is_open() {
                if writable && !fh.writable() {
                    Self::upgrade_writable(&fh, create)?;
                }
                fh.update_last_use();
                fh.pins.fetch_add(1, Ordering::AcqRel);
                return Ok(fh);
            }
            // Evicted handle still referenced somewhere: reopen in place.
            let fd = open_raw(&canonical, writable || fh.writable(), create)?;
            fh.fd.store(fd, Ordering::Release);
            fh.size_bytes.store(fstat_size(fd)?, Ordering::Release);
            if writable {
                fh.writable.store(true, Ordering::Release);
            }
            fh.update_last_use();
            fh.pins.fetch_add(1, Ordering::AcqRel);
            st.total_opens += 1;
            return Ok(fh);
        }

        self.evict_if_needed(&mut st);

        let fd = open_raw(&canonical, writable, create)?;
        let size = fstat_size(fd)?;
        let fh = Arc::new(FileHandle {
            fd: AtomicI32::new(fd),
            path: canonical.clone(),
            size_bytes: AtomicU64::new(size),
            last_use_ns: AtomicU64::new(now_ns()),
            pins: AtomicU32::new(1),
            writable: AtomicBool::new(writable),
        });
        st.table.insert(canonical, fh.clone());
        st.total_opens += 1;
        Ok(fh)
    }

    pub fn release(&self, fh: &Arc<FileHandle>) {
        let _st = self.state.lock().unwrap();
        let prev = fh.pins.load(Ordering::Acquire);
        if prev > 0 {
            fh.pins.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn pin(&self, fh: &Arc<FileHandle>) {
        let _st = self.state.lock().unwrap();
        fh.pins.fetch_add(1, Ordering::AcqRel);
        fh.update_last_use();
    }

    pub fn unpin(&self, fh: &Arc<FileHandle>) {
        let _st = self.state.lock().unwrap();
        let prev = fh.pins.load(Ordering::Acquire);
        if prev > 0 {
            fh.pins.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Grow the file to at least `min_size`. Returns true if it grew.
    /// Durability of the size bump is deferred to the mapping layer's msync.
    pub fn ensure_size(&self, fh: &Arc<FileHandle>, min_size: u64) -> Result<bool> {
        let _st = self.state.lock().unwrap();
        if min_size <= fh.size_bytes() {
            return Ok(false);
        }

        let fd = fh.fd();
        #[cfg(target_os = "linux")]
        {
            // Preallocate without forcing a metadata sync right now.
            let rc = unsafe { libc::posix_fallocate(fd, 0, min_size as libc::off_t) };
            if rc != 0 {
                return Err(anyhow::Error::new(std::io::Error::from_raw_os_error(rc))
                    .context(format!("posix_fallocate {} to {}", fh.path, min_size)));
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let rc = unsafe { libc::ftruncate(fd, min_size as libc::off_t) };
            if rc != 0 {
                return Err(anyhow::Error::new(std::io::Error::last_os_error())
                    .context(format!("ftruncate {} to {}", fh.path, min_size)));
            }
        }

        fh.size_bytes.store(min_size, Ordering::Release);
        fh.update_last_use();
        Ok(true)
    }

    pub fn ensure_writable(&self, fh: &Arc<FileHandle>, create: bool) -> Result<()> {
        let _st = self.state.lock().unwrap();
        if fh.writable() {
            return Ok(());
        }
        Self::upgrade_writable(fh, create)
    }

    fn upgrade_writable(fh: &Arc<FileHandle>, create: bool) -> Result<()> {
        fh.close_fd();
        let fd = open_raw(&fh.path, true, create)
            .with_context(|| format!("reopen writable {}", fh.path))?;
        fh.fd.store(fd, Ordering::Release);
        fh.writable.store(true, Ordering::Release);
        fh.update_last_use();
        Ok(())
    }

    pub fn open_file_count(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.table.values().filter(|fh| fh.is_open()).count()
    }

    pub fn total_opens(&self) -> u64 {
        self.state.lock().unwrap().total_opens
    }

    pub fn total_evictions(&self) -> u64 {
        self.state.lock().unwrap().total_evictions
    }

    /// Drop every unpinned handle immediately. Test hook.
    pub fn debug_evict_all_unpinned(&self) {
        let mut st = self.state.lock().unwrap();
        let victims: Vec<String> = st
            .table
            .iter()
            .filter(|(_, fh)| fh.pins() == 0 && fh.is_open())
            .map(|(p, _)| p.clone())
            .collect();
        for path in victims {
            if let Some(fh) = st.table.remove(&path) {
                fh.close_fd();
                st.total_evictions += 1;
            }
        }
    }

    fn evict_if_needed(&self, st: &mut RegistryState) {
        let open_count = st.table.values().filter(|fh| fh.is_open()).count();
        if open_count < self.max_open_files {
            return;
        }

        let to_evict = (open_count - self.max_open_files) + 1;
        let mut candidates: Vec<(String, u64)> = st
            .table
            .iter()
            .filter(|(_, fh)| fh.is_open() && fh.pins() == 0)
            .map(|(p, fh)| (p.clone(), fh.last_use_ns()))
            .collect();
        candidates.sort_by_key(|(_, ns)| *ns);

        for (path, _) in candidates.into_iter().take(to_evict) {
            if let Some(fh) = st.table.remove(&path) {
                debug!("evicting file handle {}", path);
                fh.close_fd();
                st.total_evictions += 1;
            }
        }
        // If everything is pinned we exceed the cap temporarily; the
        // rlimit-derived cap in the constructor is the hard backstop.
        if st.table.values().filter(|fh| fh.is_open()).count() >= self.max_open_files {
            warn!(
                "file handle cap {} exceeded; all handles pinned",
                self.max_open_files
            );
        }
    }

    /// Canonical form of `path`: two inputs naming the same inode map to the
    /// same string, even when the leaf does not exist yet (then the parent is
    /// resolved and the leaf appended lexically).
    pub fn canonicalize_path(&self, path: &str) -> String {
        if path.is_empty() || path == "/" {
            return path.to_string();
        }

        // Collapse odd-but-legal ".//<absolute>" prefixes.
        let mut s = path;
        while s.len() > 2 && s.starts_with("./") && s.as_bytes()[2] == b'/' {
            s = &s[2..];
        }

        // Fast path: the whole path exists.
        if let Ok(resolved) = std::fs::canonicalize(s) {
            return resolved.to_string_lossy().into_owned();
        }

        // Absolute-ize against the current directory.
        let mut abs = if Path::new(s).is_absolute() {
            PathBuf::from(s)
        } else {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            cwd.join(s)
        };

        // Strip trailing slashes (except root) so the base isn't empty.
        let as_str = abs.to_string_lossy().into_owned();
        let trimmed = as_str.trim_end_matches('/');
        if !trimmed.is_empty() {
            abs = PathBuf::from(trimmed);
        }

        let base = abs
            .file_name()
            .map(|b| b.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = abs.parent().map(Path::to_path_buf).unwrap_or_default();

        let dir_norm = lexical_normalize(&dir);
        if let Ok(resolved_dir) = std::fs::canonicalize(&dir_norm) {
            let candidate = resolved_dir.join(&base);
            if let Ok(resolved) = std::fs::canonicalize(&candidate) {
                return resolved.to_string_lossy().into_owned();
            }
            return candidate.to_string_lossy().into_owned();
        }

        // Parent doesn't exist either; fully lexical so variants coalesce.
        lexical_normalize(&abs).to_string_lossy().into_owned()
    }
}

/// Single-pass lexical normalization: collapses `//`, `.`, `..`.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let absolute = path.is_absolute();
    for comp in path.components() {
        match comp {
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !absolute {
                    out.push("..");
                }
            }
            Component::Normal(c) => out.push(c),
            Component::Prefix(_) => {}
        }
    }
    if out.as_os_str().is_empty() {
        out.push(if absolute { "/" } else { "." });
    }
    out
}
