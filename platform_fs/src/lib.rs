//! Thin filesystem portability layer: memory mapping, durability primitives
//! and the handful of path operations the storage engine needs.
//!
//! Everything here returns `anyhow::Result`; OS error codes stay reachable
//! through the wrapped `std::io::Error` (`raw_os_error()`).

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    ReadWrite,
}

/// A mapped window over a file. Unmaps and closes the owned fd on drop.
#[derive(Debug)]
pub struct MappedRegion {
    addr: *mut u8,
    size: usize,
    fd: RawFd,
}

// The mapping is MAP_SHARED file memory; concurrent access is governed by
// the callers' own protocols (seqlock, pin discipline).
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.size) }
    }

    /// msync the whole region.
    pub fn flush_view(&self) -> Result<()> {
        flush_view(self.addr, self.size)
    }

    /// fsync the backing file.
    pub fn flush_file(&self) -> Result<()> {
        flush_file(self.fd)
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            unsafe {
                libc::munmap(self.addr as *mut libc::c_void, self.size);
                libc::close(self.fd);
            }
            self.addr = std::ptr::null_mut();
        }
    }
}

fn cpath(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| anyhow!("path contains interior NUL: {}", path.display()))
}

fn os_err(what: &str, path: &Path) -> anyhow::Error {
    anyhow::Error::new(io::Error::last_os_error())
        .context(format!("{} failed for {}", what, path.display()))
}

/// System page size, cached after the first call.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ps > 0 {
            ps as usize
        } else {
            4096
        }
    })
}

/// Round `size` up to the next page boundary.
pub fn page_align(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) / page * page
}

/// Map `[offset, offset + size)` of `path`. ReadWrite creates the file if
/// missing; ReadOnly requires it to exist.
pub fn map_file(path: &Path, offset: u64, size: usize, mode: MapMode) -> Result<MappedRegion> {
    let c = cpath(path)?;
    let flags = match mode {
        MapMode::ReadOnly => libc::O_RDONLY | libc::O_CLOEXEC,
        MapMode::ReadWrite => libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
    };
    let fd = unsafe { libc::open(c.as_ptr(), flags, 0o644) };
    if fd < 0 {
        return Err(os_err("open", path));
    }

    let prot = match mode {
        MapMode::ReadOnly => libc::PROT_READ,
        MapMode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        let err = os_err("mmap", path);
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(MappedRegion {
        addr: addr as *mut u8,
        size,
        fd,
    })
}

/// Explicit unmap; equivalent to dropping the region.
pub fn unmap(region: MappedRegion) {
    drop(region);
}

/// msync(MS_SYNC) a mapped range.
pub fn flush_view(addr: *const u8, len: usize) -> Result<()> {
    let rc = unsafe { libc::msync(addr as *mut libc::c_void, len, libc::MS_SYNC) };
    if rc != 0 {
        return Err(anyhow::Error::new(io::Error::last_os_error()).context("msync failed"));
    }
    Ok(())
}

/// Durably flush a file's data and size.
pub fn flush_file(fd: RawFd) -> Result<()> {
    #[cfg(target_os = "macos")]
    let rc = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
    #[cfg(not(target_os = "macos"))]
    let rc = unsafe { libc::fsync(fd) };
    if rc != 0 {
        return Err(anyhow::Error::new(io::Error::last_os_error()).context("fsync failed"));
    }
    Ok(())
}

/// fsync a directory so entry renames/creates survive a crash.
pub fn fsync_directory(dir: &Path) -> Result<()> {
    let c = cpath(dir)?;
    let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(os_err("open directory", dir));
    }
    let rc = unsafe { libc::fsync(fd) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc != 0 {
        return Err(anyhow::Error::new(err).context(format!("fsync dir {}", dir.display())));
    }
    Ok(())
}

/// Atomically replace `dst` with `src` (rename + parent directory fsync).
/// After this returns Ok, a crash cannot expose a partially written `dst`.
pub fn atomic_replace(src: &Path, dst: &Path) -> Result<()> {
    std::fs::rename(src, dst)
        .with_context(|| format!("rename {} -> {}", src.display(), dst.display()))?;
    let parent = dst.parent().filter(|p| !p.as_os_str().is_empty());
    fsync_directory(parent.unwrap_or_else(|| Path::new(".")))
}

/// Grow `path` to at least `len` bytes, preallocating real blocks where the
/// platform supports it. Creates the file if missing.
pub fn preallocate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let fd = file.as_raw_fd();

    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::fallocate(fd, 0, 0, len as libc::off_t) };
        if rc == 0 {
            return Ok(());
        }
    }
    #[cfg(target_os = "macos")]
    {
        let mut store = libc::fstore_t {
            fst_flags: libc::F_ALLOCATECONTIG,
            fst_posmode: libc::F_PEOFPOSMODE,
            fst_offset: 0,
            fst_length: len as libc::off_t,
            fst_bytesalloc: 0,
        };
        let rc = unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store) };
        if rc == -1 {
            store.fst_flags = libc::F_ALLOCATEALL;
            unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store) };
        }
    }

    // Fallback: plain size extension. Never shrinks.
    let current = file.metadata().map(|m| m.len()).unwrap_or(0);
    if current < len {
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc != 0 {
            return Err(os_err("ftruncate", path));
        }
    }
    Ok(())
}

/// posix_fadvise(WILLNEED) on a file range. Best-effort.
pub fn advise_willneed(fd: RawFd, offset: u64, len: u64) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe {
            libc::posix_fadvise(
                fd,
                offset as libc::off_t,
                len as libc::off_t,
                libc::POSIX_FADV_WILLNEED,
            )
        };
        if rc != 0 {
            return Err(anyhow::Error::new(io::Error::from_raw_os_error(rc))
                .context("posix_fadvise failed"));
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (fd, offset, len);
    }
    Ok(())
}

/// madvise(WILLNEED) on an already-mapped range. Best-effort.
pub fn prefetch(addr: *mut u8, len: usize) -> Result<()> {
    let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_WILLNEED) };
    if rc != 0 {
        return Err(anyhow::Error::new(io::Error::last_os_error()).context("madvise failed"));
    }
    Ok(())
}

/// Advise the kernel a mapped range will not be needed soon, letting it drop
/// the pages from RSS without unmapping.
pub fn release_pages(addr: *mut u8, len: usize) {
    #[cfg(target_os = "macos")]
    let advice = libc::MADV_FREE;
    #[cfg(not(target_os = "macos"))]
    let advice = libc::MADV_DONTNEED;
    unsafe {
        libc::madvise(addr as *mut libc::c_void, len, advice);
    }
}

/// madvise(MADV_RANDOM) on a new mapping.
pub fn advise_random(addr: *mut u8, len: usize) {
    unsafe {
        libc::madvise(addr as *mut libc::c_void, len, libc::MADV_RANDOM);
    }
}

pub fn file_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(meta.len())
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("mkdir -p {}", path.display()))
}

pub fn truncate(path: &Path, size: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.set_len(size)
        .with_context(|| format!("truncate {} to {}", path.display(), size))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tmp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "platform_fs_{}_{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn map_write_read_back() -> Result<()> {
        let dir = tmp_dir("map");
        let path = dir.join("m.bin");
        preallocate(&path, 8192)?;

        {
            let region = map_file(&path, 0, 8192, MapMode::ReadWrite)?;
            unsafe {
                std::ptr::write_bytes(region.addr(), 0xAB, 16);
            }
            region.flush_view()?;
            region.flush_file()?;
        }

        let region = map_file(&path, 0, 8192, MapMode::ReadOnly)?;
        assert_eq!(&region.as_slice()[..4], &[0xAB; 4]);
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn atomic_replace_swaps_content() -> Result<()> {
        let dir = tmp_dir("swap");
        let src = dir.join("a.tmp");
        let dst = dir.join("a.json");
        std::fs::write(&dst, b"old")?;
        let mut f = std::fs::File::create(&src)?;
        f.write_all(b"new")?;
        f.sync_all()?;
        atomic_replace(&src, &dst)?;
        assert_eq!(std::fs::read(&dst)?, b"new");
        assert!(!src.exists());
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn preallocate_extends_size() -> Result<()> {
        let dir = tmp_dir("prealloc");
        let path = dir.join("p.bin");
        preallocate(&path, 1 << 20)?;
        assert_eq!(file_size(&path)?, 1 << 20);
        // A smaller preallocate never shrinks; truncate is explicit.
        preallocate(&path, 4096)?;
        assert_eq!(file_size(&path)?, 1 << 20);
        truncate(&path, 4096)?;
        assert_eq!(file_size(&path)?, 4096);
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn page_align_rounds_up() {
        let page = page_size();
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }
}
