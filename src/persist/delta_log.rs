//! Append-only framed delta log (WAL).
//!
//! Each frame is a 16-byte header, a 52-byte serialized delta record, and an
//! optional payload. Headers carry a CRC over themselves and one over the
//! payload, so replay self-verifies frame by frame. Appends reserve space by
//! atomically bumping the end offset, then pwrite at the reserved position;
//! concurrent appenders never interleave bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use super::checksums::crc32c;
use super::node_id::OtDeltaRec;
use super::utils::unix_now;

pub const FRAME_HEADER_SIZE: usize = 16;
pub const FRAME_TYPE_DELTA_ONLY: u32 = 1;
pub const FRAME_TYPE_DELTA_WITH_PAYLOAD: u32 = 2;

/// A delta plus the node bytes it describes, for eventual-durability mode.
#[derive(Debug, Clone)]
pub struct DeltaWithPayload {
    pub delta: OtDeltaRec,
    pub payload: Option<Vec<u8>>,
}

/// Little-endian wire codec for the fixed 52-byte record.
pub fn serialize_delta_rec(out: &mut Vec<u8>, rec: &OtDeltaRec) {
    out.extend_from_slice(&rec.handle_idx.to_le_bytes());
    out.extend_from_slice(&rec.tag.to_le_bytes());
    out.push(rec.class_id);
    out.push(rec.kind);
    out.extend_from_slice(&rec.file_id.to_le_bytes());
    out.extend_from_slice(&rec.segment_id.to_le_bytes());
    out.extend_from_slice(&rec.offset.to_le_bytes());
    out.extend_from_slice(&rec.length.to_le_bytes());
    out.extend_from_slice(&rec.data_crc32c.to_le_bytes());
    out.extend_from_slice(&rec.birth_epoch.to_le_bytes());
    out.extend_from_slice(&rec.retire_epoch.to_le_bytes());
}

pub fn deserialize_delta_rec(buf: &[u8]) -> OtDeltaRec {
    debug_assert!(buf.len() >= OtDeltaRec::WIRE_SIZE);
    let u16_at = |o: usize| u16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
    let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
    let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
    OtDeltaRec {
        handle_idx: u64_at(0),
        tag: u16_at(8),
        class_id: buf[10],
        kind: buf[11],
        file_id: u32_at(12),
        segment_id: u32_at(16),
        offset: u64_at(20),
        length: u32_at(28),
        data_crc32c: u32_at(32),
        birth_epoch: u64_at(36),
        retire_epoch: u64_at(44),
    }
}

const _: () = assert!(OtDeltaRec::WIRE_SIZE == 52);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEnd {
    /// The file ends exactly on a frame boundary.
    CleanEof,
    /// A final frame was only partially written; legal after a crash.
    TornTail,
    /// A frame fails verification before end-of-file.
    Corrupt { reason: String },
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    /// Byte offset just past the last fully verified frame; the caller may
    /// truncate the file here.
    pub last_good_offset: u64,
    pub frames: u64,
    pub end: ReplayEnd,
}

impl ReplayReport {
    pub fn is_torn_tail(&self) -> bool {
        matches!(self.end, ReplayEnd::TornTail)
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self.end, ReplayEnd::Corrupt { .. })
    }
}

pub struct DeltaLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
    end_offset: AtomicU64,
    closing: AtomicBool,
    in_flight: AtomicU32,
    close_mu: Mutex<()>,
    close_cv: Condvar,
    prealloc_chunk: u64,
    max_epoch: AtomicU64,
    sequence: u64,
    created_sec: u64,
}

struct InFlightGuard<'a> {
    log: &'a DeltaLog,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.log.in_flight.fetch_sub(1, Ordering::AcqRel);
        let _g = self.log.close_mu.lock().unwrap();
        self.log.close_cv.notify_all();
    }
}

impl DeltaLog {
    /// Open (or create) the log and position appends at its current end.
    pub fn new(path: &Path, prealloc_chunk: u64, sequence: u64) -> Result<Self> {
        let log = Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
            end_offset: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            in_flight: AtomicU32::new(0),
            close_mu: Mutex::new(()),
            close_cv: Condvar::new(),
            prealloc_chunk: prealloc_chunk.max(1),
            max_epoch: AtomicU64::new(0),
            sequence,
            created_sec: unix_now() as u64,
        };
        log.open_for_append()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn created_sec(&self) -> u64 {
        self.created_sec
    }

    pub fn size_bytes(&self) -> u64 {
        self.end_offset.load(Ordering::Acquire)
    }

    /// Highest birth epoch appended so far; the rotation coordinator reads
    /// this when sealing.
    pub fn max_epoch(&self) -> u64 {
        self.max_epoch.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().unwrap().is_some()
    }

    fn open_for_append(&self) -> Result<()> {
        let mut file_slot = self.file.lock().unwrap();
        if file_slot.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("open delta log {}", self.path.display()))?;
        let end = file.metadata()?.len();
        self.end_offset.store(end, Ordering::Release);

        // Preallocate the next chunk while we're in the first half of the
        // current one. Best-effort; failure is ignored.
        let chunk = self.prealloc_chunk;
        if end % chunk < chunk / 2 {
            let target = (end / chunk + 1) * chunk;
            if let Err(e) = platform_fs::preallocate(&self.path, target) {
                debug!("delta log preallocation skipped: {e:#}");
            }
        }

        *file_slot = Some(file);
        Ok(())
    }

    /// Append a batch of frames as one contiguous write. Refused while the
    /// log is closing. The caller still owns durability via `sync`.
    pub fn append_with_payloads(&self, batch: &[DeltaWithPayload]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.closing.load(Ordering::Acquire) {
            bail!("cannot append: delta log is closing");
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlightGuard { log: self };

        let mut total = 0usize;
        for item in batch {
            total += FRAME_HEADER_SIZE + OtDeltaRec::WIRE_SIZE;
            if let Some(p) = &item.payload {
                total += p.len();
            }
        }

        let mut buffer = Vec::with_capacity(total);
        let mut batch_max_epoch = 0u64;
        for item in batch {
            batch_max_epoch = batch_max_epoch.max(item.delta.birth_epoch);

            let payload = item.payload.as_deref().unwrap_or(&[]);
            let frame_type = if payload.is_empty() {
                FRAME_TYPE_DELTA_ONLY
            } else {
                FRAME_TYPE_DELTA_WITH_PAYLOAD
            };
            let payload_crc = if payload.is_empty() {
                0
            } else {
                crc32c(payload)
            };

            let mut header = [0u8; FRAME_HEADER_SIZE];
            header[0..4].copy_from_slice(&frame_type.to_le_bytes());
            header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            header[8..12].copy_from_slice(&payload_crc.to_le_bytes());
            let header_crc = crc32c(&header[0..12]);
            header[12..16].copy_from_slice(&header_crc.to_le_bytes());

            buffer.extend_from_slice(&header);
            serialize_delta_rec(&mut buffer, &item.delta);
            buffer.extend_from_slice(payload);
        }

        // Atomically reserve our byte range, then write into it.
        let write_offset = self
            .end_offset
            .fetch_add(buffer.len() as u64, Ordering::AcqRel);

        let fd = {
            let file_slot = self.file.lock().unwrap();
            match file_slot.as_ref() {
                Some(f) => f.as_raw_fd(),
                None => {
                    self.end_offset
                        .fetch_sub(buffer.len() as u64, Ordering::AcqRel);
                    bail!("delta log is not open");
                }
            }
        };

        if let Err(e) = pwrite_all(fd, &buffer, write_offset) {
            // Roll back the reservation on failure.
            self.end_offset
                .fetch_sub(buffer.len() as u64, Ordering::AcqRel);
            return Err(e).with_context(|| format!("write delta log {}", self.path.display()));
        }

        if batch_max_epoch > 0 {
            let mut cur = self.max_epoch.load(Ordering::Relaxed);
            while batch_max_epoch > cur {
                match self.max_epoch.compare_exchange_weak(
                    cur,
                    batch_max_epoch,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
        }
        Ok(())
    }

    pub fn append(&self, batch: &[OtDeltaRec]) -> Result<()> {
        let dwp: Vec<DeltaWithPayload> = batch
            .iter()
            .map(|d| DeltaWithPayload {
                delta: *d,
                payload: None,
            })
            .collect();
        self.append_with_payloads(&dwp)
    }

    /// fsync the log file.
    pub fn sync(&self) -> Result<()> {
        let file_slot = self.file.lock().unwrap();
        if let Some(f) = file_slot.as_ref() {
            platform_fs::flush_file(f.as_raw_fd())
                .with_context(|| format!("fsync delta log {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Block new appends, wait for in-flight ones to finish, close the fd.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        {
            let mut g = self.close_mu.lock().unwrap();
            while self.in_flight.load(Ordering::Acquire) != 0 {
                g = self.close_cv.wait(g).unwrap();
            }
        }
        let mut file_slot = self.file.lock().unwrap();
        *file_slot = None;
        self.end_offset.store(0, Ordering::Release);
    }

    /// Replay this log from byte zero, tolerating a torn tail silently.
    pub fn replay_with_payloads(
        &self,
        mut apply: impl FnMut(&OtDeltaRec, Option<&[u8]>),
    ) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let report = replay_file_with_payloads(&self.path, |rec, payload| apply(rec, payload))?;
        if let ReplayEnd::Corrupt { reason } = &report.end {
            warn!(
                "delta log {} stopped at corrupt frame ({}), offset {}",
                self.path.display(),
                reason,
                report.last_good_offset
            );
        }
        Ok(())
    }
}

impl Drop for DeltaLog {
    fn drop(&mut self) {
        if self.is_open() {
            self.close();
        }
    }
}

fn pwrite_all(fd: i32, buf: &[u8], offset: u64) -> Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let rc = unsafe {
            libc::pwrite(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
                (offset + written as u64) as libc::off_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(anyhow::Error::new(err).context("pwrite"));
        }
        if rc == 0 {
            bail!("pwrite wrote zero bytes");
        }
        written += rc as usize;
    }
    Ok(())
}

/// Read `buf.len()` bytes or report how many arrived before EOF.
fn read_fully(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

/// Static replay entry point used by recovery. Iterates frames from byte
/// zero, verifying every CRC, and reports where the verified prefix ends and
/// why. A torn tail is success; a corrupt frame before EOF is not.
pub fn replay_file(path: &Path, mut apply: impl FnMut(&OtDeltaRec)) -> Result<ReplayReport> {
    replay_file_with_payloads(path, |rec, _| apply(rec))
}

pub fn replay_file_with_payloads(
    path: &Path,
    mut apply: impl FnMut(&OtDeltaRec, Option<&[u8]>),
) -> Result<ReplayReport> {
    let file =
        File::open(path).with_context(|| format!("open delta log {} for replay", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut offset = 0u64;
    let mut report = ReplayReport {
        last_good_offset: 0,
        frames: 0,
        end: ReplayEnd::CleanEof,
    };

    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut rec_buf = [0u8; OtDeltaRec::WIRE_SIZE];
    let mut payload_buf: Vec<u8> = Vec::new();

    loop {
        let frame_start = offset;
        let got = read_fully(&mut reader, &mut header)?;
        if got == 0 {
            report.end = ReplayEnd::CleanEof;
            report.last_good_offset = frame_start;
            return Ok(report);
        }
        if got < FRAME_HEADER_SIZE {
            report.end = ReplayEnd::TornTail;
            report.last_good_offset = frame_start;
            return Ok(report);
        }

        let frame_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let payload_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let payload_crc = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let header_crc = u32::from_le_bytes(header[12..16].try_into().unwrap());

        if crc32c(&header[0..12]) != header_crc {
            report.end = ReplayEnd::Corrupt {
                reason: "header CRC mismatch".into(),
            };
            report.last_good_offset = frame_start;
            return Ok(report);
        }
        if frame_type != FRAME_TYPE_DELTA_ONLY && frame_type != FRAME_TYPE_DELTA_WITH_PAYLOAD {
            report.end = ReplayEnd::Corrupt {
                reason: format!("invalid frame type {frame_type}"),
            };
            report.last_good_offset = frame_start;
            return Ok(report);
        }

        let got = read_fully(&mut reader, &mut rec_buf)?;
        if got < OtDeltaRec::WIRE_SIZE {
            report.end = ReplayEnd::TornTail;
            report.last_good_offset = frame_start;
            return Ok(report);
        }
        let rec = deserialize_delta_rec(&rec_buf);

        let mut payload: Option<&[u8]> = None;
        if frame_type == FRAME_TYPE_DELTA_WITH_PAYLOAD && payload_size > 0 {
            payload_buf.resize(payload_size, 0);
            let got = read_fully(&mut reader, &mut payload_buf)?;
            if got < payload_size {
                report.end = ReplayEnd::TornTail;
                report.last_good_offset = frame_start;
                return Ok(report);
            }
            if crc32c(&payload_buf) != payload_crc {
                report.end = ReplayEnd::Corrupt {
                    reason: "payload CRC mismatch".into(),
                };
                report.last_good_offset = frame_start;
                return Ok(report);
            }
            payload = Some(&payload_buf[..]);
        }

        apply(&rec, payload);
        offset = frame_start
            + (FRAME_HEADER_SIZE + OtDeltaRec::WIRE_SIZE + payload_size) as u64;
        report.frames += 1;
        report.last_good_offset = offset;
    }
}
