//! Checksum suite for on-disk integrity: CRC32C (Castagnoli) as the primary,
//! xxHash64 and CRC64 for callers that opt into large-block hashing, Adler-32
//! for tiny frames.
//!
//! CRC32C uses SSE4.2 when the CPU has it and falls back to slicing-by-8.
//! CRC32C and CRC64 support `combine` so a hash can be computed over chunks
//! in parallel and stitched together.

use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// CRC32C
// ---------------------------------------------------------------------------

/// CRC32C polynomial (Castagnoli), reflected form.
const CRC32C_POLY: u32 = 0x82F6_3B78;

fn crc32c_tables() -> &'static [[u32; 256]; 8] {
    static TABLES: OnceLock<Box<[[u32; 256]; 8]>> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut t = Box::new([[0u32; 256]; 8]);
        for i in 0..256u32 {
            let mut crc = i;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ CRC32C_POLY
                } else {
                    crc >> 1
                };
            }
            t[0][i as usize] = crc;
        }
        for k in 1..8 {
            for i in 0..256 {
                let prev = t[k - 1][i];
                t[k][i] = (prev >> 8) ^ t[0][(prev & 0xFF) as usize];
            }
        }
        t
    })
}

fn crc32c_software(mut crc: u32, data: &[u8]) -> u32 {
    let t = crc32c_tables();
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let lo = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ crc;
        let hi = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        crc = t[7][(lo & 0xFF) as usize]
            ^ t[6][((lo >> 8) & 0xFF) as usize]
            ^ t[5][((lo >> 16) & 0xFF) as usize]
            ^ t[4][((lo >> 24) & 0xFF) as usize]
            ^ t[3][(hi & 0xFF) as usize]
            ^ t[2][((hi >> 8) & 0xFF) as usize]
            ^ t[1][((hi >> 16) & 0xFF) as usize]
            ^ t[0][((hi >> 24) & 0xFF) as usize];
    }
    for &b in chunks.remainder() {
        crc = (crc >> 8) ^ t[0][((crc ^ b as u32) & 0xFF) as usize];
    }
    crc
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn crc32c_hardware(mut crc: u32, data: &[u8]) -> u32 {
    use std::arch::x86_64::{_mm_crc32_u64, _mm_crc32_u8};

    let mut crc64 = crc as u64;
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let v = u64::from_le_bytes(chunk.try_into().unwrap());
        crc64 = _mm_crc32_u64(crc64, v);
    }
    crc = crc64 as u32;
    for &b in chunks.remainder() {
        crc = _mm_crc32_u8(crc, b);
    }
    crc
}

fn crc32c_update_raw(crc: u32, data: &[u8]) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        static HAS_SSE42: OnceLock<bool> = OnceLock::new();
        if *HAS_SSE42.get_or_init(|| is_x86_feature_detected!("sse4.2")) {
            return unsafe { crc32c_hardware(crc, data) };
        }
    }
    crc32c_software(crc, data)
}

/// Streaming CRC32C.
#[derive(Debug, Clone)]
pub struct Crc32c {
    value: u32,
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32c {
    pub fn new() -> Self {
        Self { value: !0 }
    }

    pub fn reset(&mut self) {
        self.value = !0;
    }

    pub fn update(&mut self, data: &[u8]) {
        self.value = crc32c_update_raw(self.value, data);
    }

    pub fn finalize(&self) -> u32 {
        self.value ^ 0xFFFF_FFFF
    }

    pub fn compute(data: &[u8]) -> u32 {
        let mut c = Self::new();
        c.update(data);
        c.finalize()
    }

    /// Stitch `crc2` (over `len2` bytes) onto `crc1`, yielding the CRC of
    /// the concatenation.
    pub fn combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
        crc32_combine_poly(crc1, crc2, len2, CRC32C_POLY)
    }
}

/// One-shot CRC32C.
pub fn crc32c(data: &[u8]) -> u32 {
    Crc32c::compute(data)
}

// GF(2) matrix composition of the CRC shift operator; the zlib
// crc32_combine construction, parameterized over the reflected polynomial.
fn gf2_matrix_times32(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0u32;
    let mut i = 0usize;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square32(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times32(mat, mat[n]);
    }
}

fn crc32_combine_poly(mut crc1: u32, crc2: u32, mut len2: u64, poly: u32) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u32; 32];
    let mut odd = [0u32; 32];

    // odd = shift-by-one-bit operator
    odd[0] = poly;
    let mut row = 1u32;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }

    gf2_matrix_square32(&mut even, &odd); // shift by 2 bits
    gf2_matrix_square32(&mut odd, &even); // shift by 4 bits

    loop {
        gf2_matrix_square32(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times32(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
        gf2_matrix_square32(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times32(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

// ---------------------------------------------------------------------------
// xxHash64
// ---------------------------------------------------------------------------

const XXH_PRIME1: u64 = 11400714785074694791;
const XXH_PRIME2: u64 = 14029467366897019727;
const XXH_PRIME3: u64 = 1609587929392839161;
const XXH_PRIME4: u64 = 9650029242287828579;
const XXH_PRIME5: u64 = 2870177450012600261;

/// Streaming xxHash64.
#[derive(Debug, Clone)]
pub struct XxHash64 {
    seed: u64,
    v1: u64,
    v2: u64,
    v3: u64,
    v4: u64,
    total_len: u64,
    mem: [u8; 32],
    mem_size: usize,
}

impl XxHash64 {
    pub fn new(seed: u64) -> Self {
        let mut h = Self {
            seed,
            v1: 0,
            v2: 0,
            v3: 0,
            v4: 0,
            total_len: 0,
            mem: [0u8; 32],
            mem_size: 0,
        };
        h.reset(seed);
        h
    }

    pub fn reset(&mut self, seed: u64) {
        self.seed = seed;
        self.v1 = seed.wrapping_add(XXH_PRIME1).wrapping_add(XXH_PRIME2);
        self.v2 = seed.wrapping_add(XXH_PRIME2);
        self.v3 = seed;
        self.v4 = seed.wrapping_sub(XXH_PRIME1);
        self.total_len = 0;
        self.mem_size = 0;
    }

    fn round(acc: u64, input: u64) -> u64 {
        acc.wrapping_add(input.wrapping_mul(XXH_PRIME2))
            .rotate_left(31)
            .wrapping_mul(XXH_PRIME1)
    }

    fn merge_round(acc: u64, val: u64) -> u64 {
        (acc ^ Self::round(0, val))
            .wrapping_mul(XXH_PRIME1)
            .wrapping_add(XXH_PRIME4)
    }

    fn consume_stripe(&mut self, stripe: &[u8]) {
        debug_assert_eq!(stripe.len(), 32);
        self.v1 = Self::round(self.v1, u64::from_le_bytes(stripe[0..8].try_into().unwrap()));
        self.v2 = Self::round(self.v2, u64::from_le_bytes(stripe[8..16].try_into().unwrap()));
        self.v3 = Self::round(self.v3, u64::from_le_bytes(stripe[16..24].try_into().unwrap()));
        self.v4 = Self::round(self.v4, u64::from_le_bytes(stripe[24..32].try_into().unwrap()));
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total_len += data.len() as u64;

        if self.mem_size > 0 {
            let want = 32 - self.mem_size;
            let take = want.min(data.len());
            self.mem[self.mem_size..self.mem_size + take].copy_from_slice(&data[..take]);
            self.mem_size += take;
            data = &data[take..];
            if self.mem_size < 32 {
                return;
            }
            let stripe = self.mem;
            self.consume_stripe(&stripe);
            self.mem_size = 0;
        }

        let mut chunks = data.chunks_exact(32);
        for stripe in &mut chunks {
            self.consume_stripe(stripe);
        }
        let rem = chunks.remainder();
        if !rem.is_empty() {
            self.mem[..rem.len()].copy_from_slice(rem);
            self.mem_size = rem.len();
        }
    }

    pub fn finalize(&self) -> u64 {
        let mut h = if self.total_len >= 32 {
            let mut acc = self
                .v1
                .rotate_left(1)
                .wrapping_add(self.v2.rotate_left(7))
                .wrapping_add(self.v3.rotate_left(12))
                .wrapping_add(self.v4.rotate_left(18));
            acc = Self::merge_round(acc, self.v1);
            acc = Self::merge_round(acc, self.v2);
            acc = Self::merge_round(acc, self.v3);
            acc = Self::merge_round(acc, self.v4);
            acc
        } else {
            self.seed.wrapping_add(XXH_PRIME5)
        };

        h = h.wrapping_add(self.total_len);

        let mut tail = &self.mem[..self.mem_size];
        while tail.len() >= 8 {
            let k = Self::round(0, u64::from_le_bytes(tail[..8].try_into().unwrap()));
            h = (h ^ k).rotate_left(27).wrapping_mul(XXH_PRIME1).wrapping_add(XXH_PRIME4);
            tail = &tail[8..];
        }
        if tail.len() >= 4 {
            let k = u32::from_le_bytes(tail[..4].try_into().unwrap()) as u64;
            h = (h ^ k.wrapping_mul(XXH_PRIME1))
                .rotate_left(23)
                .wrapping_mul(XXH_PRIME2)
                .wrapping_add(XXH_PRIME3);
            tail = &tail[4..];
        }
        for &b in tail {
            h = (h ^ (b as u64).wrapping_mul(XXH_PRIME5))
                .rotate_left(11)
                .wrapping_mul(XXH_PRIME1);
        }

        h ^= h >> 33;
        h = h.wrapping_mul(XXH_PRIME2);
        h ^= h >> 29;
        h = h.wrapping_mul(XXH_PRIME3);
        h ^= h >> 32;
        h
    }

    pub fn compute(data: &[u8], seed: u64) -> u64 {
        let mut h = Self::new(seed);
        h.update(data);
        h.finalize()
    }
}

// ---------------------------------------------------------------------------
// CRC64 (ECMA-182, reflected)
// ---------------------------------------------------------------------------

const CRC64_POLY: u64 = 0xC96C_5795_D787_0F42;

fn crc64_table() -> &'static [u64; 256] {
    static TABLE: OnceLock<Box<[u64; 256]>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = Box::new([0u64; 256]);
        for i in 0..256u64 {
            let mut crc = i;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ CRC64_POLY
                } else {
                    crc >> 1
                };
            }
            t[i as usize] = crc;
        }
        t
    })
}

/// Streaming CRC64 over the ECMA-182 polynomial.
#[derive(Debug, Clone)]
pub struct Crc64 {
    value: u64,
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc64 {
    pub fn new() -> Self {
        Self { value: !0 }
    }

    pub fn reset(&mut self) {
        self.value = !0;
    }

    pub fn update(&mut self, data: &[u8]) {
        let t = crc64_table();
        let mut crc = self.value;
        for &b in data {
            crc = (crc >> 8) ^ t[((crc ^ b as u64) & 0xFF) as usize];
        }
        self.value = crc;
    }

    pub fn finalize(&self) -> u64 {
        self.value ^ 0xFFFF_FFFF_FFFF_FFFF
    }

    pub fn compute(data: &[u8]) -> u64 {
        let mut c = Self::new();
        c.update(data);
        c.finalize()
    }

    pub fn combine(mut crc1: u64, crc2: u64, mut len2: u64) -> u64 {
        if len2 == 0 {
            return crc1;
        }

        let mut even = [0u64; 64];
        let mut odd = [0u64; 64];

        odd[0] = CRC64_POLY;
        let mut row = 1u64;
        for entry in odd.iter_mut().skip(1) {
            *entry = row;
            row <<= 1;
        }

        gf2_matrix_square64(&mut even, &odd);
        gf2_matrix_square64(&mut odd, &even);

        loop {
            gf2_matrix_square64(&mut even, &odd);
            if len2 & 1 != 0 {
                crc1 = gf2_matrix_times64(&even, crc1);
            }
            len2 >>= 1;
            if len2 == 0 {
                break;
            }
            gf2_matrix_square64(&mut odd, &even);
            if len2 & 1 != 0 {
                crc1 = gf2_matrix_times64(&odd, crc1);
            }
            len2 >>= 1;
            if len2 == 0 {
                break;
            }
        }

        crc1 ^ crc2
    }
}

fn gf2_matrix_times64(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0u64;
    let mut i = 0usize;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square64(square: &mut [u64; 64], mat: &[u64; 64]) {
    for n in 0..64 {
        square[n] = gf2_matrix_times64(mat, mat[n]);
    }
}

// ---------------------------------------------------------------------------
// Adler-32
// ---------------------------------------------------------------------------

const ADLER_BASE: u32 = 65521;
// Largest n with 255n(n+1)/2 + (n+1)(BASE-1) < 2^32; overflow-free chunking.
const ADLER_NMAX: usize = 5552;

/// Streaming Adler-32.
#[derive(Debug, Clone)]
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Default for Adler32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Adler32 {
    pub fn new() -> Self {
        Self { a: 1, b: 0 }
    }

    pub fn reset(&mut self) {
        self.a = 1;
        self.b = 0;
    }

    pub fn update(&mut self, data: &[u8]) {
        for chunk in data.chunks(ADLER_NMAX) {
            for &byte in chunk {
                self.a += byte as u32;
                self.b += self.a;
            }
            self.a %= ADLER_BASE;
            self.b %= ADLER_BASE;
        }
    }

    pub fn finalize(&self) -> u32 {
        (self.b << 16) | self.a
    }

    pub fn compute(data: &[u8]) -> u32 {
        let mut c = Self::new();
        c.update(data);
        c.finalize()
    }
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Adler32,
    Crc32c,
    XxHash64,
    Crc64,
}

/// Pick a checksum for a payload of `data_size` bytes.
///
/// Tiny frames take Adler-32 (cheapest to compute, adequate for a few hundred
/// bytes); everything else takes CRC32C, which is hardware-accelerated on
/// every deployment target. Callers that want the strongest detection this
/// module offers (at 64-bit width) opt in with `need_strong`.
pub fn select_checksum(data_size: usize, need_strong: bool) -> ChecksumKind {
    if need_strong {
        return ChecksumKind::Crc64;
    }
    if data_size < 1024 {
        ChecksumKind::Adler32
    } else {
        ChecksumKind::Crc32c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK_INPUT: &[u8] = b"123456789";

    #[test]
    fn crc32c_check_value() {
        // Castagnoli check value.
        assert_eq!(Crc32c::compute(CHECK_INPUT), 0xE306_9283);
        assert_eq!(Crc32c::compute(b""), 0);
    }

    #[test]
    fn crc32c_software_matches_dispatch() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 + 7) as u8).collect();
        let sw = !crc32c_software(!0, &data);
        assert_eq!(sw, Crc32c::compute(&data));
    }

    #[test]
    fn crc32c_streaming_matches_oneshot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i ^ (i >> 3)) as u8).collect();
        let mut c = Crc32c::new();
        for chunk in data.chunks(377) {
            c.update(chunk);
        }
        assert_eq!(c.finalize(), Crc32c::compute(&data));

        c.reset();
        c.update(&data);
        assert_eq!(c.finalize(), Crc32c::compute(&data));
    }

    #[test]
    fn crc32c_combine_concatenation() {
        let a = b"the quick brown fox ";
        let b = b"jumps over the lazy dog";
        let whole = {
            let mut v = a.to_vec();
            v.extend_from_slice(b);
            Crc32c::compute(&v)
        };
        let combined = Crc32c::combine(Crc32c::compute(a), Crc32c::compute(b), b.len() as u64);
        assert_eq!(combined, whole);

        // Zero-length right side is the identity.
        assert_eq!(Crc32c::combine(0xDEADBEEF, Crc32c::compute(b""), 0), 0xDEADBEEF);
    }

    #[test]
    fn xxhash64_known_values() {
        assert_eq!(XxHash64::compute(b"", 0), 0xEF46_DB37_51D8_E999);
        // Streaming with odd chunk sizes must match one-shot.
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 131) as u8).collect();
        let mut h = XxHash64::new(42);
        for chunk in data.chunks(13) {
            h.update(chunk);
        }
        assert_eq!(h.finalize(), XxHash64::compute(&data, 42));
    }

    #[test]
    fn xxhash64_seed_sensitivity() {
        let d = b"identical bytes";
        assert_ne!(XxHash64::compute(d, 0), XxHash64::compute(d, 1));
    }

    #[test]
    fn crc64_check_value() {
        // CRC-64/XZ check value for "123456789".
        assert_eq!(Crc64::compute(CHECK_INPUT), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn crc64_combine_concatenation() {
        let a = b"left half of the buffer / ";
        let b = b"right half of the buffer";
        let mut whole = a.to_vec();
        whole.extend_from_slice(b);
        assert_eq!(
            Crc64::combine(Crc64::compute(a), Crc64::compute(b), b.len() as u64),
            Crc64::compute(&whole)
        );
    }

    #[test]
    fn adler32_check_value() {
        // RFC 1950 example.
        assert_eq!(Adler32::compute(b"Wikipedia"), 0x11E6_0398);
        assert_eq!(Adler32::compute(b""), 1);
    }

    #[test]
    fn adler32_large_input_no_overflow() {
        let data = vec![0xFFu8; 100_000];
        let mut c = Adler32::new();
        c.update(&data);
        let streamed = c.finalize();
        assert_eq!(streamed, Adler32::compute(&data));
    }

    #[test]
    fn selection_policy() {
        assert_eq!(select_checksum(16, false), ChecksumKind::Adler32);
        assert_eq!(select_checksum(1023, false), ChecksumKind::Adler32);
        assert_eq!(select_checksum(1024, false), ChecksumKind::Crc32c);
        assert_eq!(select_checksum(1 << 20, false), ChecksumKind::Crc32c);
        assert_eq!(select_checksum(16, true), ChecksumKind::Crc64);
    }
}
