//! Cache topology discovery.
//!
//! Two hardware paths are tried through the legacy cache-info leaf: the
//! single-byte descriptor table, and (when a descriptor says so) the
//! deterministic per-level leaf. Only Intel parts are queried this way.
//! Whatever the hardware leaves unfilled can be taken from the OS via sysfs.
//!
//! A slot is written at most once: the first source to report a nonzero size
//! for a cache wins.

use std::fs;
use std::path::Path;

use log::{debug, trace};
use once_cell::race::OnceBox;

use crate::cpu::{Vendor, detect_vendor};
use crate::cpuid::{
    CacheLeafEax, CacheLeafEbx, CpuidSource, LEAF_BASE, LEAF_CACHE_INFO, LEAF_CACHE_PARAMS,
    NativeCpuid,
};
use crate::error::{FastCopyError, Result};

/// Cache level/kind slots tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    L1d = 0,
    L1i = 1,
    L2 = 2,
    L3 = 3,
}

impl CacheType {
    pub const ALL: [CacheType; 4] = [CacheType::L1d, CacheType::L1i, CacheType::L2, CacheType::L3];

    /// (level, deterministic-leaf type code)
    const fn leaf_key(self) -> (u32, u32) {
        match self {
            CacheType::L1d => (1, LEAF4_TYPE_DATA),
            CacheType::L1i => (1, LEAF4_TYPE_INSTRUCTION),
            CacheType::L2 => (2, LEAF4_TYPE_UNIFIED),
            CacheType::L3 => (3, LEAF4_TYPE_UNIFIED),
        }
    }
}

const LEAF4_TYPE_DATA: u32 = 1;
const LEAF4_TYPE_INSTRUCTION: u32 = 2;
const LEAF4_TYPE_UNIFIED: u32 = 3;

/// Register holds no descriptors when bit 31 is set.
const REG_RESERVED: u32 = 0x8000_0000;
/// Only level-1 caches may be taken from the deterministic leaf.
const TAG_L1_ONLY: u8 = 0x40;
/// No descriptors here; use the deterministic leaf instead.
const TAG_USE_LEAF4: u8 = 0xff;

/// Per-slot cache sizes in bytes; 0 means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheSizes([usize; 4]);

impl CacheSizes {
    pub const fn new(l1d: usize, l1i: usize, l2: usize, l3: usize) -> Self {
        Self([l1d, l1i, l2, l3])
    }

    #[inline]
    pub fn get(&self, ty: CacheType) -> usize {
        self.0[ty as usize]
    }

    /// Fill `ty` if still unknown. Returns true if the slot was written.
    pub fn fill(&mut self, ty: CacheType, size: usize) -> bool {
        let slot = &mut self.0[ty as usize];
        if *slot != 0 || size == 0 {
            return false;
        }
        *slot = size;
        true
    }

    pub fn filled(&self) -> usize {
        self.0.iter().filter(|&&s| s != 0).count()
    }

    pub fn is_complete(&self) -> bool {
        self.filled() == self.0.len()
    }
}

// =============================================================================
// DESCRIPTOR TABLE
// =============================================================================

const fn descriptor_table() -> [Option<(CacheType, usize)>; 256] {
    use CacheType::*;

    let mut t: [Option<(CacheType, usize)>; 256] = [None; 256];
    t[0x06] = Some((L1i, 8192));
    t[0x08] = Some((L1i, 16384));
    t[0x09] = Some((L1i, 32768));
    t[0x0a] = Some((L1d, 8192));
    t[0x0c] = Some((L1d, 16384));
    t[0x0d] = Some((L1d, 16384));
    t[0x0e] = Some((L1d, 24576));
    t[0x21] = Some((L2, 262144));
    t[0x22] = Some((L3, 524288));
    t[0x23] = Some((L3, 1048576));
    t[0x25] = Some((L3, 2097152));
    t[0x29] = Some((L3, 4194304));
    t[0x2c] = Some((L1d, 32768));
    t[0x30] = Some((L1i, 32768));
    t[0x39] = Some((L2, 131072));
    t[0x3a] = Some((L2, 196608));
    t[0x3b] = Some((L2, 131072));
    t[0x3c] = Some((L2, 262144));
    t[0x3d] = Some((L2, 393216));
    t[0x3e] = Some((L2, 524288));
    t[0x3f] = Some((L2, 262144));
    t[0x41] = Some((L2, 131072));
    t[0x42] = Some((L2, 262144));
    t[0x43] = Some((L2, 524288));
    t[0x44] = Some((L2, 1048576));
    t[0x45] = Some((L2, 2097152));
    t[0x46] = Some((L3, 4194304));
    t[0x47] = Some((L3, 8388608));
    t[0x48] = Some((L2, 3145728));
    t[0x49] = Some((L2, 4194304));
    t[0x4a] = Some((L3, 6291456));
    t[0x4b] = Some((L3, 8388608));
    t[0x4c] = Some((L3, 12582912));
    t[0x4d] = Some((L3, 16777216));
    t[0x4e] = Some((L2, 6291456));
    t[0x60] = Some((L1d, 16384));
    t[0x66] = Some((L1d, 8192));
    t[0x67] = Some((L1d, 16384));
    t[0x68] = Some((L1d, 32768));
    t[0x78] = Some((L2, 1048576));
    t[0x79] = Some((L2, 131072));
    t[0x7a] = Some((L2, 262144));
    t[0x7b] = Some((L2, 524288));
    t[0x7c] = Some((L2, 1048576));
    t[0x7d] = Some((L2, 2097152));
    t[0x7f] = Some((L2, 524288));
    t[0x80] = Some((L2, 524288));
    t[0x82] = Some((L2, 262144));
    t[0x83] = Some((L2, 524288));
    t[0x84] = Some((L2, 1048576));
    t[0x85] = Some((L2, 2097152));
    t[0x86] = Some((L2, 524288));
    t[0x87] = Some((L2, 1048576));
    t[0xd0] = Some((L3, 524288));
    t[0xd1] = Some((L3, 1048576));
    t[0xd2] = Some((L3, 2097152));
    t[0xd6] = Some((L3, 1048576));
    t[0xd7] = Some((L3, 2097152));
    t[0xd8] = Some((L3, 4194304));
    t[0xdc] = Some((L3, 2097152));
    t[0xdd] = Some((L3, 4194304));
    t[0xde] = Some((L3, 8388608));
    t[0xe2] = Some((L3, 2097152));
    t[0xe3] = Some((L3, 4194304));
    t[0xe4] = Some((L3, 8388608));
    t[0xea] = Some((L3, 12582912));
    t[0xeb] = Some((L3, 18874368));
    t[0xec] = Some((L3, 25165824));
    t
}

static DESCRIPTORS: [Option<(CacheType, usize)>; 256] = descriptor_table();

// =============================================================================
// HARDWARE ENUMERATION
// =============================================================================

/// Fill `sizes` from the deterministic cache leaf, walking sub-leaves until
/// one reports no cache or every slot is filled.
fn enumerate_leaf4(src: &impl CpuidSource, sizes: &mut CacheSizes, level1_only: bool) {
    let mut subleaf = 0;
    while !sizes.is_complete() {
        let regs = src.query(LEAF_CACHE_PARAMS, subleaf);
        let info = CacheLeafEax(regs.eax);
        if info.cache_type() == 0 {
            break;
        }

        let line = CacheLeafEbx(regs.ebx);
        let size = (line.associativity() as usize + 1)
            * (line.partitions() as usize + 1)
            * (line.line_size() as usize + 1)
            * (regs.ecx as usize + 1);

        for ty in CacheType::ALL {
            let (level, code) = ty.leaf_key();
            if info.level() != level || info.cache_type() != code {
                continue;
            }
            if level != 1 && level1_only {
                continue;
            }
            if sizes.fill(ty, size) {
                trace!("leaf 4.{subleaf}: {ty:?} = {size} bytes");
            }
        }

        subleaf += 1;
    }
}

/// Discover cache sizes through the identification registers.
///
/// Slots already nonzero in `sizes` are left alone. Returns `Ok` only when all
/// four slots end up filled; otherwise `Unsupported`, with whatever was found
/// still recorded in `sizes`.
pub fn enumerate_caches(src: &impl CpuidSource, sizes: &mut CacheSizes) -> Result<()> {
    // Querying the base leaf also resets the leaf 2 iteration sequence.
    if detect_vendor(src) != Vendor::Intel {
        return Err(FastCopyError::unsupported("cache enumeration on non-Intel vendor"));
    }
    if src.query(LEAF_BASE, 0).eax < LEAF_CACHE_INFO {
        return Err(FastCopyError::unsupported("cache info leaf"));
    }

    let mut level1_only = false;
    let mut max_iter = 1;
    let mut iter = 0;

    // The first response carries the number of leaf 2 queries to issue.
    while iter < max_iter {
        let regs = src.query(LEAF_CACHE_INFO, 0);
        let mut eax = regs.eax;
        if iter == 0 {
            max_iter = eax & 0xff;
            eax &= !0xff;
        }

        for reg in [eax, regs.ebx, regs.ecx, regs.edx] {
            if reg & REG_RESERVED != 0 {
                continue;
            }

            for tag in reg.to_le_bytes() {
                match tag {
                    0 => {}
                    TAG_L1_ONLY => level1_only = true,
                    TAG_USE_LEAF4 => {
                        enumerate_leaf4(src, sizes, level1_only);
                        return complete_or_unsupported(sizes);
                    }
                    code => {
                        if let Some((ty, size)) = DESCRIPTORS[code as usize] {
                            if sizes.fill(ty, size) {
                                trace!("descriptor {code:#04x}: {ty:?} = {size} bytes");
                            }
                        }
                    }
                }
            }
        }

        iter += 1;
    }

    complete_or_unsupported(sizes)
}

fn complete_or_unsupported(sizes: &CacheSizes) -> Result<()> {
    if sizes.is_complete() {
        Ok(())
    } else {
        Err(FastCopyError::unsupported(format!(
            "cache enumeration found {} of 4 caches",
            sizes.filled()
        )))
    }
}

// =============================================================================
// OS FALLBACK
// =============================================================================

const SYSFS_CACHE_DIR: &str = "/sys/devices/system/cpu/cpu0/cache";

/// Parse a sysfs cache size such as `48K` or `32M`.
pub fn parse_sysfs_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, mult) = match text.as_bytes().last()? {
        b'K' => (&text[..text.len() - 1], 1 << 10),
        b'M' => (&text[..text.len() - 1], 1 << 20),
        b'G' => (&text[..text.len() - 1], 1 << 30),
        _ => (text, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(mult)
}

fn sysfs_cache_type(level: &str, kind: &str) -> Option<CacheType> {
    match (level.trim(), kind.trim()) {
        ("1", "Data") => Some(CacheType::L1d),
        ("1", "Instruction") => Some(CacheType::L1i),
        ("2", "Unified") => Some(CacheType::L2),
        ("3", "Unified") => Some(CacheType::L3),
        _ => None,
    }
}

/// Fill unknown slots from the sysfs cache description under `dir`.
pub fn fill_from_sysfs(dir: &Path, sizes: &mut CacheSizes) {
    let Ok(entries) = fs::read_dir(dir) else {
        debug!("{} is not readable, cache sizes stay unknown", dir.display());
        return;
    };

    for entry in entries.flatten() {
        let index = entry.path();
        let read = |name: &str| fs::read_to_string(index.join(name)).ok();
        let (Some(level), Some(kind), Some(size)) = (read("level"), read("type"), read("size"))
        else {
            continue;
        };

        if let (Some(ty), Some(bytes)) = (sysfs_cache_type(&level, &kind), parse_sysfs_size(&size))
        {
            if sizes.fill(ty, bytes) {
                trace!("sysfs {}: {ty:?} = {bytes} bytes", index.display());
            }
        }
    }
}

// =============================================================================
// PROCESS-WIDE VIEW
// =============================================================================

struct CacheState {
    hardware: CacheSizes,
    hardware_complete: bool,
    merged: CacheSizes,
}

static CACHE_STATE: OnceBox<CacheState> = OnceBox::new();

fn cache_state() -> &'static CacheState {
    CACHE_STATE.get_or_init(|| {
        let mut hardware = CacheSizes::default();
        let hardware_complete = match enumerate_caches(&NativeCpuid, &mut hardware) {
            Ok(()) => true,
            Err(err) => {
                debug!("{err}, falling back to OS cache sizes");
                false
            }
        };

        let mut merged = hardware;
        if !merged.is_complete() {
            fill_from_sysfs(Path::new(SYSFS_CACHE_DIR), &mut merged);
        }
        debug!("cache sizes: {merged:?}");

        Box::new(CacheState {
            hardware,
            hardware_complete,
            merged,
        })
    })
}

/// Cache sizes reported by the processor itself.
///
/// Returns `Unsupported` unless the hardware described all four caches;
/// callers should then fall back to [`cache_size`], which also consults the OS.
pub fn get_cache_sizes() -> Result<CacheSizes> {
    let state = cache_state();
    if state.hardware_complete {
        Ok(state.hardware)
    } else {
        Err(FastCopyError::unsupported(format!(
            "hardware reported {} of 4 cache sizes",
            state.hardware.filled()
        )))
    }
}

/// Best known size of `ty` in bytes, hardware first and then OS; 0 if unknown.
pub fn cache_size(ty: CacheType) -> usize {
    cache_state().merged.get(ty)
}
