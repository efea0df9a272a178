//! Processor identification: vendor, microarchitecture and feature flags.
//!
//! Each answer is computed from the identification registers on first use and
//! cached in an atomic for the life of the process. The computation is a pure
//! function of hardware state, so two threads racing through the first call
//! store the same value and no lock is needed.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::cpuid::{
    CpuidSource, LEAF_BASE, LEAF_EXTENDED_FEATURES, LEAF_MODEL, NativeCpuid, Registers,
    VersionWord,
};

// =============================================================================
// VENDOR
// =============================================================================

/// Processor vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Vendor {
    Unknown = 0,
    Intel = 1,
    Amd = 2,
    Zhaoxin = 3,
}

impl Vendor {
    const fn from_repr(v: u8) -> Self {
        match v {
            1 => Vendor::Intel,
            2 => Vendor::Amd,
            3 => Vendor::Zhaoxin,
            _ => Vendor::Unknown,
        }
    }
}

// The base leaf returns the 12-byte signature in EBX, EDX, ECX order; laid out
// as EBX, ECX, EDX (register order) the strings read shuffled.
const SIG_GENUINE_INTEL: &[u8; 12] = b"GenuntelineI";
const SIG_AUTHENTIC_AMD: &[u8; 12] = b"AuthcAMDenti";
const SIG_CENTAUR_HAULS: &[u8; 12] = b"CentaulsaurH";
const SIG_SHANGHAI: &[u8; 12] = b"  Shai  angh";

/// Decode the vendor from base-leaf registers.
pub fn vendor_from_registers(regs: Registers) -> Vendor {
    let mut id = [0u8; 12];
    id[0..4].copy_from_slice(&regs.ebx.to_le_bytes());
    id[4..8].copy_from_slice(&regs.ecx.to_le_bytes());
    id[8..12].copy_from_slice(&regs.edx.to_le_bytes());

    if &id == SIG_GENUINE_INTEL {
        Vendor::Intel
    } else if &id == SIG_AUTHENTIC_AMD {
        Vendor::Amd
    } else if &id == SIG_CENTAUR_HAULS || &id == SIG_SHANGHAI {
        Vendor::Zhaoxin
    } else {
        Vendor::Unknown
    }
}

/// Detect the vendor using `src`. Not cached.
pub fn detect_vendor(src: &impl CpuidSource) -> Vendor {
    vendor_from_registers(src.query(LEAF_BASE, 0))
}

const VENDOR_UNSET: u8 = u8::MAX;
static VENDOR: AtomicU8 = AtomicU8::new(VENDOR_UNSET);

/// Vendor of the running processor (cached).
pub fn get_vendor() -> Vendor {
    let cached = VENDOR.load(Ordering::Relaxed);
    if cached != VENDOR_UNSET {
        return Vendor::from_repr(cached);
    }

    let vendor = detect_vendor(&NativeCpuid);
    VENDOR.store(vendor as u8, Ordering::Relaxed);
    vendor
}

// =============================================================================
// MICROARCHITECTURE
// =============================================================================

/// Named microarchitecture.
///
/// Many (family, model) pairs are deliberately absent from the table and
/// classify as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CpuModel {
    Unknown = 0,
    IntelIvyBridge,
    IntelSandyBridge,
    IntelNehalem,
    IntelWestmere,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    IntelIceLake,
    AmdNaples,
    AmdRome,
    AmdMilan,
    AmdGenoa,
    AmdTurin,
    ZhaoxinZhangJiang,
    ZhaoxinWuDaoKou,
    ZhaoxinLuJiaZui,
}

impl CpuModel {
    pub const ALL: [CpuModel; 17] = [
        CpuModel::Unknown,
        CpuModel::IntelIvyBridge,
        CpuModel::IntelSandyBridge,
        CpuModel::IntelNehalem,
        CpuModel::IntelWestmere,
        CpuModel::IntelHaswell,
        CpuModel::IntelBroadwell,
        CpuModel::IntelSkylake,
        CpuModel::IntelIceLake,
        CpuModel::AmdNaples,
        CpuModel::AmdRome,
        CpuModel::AmdMilan,
        CpuModel::AmdGenoa,
        CpuModel::AmdTurin,
        CpuModel::ZhaoxinZhangJiang,
        CpuModel::ZhaoxinWuDaoKou,
        CpuModel::ZhaoxinLuJiaZui,
    ];

    fn from_repr(v: u8) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(CpuModel::Unknown)
    }

    /// True for Intel parts from Haswell onwards.
    pub const fn is_haswell_or_newer(self) -> bool {
        matches!(
            self,
            CpuModel::IntelHaswell
                | CpuModel::IntelBroadwell
                | CpuModel::IntelSkylake
                | CpuModel::IntelIceLake
        )
    }
}

/// Which half of the table applies. Zhaoxin reuses Intel family numbers, so
/// it gets its own rows; every other vendor shares the family-keyed rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableVendor {
    Zhaoxin,
    Other,
}

struct ModelEntry {
    vendor: TableVendor,
    family: u32,
    models: core::ops::RangeInclusive<u32>,
    model: CpuModel,
}

const fn entry(
    vendor: TableVendor,
    family: u32,
    lo: u32,
    hi: u32,
    model: CpuModel,
) -> ModelEntry {
    ModelEntry {
        vendor,
        family,
        models: lo..=hi,
        model,
    }
}

use TableVendor::{Other, Zhaoxin};

static MODEL_TABLE: &[ModelEntry] = &[
    // Intel
    entry(Other, 0x06, 0x3a, 0x3a, CpuModel::IntelIvyBridge),
    entry(Other, 0x06, 0x3e, 0x3e, CpuModel::IntelIvyBridge),
    entry(Other, 0x06, 0x2a, 0x2a, CpuModel::IntelSandyBridge),
    entry(Other, 0x06, 0x2d, 0x2d, CpuModel::IntelSandyBridge),
    entry(Other, 0x06, 0x1a, 0x1a, CpuModel::IntelNehalem),
    entry(Other, 0x06, 0x1e, 0x1f, CpuModel::IntelNehalem),
    entry(Other, 0x06, 0x2e, 0x2e, CpuModel::IntelNehalem),
    entry(Other, 0x06, 0x25, 0x25, CpuModel::IntelWestmere),
    entry(Other, 0x06, 0x2c, 0x2c, CpuModel::IntelWestmere),
    entry(Other, 0x06, 0x2f, 0x2f, CpuModel::IntelWestmere),
    entry(Other, 0x06, 0x3c, 0x3c, CpuModel::IntelHaswell),
    entry(Other, 0x06, 0x3f, 0x3f, CpuModel::IntelHaswell),
    entry(Other, 0x06, 0x45, 0x46, CpuModel::IntelHaswell),
    entry(Other, 0x06, 0x3d, 0x3d, CpuModel::IntelBroadwell),
    entry(Other, 0x06, 0x47, 0x47, CpuModel::IntelBroadwell),
    entry(Other, 0x06, 0x4f, 0x4f, CpuModel::IntelBroadwell),
    entry(Other, 0x06, 0x56, 0x56, CpuModel::IntelBroadwell),
    entry(Other, 0x06, 0x4e, 0x4e, CpuModel::IntelSkylake),
    entry(Other, 0x06, 0x55, 0x55, CpuModel::IntelSkylake),
    entry(Other, 0x06, 0x5e, 0x5e, CpuModel::IntelSkylake),
    entry(Other, 0x06, 0x6a, 0x6a, CpuModel::IntelIceLake),
    entry(Other, 0x06, 0x6c, 0x6c, CpuModel::IntelIceLake),
    entry(Other, 0x06, 0x7e, 0x7e, CpuModel::IntelIceLake),
    // AMD Zen / Zen 2
    entry(Other, 0x17, 0x29, 0x29, CpuModel::AmdNaples),
    entry(Other, 0x17, 0x31, 0x31, CpuModel::AmdRome),
    // AMD Zen 3 / Zen 4
    entry(Other, 0x19, 0x00, 0x01, CpuModel::AmdMilan),
    entry(Other, 0x19, 0x11, 0x11, CpuModel::AmdGenoa),
    entry(Other, 0x19, 0x90, 0x90, CpuModel::AmdGenoa),
    // AMD Zen 5
    entry(Other, 0x1a, 0x00, 0x2f, CpuModel::AmdTurin),
    entry(Other, 0x1a, 0x40, 0x4f, CpuModel::AmdTurin),
    entry(Other, 0x1a, 0x60, 0x7f, CpuModel::AmdTurin),
    // Zhaoxin
    entry(Zhaoxin, 0x06, 0x0f, 0x0f, CpuModel::ZhaoxinZhangJiang),
    entry(Zhaoxin, 0x07, 0x1b, 0x1b, CpuModel::ZhaoxinWuDaoKou),
    entry(Zhaoxin, 0x07, 0x3b, 0x3b, CpuModel::ZhaoxinLuJiaZui),
];

/// Look up a decoded (vendor, family, model) triple.
pub fn classify_model(vendor: Vendor, family: u32, model: u32) -> CpuModel {
    let table_vendor = if vendor == Vendor::Zhaoxin {
        Zhaoxin
    } else {
        Other
    };

    MODEL_TABLE
        .iter()
        .find(|e| e.vendor == table_vendor && e.family == family && e.models.contains(&model))
        .map_or(CpuModel::Unknown, |e| e.model)
}

/// Detect the microarchitecture using `src`. Not cached.
pub fn detect_model(src: &impl CpuidSource) -> CpuModel {
    let version = VersionWord(src.query(LEAF_MODEL, 0).eax);
    classify_model(
        detect_vendor(src),
        version.effective_family(),
        version.effective_model(),
    )
}

const MODEL_UNSET: u8 = u8::MAX;
static MODEL: AtomicU8 = AtomicU8::new(MODEL_UNSET);

/// Microarchitecture of the running processor (cached).
pub fn get_model() -> CpuModel {
    let cached = MODEL.load(Ordering::Relaxed);
    if cached != MODEL_UNSET {
        return CpuModel::from_repr(cached);
    }

    let model = detect_model(&NativeCpuid);
    MODEL.store(model as u8, Ordering::Relaxed);
    model
}

// =============================================================================
// FEATURE FLAGS
// =============================================================================

bitflags! {
    /// Instruction-set extensions the copy engine cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuFlags: u32 {
        const CMOV  = 1 << 0;
        const MMX   = 1 << 1;
        const MMX2  = 1 << 2;
        const SSE   = 1 << 3;
        const SSE2  = 1 << 4;
        const SSE3  = 1 << 5;
        const SSSE3 = 1 << 6;
        const SSE41 = 1 << 7;
        const SSE42 = 1 << 8;
        /// Requires OS support for the upper vector state (XCR0).
        const AVX   = 1 << 9;
        const AVX2  = 1 << 10;
    }
}

// Leaf 1 ECX: OSXSAVE (27) and AVX (28) both set.
const ECX_OSXSAVE_AVX: u32 = 0x1800_0000;
// XCR0 bits 1-2: XMM and YMM state enabled by the OS.
const XCR0_SSE_AVX: u64 = 0x6;

/// Decode feature flags using `src`. Not cached.
pub fn detect_flags(src: &impl CpuidSource) -> CpuFlags {
    let mut flags = CpuFlags::empty();
    let max_leaf = src.query(LEAF_BASE, 0).eax;

    if max_leaf >= LEAF_MODEL {
        let r = src.query(LEAF_MODEL, 0);
        let edx_bits = [
            (15, CpuFlags::CMOV),
            (23, CpuFlags::MMX),
            (25, CpuFlags::MMX2),
            (25, CpuFlags::SSE),
            (26, CpuFlags::SSE2),
        ];
        for (bit, flag) in edx_bits {
            if r.edx & (1 << bit) != 0 {
                flags |= flag;
            }
        }

        let ecx_bits = [
            (0, CpuFlags::SSE3),
            (9, CpuFlags::SSSE3),
            (19, CpuFlags::SSE41),
            (20, CpuFlags::SSE42),
        ];
        for (bit, flag) in ecx_bits {
            if r.ecx & (1 << bit) != 0 {
                flags |= flag;
            }
        }

        if r.ecx & ECX_OSXSAVE_AVX == ECX_OSXSAVE_AVX
            && src.xgetbv(0) & XCR0_SSE_AVX == XCR0_SSE_AVX
        {
            flags |= CpuFlags::AVX;
        }
    }

    if max_leaf >= LEAF_EXTENDED_FEATURES {
        let r = src.query(LEAF_EXTENDED_FEATURES, 0);
        if flags.contains(CpuFlags::AVX) && r.ebx & (1 << 5) != 0 {
            flags |= CpuFlags::AVX2;
        }
    }

    flags
}

const FLAGS_UNSET: u32 = u32::MAX;
static FLAGS: AtomicU32 = AtomicU32::new(FLAGS_UNSET);

/// Feature flags of the running processor (cached).
pub fn get_flags() -> CpuFlags {
    let cached = FLAGS.load(Ordering::Relaxed);
    if cached != FLAGS_UNSET {
        return CpuFlags::from_bits_truncate(cached);
    }

    let flags = detect_flags(&NativeCpuid);
    FLAGS.store(flags.bits(), Ordering::Relaxed);
    flags
}
