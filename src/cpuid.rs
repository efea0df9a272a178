//! Processor identification register access.
//!
//! Everything above this module decodes plain `u32` register values, so the
//! decoders can be driven by a recorded register table in tests. The only
//! code that executes `cpuid`/`xgetbv` is [`NativeCpuid`].
//!
//! Packed hardware fields are read through mask/shift accessors on newtypes
//! over the raw register; bit positions are part of the documented contract.
#![allow(unsafe_code)]

/// Base leaf: max supported leaf in EAX, vendor signature in EBX/EDX/ECX.
pub const LEAF_BASE: u32 = 0x0000_0000;
/// Version information and basic feature flags.
pub const LEAF_MODEL: u32 = 0x0000_0001;
/// Legacy cache descriptor codes.
pub const LEAF_CACHE_INFO: u32 = 0x0000_0002;
/// Deterministic cache parameters (indexed by sub-leaf).
pub const LEAF_CACHE_PARAMS: u32 = 0x0000_0004;
/// Structured extended feature flags.
pub const LEAF_EXTENDED_FEATURES: u32 = 0x0000_0007;
/// Max supported extended leaf in EAX.
pub const LEAF_EXTENDED_MAX: u32 = 0x8000_0000;
/// Advanced power management; EDX bit 8 is the invariant counter.
pub const LEAF_INVARIANT_TSC: u32 = 0x8000_0007;

/// Register values returned by one identification query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl Registers {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }
}

/// Source of identification register values.
pub trait CpuidSource {
    /// Query `leaf` with sub-leaf `subleaf` (ignored by leaves without one).
    fn query(&self, leaf: u32, subleaf: u32) -> Registers;

    /// Read extended control register `index`. Only called after the
    /// caller confirmed OS support for the read.
    fn xgetbv(&self, index: u32) -> u64;
}

/// Executes the real instructions on the current processor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCpuid;

impl CpuidSource for NativeCpuid {
    #[inline]
    fn query(&self, leaf: u32, subleaf: u32) -> Registers {
        use core::arch::x86_64::__cpuid_count;

        // SAFETY: CPUID is always available on x86_64.
        let r = unsafe { __cpuid_count(leaf, subleaf) };
        Registers::new(r.eax, r.ebx, r.ecx, r.edx)
    }

    #[inline]
    fn xgetbv(&self, index: u32) -> u64 {
        use core::arch::x86_64::_xgetbv;

        // SAFETY: Callers only reach this after observing OSXSAVE in leaf 1
        // ECX, which guarantees XGETBV is enabled.
        unsafe { _xgetbv(index) }
    }
}

// =============================================================================
// VERSION WORD (leaf 1, EAX)
// =============================================================================
//
// stepping:4 | model:4 | family:4 | type:2 | reserved:2 | ext_model:4 | ext_family:8

/// Packed processor version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionWord(pub u32);

impl VersionWord {
    #[inline]
    pub const fn stepping(self) -> u32 {
        self.0 & 0xF
    }

    #[inline]
    pub const fn model(self) -> u32 {
        (self.0 >> 4) & 0xF
    }

    #[inline]
    pub const fn family(self) -> u32 {
        (self.0 >> 8) & 0xF
    }

    #[inline]
    pub const fn processor_type(self) -> u32 {
        (self.0 >> 12) & 0x3
    }

    #[inline]
    pub const fn ext_model(self) -> u32 {
        (self.0 >> 16) & 0xF
    }

    #[inline]
    pub const fn ext_family(self) -> u32 {
        (self.0 >> 20) & 0xFF
    }

    /// Family after applying the extended family (base family 0xF only).
    pub const fn effective_family(self) -> u32 {
        let family = self.family();
        if family == 0xF {
            family + self.ext_family()
        } else {
            family
        }
    }

    /// Model after prepending the extended model for the families that use it.
    pub const fn effective_model(self) -> u32 {
        match self.effective_family() {
            0x6 | 0x7 | 0xF | 0x17 | 0x19 => (self.ext_model() << 4) | self.model(),
            _ => self.model(),
        }
    }
}

// =============================================================================
// DETERMINISTIC CACHE LEAF (leaf 4)
// =============================================================================

/// Leaf 4 EAX: `type:5 | level:3 | ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLeafEax(pub u32);

impl CacheLeafEax {
    /// 0 = no more caches, 1 = data, 2 = instruction, 3 = unified.
    #[inline]
    pub const fn cache_type(self) -> u32 {
        self.0 & 0x1F
    }

    #[inline]
    pub const fn level(self) -> u32 {
        (self.0 >> 5) & 0x7
    }
}

/// Leaf 4 EBX: `line_size:12 | partitions:10 | associativity:10`, each minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLeafEbx(pub u32);

impl CacheLeafEbx {
    #[inline]
    pub const fn line_size(self) -> u32 {
        self.0 & 0xFFF
    }

    #[inline]
    pub const fn partitions(self) -> u32 {
        (self.0 >> 12) & 0x3FF
    }

    #[inline]
    pub const fn associativity(self) -> u32 {
        (self.0 >> 22) & 0x3FF
    }
}
