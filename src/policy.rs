//! Adaptive transfer thresholds.
//!
//! Thresholds are derived once from the processor identity and L3 size, with
//! any explicit [`TransferConfig`] value taking precedence. `usize::MAX`
//! means "never".

use log::{debug, error};
use once_cell::race::OnceBox;

use crate::cache::{CacheType, cache_size};
use crate::config::TransferConfig;
use crate::cpu::{CpuModel, Vendor, get_model, get_vendor};
use crate::error::{FastCopyError, Result};
use crate::types::MemUnits;

/// Resolved byte thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferThresholds {
    /// Copies of at least this many bytes may use the string-move path.
    pub builtin_memcpy_min: usize,
    /// Copies above this many bytes leave the string-move path.
    pub builtin_memcpy_max: usize,
    /// Logical transfers of at least this size use the streaming engine.
    pub nt_buffer_transfer_min: usize,
    /// Logical transfers above this size bypass the cache on the destination.
    pub nt_dest_threshold: usize,
}

impl TransferThresholds {
    /// Every optimization switched off.
    pub const DISABLED: Self = Self {
        builtin_memcpy_min: usize::MAX,
        builtin_memcpy_max: usize::MAX,
        nt_buffer_transfer_min: usize::MAX,
        nt_dest_threshold: usize::MAX,
    };
}

impl Default for TransferThresholds {
    fn default() -> Self {
        Self::DISABLED
    }
}

/// Auto string-move window `(min, max)` for a vendor.
pub const fn builtin_memcpy_window(vendor: Vendor) -> (usize, usize) {
    match vendor {
        Vendor::Intel | Vendor::Zhaoxin => (1024, 8 * 1024 * 1024),
        Vendor::Amd => (1024, 136 * 1024),
        Vendor::Unknown => (usize::MAX, usize::MAX),
    }
}

fn builtin_memcpy_enabled(vendor: Vendor, model: CpuModel) -> bool {
    match vendor {
        Vendor::Intel => model.is_haswell_or_newer(),
        Vendor::Amd | Vendor::Zhaoxin => true,
        Vendor::Unknown => false,
    }
}

fn pick(value: MemUnits, auto: impl FnOnce() -> usize) -> usize {
    value.resolved().unwrap_or_else(auto)
}

/// Derive thresholds for a given processor.
///
/// `l3` is the L3 size in bytes, 0 when unknown. An unknown L3 disables the
/// cache-relative AMD thresholds instead of making them zero.
pub fn resolve(config: &TransferConfig, vendor: Vendor, model: CpuModel, l3: usize) -> TransferThresholds {
    let enabled = builtin_memcpy_enabled(vendor, model);
    let (auto_min, auto_max) = if enabled {
        builtin_memcpy_window(vendor)
    } else {
        (usize::MAX, usize::MAX)
    };
    let amd_l3 = (vendor == Vendor::Amd && l3 != 0).then_some(l3);

    TransferThresholds {
        builtin_memcpy_min: pick(config.builtin_memcpy_min, || auto_min),
        builtin_memcpy_max: pick(config.builtin_memcpy_max, || auto_max),
        nt_buffer_transfer_min: pick(config.nt_buffer_transfer_min, || {
            amd_l3.map_or(usize::MAX, |l3| l3 * 3 / 4)
        }),
        nt_dest_threshold: pick(config.nt_dest_threshold, || {
            amd_l3.map_or(usize::MAX, |l3| l3 * 9 / 8)
        }),
    }
}

/// Derive thresholds for the running processor.
pub fn init_transfer_policy(config: &TransferConfig) -> TransferThresholds {
    let vendor = get_vendor();
    let model = get_model();
    let l3 = cache_size(CacheType::L3);
    let thresholds = resolve(config, vendor, model, l3);
    debug!("transfer policy for {vendor:?}/{model:?} (L3 {l3}): {thresholds:?}");
    thresholds
}

static THRESHOLDS: OnceBox<TransferThresholds> = OnceBox::new();

/// Publish thresholds derived from `config` as the process-wide policy.
///
/// Fails with `AlreadyInitialized` once a policy has been published, either
/// by an earlier call or by [`thresholds`].
pub fn install(config: &TransferConfig) -> Result<&'static TransferThresholds> {
    let resolved = init_transfer_policy(config);
    THRESHOLDS
        .set(Box::new(resolved))
        .map_err(|_| FastCopyError::AlreadyInitialized)?;
    Ok(thresholds())
}

/// The process-wide policy, derived from the environment on first use.
pub fn thresholds() -> &'static TransferThresholds {
    THRESHOLDS.get_or_init(|| {
        let config = TransferConfig::from_env().unwrap_or_else(|err| {
            error!("{err}, using automatic transfer thresholds");
            TransferConfig::default()
        });
        Box::new(init_transfer_policy(&config))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_amd_auto() {
        let t = resolve(&TransferConfig::default(), Vendor::Amd, CpuModel::AmdRome, 32 * MIB);
        assert_eq!(t.builtin_memcpy_min, 1024);
        assert_eq!(t.builtin_memcpy_max, 136 * 1024);
        assert_eq!(t.nt_buffer_transfer_min, 24 * MIB);
        assert_eq!(t.nt_dest_threshold, 36 * MIB);
    }

    #[test]
    fn test_amd_unknown_l3_disables_streaming() {
        let t = resolve(&TransferConfig::default(), Vendor::Amd, CpuModel::Unknown, 0);
        assert_eq!(t.builtin_memcpy_min, 1024);
        assert_eq!(t.nt_buffer_transfer_min, usize::MAX);
        assert_eq!(t.nt_dest_threshold, usize::MAX);
    }

    #[test]
    fn test_intel_generation_gate() {
        let config = TransferConfig::default();
        let t = resolve(&config, Vendor::Intel, CpuModel::IntelSkylake, 32 * MIB);
        assert_eq!((t.builtin_memcpy_min, t.builtin_memcpy_max), (1024, 8 * MIB));
        assert_eq!(t.nt_buffer_transfer_min, usize::MAX);
        assert_eq!(t.nt_dest_threshold, usize::MAX);

        let t = resolve(&config, Vendor::Intel, CpuModel::IntelIvyBridge, 32 * MIB);
        assert_eq!(t, TransferThresholds::DISABLED);

        let t = resolve(&config, Vendor::Intel, CpuModel::Unknown, 32 * MIB);
        assert_eq!(t, TransferThresholds::DISABLED);
    }

    #[test]
    fn test_zhaoxin_and_unknown() {
        let config = TransferConfig::default();
        let t = resolve(&config, Vendor::Zhaoxin, CpuModel::Unknown, 0);
        assert_eq!((t.builtin_memcpy_min, t.builtin_memcpy_max), (1024, 8 * MIB));
        assert_eq!(t.nt_dest_threshold, usize::MAX);

        let t = resolve(&config, Vendor::Unknown, CpuModel::Unknown, 32 * MIB);
        assert_eq!(t, TransferThresholds::DISABLED);
    }

    #[test]
    fn test_override_always_wins() {
        let config = TransferConfig::default()
            .with_builtin_memcpy(MemUnits::Bytes(7), MemUnits::Inf)
            .with_nt_buffer_transfer_min(MemUnits::Bytes(0))
            .with_nt_dest_threshold(MemUnits::Bytes(12345));

        for vendor in [Vendor::Unknown, Vendor::Intel, Vendor::Amd, Vendor::Zhaoxin] {
            for model in CpuModel::ALL {
                for l3 in [0, 8 * MIB, 256 * MIB] {
                    let t = resolve(&config, vendor, model, l3);
                    assert_eq!(t.builtin_memcpy_min, 7);
                    assert_eq!(t.builtin_memcpy_max, usize::MAX);
                    assert_eq!(t.nt_buffer_transfer_min, 0);
                    assert_eq!(t.nt_dest_threshold, 12345);
                }
            }
        }
    }

    #[test]
    fn test_global_policy_is_stable() {
        let first = *thresholds();
        assert_eq!(*thresholds(), first);
        assert!(matches!(
            install(&TransferConfig::default()),
            Err(FastCopyError::AlreadyInitialized)
        ));
    }
}
