//! fastcopy: x86_64 processor introspection and an adaptive memory-transfer engine.
//!
//! Detection results (vendor, microarchitecture, feature flags, cache sizes,
//! counter calibration) and the derived [`TransferThresholds`] are computed
//! lazily once per process and never change afterwards.

pub mod cache;
pub mod config;
pub mod cpu;
pub mod cpuid;
pub mod error;
pub mod mem;
pub mod memcpy;
pub mod memtype;
pub mod nt;
pub mod policy;
pub mod relaxed;
pub mod stream_load;
pub mod tsc;
pub mod types;

pub use cache::{CacheSizes, CacheType, cache_size, get_cache_sizes};
pub use config::TransferConfig;
pub use cpu::{CpuFlags, CpuModel, Vendor, get_flags, get_model, get_vendor};
pub use error::{FastCopyError, Result};
pub use memcpy::{CopyHint, copy, transfer};
pub use memtype::{CopySelector, DeviceRuntime, MemCopier, MemoryType};
pub use policy::{TransferThresholds, init_transfer_policy, thresholds};
pub use tsc::{clocks_per_sec, read_clock};
pub use types::MemUnits;
