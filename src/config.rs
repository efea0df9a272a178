//! User overrides for the transfer policy.
//!
//! Overrides come either from code, by building a [`TransferConfig`], or from
//! the environment:
//!
//! | Variable                           | Field                  |
//! |------------------------------------|------------------------|
//! | `FASTCOPY_BUILTIN_MEMCPY_MIN`      | `builtin_memcpy_min`   |
//! | `FASTCOPY_BUILTIN_MEMCPY_MAX`      | `builtin_memcpy_max`   |
//! | `FASTCOPY_NT_BUFFER_TRANSFER_MIN`  | `nt_buffer_transfer_min` |
//! | `FASTCOPY_NT_DEST_THRESHOLD`       | `nt_dest_threshold`    |
//!
//! Values are memory units (`auto`, `inf`, `4096`, `64k`, `8m`). An unset
//! variable means `auto`.

use std::env;

use crate::error::{FastCopyError, Result};
use crate::types::MemUnits;

/// Default environment variable prefix.
pub const ENV_PREFIX: &str = "FASTCOPY_";

/// Threshold overrides. Every field defaults to [`MemUnits::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferConfig {
    /// Smallest copy handed to the string-move path.
    pub builtin_memcpy_min: MemUnits,
    /// Largest copy handed to the string-move path.
    pub builtin_memcpy_max: MemUnits,
    /// Smallest logical transfer that goes through the streaming engine.
    pub nt_buffer_transfer_min: MemUnits,
    /// Logical transfer size above which destination stores bypass the cache.
    pub nt_dest_threshold: MemUnits,
}

impl TransferConfig {
    /// Read overrides using the default `FASTCOPY_` prefix.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Read overrides from `{prefix}BUILTIN_MEMCPY_MIN` and friends.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        Ok(Self {
            builtin_memcpy_min: parse_env_units(&format!("{prefix}BUILTIN_MEMCPY_MIN"))?,
            builtin_memcpy_max: parse_env_units(&format!("{prefix}BUILTIN_MEMCPY_MAX"))?,
            nt_buffer_transfer_min: parse_env_units(&format!("{prefix}NT_BUFFER_TRANSFER_MIN"))?,
            nt_dest_threshold: parse_env_units(&format!("{prefix}NT_DEST_THRESHOLD"))?,
        })
    }

    /// Builder-style setter for the string-move window.
    pub fn with_builtin_memcpy(mut self, min: MemUnits, max: MemUnits) -> Self {
        self.builtin_memcpy_min = min;
        self.builtin_memcpy_max = max;
        self
    }

    pub fn with_nt_buffer_transfer_min(mut self, value: MemUnits) -> Self {
        self.nt_buffer_transfer_min = value;
        self
    }

    pub fn with_nt_dest_threshold(mut self, value: MemUnits) -> Self {
        self.nt_dest_threshold = value;
        self
    }
}

fn parse_env_units(var_name: &str) -> Result<MemUnits> {
    match env::var(var_name) {
        Ok(text) => text.parse::<MemUnits>().map_err(|err| match err {
            FastCopyError::InvalidConfig { value, reason, .. } => {
                FastCopyError::invalid_config(var_name, value, reason)
            }
            other => other,
        }),
        Err(_) => Ok(MemUnits::Auto),
    }
}
