//! Error type shared by the detection, policy and selector layers.

use thiserror::Error;

use crate::memtype::MemoryType;

/// Main error type for fastcopy
#[derive(Error, Debug)]
pub enum FastCopyError {
    /// The running processor or OS does not support the requested query
    #[error("Not supported: {feature}")]
    Unsupported {
        /// What was asked for
        feature: String,
    },

    /// No usable accelerator device
    #[error("No device: {reason}")]
    NoDevice {
        /// Why the device could not be used
        reason: String,
    },

    /// No copy function exists for this memory type
    #[error("memcpy is not defined for memory type {memory_type}")]
    UnsupportedMemoryType {
        /// The resolved memory type
        memory_type: MemoryType,
    },

    /// Process-wide state was already published
    #[error("already initialized")]
    AlreadyInitialized,

    /// A configuration value could not be parsed
    #[error("Invalid configuration for {var}: '{value}' ({reason})")]
    InvalidConfig {
        /// Variable or field name
        var: String,
        /// The rejected text
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

impl FastCopyError {
    /// Create an unsupported-feature error
    pub fn unsupported<S: Into<String>>(feature: S) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    /// Create a no-device error
    pub fn no_device<S: Into<String>>(reason: S) -> Self {
        Self::NoDevice {
            reason: reason.into(),
        }
    }

    /// Create an invalid-config error
    pub fn invalid_config<V: Into<String>, T: Into<String>, R: Into<String>>(
        var: V,
        value: T,
        reason: R,
    ) -> Self {
        Self::InvalidConfig {
            var: var.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Short category name for log context
    pub fn category(&self) -> &'static str {
        match self {
            Self::Unsupported { .. } => "unsupported",
            Self::NoDevice { .. } => "device",
            Self::UnsupportedMemoryType { .. } => "memtype",
            Self::AlreadyInitialized => "init",
            Self::InvalidConfig { .. } => "config",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FastCopyError>;
