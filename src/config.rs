//! Runtime configuration
//!
//! ```toml
//! [kernel]
//! template_capacity = 32
//! extra_build_options = "-Werror"
//!
//! [svm]
//! descriptor_capacity = 64
//! default_alignment = 64
//! force_level = "emulated"
//! ```

use crate::diagnostics::RuntimeError;
use crate::svm::SvmLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable overriding `svm.force_level`
pub const SVM_LEVEL_ENV: &str = "TIERCL_SVM_LEVEL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kernel: KernelConfig,
    pub svm: SvmConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Initial template registry capacity
    pub template_capacity: usize,
    /// Appended to every tier's build options
    pub extra_build_options: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            template_capacity: 32,
            extra_build_options: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmConfig {
    /// Initial descriptor table capacity
    pub descriptor_capacity: usize,
    /// Alignment in bytes when the device reports none
    pub default_alignment: usize,
    /// Use this level instead of the probed one
    pub force_level: Option<SvmLevel>,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            descriptor_capacity: 64,
            default_alignment: 64,
            force_level: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, RuntimeError> {
        let config: Self = toml::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `TIERCL_SVM_LEVEL` if it is set
    pub fn apply_env(&mut self) -> Result<(), RuntimeError> {
        match std::env::var(SVM_LEVEL_ENV) {
            Ok(value) => self.apply_level_override(&value),
            Err(_) => Ok(()),
        }
    }

    fn apply_level_override(&mut self, value: &str) -> Result<(), RuntimeError> {
        let level = value
            .parse::<SvmLevel>()
            .map_err(|e| RuntimeError::Config(format!("{SVM_LEVEL_ENV}: {e}")))?;
        tracing::debug!("SVM level override from environment: {}", level);
        self.svm.force_level = Some(level);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.kernel.template_capacity == 0 {
            return Err(RuntimeError::Config("kernel.template_capacity must be positive".into()));
        }
        if self.svm.descriptor_capacity == 0 {
            return Err(RuntimeError::Config("svm.descriptor_capacity must be positive".into()));
        }
        if !self.svm.default_alignment.is_power_of_two() {
            return Err(RuntimeError::Config(format!(
                "svm.default_alignment must be a power of two, got {}",
                self.svm.default_alignment
            )));
        }
        Ok(())
    }
}
