//! Platform and device enumeration

use crate::diagnostics::{DriverResult, RuntimeError};
use crate::device::{SvmCapabilities, parse_api_version};
use crate::kernel::caps::{DeviceCapabilities, EXT_ATOMIC32, EXT_ATOMIC64, EXT_FP64, EXT_IMAGES};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Gpu,
    Cpu,
    Accelerator,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

/// What enumeration reports about one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    pub version: String,
    pub extensions: String,
    pub svm_capabilities: SvmCapabilities,
    pub global_mem_size: u64,
    pub compute_units: u64,
    pub max_work_group_size: u64,
}

impl DeviceRecord {
    /// `"fp64"`, `"atomic32"`, `"atomic64"`, `"images"`, `"svm"`, or a raw
    /// extension token
    pub fn supports(&self, capability: &str) -> bool {
        match capability {
            "fp64" => self.extensions.contains(EXT_FP64),
            "atomic32" => self.extensions.contains(EXT_ATOMIC32),
            "atomic64" => self.extensions.contains(EXT_ATOMIC64),
            "images" => self.extensions.contains(EXT_IMAGES),
            "svm" => {
                parse_api_version(&self.version).is_some_and(|v| v >= (2, 0))
                    && !self.svm_capabilities.is_empty()
            }
            token => self.extensions.split_whitespace().any(|e| e == token),
        }
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::from_strings(&self.version, &self.extensions);
        caps.device_name = self.name.clone();
        caps.svm = self.supports("svm");
        if caps.svm {
            caps.svm_capabilities = self.svm_capabilities;
        }
        caps.compute_units = self.compute_units;
        caps.max_work_group_size = self.max_work_group_size;
        caps
    }
}

/// A driver that can list platforms and devices.
///
/// Every listing is two-phase: ask for the count, then fill a slice of that
/// length. `fill_*` returns the number of entries the driver has, which may
/// exceed the slice.
pub trait DeviceSource {
    fn platform_count(&self) -> DriverResult<usize>;

    fn fill_platforms(&self, out: &mut [PlatformInfo]) -> DriverResult<usize>;

    fn device_count(&self, platform: usize) -> DriverResult<usize>;

    fn fill_devices(&self, platform: usize, out: &mut [DeviceRecord]) -> DriverResult<usize>;
}

/// Count, allocate exactly that, fill; re-query once if the list grew
fn two_phase<T: Default + Clone>(
    count: impl Fn() -> DriverResult<usize>,
    fill: impl Fn(&mut [T]) -> DriverResult<usize>,
) -> DriverResult<Vec<T>> {
    let expected = count()?;
    let mut out = vec![T::default(); expected];
    let reported = fill(&mut out)?;
    if reported <= expected {
        out.truncate(reported);
        return Ok(out);
    }

    tracing::debug!("Enumeration grew from {} to {} entries, re-querying", expected, reported);
    let mut out = vec![T::default(); reported];
    let again = fill(&mut out)?;
    out.truncate(again.min(reported));
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformEntry {
    #[serde(flatten)]
    pub info: PlatformInfo,
    pub devices: Vec<DeviceRecord>,
}

/// Every platform and device a source reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInventory {
    pub platforms: Vec<PlatformEntry>,
}

impl DeviceInventory {
    pub fn collect<S: DeviceSource + ?Sized>(source: &S) -> Result<Self, RuntimeError> {
        let infos = two_phase(|| source.platform_count(), |out| source.fill_platforms(out))?;
        let mut platforms = Vec::with_capacity(infos.len());
        for (index, info) in infos.into_iter().enumerate() {
            let devices = two_phase(
                || source.device_count(index),
                |out| source.fill_devices(index, out),
            )?;
            tracing::debug!("Platform {} has {} device(s)", info.name, devices.len());
            platforms.push(PlatformEntry { info, devices });
        }
        Ok(Self { platforms })
    }

    pub fn platform_count(&self) -> usize {
        self.platforms.len()
    }

    pub fn device_count(&self) -> usize {
        self.platforms.iter().map(|p| p.devices.len()).sum()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.platforms.iter().flat_map(|p| p.devices.iter())
    }

    /// First device whose name contains `name`, ignoring case
    pub fn find_device(&self, name: &str) -> Option<&DeviceRecord> {
        let needle = name.to_lowercase();
        self.devices()
            .find(|d| d.name.to_lowercase().contains(&needle))
    }

    pub fn to_json(&self) -> Result<String, RuntimeError> {
        serde_json::to_string_pretty(self).map_err(|e| RuntimeError::Serialization {
            what: "device inventory",
            reason: e.to_string(),
        })
    }

    pub fn export_json(&self, path: &Path) -> Result<(), RuntimeError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| RuntimeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Exported {} device(s) to {}", self.device_count(), path.display());
        Ok(())
    }
}
