//! Device capability probing

use crate::device::{ComputeBackend, DeviceLimit, DeviceParam, SvmCapabilities, parse_api_version};
use serde::Serialize;

pub const EXT_FP64: &str = "cl_khr_fp64";
pub const EXT_ATOMIC32: &str = "cl_khr_global_int32_base_atomics";
pub const EXT_ATOMIC64: &str = "cl_khr_int64_base_atomics";
pub const EXT_IMAGES: &str = "cl_khr_image2d_from_buffer";

/// What one device can do, computed once when a manager is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCapabilities {
    pub device_name: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub fp64: bool,
    pub atomic32: bool,
    pub atomic64: bool,
    pub images: bool,
    pub svm: bool,
    pub svm_capabilities: SvmCapabilities,
    /// 0 when the device did not report a limit
    pub max_work_group_size: u64,
    pub compute_units: u64,
}

impl DeviceCapabilities {
    /// Query `backend` once per attribute. Failed queries degrade to the
    /// least capable answer.
    pub fn probe<B: ComputeBackend>(backend: &B) -> Self {
        let device_name = backend.device_string(DeviceParam::Name).unwrap_or_default();
        let version = backend.device_string(DeviceParam::Version).unwrap_or_default();
        let extensions = backend.device_string(DeviceParam::Extensions).unwrap_or_default();

        let mut caps = Self::from_strings(&version, &extensions);
        caps.device_name = device_name;

        if caps.version_major >= 2 {
            let bits = backend.device_limit(DeviceLimit::SvmCapabilities).unwrap_or(0);
            caps.svm_capabilities = SvmCapabilities(bits);
            caps.svm = bits != 0;
        }
        caps.max_work_group_size = backend.device_limit(DeviceLimit::MaxWorkGroupSize).unwrap_or(0);
        caps.compute_units = backend.device_limit(DeviceLimit::MaxComputeUnits).unwrap_or(1);

        tracing::info!(
            "Device capabilities: {} (OpenCL {}.{}, fp64={}, atomic32={}, atomic64={}, svm={})",
            caps.device_name,
            caps.version_major,
            caps.version_minor,
            caps.fp64,
            caps.atomic32,
            caps.atomic64,
            caps.svm
        );
        caps
    }

    /// Capabilities implied by a version string and an extension list alone
    pub fn from_strings(version: &str, extensions: &str) -> Self {
        let (version_major, version_minor) = parse_api_version(version).unwrap_or((0, 0));
        Self {
            device_name: String::new(),
            version_major,
            version_minor,
            fp64: extensions.contains(EXT_FP64),
            atomic32: extensions.contains(EXT_ATOMIC32),
            atomic64: extensions.contains(EXT_ATOMIC64),
            images: extensions.contains(EXT_IMAGES),
            svm: false,
            svm_capabilities: SvmCapabilities::NONE,
            max_work_group_size: 0,
            compute_units: 1,
        }
    }

    pub fn version(&self) -> (u32, u32) {
        (self.version_major, self.version_minor)
    }

    pub fn version_at_least(&self, major: u32, minor: u32) -> bool {
        self.version() >= (major, minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProfile, SimulatedBackend};

    #[test]
    fn test_from_strings() {
        let caps = DeviceCapabilities::from_strings(
            "OpenCL 1.2 pocl",
            "cl_khr_fp64 cl_khr_global_int32_base_atomics",
        );
        assert_eq!(caps.version(), (1, 2));
        assert!(caps.fp64);
        assert!(caps.atomic32);
        assert!(!caps.atomic64);
        assert!(!caps.images);
    }

    #[test]
    fn test_unparsable_version_is_zero() {
        let caps = DeviceCapabilities::from_strings("1.1", "");
        assert_eq!(caps.version(), (0, 0));
        assert!(!caps.version_at_least(1, 0));
    }

    #[test]
    fn test_version_comparison_is_lexicographic() {
        let caps = DeviceCapabilities::from_strings("OpenCL 2.0", "");
        assert!(caps.version_at_least(1, 2));
        let caps = DeviceCapabilities::from_strings("OpenCL 1.1", "");
        assert!(!caps.version_at_least(1, 2));
    }

    #[test]
    fn test_probe_svm_only_on_2x() {
        let profile = DeviceProfile::opencl12().with_svm(SvmCapabilities::COARSE_GRAIN_BUFFER);
        let caps = DeviceCapabilities::probe(&SimulatedBackend::new(profile));
        assert!(!caps.svm);

        let caps = DeviceCapabilities::probe(&SimulatedBackend::new(DeviceProfile::opencl20()));
        assert!(caps.svm);
        assert_eq!(caps.compute_units, 8);
        assert_eq!(caps.max_work_group_size, 256);
    }

    #[test]
    fn test_probe_failed_svm_query() {
        let profile = DeviceProfile {
            fail_svm_query: true,
            ..DeviceProfile::opencl20()
        };
        let caps = DeviceCapabilities::probe(&SimulatedBackend::new(profile));
        assert!(!caps.svm);
        assert!(caps.svm_capabilities.is_empty());
    }
}
