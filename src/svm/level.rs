//! Shared virtual memory capability levels

use crate::device::{ComputeBackend, DeviceLimit, DeviceParam, SvmCapabilities, parse_api_version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

/// How host and device share memory on one device, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SvmLevel {
    /// No sharing; served by the emulated path
    None,
    /// Buffer sharing with explicit map/unmap
    CoarseGrain,
    /// Buffer sharing, always coherent
    FineGrain,
    /// Any host allocation is shared
    FineGrainSystem,
    /// Device reports sharing it cannot back; served by the emulated path
    Emulated,
}

impl SvmLevel {
    /// Whether allocations go straight to the driver
    pub fn is_native(self) -> bool {
        matches!(
            self,
            SvmLevel::CoarseGrain | SvmLevel::FineGrain | SvmLevel::FineGrainSystem
        )
    }

    /// Whether host and device always see the same bytes
    pub fn is_coherent(self) -> bool {
        matches!(self, SvmLevel::FineGrain | SvmLevel::FineGrainSystem)
    }
}

impl fmt::Display for SvmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SvmLevel::None => "none",
            SvmLevel::CoarseGrain => "coarse-grain",
            SvmLevel::FineGrain => "fine-grain",
            SvmLevel::FineGrainSystem => "fine-grain-system",
            SvmLevel::Emulated => "emulated",
        };
        f.write_str(name)
    }
}

impl FromStr for SvmLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" => Ok(SvmLevel::None),
            "coarse" | "coarse-grain" => Ok(SvmLevel::CoarseGrain),
            "fine" | "fine-grain" => Ok(SvmLevel::FineGrain),
            "system" | "fine-grain-system" => Ok(SvmLevel::FineGrainSystem),
            "emulated" => Ok(SvmLevel::Emulated),
            other => Err(format!("unknown SVM level `{other}`")),
        }
    }
}

/// Caller-facing allocation flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SvmFlags(pub u32);

impl SvmFlags {
    pub const READ_WRITE: Self = Self(0x01);
    pub const READ_ONLY: Self = Self(0x02);
    pub const WRITE_ONLY: Self = Self(0x04);
    pub const ATOMIC: Self = Self(0x08);
    pub const FINE_GRAIN: Self = Self(0x10);
    pub const COARSE_GRAIN: Self = Self(0x20);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SvmFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Map a device version and capability query to a level.
///
/// `caps` is `None` when the query failed.
pub fn classify(version: Option<(u32, u32)>, caps: Option<SvmCapabilities>) -> SvmLevel {
    match version {
        Some(v) if v >= (2, 0) => {}
        _ => return SvmLevel::None,
    }
    let Some(caps) = caps else {
        return SvmLevel::Emulated;
    };
    if caps.contains(SvmCapabilities::FINE_GRAIN_SYSTEM) {
        SvmLevel::FineGrainSystem
    } else if caps.contains(SvmCapabilities::FINE_GRAIN_BUFFER) {
        SvmLevel::FineGrain
    } else if caps.contains(SvmCapabilities::COARSE_GRAIN_BUFFER) {
        SvmLevel::CoarseGrain
    } else {
        SvmLevel::Emulated
    }
}

/// Shared-memory facts read from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmProbe {
    pub level: SvmLevel,
    pub capabilities: SvmCapabilities,
    pub atomics: bool,
    /// Bytes; 0 when the device did not report one
    pub alignment: usize,
    /// Bytes; 0 when the device did not report one
    pub max_alloc: usize,
}

impl SvmProbe {
    pub fn run<B: ComputeBackend>(backend: &B) -> Self {
        let version = backend
            .device_string(DeviceParam::Version)
            .ok()
            .and_then(|v| parse_api_version(&v));
        let caps = match version {
            Some(v) if v >= (2, 0) => backend
                .device_limit(DeviceLimit::SvmCapabilities)
                .ok()
                .map(SvmCapabilities),
            _ => None,
        };
        let alignment_bits = backend.device_limit(DeviceLimit::MemBaseAddrAlign).unwrap_or(0);
        let max_alloc = backend.device_limit(DeviceLimit::MaxMemAllocSize).unwrap_or(0);

        let capabilities = caps.unwrap_or_default();
        Self {
            level: classify(version, caps),
            capabilities,
            atomics: capabilities.contains(SvmCapabilities::ATOMICS),
            alignment: usize::try_from(alignment_bits / 8).unwrap_or(0),
            max_alloc: usize::try_from(max_alloc).unwrap_or(usize::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_version() {
        let all = SvmCapabilities(0b111);
        assert_eq!(classify(None, Some(all)), SvmLevel::None);
        assert_eq!(classify(Some((1, 2)), Some(all)), SvmLevel::None);
        assert_eq!(classify(Some((2, 0)), Some(all)), SvmLevel::FineGrainSystem);
    }

    #[test]
    fn test_classify_richest_bit_wins() {
        let v = Some((2, 1));
        assert_eq!(
            classify(v, Some(SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::FINE_GRAIN_BUFFER)),
            SvmLevel::FineGrain
        );
        assert_eq!(classify(v, Some(SvmCapabilities::COARSE_GRAIN_BUFFER)), SvmLevel::CoarseGrain);
        assert_eq!(classify(v, Some(SvmCapabilities::ATOMICS)), SvmLevel::Emulated);
        assert_eq!(classify(v, Some(SvmCapabilities::NONE)), SvmLevel::Emulated);
        assert_eq!(classify(v, None), SvmLevel::Emulated);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("coarse".parse::<SvmLevel>(), Ok(SvmLevel::CoarseGrain));
        assert_eq!("FINE_GRAIN".parse::<SvmLevel>(), Ok(SvmLevel::FineGrain));
        assert_eq!("emulated".parse::<SvmLevel>(), Ok(SvmLevel::Emulated));
        assert!("shared".parse::<SvmLevel>().is_err());
    }

    #[test]
    fn test_native_levels() {
        assert!(SvmLevel::CoarseGrain.is_native());
        assert!(!SvmLevel::CoarseGrain.is_coherent());
        assert!(SvmLevel::FineGrainSystem.is_coherent());
        assert!(!SvmLevel::None.is_native());
        assert!(!SvmLevel::Emulated.is_native());
    }
}
