//! Compilation strategy tiers

use super::caps::DeviceCapabilities;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kernel compilation approach, richest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyTier {
    /// OpenCL 2.0 with native C11-style atomics
    Native,
    /// OpenCL 1.2 with the 32-bit atomic extensions
    Extension,
    /// OpenCL 1.1 core
    Basic,
    /// Work-group synchronization only; builds on every conforming device
    Fallback,
}

impl StrategyTier {
    pub const ALL: [StrategyTier; 4] = [
        StrategyTier::Native,
        StrategyTier::Extension,
        StrategyTier::Basic,
        StrategyTier::Fallback,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn short_name(self) -> &'static str {
        match self {
            StrategyTier::Native => "cl20",
            StrategyTier::Extension => "cl12ext",
            StrategyTier::Basic => "cl11",
            StrategyTier::Fallback => "cl10",
        }
    }

    /// Preprocessor symbol identifying the tier inside generated source
    pub fn define(self) -> &'static str {
        match self {
            StrategyTier::Native => "RIX_TIER_NATIVE",
            StrategyTier::Extension => "RIX_TIER_EXTENSION",
            StrategyTier::Basic => "RIX_TIER_BASIC",
            StrategyTier::Fallback => "RIX_TIER_FALLBACK",
        }
    }

    /// Compiler flags for the tier; richer tiers get more aggressive math
    pub fn base_options(self) -> &'static str {
        match self {
            StrategyTier::Native => "-cl-std=CL2.0 -cl-fast-relaxed-math",
            StrategyTier::Extension => "-cl-std=CL1.2 -cl-fast-relaxed-math",
            StrategyTier::Basic => "-cl-std=CL1.1 -cl-unsafe-math-optimizations",
            StrategyTier::Fallback => "-cl-std=CL1.0",
        }
    }

    /// Full option string for one build
    pub fn build_options(self, extra: &str) -> String {
        let mut options = format!("{} -DRIX_VARIANT_{}=1", self.base_options(), self.index());
        let extra = extra.trim();
        if !extra.is_empty() {
            options.push(' ');
            options.push_str(extra);
        }
        options
    }
}

impl fmt::Display for StrategyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyTier::Native => "native",
            StrategyTier::Extension => "extension",
            StrategyTier::Basic => "basic",
            StrategyTier::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// Preferred tier for a device
pub fn select_tier(caps: &DeviceCapabilities) -> StrategyTier {
    if caps.version_at_least(2, 0) && caps.atomic32 {
        StrategyTier::Native
    } else if caps.version_at_least(1, 2) && caps.atomic32 {
        StrategyTier::Extension
    } else if caps.version_at_least(1, 1) {
        StrategyTier::Basic
    } else {
        StrategyTier::Fallback
    }
}

/// Order in which tiers are attempted on a cache miss.
///
/// The preferred tier comes first, then the fixed sequence extension, basic,
/// fallback. A tier can appear twice and may be tried after a poorer one;
/// callers skip tiers already attempted.
pub fn fallback_order(preferred: StrategyTier) -> [StrategyTier; 4] {
    [
        preferred,
        StrategyTier::Extension,
        StrategyTier::Basic,
        StrategyTier::Fallback,
    ]
}
