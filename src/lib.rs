//! tiercl: capability-tiered kernel dispatch for heterogeneous devices
//!
//! Runs compute kernels on devices whose drivers differ in API generation,
//! atomic support, and shared-memory model, without the caller knowing
//! which level a device supports:
//! - Kernel templates are compiled per strategy tier, richest first, and the
//!   first variant that builds is cached and dispatched
//! - Shared virtual memory is served natively where possible and emulated
//!   with mirrored host memory elsewhere
//!
//! # Architecture
//!
//! ```text
//! KernelManager ─ resolve ─▶ strategy ─▶ source synthesis ─▶ ComputeBackend
//! SvmContext    ─ alloc   ─▶ SVM level ─▶ native | emulated ─▶ ComputeBackend
//! ```
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use tiercl::config::RuntimeConfig;
//! use tiercl::device::{DeviceProfile, SimulatedBackend};
//! use tiercl::kernel::{KernelManager, LaunchConfig};
//! use tiercl::svm::{SvmContext, SvmFlags};
//!
//! # fn main() -> Result<(), tiercl::RuntimeError> {
//! let config = RuntimeConfig::default();
//! let backend = Rc::new(SimulatedBackend::new(DeviceProfile::opencl12()));
//! let queue = Rc::new(backend.create_queue());
//!
//! let mut kernels = KernelManager::new(backend.clone(), queue.clone(), config.kernel.clone());
//! let mut svm = SvmContext::new(backend, &config.svm)?;
//!
//! kernels.register("inc", "inc", "__kernel void inc(__global int* p) { RIX_ATOMIC_INC(p); }")?;
//! let counter = svm.alloc(4, SvmFlags::READ_WRITE)?;
//! svm.unmap(counter, &queue)?;
//! kernels.execute("inc", LaunchConfig::global(64), &[svm.kernel_arg(counter)?])?;
//! svm.sync_to_host(counter, &queue)?;
//! svm.free(counter)?;
//! # Ok(())
//! # }
//! ```
//!
//! Managers and contexts are single-threaded. Calls against one instance
//! must never overlap; confine it to one thread or guard it with one lock.

pub mod comm;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod inventory;
pub mod kernel;
pub mod module_info;
pub mod selftest;
pub mod svm;

pub use config::RuntimeConfig;
pub use device::{ComputeBackend, KernelArg};
pub use diagnostics::{BuildFailure, BuildReporter, DriverError, RuntimeError};
pub use kernel::{KernelManager, LaunchConfig, StrategyTier};
pub use svm::{SvmContext, SvmFlags, SvmLevel};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
