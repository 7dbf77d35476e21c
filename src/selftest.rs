//! Atomic-add compatibility check
//!
//! Runs one kernel that bumps a shared counter once per work item through
//! `RIX_ATOMIC_INC`, using the full allocate / publish / launch / read-back
//! protocol, and compares the result with the work-item count.

use crate::config::RuntimeConfig;
use crate::device::{ComputeBackend, KernelArg, SimulatedBackend};
use crate::diagnostics::RuntimeError;
use crate::kernel::{KernelManager, KernelStats, LaunchConfig, StrategyTier};
use crate::svm::{SvmContext, SvmFlags, SvmLevel, SvmStats};
use serde::Serialize;
use std::rc::Rc;

pub const TEMPLATE_NAME: &str = "selftest_counter";
pub const ENTRY_POINT: &str = "rix_counter";
pub const SOURCE: &str = "\
__kernel void rix_counter(RIX_GLOBAL_PTR(int) counter, const int limit) {
    if ((int)get_global_id(0) < limit) {
        RIX_ATOMIC_INC(counter);
    }
}
";

#[derive(Debug, Clone, Serialize)]
pub struct SelftestReport {
    pub device: String,
    pub tier: StrategyTier,
    pub svm_level: SvmLevel,
    pub work_items: usize,
    pub expected: i32,
    pub observed: i32,
    pub passed: bool,
    pub kernel: KernelStats,
    pub svm: SvmStats,
}

/// Run the check on one device
pub fn run<B: ComputeBackend>(
    backend: Rc<B>,
    queue: Rc<B::Queue>,
    config: &RuntimeConfig,
    work_items: usize,
) -> Result<SelftestReport, RuntimeError> {
    let expected = i32::try_from(work_items)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| RuntimeError::invalid(format!("work item count {work_items} out of range")))?;

    let mut kernels = KernelManager::new(Rc::clone(&backend), Rc::clone(&queue), config.kernel.clone());
    let mut svm = SvmContext::new(backend, &config.svm)?;
    kernels.register(TEMPLATE_NAME, ENTRY_POINT, SOURCE)?;

    let counter = svm.alloc(std::mem::size_of::<i32>(), SvmFlags::READ_WRITE | SvmFlags::ATOMIC)?;
    // SAFETY: a fresh, mapped allocation of at least four aligned bytes.
    unsafe { counter.cast::<i32>().write(0) };
    svm.unmap(counter, &queue)?;

    let tier = kernels.resolve_tier(TEMPLATE_NAME)?;
    {
        let args = [svm.kernel_arg(counter)?, KernelArg::scalar(&expected)];
        kernels.execute(TEMPLATE_NAME, LaunchConfig::global(work_items), &args)?;
    }

    svm.sync_to_host(counter, &queue)?;
    // SAFETY: the allocation is live and host-visible after the sync.
    let observed = unsafe { counter.cast::<i32>().read() };
    svm.free(counter)?;

    let device = kernels.capabilities().device_name.clone();
    let svm_level = svm.level();
    let kernel_stats = kernels.shutdown();
    let svm_stats = svm.destroy();

    let passed = observed == expected;
    if passed {
        tracing::info!("Selftest passed on {} ({} tier, {})", device, tier, svm_level);
    } else {
        tracing::warn!(
            "Selftest failed on {}: expected {}, observed {}",
            device,
            expected,
            observed
        );
    }

    Ok(SelftestReport {
        device,
        tier,
        svm_level,
        work_items,
        expected,
        observed,
        passed,
        kernel: kernel_stats,
        svm: svm_stats,
    })
}

/// Give the simulated device a body for the selftest kernel
pub fn register_simulated_kernel(backend: &SimulatedBackend) {
    backend.register_host_kernel(ENTRY_POINT, |launch| {
        let limit: i32 = launch.scalar(1).ok_or("limit argument missing")?;
        let items = launch.global_size().min(usize::try_from(limit).unwrap_or(0));
        let current = launch.read_u32(0, 0).ok_or("counter not addressable")?;
        let updated = current.wrapping_add(items as u32);
        if launch.write_u32(0, 0, updated) {
            Ok(())
        } else {
            Err("counter not writable".to_string())
        }
    });
}
