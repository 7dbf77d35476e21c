//! Kernel dispatch tests against the simulated driver

use proptest::prelude::*;
use std::rc::Rc;
use tiercl::config::{KernelConfig, RuntimeConfig};
use tiercl::device::{DeviceProfile, KernelArg, SimulatedBackend};
use tiercl::kernel::{KernelManager, LaunchConfig, StrategyTier, VariantState};
use tiercl::svm::{SvmContext, SvmFlags};
use tiercl::RuntimeError;

const VEC_ADD: &str = "\
__kernel void vec_add(RIX_GLOBAL_PTR(int) a, RIX_GLOBAL_PTR(int) b, const int n) {
    int i = get_global_id(0);
    if (i < n) {
        a[i] += b[i];
    }
}
";

const COUNTER: &str = "\
__kernel void counter(RIX_GLOBAL_PTR(int) c) {
    RIX_ATOMIC_INC(c);
}
";

fn setup(profile: DeviceProfile) -> (Rc<SimulatedBackend>, Rc<tiercl::device::simulated::SimQueue>, KernelManager<SimulatedBackend>) {
    let backend = Rc::new(SimulatedBackend::new(profile));
    let queue = Rc::new(backend.create_queue());
    let km = KernelManager::new(backend.clone(), queue.clone(), KernelConfig::default());
    (backend, queue, km)
}

fn register_vec_add_body(backend: &SimulatedBackend) {
    backend.register_host_kernel("vec_add", |launch| {
        let n: i32 = launch.scalar(2).ok_or("n missing")?;
        let items = launch.global_size().min(n.max(0) as usize);
        for i in 0..items {
            let a = launch.read_u32(0, i).ok_or("a out of range")?;
            let b = launch.read_u32(1, i).ok_or("b out of range")?;
            if !launch.write_u32(0, i, a.wrapping_add(b)) {
                return Err("a not writable".to_string());
            }
        }
        Ok(())
    });
}

// ==================== Tier Selection ====================

#[test]
fn test_preferred_tier_per_device_generation() {
    let cases = [
        (DeviceProfile::opencl20(), StrategyTier::Native),
        (DeviceProfile::opencl12(), StrategyTier::Extension),
        (DeviceProfile::opencl11(), StrategyTier::Basic),
        (DeviceProfile::unversioned(), StrategyTier::Fallback),
    ];
    for (profile, expected) in cases {
        let name = profile.name.clone();
        let (_, _, km) = setup(profile);
        assert_eq!(km.preferred_tier(), expected, "device {name}");
    }
}

#[test]
fn test_unparsable_version_runs_on_fallback_tier() {
    let (backend, _, mut km) = setup(DeviceProfile::unversioned());
    km.register("count", "counter", COUNTER).expect("should register");

    let elapsed = km.execute("count", LaunchConfig::global(16), &[KernelArg::Local(4)]);
    assert!(elapsed.is_ok());
    assert_eq!(
        km.template("count").and_then(|t| t.active_tier()),
        Some(StrategyTier::Fallback)
    );
    assert_eq!(backend.counters().failed_builds, 0);
}

#[test]
fn test_native_failure_falls_back_to_extension() {
    let profile = DeviceProfile::opencl20().with_rejected_token("atomic_fetch_add_explicit");
    let (backend, _, mut km) = setup(profile);
    km.register("count", "counter", COUNTER).expect("should register");

    let tier = km.resolve_tier("count").expect("extension tier builds");
    assert_eq!(tier, StrategyTier::Extension);

    let template = km.template("count").expect("registered");
    assert_eq!(template.variant_state(StrategyTier::Native), VariantState::Failed);
    assert_eq!(template.variant_state(StrategyTier::Extension), VariantState::Compiled);
    assert_eq!(template.variant_state(StrategyTier::Basic), VariantState::Uncompiled);
    assert_eq!(template.failed_tiers(), vec![StrategyTier::Native]);

    let failures: Vec<_> = km.build_failures().for_template("count").collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].tier, StrategyTier::Native);
    assert!(failures[0].log.contains("atomic_fetch_add_explicit"));
    assert_eq!(backend.counters().live_programs(), 1);
}

#[test]
fn test_compiled_source_carries_tier_define() {
    let (backend, _, mut km) = setup(DeviceProfile::opencl12());
    km.register("count", "counter", COUNTER).expect("should register");
    let kernel = km.resolve("count").expect("should compile");
    let source = backend.kernel_source(kernel).expect("simulated kernel keeps its source");
    assert!(source.contains("#define RIX_TIER_EXTENSION 1"));
    assert!(source.contains("#define RIX_ATOMIC_32 1"));
    assert!(!source.contains("#define RIX_SVM_SUPPORT"));
    assert!(source.ends_with(COUNTER));
}

#[test]
fn test_universal_flag_follows_source() {
    let (_, _, mut km) = setup(DeviceProfile::opencl20());
    km.register("count", "counter", COUNTER).expect("should register");
    km.register("plain", "plain", "__kernel void plain(__global int* p) { p[0] += 1; }")
        .expect("should register");
    km.register("prefixed", "k", "__kernel void k(__global int* p) { MY_RIX_INC(p); }")
        .expect("should register");

    assert!(km.template("count").expect("registered").is_universal());
    assert!(!km.template("plain").expect("registered").is_universal());
    assert!(!km.template("prefixed").expect("registered").is_universal());
}

// ==================== Execution ====================

#[test]
fn test_vec_add_through_emulated_memory() {
    let (backend, queue, mut km) = setup(DeviceProfile::opencl12());
    register_vec_add_body(&backend);
    let mut svm = SvmContext::new(backend.clone(), &RuntimeConfig::default().svm)
        .expect("context should open");
    km.register("add", "vec_add", VEC_ADD).expect("should register");

    let n = 32usize;
    let bytes = n * std::mem::size_of::<i32>();
    let a = svm.alloc(bytes, SvmFlags::READ_WRITE).expect("should alloc a");
    let b = svm.alloc(bytes, SvmFlags::READ_ONLY).expect("should alloc b");
    // SAFETY: both blocks are live, host-visible, and hold `n` aligned ints.
    unsafe {
        for i in 0..n {
            a.cast::<i32>().add(i).write(i as i32);
            b.cast::<i32>().add(i).write(100);
        }
    }
    svm.unmap(a, &queue).expect("should publish a");
    svm.unmap(b, &queue).expect("should publish b");

    let count = n as i32;
    {
        let args = [
            svm.kernel_arg(a).expect("a is live"),
            svm.kernel_arg(b).expect("b is live"),
            KernelArg::scalar(&count),
        ];
        km.execute("add", LaunchConfig::new(n, 8), &args).expect("should run");
    }
    svm.sync_to_host(a, &queue).expect("should read back");

    // SAFETY: `a` is live and synchronized.
    let result: Vec<i32> = (0..n).map(|i| unsafe { a.cast::<i32>().add(i).read() }).collect();
    let expected: Vec<i32> = (0..n as i32).map(|i| i + 100).collect();
    assert_eq!(result, expected);

    svm.free(a).expect("should free a");
    svm.free(b).expect("should free b");
    assert_eq!(km.stats().executions, 1);
}

#[test]
fn test_launch_failure_is_counted() {
    let (backend, _, mut km) = setup(DeviceProfile::opencl20());
    backend.register_host_kernel("counter", |_| Err("device lost".to_string()));
    km.register("count", "counter", COUNTER).expect("should register");

    let err = km
        .execute("count", LaunchConfig::global(4), &[KernelArg::Local(4)])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Launch { .. }));
    assert_eq!(km.stats().failed_executions, 1);
    assert_eq!(km.stats().executions, 0);
}

#[test]
fn test_templates_keep_registration_order() {
    let (_, _, mut km) = setup(DeviceProfile::opencl20());
    for name in ["zeta", "alpha", "mid"] {
        km.register(name, "counter", COUNTER).expect("should register");
    }
    let names: Vec<&str> = km.templates().map(|t| t.name()).collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
}

// ==================== Properties ====================

proptest! {
    #[test]
    fn prop_resolution_is_stable(calls in 1usize..40) {
        let (backend, _, mut km) = setup(DeviceProfile::opencl20());
        km.register("count", "counter", COUNTER).expect("should register");

        let first = km.resolve("count").expect("should compile").id();
        for _ in 1..calls {
            let id = km.resolve("count").expect("should hit").id();
            prop_assert_eq!(id, first);
        }
        prop_assert_eq!(km.stats().compiles, 1);
        prop_assert_eq!(km.stats().cache_hits, calls as u64 - 1);
        prop_assert_eq!(backend.counters().builds, 1);
    }

    #[test]
    fn prop_rejected_token_never_resolves_to_failed_tier(tier_index in 0usize..3) {
        let tokens = ["atomic_fetch_add_explicit", "atomic_inc", "CLK_GLOBAL_MEM_FENCE"];
        let profile = DeviceProfile::opencl20().with_rejected_token(tokens[tier_index]);
        let (_, _, mut km) = setup(profile);
        km.register("count", "counter", COUNTER).expect("should register");

        match km.resolve_tier("count") {
            Ok(tier) => {
                let template = km.template("count").expect("registered");
                prop_assert_eq!(template.variant_state(tier), VariantState::Compiled);
                prop_assert!(!template.failed_tiers().contains(&tier));
            }
            Err(err) => {
                let exhausted = matches!(err, RuntimeError::StrategiesExhausted { .. });
                prop_assert!(exhausted, "unexpected error: {}", err);
            }
        }
    }
}
