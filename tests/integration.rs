//! Integration tests for the full dispatch pipeline

use std::rc::Rc;
use tiercl::config::RuntimeConfig;
use tiercl::device::{DeviceProfile, SimulatedBackend, SimulatedSystem, SvmCapabilities};
use tiercl::kernel::StrategyTier;
use tiercl::selftest;
use tiercl::svm::SvmLevel;

fn selftest_on(profile: DeviceProfile, config: &RuntimeConfig, items: usize) -> (Rc<SimulatedBackend>, selftest::SelftestReport) {
    let backend = Rc::new(SimulatedBackend::new(profile));
    selftest::register_simulated_kernel(&backend);
    let queue = Rc::new(backend.create_queue());
    let report = selftest::run(backend.clone(), queue, config, items).expect("selftest should run");
    (backend, report)
}

// ==================== Selftest ====================

#[test]
fn test_selftest_on_every_default_device() {
    let system = SimulatedSystem::default();
    let expected = [
        (StrategyTier::Native, SvmLevel::CoarseGrain),
        (StrategyTier::Extension, SvmLevel::None),
        (StrategyTier::Fallback, SvmLevel::None),
    ];
    for (profile, (tier, level)) in system.profiles().zip(expected) {
        let (backend, report) = selftest_on(profile.clone(), &RuntimeConfig::default(), 1024);
        assert!(report.passed, "{} failed: {:?}", profile.name, report);
        assert_eq!(report.tier, tier, "{}", profile.name);
        assert_eq!(report.svm_level, level, "{}", profile.name);
        assert_eq!(report.observed, 1024);

        let counters = backend.counters();
        assert_eq!(counters.live_programs(), 0);
        assert_eq!(counters.live_kernels(), 0);
        assert_eq!(counters.live_svm(), 0);
        assert_eq!(counters.live_mirrors(), 0);
    }
}

#[test]
fn test_selftest_survives_native_build_failure() {
    let profile = DeviceProfile::opencl20().with_rejected_token("atomic_fetch_add_explicit");
    let (_, report) = selftest_on(profile, &RuntimeConfig::default(), 300);
    assert!(report.passed);
    assert_eq!(report.tier, StrategyTier::Extension);
    assert_eq!(report.kernel.failed_compiles, 1);
    assert_eq!(report.kernel.compiles, 1);
}

#[test]
fn test_selftest_with_fine_grain_system_memory() {
    let profile = DeviceProfile::opencl20()
        .with_svm(SvmCapabilities::FINE_GRAIN_SYSTEM | SvmCapabilities::ATOMICS);
    let (backend, report) = selftest_on(profile, &RuntimeConfig::default(), 64);
    assert!(report.passed);
    assert_eq!(report.svm_level, SvmLevel::FineGrainSystem);
    assert_eq!(backend.counters().svm_maps, 0);
    assert_eq!(backend.counters().mirrors_created, 0);
}

#[test]
fn test_selftest_report_serializes() {
    let (_, report) = selftest_on(DeviceProfile::opencl12(), &RuntimeConfig::default(), 8);
    let json = serde_json::to_value(&report).expect("report should serialize");
    assert_eq!(json["tier"], "extension");
    assert_eq!(json["svm_level"], "none");
    assert_eq!(json["passed"], true);
    assert_eq!(json["kernel"]["executions"], 1);
    assert_eq!(json["svm"]["alloc_count"], 1);
}

// ==================== Configuration ====================

#[test]
fn test_config_forces_emulated_memory() {
    let config = RuntimeConfig::from_toml_str(
        r#"
        [svm]
        force_level = "emulated"
        "#,
    )
    .expect("should parse");
    let (backend, report) = selftest_on(DeviceProfile::opencl20(), &config, 128);
    assert!(report.passed);
    assert_eq!(report.tier, StrategyTier::Native);
    assert_eq!(report.svm_level, SvmLevel::Emulated);
    assert_eq!(backend.counters().svm_allocs, 0);
    assert_eq!(backend.counters().mirrors_created, 1);
}

#[test]
fn test_config_extra_build_options() {
    let config = RuntimeConfig::from_toml_str(
        r#"
        [kernel]
        template_capacity = 4
        extra_build_options = "-cl-mad-enable"
        "#,
    )
    .expect("should parse");
    assert_eq!(config.kernel.template_capacity, 4);
    let (_, report) = selftest_on(DeviceProfile::opencl11(), &config, 16);
    assert!(report.passed);
    assert_eq!(report.tier, StrategyTier::Basic);
}

#[test]
fn test_config_file_round_trip() {
    let path = std::env::temp_dir().join(format!("tiercl-config-{}.toml", std::process::id()));
    std::fs::write(&path, "[svm]\ndescriptor_capacity = 8\ndefault_alignment = 256\n")
        .expect("should write config");
    let config = RuntimeConfig::load(&path);
    let _ = std::fs::remove_file(&path);

    let config = config.expect("should load");
    assert_eq!(config.svm.descriptor_capacity, 8);
    assert_eq!(config.svm.default_alignment, 256);
    assert_eq!(config.kernel.template_capacity, 32);
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(RuntimeConfig::from_toml_str("[svm]\ndefault_alignment = 48\n").is_err());
    assert!(RuntimeConfig::from_toml_str("[svm]\nforce_level = \"shared\"\n").is_err());
    assert!(RuntimeConfig::load(std::path::Path::new("/nonexistent/tiercl.toml")).is_err());
}
