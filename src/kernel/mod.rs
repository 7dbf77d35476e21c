//! Adaptive kernel dispatch
//!
//! A [`KernelManager`] owns the templates registered against one device.
//! Resolving a template tries strategy tiers in order until one builds,
//! caches that variant, and serves every later launch from it.
//!
//! The manager is single-threaded: it holds its backend through `Rc` and is
//! neither `Send` nor `Sync`. Share it across threads only behind a lock
//! that serializes every call.

pub mod caps;
pub mod source;
pub mod strategy;
pub mod template;

pub use caps::DeviceCapabilities;
pub use strategy::{StrategyTier, fallback_order, select_tier};
pub use template::{KernelTemplate, KernelVariant, VariantState};

use crate::config::KernelConfig;
use crate::device::{ComputeBackend, KernelArg};
use crate::diagnostics::{BuildFailure, BuildReporter, RuntimeError};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// One-dimensional launch geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub global_size: usize,
    /// Work-group size; `None` lets the driver choose
    pub local_size: Option<usize>,
}

impl LaunchConfig {
    /// A local size of 0 means "driver chooses"
    pub fn new(global_size: usize, local_size: usize) -> Self {
        Self {
            global_size,
            local_size: (local_size > 0).then_some(local_size),
        }
    }

    pub fn global(global_size: usize) -> Self {
        Self {
            global_size,
            local_size: None,
        }
    }

    /// Check the geometry against a device
    pub fn validate(&self, caps: &DeviceCapabilities) -> Result<(), RuntimeError> {
        if self.global_size == 0 {
            return Err(RuntimeError::InvalidLaunch("global size is zero".to_string()));
        }
        if let Some(local) = self.local_size {
            if caps.max_work_group_size > 0 && local as u64 > caps.max_work_group_size {
                return Err(RuntimeError::InvalidLaunch(format!(
                    "local size ({}) exceeds maximum work-group size ({})",
                    local, caps.max_work_group_size
                )));
            }
        }
        Ok(())
    }
}

/// Aggregate kernel statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KernelStats {
    pub compiles: u64,
    pub failed_compiles: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub compile_seconds: f64,
    pub executions: u64,
    pub failed_executions: u64,
    pub execution_seconds: f64,
}

impl KernelStats {
    /// Percentage of resolutions served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64 * 100.0
        }
    }

    pub fn average_compile_seconds(&self) -> f64 {
        if self.compiles == 0 {
            0.0
        } else {
            self.compile_seconds / self.compiles as f64
        }
    }

    pub fn average_execution_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.execution_seconds / self.executions as f64 * 1000.0
        }
    }
}

/// Template registry and dispatcher for one device
pub struct KernelManager<B: ComputeBackend> {
    backend: Rc<B>,
    queue: Rc<B::Queue>,
    caps: DeviceCapabilities,
    config: KernelConfig,
    templates: IndexMap<String, KernelTemplate<B>>,
    template_capacity: usize,
    stats: KernelStats,
    reporter: BuildReporter,
}

impl<B: ComputeBackend> KernelManager<B> {
    /// Probe the device and create an empty registry
    pub fn new(backend: Rc<B>, queue: Rc<B::Queue>, config: KernelConfig) -> Self {
        let caps = DeviceCapabilities::probe(backend.as_ref());
        let template_capacity = config.template_capacity.max(1);
        tracing::info!(
            "Kernel manager ready on {} (preferred tier: {})",
            caps.device_name,
            select_tier(&caps)
        );
        Self {
            backend,
            queue,
            caps,
            config,
            templates: IndexMap::with_capacity(template_capacity),
            template_capacity,
            stats: KernelStats::default(),
            reporter: BuildReporter::new(),
        }
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    pub fn preferred_tier(&self) -> StrategyTier {
        select_tier(&self.caps)
    }

    pub fn backend(&self) -> &Rc<B> {
        &self.backend
    }

    pub fn queue(&self) -> &Rc<B::Queue> {
        &self.queue
    }

    /// Register kernel source under `name`. Names are never reused.
    pub fn register(&mut self, name: &str, entry_point: &str, source: &str) -> Result<(), RuntimeError> {
        if name.is_empty() {
            return Err(RuntimeError::invalid("template name is empty"));
        }
        if entry_point.is_empty() {
            return Err(RuntimeError::invalid("entry point is empty"));
        }
        if source.is_empty() {
            return Err(RuntimeError::invalid("kernel source is empty"));
        }
        if self.templates.contains_key(name) {
            return Err(RuntimeError::DuplicateTemplate {
                name: name.to_string(),
            });
        }

        if self.templates.len() == self.template_capacity {
            let requested = self.template_capacity * 2;
            self.templates
                .try_reserve(requested - self.templates.len())
                .map_err(|_| RuntimeError::CapacityExhausted {
                    table: "template",
                    requested,
                })?;
            self.template_capacity = requested;
        }

        let template = KernelTemplate::new(name, entry_point, source);
        if !template.is_universal() {
            tracing::debug!("Template `{}` uses no RIX_ macros; richer tiers may not add anything", name);
        }
        self.templates.insert(name.to_string(), template);
        tracing::debug!("Registered template `{}` (entry `{}`)", name, entry_point);
        Ok(())
    }

    pub fn template(&self, name: &str) -> Option<&KernelTemplate<B>> {
        self.templates.get(name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &KernelTemplate<B>> {
        self.templates.values()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn template_capacity(&self) -> usize {
        self.template_capacity
    }

    /// Compiled kernel for `name`, building it on first use
    pub fn resolve(&mut self, name: &str) -> Result<&B::Kernel, RuntimeError> {
        let tier = self.resolve_tier(name)?;
        self.templates
            .get(name)
            .and_then(|t| t.variant(tier))
            .and_then(KernelVariant::kernel)
            .ok_or_else(|| RuntimeError::TemplateNotFound {
                name: name.to_string(),
            })
    }

    /// Resolve `name` and report which tier serves it
    pub fn resolve_tier(&mut self, name: &str) -> Result<StrategyTier, RuntimeError> {
        if name.is_empty() {
            return Err(RuntimeError::invalid("template name is empty"));
        }
        let template = self
            .templates
            .get_mut(name)
            .ok_or_else(|| RuntimeError::TemplateNotFound {
                name: name.to_string(),
            })?;

        if let Some(variant) = template.active_variant_mut() {
            variant.touch();
            self.stats.cache_hits += 1;
            return Ok(variant.tier());
        }
        self.stats.cache_misses += 1;

        let preferred = select_tier(&self.caps);
        for tier in fallback_order(preferred) {
            if template.variant_state(tier) != VariantState::Uncompiled {
                continue;
            }
            let source = source::synthesize(&self.caps, tier, template.source());
            let options = tier.build_options(&self.config.extra_build_options);
            let entry_point = template.entry_point().to_string();
            let variant = template
                .slot_mut(tier)
                .insert(KernelVariant::new(&entry_point, tier, source, options));

            match variant.compile(self.backend.as_ref(), name) {
                Ok(()) => {
                    variant.touch();
                    self.stats.compiles += 1;
                    self.stats.compile_seconds += variant.compile_time().as_secs_f64();
                    tracing::info!(
                        "Compiled `{}` for the {} tier in {:.3} ms",
                        name,
                        tier,
                        variant.compile_time().as_secs_f64() * 1000.0
                    );
                    template.set_active(tier);
                    return Ok(tier);
                }
                Err(failure) => {
                    self.stats.failed_compiles += 1;
                    Self::record_failure(&mut self.reporter, failure);
                    tracing::info!("Tier {} failed for `{}`, trying next", tier, name);
                }
            }
        }

        tracing::error!("All compilation strategies failed for `{}`", name);
        Err(RuntimeError::StrategiesExhausted {
            name: name.to_string(),
            failed: template.failed_tiers(),
        })
    }

    fn record_failure(reporter: &mut BuildReporter, failure: BuildFailure) {
        tracing::warn!(
            "Build of `{}` failed for the {} tier:\n{}",
            failure.template,
            failure.tier,
            failure.log
        );
        reporter.record(failure);
    }

    /// Bind `args` in order, launch, and wait for completion
    pub fn execute(&mut self, name: &str, launch: LaunchConfig, args: &[KernelArg<'_>]) -> Result<Duration, RuntimeError> {
        if name.is_empty() {
            return Err(RuntimeError::invalid("template name is empty"));
        }
        launch.validate(&self.caps)?;

        let tier = self.resolve_tier(name)?;
        let template = self
            .templates
            .get_mut(name)
            .ok_or_else(|| RuntimeError::TemplateNotFound {
                name: name.to_string(),
            })?;
        let kernel = template
            .slot_mut(tier)
            .as_mut()
            .and_then(KernelVariant::kernel_mut)
            .ok_or_else(|| RuntimeError::TemplateNotFound {
                name: name.to_string(),
            })?;

        for (index, arg) in args.iter().enumerate() {
            let index = index as u32;
            if let Err(source) = self.backend.set_kernel_arg(kernel, index, arg) {
                self.stats.failed_executions += 1;
                tracing::error!("Failed to bind argument {} of `{}`: {}", index, name, source);
                return Err(RuntimeError::BindArgument { index, source });
            }
        }

        let start = Instant::now();
        let launched = self
            .backend
            .enqueue_kernel(&self.queue, kernel, launch.global_size, launch.local_size)
            .and_then(|()| self.backend.finish(&self.queue));
        if let Err(source) = launched {
            self.stats.failed_executions += 1;
            tracing::error!("Kernel `{}` failed: {}", name, source);
            return Err(RuntimeError::Launch {
                name: name.to_string(),
                source,
            });
        }
        let elapsed = start.elapsed();

        self.stats.executions += 1;
        self.stats.execution_seconds += elapsed.as_secs_f64();
        tracing::debug!(
            "Executed `{}` ({:.3} ms, global={}, local={:?})",
            name,
            elapsed.as_secs_f64() * 1000.0,
            launch.global_size,
            launch.local_size
        );
        Ok(elapsed)
    }

    pub fn stats(&self) -> &KernelStats {
        &self.stats
    }

    pub fn build_failures(&self) -> &BuildReporter {
        &self.reporter
    }

    /// Multi-line statistics report, also logged at `info`
    pub fn print_stats(&self) -> String {
        let s = &self.stats;
        let mut report = String::new();
        let _ = writeln!(report, "Kernel statistics for {}", self.caps.device_name);
        let _ = writeln!(report, "  templates:        {}", self.templates.len());
        let _ = writeln!(report, "  compiles:         {} ({} failed)", s.compiles, s.failed_compiles);
        let _ = writeln!(report, "  cache hits:       {}", s.cache_hits);
        let _ = writeln!(report, "  cache misses:     {}", s.cache_misses);
        let _ = writeln!(report, "  hit rate:         {:.1}%", s.hit_rate());
        let _ = writeln!(report, "  compile time:     {:.3} s (avg {:.3} s)", s.compile_seconds, s.average_compile_seconds());
        let _ = writeln!(report, "  executions:       {} ({} failed)", s.executions, s.failed_executions);
        let _ = writeln!(report, "  execution time:   {:.3} s (avg {:.3} ms)", s.execution_seconds, s.average_execution_ms());
        for template in self.templates.values() {
            match template.active_variant() {
                Some(variant) => {
                    let _ = writeln!(
                        report,
                        "  - {}: {} tier, {} uses",
                        template.name(),
                        variant.tier(),
                        variant.use_count()
                    );
                }
                None => {
                    let _ = writeln!(report, "  - {}: not compiled", template.name());
                }
            }
        }
        tracing::info!("{}", report.trim_end());
        report
    }

    /// Release every compiled variant and log final statistics
    pub fn shutdown(mut self) -> KernelStats {
        self.release_all();
        tracing::info!(
            "Kernel manager shut down: {} compiles, {} executions, {:.1}% hit rate",
            self.stats.compiles,
            self.stats.executions,
            self.stats.hit_rate()
        );
        std::mem::take(&mut self.stats)
    }

    fn release_all(&mut self) {
        for template in self.templates.values_mut() {
            template.release_all(self.backend.as_ref());
        }
        self.templates.clear();
    }
}

impl<B: ComputeBackend> Drop for KernelManager<B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProfile, SimulatedBackend};

    const VEC_ADD: &str = "__kernel void vec_add(__global int* a, __global int* b) {\n    a[get_global_id(0)] += b[get_global_id(0)];\n}\n";

    fn manager(profile: DeviceProfile) -> KernelManager<SimulatedBackend> {
        let backend = Rc::new(SimulatedBackend::new(profile));
        let queue = Rc::new(backend.create_queue());
        KernelManager::new(backend, queue, KernelConfig::default())
    }

    // ==================== Registration ====================

    #[test]
    fn test_register_validates_arguments() {
        let mut km = manager(DeviceProfile::opencl20());
        assert!(matches!(
            km.register("", "vec_add", VEC_ADD),
            Err(RuntimeError::InvalidArgument { .. })
        ));
        assert!(km.register("t", "", VEC_ADD).is_err());
        assert!(km.register("t", "vec_add", "").is_err());
        assert_eq!(km.template_count(), 0);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut km = manager(DeviceProfile::opencl20());
        km.register("add", "vec_add", VEC_ADD).expect("should register");
        let err = km.register("add", "vec_add", "__kernel void other() {}").unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateTemplate { .. }));
        assert_eq!(km.template("add").map(|t| t.source()), Some(VEC_ADD));
    }

    #[test]
    fn test_registry_capacity_doubles() {
        let backend = Rc::new(SimulatedBackend::new(DeviceProfile::opencl20()));
        let queue = Rc::new(backend.create_queue());
        let config = KernelConfig {
            template_capacity: 2,
            ..KernelConfig::default()
        };
        let mut km = KernelManager::new(backend, queue, config);
        for i in 0..5 {
            km.register(&format!("t{i}"), "vec_add", VEC_ADD).expect("should register");
        }
        assert_eq!(km.template_capacity(), 8);
        assert!(km.template_count() <= km.template_capacity());
    }

    // ==================== Resolution ====================

    #[test]
    fn test_resolve_unknown_template() {
        let mut km = manager(DeviceProfile::opencl20());
        assert!(matches!(
            km.resolve_tier("missing"),
            Err(RuntimeError::TemplateNotFound { .. })
        ));
        assert_eq!(km.stats().cache_misses, 0);
    }

    #[test]
    fn test_resolve_caches_active_variant() {
        let mut km = manager(DeviceProfile::opencl20());
        km.register("add", "vec_add", VEC_ADD).expect("should register");

        let first = km.resolve("add").expect("should compile").id();
        let second = km.resolve("add").expect("should hit").id();
        assert_eq!(first, second);
        assert_eq!(km.stats().compiles, 1);
        assert_eq!(km.stats().cache_misses, 1);
        assert_eq!(km.stats().cache_hits, 1);
        assert_eq!(
            km.template("add").and_then(|t| t.active_tier()),
            Some(StrategyTier::Native)
        );
    }

    #[test]
    fn test_failed_tier_is_released_and_skipped() {
        let profile = DeviceProfile::opencl12().with_rejected_token("atomic_inc");
        let backend = Rc::new(SimulatedBackend::new(profile));
        let queue = Rc::new(backend.create_queue());
        let mut km = KernelManager::new(backend.clone(), queue, KernelConfig::default());
        km.register(
            "count",
            "count",
            "__kernel void count(__global int* c) { RIX_ATOMIC_INC(c); }\n",
        )
        .expect("should register");

        let tier = km.resolve_tier("count").expect("basic tier builds");
        assert_eq!(tier, StrategyTier::Basic);
        let template = km.template("count").expect("registered");
        assert_eq!(template.variant_state(StrategyTier::Extension), VariantState::Failed);
        assert_eq!(template.variant_state(StrategyTier::Native), VariantState::Uncompiled);
        assert_eq!(km.stats().failed_compiles, 1);
        assert_eq!(km.build_failures().failure_count(), 1);

        // only the compiled variant's program is still alive
        assert_eq!(backend.counters().live_programs(), 1);
    }

    #[test]
    fn test_exhausted_tiers_are_not_retried() {
        let profile = DeviceProfile::opencl20().with_rejected_token("forbidden");
        let backend = Rc::new(SimulatedBackend::new(profile));
        let queue = Rc::new(backend.create_queue());
        let mut km = KernelManager::new(backend.clone(), queue, KernelConfig::default());
        km.register("bad", "bad", "__kernel void bad() { forbidden(); }\n")
            .expect("should register");

        let err = km.resolve_tier("bad").unwrap_err();
        match err {
            RuntimeError::StrategiesExhausted { failed, .. } => {
                assert_eq!(failed, StrategyTier::ALL.to_vec());
            }
            other => panic!("unexpected error: {other}"),
        }
        let builds = backend.counters().builds;
        assert_eq!(builds, 4);

        assert!(km.resolve_tier("bad").is_err());
        assert_eq!(backend.counters().builds, builds);
        assert_eq!(backend.counters().live_programs(), 0);
    }

    // ==================== Execution ====================

    #[test]
    fn test_execute_rejects_bad_launch_before_resolving() {
        let mut km = manager(DeviceProfile::opencl20());
        km.register("add", "vec_add", VEC_ADD).expect("should register");
        assert!(matches!(
            km.execute("add", LaunchConfig::global(0), &[]),
            Err(RuntimeError::InvalidLaunch(_))
        ));
        assert!(km.execute("add", LaunchConfig::new(64, 512), &[]).is_err());
        assert_eq!(km.stats().cache_misses, 0);
    }

    #[test]
    fn test_execute_reports_argument_index() {
        let profile = DeviceProfile {
            fail_arg_index: Some(1),
            ..DeviceProfile::opencl20()
        };
        let mut km = manager(profile);
        km.register("add", "vec_add", VEC_ADD).expect("should register");
        let (a, b) = (1i32, 2i32);
        let err = km
            .execute(
                "add",
                LaunchConfig::global(1),
                &[KernelArg::scalar(&a), KernelArg::scalar(&b)],
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::BindArgument { index: 1, .. }));
        assert_eq!(km.stats().failed_executions, 1);
        assert_eq!(km.stats().executions, 0);
    }

    #[test]
    fn test_execute_records_statistics() {
        let mut km = manager(DeviceProfile::opencl20());
        km.register("add", "vec_add", VEC_ADD).expect("should register");
        let (a, b) = (1i32, 2i32);
        let args = [KernelArg::scalar(&a), KernelArg::scalar(&b)];
        km.execute("add", LaunchConfig::new(64, 64), &args).expect("should run");
        km.execute("add", LaunchConfig::new(64, 0), &args).expect("should run");
        assert_eq!(km.stats().executions, 2);
        assert_eq!(km.stats().cache_hits, 1);
        let report = km.print_stats();
        assert!(report.contains("add: native tier, 2 uses"));
    }

    #[test]
    fn test_shutdown_releases_handles() {
        let backend = Rc::new(SimulatedBackend::new(DeviceProfile::opencl20()));
        let queue = Rc::new(backend.create_queue());
        let mut km = KernelManager::new(backend.clone(), queue, KernelConfig::default());
        km.register("add", "vec_add", VEC_ADD).expect("should register");
        km.resolve_tier("add").expect("should compile");
        let stats = km.shutdown();
        assert_eq!(stats.compiles, 1);
        let counters = backend.counters();
        assert_eq!(counters.live_programs(), 0);
        assert_eq!(counters.live_kernels(), 0);
    }
}
