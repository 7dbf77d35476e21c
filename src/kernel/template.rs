//! Kernel templates and their per-tier variants

use super::strategy::StrategyTier;
use crate::device::ComputeBackend;
use crate::diagnostics::BuildFailure;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Compilation state of one variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantState {
    Uncompiled,
    Compiling,
    Compiled,
    Failed,
}

/// One template compiled for one tier
pub struct KernelVariant<B: ComputeBackend> {
    entry_point: String,
    tier: StrategyTier,
    source: String,
    build_options: String,
    state: VariantState,
    program: Option<B::Program>,
    kernel: Option<B::Kernel>,
    compile_time: Duration,
    last_used: Option<Instant>,
    use_count: u64,
}

impl<B: ComputeBackend> KernelVariant<B> {
    pub(crate) fn new(entry_point: &str, tier: StrategyTier, source: String, build_options: String) -> Self {
        Self {
            entry_point: entry_point.to_string(),
            tier,
            source,
            build_options,
            state: VariantState::Uncompiled,
            program: None,
            kernel: None,
            compile_time: Duration::ZERO,
            last_used: None,
            use_count: 0,
        }
    }

    /// Build the variant and create its kernel.
    ///
    /// On failure every handle created along the way is released before
    /// returning and the variant is left `Failed`.
    pub(crate) fn compile(&mut self, backend: &B, template: &str) -> Result<(), BuildFailure> {
        self.state = VariantState::Compiling;
        let start = Instant::now();
        let outcome = self.try_compile(backend);
        self.compile_time = start.elapsed();

        match outcome {
            Ok((program, kernel)) => {
                self.program = Some(program);
                self.kernel = Some(kernel);
                self.state = VariantState::Compiled;
                Ok(())
            }
            Err(log) => {
                self.state = VariantState::Failed;
                Err(BuildFailure::new(template, self.tier, &self.source, log))
            }
        }
    }

    fn try_compile(&self, backend: &B) -> Result<(B::Program, B::Kernel), String> {
        let mut program = backend
            .create_program(&self.source)
            .map_err(|e| e.to_string())?;

        if let Err(err) = backend.build_program(&mut program, &self.build_options) {
            let log = match backend.build_log(&program) {
                Ok(log) if !log.trim().is_empty() => log,
                _ => err.to_string(),
            };
            backend.release_program(program);
            return Err(log);
        }

        match backend.create_kernel(&program, &self.entry_point) {
            Ok(kernel) => Ok((program, kernel)),
            Err(err) => {
                backend.release_program(program);
                Err(format!("{err}: no kernel named `{}`", self.entry_point))
            }
        }
    }

    /// Give the handles back to the driver
    pub(crate) fn release(&mut self, backend: &B) {
        if let Some(kernel) = self.kernel.take() {
            backend.release_kernel(kernel);
        }
        if let Some(program) = self.program.take() {
            backend.release_program(program);
        }
    }

    pub(crate) fn touch(&mut self) {
        self.use_count += 1;
        self.last_used = Some(Instant::now());
    }

    pub(crate) fn kernel_mut(&mut self) -> Option<&mut B::Kernel> {
        self.kernel.as_mut()
    }

    pub fn kernel(&self) -> Option<&B::Kernel> {
        self.kernel.as_ref()
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn tier(&self) -> StrategyTier {
        self.tier
    }

    /// Complete generated source
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn build_options(&self) -> &str {
        &self.build_options
    }

    pub fn state(&self) -> VariantState {
        self.state
    }

    pub fn is_compiled(&self) -> bool {
        self.state == VariantState::Compiled
    }

    pub fn compile_time(&self) -> Duration {
        self.compile_time
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }
}

/// A named kernel with one variant slot per tier
pub struct KernelTemplate<B: ComputeBackend> {
    name: String,
    entry_point: String,
    source: String,
    variants: [Option<KernelVariant<B>>; 4],
    active: Option<StrategyTier>,
    universal: bool,
}

impl<B: ComputeBackend> KernelTemplate<B> {
    pub(crate) fn new(name: &str, entry_point: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            entry_point: entry_point.to_string(),
            source: source.to_string(),
            variants: [None, None, None, None],
            active: None,
            universal: uses_portability_macros(source),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Caller's kernel source as registered
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Tier whose variant serves launches
    pub fn active_tier(&self) -> Option<StrategyTier> {
        self.active
    }

    /// Whether the source is written against the `RIX_*` portability macros
    pub fn is_universal(&self) -> bool {
        self.universal
    }

    pub fn variant(&self, tier: StrategyTier) -> Option<&KernelVariant<B>> {
        self.variants[tier.index()].as_ref()
    }

    pub fn variant_state(&self, tier: StrategyTier) -> VariantState {
        self.variant(tier)
            .map_or(VariantState::Uncompiled, KernelVariant::state)
    }

    /// Active compiled variant, if any
    pub fn active_variant(&self) -> Option<&KernelVariant<B>> {
        self.variant(self.active?).filter(|v| v.is_compiled())
    }

    pub(crate) fn active_variant_mut(&mut self) -> Option<&mut KernelVariant<B>> {
        let tier = self.active?;
        self.variants[tier.index()]
            .as_mut()
            .filter(|v| v.is_compiled())
    }

    pub(crate) fn slot_mut(&mut self, tier: StrategyTier) -> &mut Option<KernelVariant<B>> {
        &mut self.variants[tier.index()]
    }

    pub(crate) fn set_active(&mut self, tier: StrategyTier) {
        self.active = Some(tier);
    }

    /// Tiers attempted so far that did not build
    pub fn failed_tiers(&self) -> Vec<StrategyTier> {
        StrategyTier::ALL
            .into_iter()
            .filter(|t| self.variant_state(*t) == VariantState::Failed)
            .collect()
    }

    pub(crate) fn release_all(&mut self, backend: &B) {
        for variant in self.variants.iter_mut().flatten() {
            variant.release(backend);
        }
    }
}

/// True when the source names at least one `RIX_*` macro
fn uses_portability_macros(source: &str) -> bool {
    let bytes = source.as_bytes();
    source.match_indices("RIX_").any(|(at, _)| {
        at == 0 || !(bytes[at - 1].is_ascii_alphanumeric() || bytes[at - 1] == b'_')
    })
}
