//! Error types and build diagnostics
//!
//! Runtime failures are reported as [`RuntimeError`]. Kernel build failures
//! are non-fatal and get their own diagnostic, [`BuildFailure`], which keeps
//! the generated source so miette can point at the line the driver rejected.

use crate::kernel::StrategyTier;
use crate::svm::SvmLevel;
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// Status returned by a device driver call
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
#[error("{call} failed with status {code}")]
#[diagnostic(code(driver::status))]
pub struct DriverError {
    /// Name of the driver entry point that failed
    pub call: &'static str,
    /// Raw status code
    pub code: i32,
}

impl DriverError {
    pub fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Runtime error
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    #[error("Invalid argument: {reason}")]
    #[diagnostic(code(runtime::invalid_argument))]
    InvalidArgument { reason: String },

    // === Kernel Errors ===
    #[error("Template `{name}` is already registered")]
    #[diagnostic(
        code(kernel::duplicate_template),
        help("register the new source under a different template name")
    )]
    DuplicateTemplate { name: String },

    #[error("Template `{name}` not found")]
    #[diagnostic(code(kernel::template_not_found))]
    TemplateNotFound { name: String },

    #[error("All compilation strategies failed for template `{name}`")]
    #[diagnostic(
        code(kernel::strategies_exhausted),
        help("failed tiers are not retried; inspect the build failures for each tier")
    )]
    StrategiesExhausted {
        name: String,
        failed: Vec<StrategyTier>,
    },

    #[error("Failed to bind kernel argument {index}")]
    #[diagnostic(code(kernel::bind_argument))]
    BindArgument {
        index: u32,
        #[source]
        source: DriverError,
    },

    #[error("Kernel `{name}` launch failed")]
    #[diagnostic(code(kernel::launch))]
    Launch {
        name: String,
        #[source]
        source: DriverError,
    },

    #[error("Invalid launch configuration: {0}")]
    #[diagnostic(code(kernel::invalid_launch))]
    InvalidLaunch(String),

    // === SVM Errors ===
    #[error("Allocation of {size} bytes failed on the {level} path")]
    #[diagnostic(code(svm::allocation_failed))]
    AllocationFailed { size: usize, level: SvmLevel },

    #[error("Allocation of {size} bytes exceeds the device maximum of {max} bytes")]
    #[diagnostic(code(svm::allocation_too_large))]
    AllocationTooLarge { size: usize, max: usize },

    #[error("No live allocation at {ptr:#x}")]
    #[diagnostic(code(svm::not_found))]
    NotFound { ptr: usize },

    #[error("Pointer {ptr:#x} is already tracked by this context")]
    #[diagnostic(code(svm::duplicate_pointer))]
    DuplicatePointer { ptr: usize },

    #[error("Reference count overflow at {ptr:#x}")]
    #[diagnostic(code(svm::ref_count_overflow))]
    RefCountOverflow { ptr: usize },

    #[error("Synchronization of {ptr:#x} failed")]
    #[diagnostic(code(svm::sync))]
    Sync {
        ptr: usize,
        #[source]
        source: DriverError,
    },

    // === Table Errors ===
    #[error("Cannot grow {table} table to {requested} entries")]
    #[diagnostic(code(runtime::capacity_exhausted))]
    CapacityExhausted {
        table: &'static str,
        requested: usize,
    },

    // === Messaging Errors ===
    #[error("Message queue `{channel}` is full ({capacity} packets)")]
    #[diagnostic(
        code(comm::queue_full),
        help("receive pending packets before sending more")
    )]
    QueueFull { channel: String, capacity: usize },

    #[error("Packet payload of {size} bytes exceeds the limit of {max} bytes")]
    #[diagnostic(code(comm::payload_too_large))]
    PayloadTooLarge { size: usize, max: usize },

    // === Module Registry Errors ===
    #[error("Module `{name}` is already registered")]
    #[diagnostic(code(module::duplicate))]
    DuplicateModule { name: String },

    #[error("Invalid module descriptor `{name}`: {reason}")]
    #[diagnostic(code(module::invalid))]
    InvalidModule { name: String, reason: String },

    // === Serialization Errors ===
    #[error("Failed to serialize {what}: {reason}")]
    #[diagnostic(code(runtime::serialize))]
    Serialization { what: &'static str, reason: String },

    // === Configuration Errors ===
    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(config::invalid))]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    #[diagnostic(code(config::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Driver(#[from] DriverError),
}

impl RuntimeError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// A kernel variant that failed to build for one strategy tier
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("Build of `{template}` failed for the {tier} tier")]
#[diagnostic(code(kernel::build_failed))]
pub struct BuildFailure {
    pub template: String,
    pub tier: StrategyTier,
    /// Full driver build log
    pub log: String,
    #[source_code]
    pub src: NamedSource<String>,
    #[label("rejected here")]
    pub span: Option<SourceSpan>,
    #[help]
    pub help: Option<String>,
}

impl BuildFailure {
    pub fn new(template: &str, tier: StrategyTier, source: &str, log: String) -> Self {
        let span = locate_log_position(&log, source);
        let help = if log.trim().is_empty() {
            None
        } else {
            Some(log.trim_end().to_string())
        };
        Self {
            template: template.to_string(),
            tier,
            src: NamedSource::new(format!("{template}.{}.cl", tier.short_name()), source.to_string()),
            log,
            span,
            help,
        }
    }
}

/// Find the first `:<line>:<col>:` marker in a build log and turn it into a
/// one-character span over `source`.
fn locate_log_position(log: &str, source: &str) -> Option<SourceSpan> {
    for line in log.lines() {
        let mut parts = line.split(':');
        while let Some(part) = parts.next() {
            let Ok(row) = part.trim().parse::<usize>() else {
                continue;
            };
            let Some(Ok(col)) = parts.next().map(|p| p.trim().parse::<usize>()) else {
                break;
            };
            if row == 0 || col == 0 {
                break;
            }
            let line_start: usize = source
                .split_inclusive('\n')
                .take(row - 1)
                .map(str::len)
                .sum();
            let offset = line_start + col - 1;
            if offset < source.len() {
                return Some(SourceSpan::new(offset.into(), 1));
            }
            break;
        }
    }
    None
}

/// Collects build failures across resolutions
#[derive(Debug, Default)]
pub struct BuildReporter {
    failures: Vec<BuildFailure>,
}

impl BuildReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, failure: BuildFailure) {
        self.failures.push(failure);
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Failures recorded for one template, oldest first
    pub fn for_template<'a>(&'a self, template: &'a str) -> impl Iterator<Item = &'a BuildFailure> {
        self.failures.iter().filter(move |f| f.template == template)
    }

    /// Print all build failures
    pub fn emit_all(&self) {
        for failure in &self.failures {
            eprintln!("{:?}", miette::Report::new(failure.clone()));
        }
    }

    pub fn failures(&self) -> &[BuildFailure] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_log_position() {
        let source = "line one\nline two\nline three\n";
        let log = "<source>:2:6: error: use of undeclared identifier 'two'";
        let span = locate_log_position(log, source).expect("should locate");
        assert_eq!(span.offset(), 9 + 5);
        assert_eq!(&source[span.offset()..span.offset() + 3], "two");
    }

    #[test]
    fn test_locate_log_position_without_marker() {
        assert!(locate_log_position("error: unsupported -cl-std", "x").is_none());
        assert!(locate_log_position("", "x").is_none());
    }

    #[test]
    fn test_build_failure_keeps_log() {
        let failure = BuildFailure::new(
            "vec_add",
            StrategyTier::Basic,
            "__kernel void k() {}\n",
            "<source>:1:1: error: nope\n".to_string(),
        );
        assert_eq!(failure.help.as_deref(), Some("<source>:1:1: error: nope"));
        assert!(failure.span.is_some());
        assert!(failure.to_string().contains("basic"));
    }

    #[test]
    fn test_serialization_error_has_own_code() {
        let err = RuntimeError::Serialization {
            what: "device inventory",
            reason: "key must be a string".to_string(),
        };
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("runtime::serialize"));
        let config_code = RuntimeError::Config("bad".to_string()).code().map(|c| c.to_string());
        assert_ne!(code, config_code);
        assert!(err.to_string().starts_with("Failed to serialize device inventory"));
    }

    #[test]
    fn test_driver_error_display() {
        let err = RuntimeError::from(DriverError::new("clBuildProgram", -11));
        assert_eq!(err.to_string(), "clBuildProgram failed with status -11");
    }
}
