//! tiercl CLI
//!
//! Main entry point for the `tiercl` command.

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tiercl::device::{ComputeBackend, SimulatedSystem};
use tiercl::inventory::DeviceInventory;
use tiercl::kernel::{DeviceCapabilities, KernelManager, LaunchConfig, fallback_order, select_tier};
use tiercl::module_info::ModuleRegistry;
use tiercl::svm::{SvmContext, SvmFlags, SvmProbe};
use tiercl::{RuntimeConfig, selftest};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tiercl")]
#[command(author = "Demetrios Chiuratto Agourakis, Dionisio Chiuratto Agourakis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capability-tiered kernel dispatch and shared memory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Simulated system description (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Runtime configuration (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device index across all platforms
    #[arg(short, long, global = true, default_value = "0")]
    device: usize,

    /// Driver to use
    #[arg(long, global = true, value_enum, default_value = "simulated")]
    backend: BackendKind,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// In-process software device
    Simulated,
    /// OpenCL driver (requires the `opencl` feature)
    Opencl,
}

#[derive(Subcommand)]
enum Commands {
    /// List platforms and devices
    Devices {
        /// Also write the inventory as JSON
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },

    /// Show a device's capabilities and the tiers it would use
    Probe,

    /// Compile and launch a kernel file
    Run {
        /// Kernel source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Kernel entry point
        #[arg(short, long)]
        entry: String,

        /// Global work size
        #[arg(short, long, default_value = "1024")]
        global: usize,

        /// Local work size (0 lets the driver choose)
        #[arg(short, long, default_value = "0")]
        local: usize,

        /// Bytes of shared memory bound as argument 0
        #[arg(long, default_value = "4096")]
        buffer: usize,
    },

    /// Run the atomic-add compatibility check
    Selftest {
        /// Work items to launch
        #[arg(short = 'n', long, default_value = "1024")]
        items: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the registered module descriptors as JSON
    Modules,

    /// Show information about tiercl
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("tiercl=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    config.apply_env()?;

    match &cli.command {
        Commands::Devices { json } => devices(&cli, json.as_deref()),
        Commands::Info => info(),
        Commands::Modules => modules(),
        command => dispatch(&cli, &config, command),
    }
}

fn simulated_system(cli: &Cli) -> Result<SimulatedSystem> {
    Ok(match &cli.profile {
        Some(path) => SimulatedSystem::load(path)?,
        None => SimulatedSystem::default(),
    })
}

fn devices(cli: &Cli, json: Option<&Path>) -> Result<()> {
    let inventory = match cli.backend {
        BackendKind::Simulated => DeviceInventory::collect(&simulated_system(cli)?)?,
        #[cfg(feature = "opencl")]
        BackendKind::Opencl => DeviceInventory::collect(&tiercl::device::opencl::OpenClSystem)?,
        #[cfg(not(feature = "opencl"))]
        BackendKind::Opencl => miette::bail!("tiercl was built without the `opencl` feature"),
    };

    let mut index = 0;
    for platform in &inventory.platforms {
        println!("{} ({}, {})", platform.info.name, platform.info.vendor, platform.info.version);
        for device in &platform.devices {
            println!(
                "  [{}] {} - {} - {:?} - svm {}",
                index, device.name, device.version, device.kind, device.svm_capabilities
            );
            index += 1;
        }
    }
    println!("{} device(s)", inventory.device_count());

    if let Some(path) = json {
        inventory.export_json(path)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

/// Open the selected backend and run a device command on it
fn dispatch(cli: &Cli, config: &RuntimeConfig, command: &Commands) -> Result<()> {
    match cli.backend {
        BackendKind::Simulated => {
            let system = simulated_system(cli)?;
            let backend = system
                .backend(cli.device)
                .ok_or_else(|| miette::miette!("No simulated device #{}", cli.device))?;
            selftest::register_simulated_kernel(&backend);
            let queue = Rc::new(backend.create_queue());
            run_command(Rc::new(backend), queue, config, command)
        }
        #[cfg(feature = "opencl")]
        BackendKind::Opencl => {
            let backend = tiercl::device::opencl::OpenClBackend::open(0, cli.device)?;
            let queue = Rc::new(backend.create_queue().map_err(tiercl::RuntimeError::from)?);
            run_command(Rc::new(backend), queue, config, command)
        }
        #[cfg(not(feature = "opencl"))]
        BackendKind::Opencl => miette::bail!("tiercl was built without the `opencl` feature"),
    }
}

fn run_command<B: ComputeBackend>(
    backend: Rc<B>,
    queue: Rc<B::Queue>,
    config: &RuntimeConfig,
    command: &Commands,
) -> Result<()> {
    match command {
        Commands::Probe => probe(backend.as_ref()),
        Commands::Run {
            input,
            entry,
            global,
            local,
            buffer,
        } => run(backend, queue, config, input, entry, LaunchConfig::new(*global, *local), *buffer),
        Commands::Selftest { items, json } => {
            let report = selftest::run(backend, queue, config, *items)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
            } else {
                println!("Device:   {}", report.device);
                println!("Tier:     {}", report.tier);
                println!("SVM:      {}", report.svm_level);
                println!("Expected: {}", report.expected);
                println!("Observed: {}", report.observed);
                println!("Result:   {}", if report.passed { "PASS" } else { "FAIL" });
            }
            if !report.passed {
                miette::bail!("selftest failed");
            }
            Ok(())
        }
        Commands::Devices { .. } | Commands::Info | Commands::Modules => Ok(()),
    }
}

fn probe<B: ComputeBackend>(backend: &B) -> Result<()> {
    let caps = DeviceCapabilities::probe(backend);
    let svm = SvmProbe::run(backend);
    let preferred = select_tier(&caps);
    let yes_no = |b: bool| if b { "yes" } else { "no" };

    println!("Device:          {}", caps.device_name);
    println!("Version:         {}.{}", caps.version_major, caps.version_minor);
    println!("FP64:            {}", yes_no(caps.fp64));
    println!("32-bit atomics:  {}", yes_no(caps.atomic32));
    println!("64-bit atomics:  {}", yes_no(caps.atomic64));
    println!("Images:          {}", yes_no(caps.images));
    println!("SVM:             {} ({})", svm.level, svm.capabilities);
    println!("Compute units:   {}", caps.compute_units);
    println!("Max work-group:  {}", caps.max_work_group_size);
    println!("Preferred tier:  {}", preferred);
    let order: Vec<String> = fallback_order(preferred).iter().map(|t| t.to_string()).collect();
    println!("Fallback order:  {}", order.join(" -> "));
    Ok(())
}

fn run<B: ComputeBackend>(
    backend: Rc<B>,
    queue: Rc<B::Queue>,
    config: &RuntimeConfig,
    input: &Path,
    entry: &str,
    launch: LaunchConfig,
    buffer: usize,
) -> Result<()> {
    tracing::info!("Running {:?} ({}) with {:?}", input, entry, launch);

    let source = std::fs::read_to_string(input)
        .map_err(|e| miette::miette!("Failed to read input file: {}", e))?;
    let name = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(entry)
        .to_string();

    let mut kernels = KernelManager::new(Rc::clone(&backend), Rc::clone(&queue), config.kernel.clone());
    let mut svm = SvmContext::new(backend, &config.svm)?;
    kernels.register(&name, entry, &source)?;

    let data = svm.alloc(buffer, SvmFlags::READ_WRITE)?;
    svm.unmap(data, &queue)?;
    let result = svm
        .kernel_arg(data)
        .and_then(|arg| kernels.execute(&name, launch, &[arg]));

    if kernels.build_failures().has_failures() {
        kernels.build_failures().emit_all();
    }
    let elapsed = result?;
    svm.sync_to_host(data, &queue)?;
    svm.free(data)?;

    let tier = kernels
        .template(&name)
        .and_then(|t| t.active_tier())
        .map_or_else(|| "none".to_string(), |t| t.to_string());
    println!("{} ran on the {} tier in {:.3} ms", name, tier, elapsed.as_secs_f64() * 1000.0);
    print!("{}", kernels.print_stats());
    kernels.shutdown();
    svm.destroy();
    Ok(())
}

fn modules() -> Result<()> {
    let registry = ModuleRegistry::with_crate();
    println!("{}", registry.to_json()?);
    Ok(())
}

fn info() -> Result<()> {
    println!("tiercl");
    println!("Version: {}", tiercl::VERSION);
    println!();
    println!("Strategy tiers (richest first):");
    for tier in tiercl::StrategyTier::ALL {
        println!("  - {:<10} {}", tier.to_string(), tier.base_options());
    }
    println!();
    println!("Backends:");
    println!("  - Simulated (enabled)");
    #[cfg(feature = "opencl")]
    println!("  - OpenCL (enabled)");
    #[cfg(not(feature = "opencl"))]
    println!("  - OpenCL (disabled)");
    Ok(())
}
