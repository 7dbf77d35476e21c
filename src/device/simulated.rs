//! Simulated compute device
//!
//! A software driver that behaves like a small OpenCL implementation:
//! programs are "built" by checking the requested language version against
//! the device version and scanning the preprocessed source for tokens the
//! device profile rejects, kernels run host closures, and mirror buffers are
//! real device-side copies that only change on explicit writes.

use super::{ComputeBackend, DeviceLimit, DeviceParam, KernelArg, Scalar, SvmAllocFlags, SvmCapabilities};
use crate::diagnostics::{DriverError, DriverResult, RuntimeError};
use crate::inventory::{DeviceKind, DeviceRecord, DeviceSource, PlatformInfo};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::alloc::Layout;
use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;
use std::rc::Rc;

// OpenCL status codes reported by the simulated driver
const CL_OUT_OF_RESOURCES: i32 = -5;
const CL_MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
const CL_BUILD_PROGRAM_FAILURE: i32 = -11;
const CL_INVALID_VALUE: i32 = -30;
const CL_INVALID_PROGRAM_EXECUTABLE: i32 = -45;
const CL_INVALID_KERNEL_NAME: i32 = -46;
const CL_INVALID_ARG_SIZE: i32 = -51;
const CL_INVALID_KERNEL_ARGS: i32 = -52;
const CL_INVALID_WORK_GROUP_SIZE: i32 = -54;

/// Mirror handles live in their own id range so they are never confused
/// with small scalar arguments.
const MIRROR_TAG: u64 = 0x4D49_5252_0000_0000;

/// Static description of a simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    /// Version string as the driver reports it, e.g. `"OpenCL 2.0 sim"`
    pub version: String,
    /// Space-separated extension list
    pub extensions: String,
    pub svm_capabilities: SvmCapabilities,
    pub max_work_group_size: u64,
    pub compute_units: u64,
    /// Base address alignment in bits; 0 makes the query fail
    pub mem_base_addr_align: u64,
    pub max_mem_alloc_size: u64,
    pub global_mem_size: u64,
    /// Identifiers the compiler rejects when they appear on an active line
    pub rejected_tokens: Vec<String>,
    pub fail_svm_query: bool,
    pub fail_svm_alloc: bool,
    pub fail_mirror_creation: bool,
    /// Argument index whose binding is refused
    pub fail_arg_index: Option<u32>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::opencl20()
    }
}

impl DeviceProfile {
    /// OpenCL 2.0 GPU with coarse-grained SVM and 32/64-bit atomics
    pub fn opencl20() -> Self {
        Self {
            name: "Simulated GPU".to_string(),
            vendor: "tiercl".to_string(),
            kind: DeviceKind::Gpu,
            version: "OpenCL 2.0 tiercl-sim".to_string(),
            extensions: "cl_khr_global_int32_base_atomics cl_khr_global_int32_extended_atomics \
                         cl_khr_int64_base_atomics cl_khr_fp64"
                .to_string(),
            svm_capabilities: SvmCapabilities::COARSE_GRAIN_BUFFER,
            max_work_group_size: 256,
            compute_units: 8,
            mem_base_addr_align: 1024,
            max_mem_alloc_size: 256 * 1024 * 1024,
            global_mem_size: 1024 * 1024 * 1024,
            rejected_tokens: Vec::new(),
            fail_svm_query: false,
            fail_svm_alloc: false,
            fail_mirror_creation: false,
            fail_arg_index: None,
        }
    }

    /// OpenCL 1.2 device with 32-bit atomic extensions and no SVM
    pub fn opencl12() -> Self {
        Self {
            name: "Simulated GPU (1.2)".to_string(),
            version: "OpenCL 1.2 tiercl-sim".to_string(),
            extensions: "cl_khr_global_int32_base_atomics cl_khr_global_int32_extended_atomics"
                .to_string(),
            svm_capabilities: SvmCapabilities::NONE,
            ..Self::opencl20()
        }
    }

    /// OpenCL 1.1 device without atomic extensions
    pub fn opencl11() -> Self {
        Self {
            name: "Simulated GPU (1.1)".to_string(),
            version: "OpenCL 1.1 tiercl-sim".to_string(),
            extensions: String::new(),
            svm_capabilities: SvmCapabilities::NONE,
            ..Self::opencl20()
        }
    }

    /// Device whose version string does not follow `<API> <major>.<minor>`
    pub fn unversioned() -> Self {
        Self {
            name: "Simulated legacy device".to_string(),
            kind: DeviceKind::Accelerator,
            version: "1.1".to_string(),
            ..Self::opencl11()
        }
    }

    pub fn with_svm(mut self, caps: SvmCapabilities) -> Self {
        self.svm_capabilities = caps;
        self
    }

    pub fn with_rejected_token(mut self, token: impl Into<String>) -> Self {
        self.rejected_tokens.push(token.into());
        self
    }

    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            name: self.name.clone(),
            vendor: self.vendor.clone(),
            kind: self.kind,
            version: self.version.clone(),
            extensions: self.extensions.clone(),
            svm_capabilities: if self.fail_svm_query {
                SvmCapabilities::NONE
            } else {
                self.svm_capabilities
            },
            global_mem_size: self.global_mem_size,
            compute_units: self.compute_units,
            max_work_group_size: self.max_work_group_size,
        }
    }
}

/// Call counters kept by the simulated driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimCounters {
    pub programs_created: u64,
    pub programs_released: u64,
    pub builds: u64,
    pub failed_builds: u64,
    pub kernels_created: u64,
    pub kernels_released: u64,
    pub launches: u64,
    pub finishes: u64,
    pub svm_allocs: u64,
    pub svm_frees: u64,
    pub svm_maps: u64,
    pub svm_unmaps: u64,
    pub mirrors_created: u64,
    pub mirrors_released: u64,
    pub mirror_writes: u64,
    pub mirror_reads: u64,
}

impl SimCounters {
    pub fn live_programs(&self) -> u64 {
        self.programs_created - self.programs_released
    }

    pub fn live_kernels(&self) -> u64 {
        self.kernels_created - self.kernels_released
    }

    pub fn live_mirrors(&self) -> u64 {
        self.mirrors_created - self.mirrors_released
    }

    pub fn live_svm(&self) -> u64 {
        self.svm_allocs - self.svm_frees
    }
}

/// Program handle
#[derive(Debug)]
pub struct SimProgram {
    id: u64,
}

/// Kernel handle
#[derive(Debug)]
pub struct SimKernel {
    id: u64,
    entry: String,
    args: Vec<Option<SimArg>>,
}

impl SimKernel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entry_point(&self) -> &str {
        &self.entry
    }
}

/// Mirror buffer handle
#[derive(Debug)]
pub struct SimMirror {
    id: u64,
    size: usize,
}

impl SimMirror {
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Command queue handle
#[derive(Debug)]
pub struct SimQueue {
    id: u64,
}

impl SimQueue {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A bound kernel argument as the simulated device stores it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimArg {
    Value(Vec<u8>),
    Svm(usize),
    Local(usize),
}

type HostKernel = Rc<dyn Fn(&mut LaunchContext<'_>) -> Result<(), String>>;

#[derive(Debug)]
struct ProgramData {
    source: String,
    log: String,
    built: bool,
}

#[derive(Debug, Clone, Copy)]
struct SvmRegion {
    layout: Layout,
    flags: SvmAllocFlags,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    programs: FxHashMap<u64, ProgramData>,
    mirrors: FxHashMap<u64, Vec<u8>>,
    svm: FxHashMap<usize, SvmRegion>,
    host_kernels: FxHashMap<String, HostKernel>,
    counters: SimCounters,
}

impl SimState {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// View of a running launch handed to host kernel closures
pub struct LaunchContext<'a> {
    global: usize,
    local: Option<usize>,
    args: &'a [SimArg],
    mirrors: &'a mut FxHashMap<u64, Vec<u8>>,
    svm: &'a FxHashMap<usize, SvmRegion>,
}

impl LaunchContext<'_> {
    pub fn global_size(&self) -> usize {
        self.global
    }

    pub fn local_size(&self) -> Option<usize> {
        self.local
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Read a value argument of exactly `size_of::<T>()` bytes
    pub fn scalar<T: Scalar>(&self, index: usize) -> Option<T> {
        match self.args.get(index)? {
            SimArg::Value(bytes) => T::from_ne_slice(bytes),
            _ => None,
        }
    }

    /// Device memory behind a pointer or mirror argument
    pub fn memory(&mut self, index: usize) -> Option<&mut [u8]> {
        match self.args.get(index)? {
            SimArg::Svm(addr) => {
                let (base, region) = self
                    .svm
                    .iter()
                    .find(|(base, region)| **base <= *addr && *addr < **base + region.layout.size())?;
                let len = base + region.layout.size() - addr;
                // SAFETY: the region is a live allocation owned by this driver.
                Some(unsafe { std::slice::from_raw_parts_mut(*addr as *mut u8, len) })
            }
            SimArg::Value(bytes) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let id = u64::from_ne_bytes(raw);
                self.mirrors.get_mut(&id).map(Vec::as_mut_slice)
            }
            _ => None,
        }
    }

    pub fn read_u32(&mut self, index: usize, word: usize) -> Option<u32> {
        let memory = self.memory(index)?;
        let bytes = memory.get(word * 4..word * 4 + 4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, index: usize, word: usize, value: u32) -> bool {
        let Some(memory) = self.memory(index) else {
            return false;
        };
        match memory.get_mut(word * 4..word * 4 + 4) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_ne_bytes());
                true
            }
            None => false,
        }
    }
}

/// Software compute device
pub struct SimulatedBackend {
    profile: DeviceProfile,
    state: RefCell<SimState>,
}

impl fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SimulatedBackend")
            .field("profile", &self.profile.name)
            .field("counters", &state.counters)
            .field("host_kernels", &state.host_kernels.len())
            .finish()
    }
}

impl SimulatedBackend {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            state: RefCell::new(SimState::default()),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn create_queue(&self) -> SimQueue {
        let id = self.state.borrow_mut().fresh_id();
        SimQueue { id }
    }

    /// Run `kernel` on the host whenever `entry_point` is launched
    pub fn register_host_kernel<F>(&self, entry_point: &str, kernel: F)
    where
        F: Fn(&mut LaunchContext<'_>) -> Result<(), String> + 'static,
    {
        self.state
            .borrow_mut()
            .host_kernels
            .insert(entry_point.to_string(), Rc::new(kernel));
    }

    pub fn counters(&self) -> SimCounters {
        self.state.borrow().counters.clone()
    }

    /// Current device-side contents of a mirror buffer
    pub fn mirror_bytes(&self, mirror: &SimMirror) -> Vec<u8> {
        self.state
            .borrow()
            .mirrors
            .get(&mirror.id)
            .cloned()
            .unwrap_or_default()
    }

    /// Flags a native allocation was requested with
    pub fn svm_flags(&self, ptr: NonNull<u8>) -> Option<SvmAllocFlags> {
        self.state
            .borrow()
            .svm
            .get(&(ptr.as_ptr() as usize))
            .map(|region| region.flags)
    }

    /// Source text last handed to `create_program` for the given kernel
    pub fn kernel_source(&self, kernel: &SimKernel) -> Option<String> {
        let state = self.state.borrow();
        state
            .programs
            .values()
            .find(|p| p.built && declares_kernel(&p.source, &kernel.entry))
            .map(|p| p.source.clone())
    }
}

impl ComputeBackend for SimulatedBackend {
    type Queue = SimQueue;
    type Program = SimProgram;
    type Kernel = SimKernel;
    type Mirror = SimMirror;

    fn device_string(&self, param: DeviceParam) -> DriverResult<String> {
        Ok(match param {
            DeviceParam::Name => self.profile.name.clone(),
            DeviceParam::Vendor => self.profile.vendor.clone(),
            DeviceParam::Version => self.profile.version.clone(),
            DeviceParam::Extensions => self.profile.extensions.clone(),
        })
    }

    fn device_limit(&self, limit: DeviceLimit) -> DriverResult<u64> {
        let p = &self.profile;
        match limit {
            DeviceLimit::SvmCapabilities if p.fail_svm_query => {
                Err(DriverError::new("clGetDeviceInfo", CL_INVALID_VALUE))
            }
            DeviceLimit::SvmCapabilities => Ok(p.svm_capabilities.bits()),
            DeviceLimit::MaxWorkGroupSize => Ok(p.max_work_group_size),
            DeviceLimit::MaxComputeUnits => Ok(p.compute_units),
            DeviceLimit::MemBaseAddrAlign if p.mem_base_addr_align == 0 => {
                Err(DriverError::new("clGetDeviceInfo", CL_INVALID_VALUE))
            }
            DeviceLimit::MemBaseAddrAlign => Ok(p.mem_base_addr_align),
            DeviceLimit::MaxMemAllocSize => Ok(p.max_mem_alloc_size),
            DeviceLimit::GlobalMemSize => Ok(p.global_mem_size),
        }
    }

    fn create_program(&self, source: &str) -> DriverResult<SimProgram> {
        if source.is_empty() {
            return Err(DriverError::new("clCreateProgramWithSource", CL_INVALID_VALUE));
        }
        let mut state = self.state.borrow_mut();
        let id = state.fresh_id();
        state.programs.insert(
            id,
            ProgramData {
                source: source.to_string(),
                log: String::new(),
                built: false,
            },
        );
        state.counters.programs_created += 1;
        Ok(SimProgram { id })
    }

    fn build_program(&self, program: &mut SimProgram, options: &str) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        state.counters.builds += 1;
        let data = state
            .programs
            .get_mut(&program.id)
            .ok_or(DriverError::new("clBuildProgram", CL_INVALID_VALUE))?;
        let outcome = simulate_build(&self.profile, &data.source, options);
        match outcome {
            Ok(log) => {
                data.log = log;
                data.built = true;
                Ok(())
            }
            Err(log) => {
                data.log = log;
                data.built = false;
                state.counters.failed_builds += 1;
                Err(DriverError::new("clBuildProgram", CL_BUILD_PROGRAM_FAILURE))
            }
        }
    }

    fn build_log(&self, program: &SimProgram) -> DriverResult<String> {
        self.state
            .borrow()
            .programs
            .get(&program.id)
            .map(|p| p.log.clone())
            .ok_or(DriverError::new("clGetProgramBuildInfo", CL_INVALID_VALUE))
    }

    fn create_kernel(&self, program: &SimProgram, entry_point: &str) -> DriverResult<SimKernel> {
        let mut state = self.state.borrow_mut();
        let data = state
            .programs
            .get(&program.id)
            .ok_or(DriverError::new("clCreateKernel", CL_INVALID_VALUE))?;
        if !data.built {
            return Err(DriverError::new("clCreateKernel", CL_INVALID_PROGRAM_EXECUTABLE));
        }
        if !declares_kernel(&data.source, entry_point) {
            return Err(DriverError::new("clCreateKernel", CL_INVALID_KERNEL_NAME));
        }
        let id = state.fresh_id();
        state.counters.kernels_created += 1;
        Ok(SimKernel {
            id,
            entry: entry_point.to_string(),
            args: Vec::new(),
        })
    }

    fn release_program(&self, program: SimProgram) {
        let mut state = self.state.borrow_mut();
        if state.programs.remove(&program.id).is_some() {
            state.counters.programs_released += 1;
        }
    }

    fn release_kernel(&self, _kernel: SimKernel) {
        self.state.borrow_mut().counters.kernels_released += 1;
    }

    fn set_kernel_arg(&self, kernel: &mut SimKernel, index: u32, arg: &KernelArg<'_>) -> DriverResult<()> {
        if self.profile.fail_arg_index == Some(index) {
            return Err(DriverError::new("clSetKernelArg", CL_INVALID_ARG_SIZE));
        }
        let stored = match arg {
            KernelArg::Value([]) => return Err(DriverError::new("clSetKernelArg", CL_INVALID_ARG_SIZE)),
            KernelArg::Value(bytes) => SimArg::Value(bytes.to_vec()),
            KernelArg::Svm(ptr) => SimArg::Svm(ptr.as_ptr() as usize),
            KernelArg::Local(0) => return Err(DriverError::new("clSetKernelArg", CL_INVALID_ARG_SIZE)),
            KernelArg::Local(size) => SimArg::Local(*size),
        };
        let index = index as usize;
        if kernel.args.len() <= index {
            kernel.args.resize(index + 1, None);
        }
        kernel.args[index] = Some(stored);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        _queue: &SimQueue,
        kernel: &SimKernel,
        global: usize,
        local: Option<usize>,
    ) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        state.counters.launches += 1;

        if let Some(local) = local {
            if local as u64 > self.profile.max_work_group_size {
                return Err(DriverError::new("clEnqueueNDRangeKernel", CL_INVALID_WORK_GROUP_SIZE));
            }
        }
        let args: Vec<SimArg> = kernel
            .args
            .iter()
            .cloned()
            .collect::<Option<_>>()
            .ok_or(DriverError::new("clEnqueueNDRangeKernel", CL_INVALID_KERNEL_ARGS))?;

        let Some(host) = state.host_kernels.get(&kernel.entry).cloned() else {
            tracing::debug!("simulated launch of `{}` has no host body", kernel.entry);
            return Ok(());
        };

        let SimState { mirrors, svm, .. } = &mut *state;
        let mut launch = LaunchContext {
            global,
            local,
            args: &args,
            mirrors,
            svm,
        };
        host(&mut launch).map_err(|msg| {
            tracing::warn!("simulated kernel `{}` failed: {}", kernel.entry, msg);
            DriverError::new("clEnqueueNDRangeKernel", CL_OUT_OF_RESOURCES)
        })
    }

    fn finish(&self, _queue: &SimQueue) -> DriverResult<()> {
        self.state.borrow_mut().counters.finishes += 1;
        Ok(())
    }

    fn svm_alloc(&self, flags: SvmAllocFlags, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if self.profile.fail_svm_alloc || size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, alignment.max(1)).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        let mut state = self.state.borrow_mut();
        state
            .svm
            .insert(ptr.as_ptr() as usize, SvmRegion { layout, flags });
        state.counters.svm_allocs += 1;
        Some(ptr)
    }

    unsafe fn svm_free(&self, ptr: NonNull<u8>) {
        let mut state = self.state.borrow_mut();
        if let Some(region) = state.svm.remove(&(ptr.as_ptr() as usize)) {
            // SAFETY: the region was allocated by `svm_alloc` with this layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), region.layout) };
            state.counters.svm_frees += 1;
        }
    }

    fn enqueue_svm_map(&self, _queue: &SimQueue, ptr: NonNull<u8>, _size: usize) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.svm.contains_key(&(ptr.as_ptr() as usize)) {
            return Err(DriverError::new("clEnqueueSVMMap", CL_INVALID_VALUE));
        }
        state.counters.svm_maps += 1;
        Ok(())
    }

    fn enqueue_svm_unmap(&self, _queue: &SimQueue, ptr: NonNull<u8>, _size: usize) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.svm.contains_key(&(ptr.as_ptr() as usize)) {
            return Err(DriverError::new("clEnqueueSVMUnmap", CL_INVALID_VALUE));
        }
        state.counters.svm_unmaps += 1;
        Ok(())
    }

    unsafe fn create_mirror(&self, host: NonNull<u8>, size: usize) -> DriverResult<SimMirror> {
        if self.profile.fail_mirror_creation {
            return Err(DriverError::new("clCreateBuffer", CL_MEM_OBJECT_ALLOCATION_FAILURE));
        }
        // SAFETY: the caller guarantees `host` is valid for `size` bytes.
        let initial = unsafe { std::slice::from_raw_parts(host.as_ptr(), size) }.to_vec();
        let mut state = self.state.borrow_mut();
        let id = MIRROR_TAG | state.fresh_id();
        state.mirrors.insert(id, initial);
        state.counters.mirrors_created += 1;
        Ok(SimMirror { id, size })
    }

    fn release_mirror(&self, mirror: SimMirror) {
        let mut state = self.state.borrow_mut();
        if state.mirrors.remove(&mirror.id).is_some() {
            state.counters.mirrors_released += 1;
        }
    }

    fn mirror_arg(&self, mirror: &SimMirror) -> Vec<u8> {
        mirror.id.to_ne_bytes().to_vec()
    }

    fn enqueue_write_mirror(&self, _queue: &SimQueue, mirror: &mut SimMirror, src: &[u8]) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        let data = state
            .mirrors
            .get_mut(&mirror.id)
            .ok_or(DriverError::new("clEnqueueWriteBuffer", CL_INVALID_VALUE))?;
        let dst = data
            .get_mut(..src.len())
            .ok_or(DriverError::new("clEnqueueWriteBuffer", CL_INVALID_VALUE))?;
        dst.copy_from_slice(src);
        state.counters.mirror_writes += 1;
        Ok(())
    }

    fn enqueue_read_mirror(&self, _queue: &SimQueue, mirror: &SimMirror, dst: &mut [u8]) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        let data = state
            .mirrors
            .get(&mirror.id)
            .ok_or(DriverError::new("clEnqueueReadBuffer", CL_INVALID_VALUE))?;
        let src = data
            .get(..dst.len())
            .ok_or(DriverError::new("clEnqueueReadBuffer", CL_INVALID_VALUE))?;
        dst.copy_from_slice(src);
        state.counters.mirror_reads += 1;
        Ok(())
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (base, region) in state.svm.drain() {
            // SAFETY: every tracked region came from `alloc_zeroed` with this layout.
            unsafe { std::alloc::dealloc(base as *mut u8, region.layout) };
        }
    }
}

// === Compiler model ===

/// Check `source` the way the device compiler would.
///
/// Returns the build log on both success and failure.
fn simulate_build(profile: &DeviceProfile, source: &str, options: &str) -> Result<String, String> {
    let mut log = Vec::new();

    if let Some(requested) = requested_language_version(options) {
        let device = loose_version(&profile.version);
        let supported = requested <= (1, 0) || device.is_some_and(|d| requested <= d);
        if !supported {
            return Err(format!(
                "error: OpenCL C version {}.{} is not supported by this device ({})",
                requested.0, requested.1, profile.version
            ));
        }
    }

    let mut defines: FxHashSet<String> = option_defines(options);
    let mut macros: FxHashMap<String, String> = FxHashMap::default();
    let mut frames: Vec<CondFrame> = Vec::new();
    let mut errors = 0usize;
    let mut continued = false;

    for (row, line) in source.lines().enumerate() {
        let row = row + 1;
        if continued {
            continued = line.trim_end().ends_with('\\');
            continue;
        }
        let active = frames.last().is_none_or(|f| f.active);
        let trimmed = line.trim_start();

        if let Some(directive) = trimmed.strip_prefix('#') {
            continued = line.trim_end().ends_with('\\');
            let directive = directive.trim_start();
            let (keyword, rest) = directive
                .split_once(char::is_whitespace)
                .unwrap_or((directive, ""));
            let rest = rest.trim();
            match keyword {
                "define" if active => {
                    let name: String = rest
                        .chars()
                        .take_while(|c| c.is_alphanumeric() || *c == '_')
                        .collect();
                    let body = macro_body(&rest[name.len()..]);
                    if !body.is_empty() {
                        macros.insert(name.clone(), body.to_string());
                    }
                    defines.insert(name);
                }
                "undef" if active => {
                    defines.remove(rest);
                    macros.remove(rest);
                }
                "ifdef" => frames.push(CondFrame::open(active, defines.contains(rest))),
                "ifndef" => frames.push(CondFrame::open(active, !defines.contains(rest))),
                "if" => frames.push(CondFrame::open(active, eval_condition(rest, &defines))),
                "elif" => match frames.last_mut() {
                    Some(frame) => frame.elif(eval_condition(rest, &defines)),
                    None => {
                        log.push(format!("<source>:{row}:1: error: #elif without #if"));
                        errors += 1;
                    }
                },
                "else" => match frames.last_mut() {
                    Some(frame) => frame.otherwise(),
                    None => {
                        log.push(format!("<source>:{row}:1: error: #else without #if"));
                        errors += 1;
                    }
                },
                "endif" => {
                    if frames.pop().is_none() {
                        log.push(format!("<source>:{row}:1: error: #endif without #if"));
                        errors += 1;
                    }
                }
                "pragma" if active => {
                    if let Some(ext) = pragma_extension(rest) {
                        if !profile.extensions.split_whitespace().any(|e| e == ext) {
                            log.push(format!(
                                "<source>:{row}:1: warning: unsupported OpenCL extension '{ext}' - ignoring"
                            ));
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        if !active {
            continue;
        }
        let code = line.split("//").next().unwrap_or("");
        for token in &profile.rejected_tokens {
            let direct = find_identifier(code, token);
            // one level of macro expansion
            let expanded = || {
                macros
                    .iter()
                    .filter(|(_, body)| find_identifier(body, token).is_some())
                    .filter_map(|(name, _)| find_identifier(code, name))
                    .min()
            };
            if let Some(col) = direct.or_else(expanded) {
                log.push(format!(
                    "<source>:{row}:{}: error: use of undeclared identifier '{token}'",
                    col + 1
                ));
                errors += 1;
            }
        }
    }

    if !frames.is_empty() {
        log.push("<source>: error: unterminated conditional directive".to_string());
        errors += 1;
    }

    if errors > 0 {
        log.push(format!("{errors} error(s) generated."));
        Err(log.join("\n"))
    } else {
        Ok(log.join("\n"))
    }
}

#[derive(Debug, Clone, Copy)]
struct CondFrame {
    parent_active: bool,
    taken: bool,
    active: bool,
}

impl CondFrame {
    fn open(parent_active: bool, cond: bool) -> Self {
        Self {
            parent_active,
            taken: cond,
            active: parent_active && cond,
        }
    }

    fn elif(&mut self, cond: bool) {
        if self.taken {
            self.active = false;
        } else {
            self.active = self.parent_active && cond;
            self.taken = cond;
        }
    }

    fn otherwise(&mut self) {
        self.active = self.parent_active && !self.taken;
        self.taken = true;
    }
}

/// Evaluate `defined(X)`, `defined X`, `!defined(X)`, integer literals and
/// bare names joined by `||` and `&&`.
fn eval_condition(expr: &str, defines: &FxHashSet<String>) -> bool {
    expr.split("||").any(|clause| {
        clause.split("&&").all(|term| {
            let term = term.trim();
            let (negated, term) = match term.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, term),
            };
            let value = if let Some(rest) = term.strip_prefix("defined") {
                let name = rest.trim().trim_start_matches('(').trim_end_matches(')').trim();
                defines.contains(name)
            } else if let Ok(n) = term.parse::<i64>() {
                n != 0
            } else {
                defines.contains(term)
            };
            value != negated
        })
    })
}

/// Replacement text of a `#define`, skipping a function-like parameter list
fn macro_body(after_name: &str) -> &str {
    let rest = match after_name.strip_prefix('(') {
        Some(params) => params.split_once(')').map_or("", |(_, body)| body),
        None => after_name,
    };
    rest.trim().trim_end_matches('\\').trim()
}

fn pragma_extension(rest: &str) -> Option<&str> {
    let rest = rest.strip_prefix("OPENCL")?.trim_start();
    let rest = rest.strip_prefix("EXTENSION")?.trim_start();
    rest.split(':').next().map(str::trim)
}

/// Byte column of `token` in `line` when it appears as a whole identifier
fn find_identifier(line: &str, token: &str) -> Option<usize> {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    let mut start = 0;
    while let Some(pos) = line[start..].find(token) {
        let at = start + pos;
        let before = line[..at].chars().next_back();
        let after = line[at + token.len()..].chars().next();
        if !before.is_some_and(is_ident) && !after.is_some_and(is_ident) {
            return Some(at);
        }
        start = at + token.len();
    }
    None
}

fn option_defines(options: &str) -> FxHashSet<String> {
    let mut defines = FxHashSet::default();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        let def = match token.strip_prefix("-D") {
            Some("") => tokens.next(),
            Some(def) => Some(def),
            None => None,
        };
        if let Some(def) = def {
            let name = def.split('=').next().unwrap_or(def);
            defines.insert(name.to_string());
        }
    }
    defines
}

fn requested_language_version(options: &str) -> Option<(u32, u32)> {
    options
        .split_whitespace()
        .find_map(|t| t.strip_prefix("-cl-std=CL"))
        .and_then(loose_version)
}

/// First `<digits>.<digits>` anywhere in `s`
fn loose_version(s: &str) -> Option<(u32, u32)> {
    let bytes = s.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if !b.is_ascii_digit() || (i > 0 && bytes[i - 1].is_ascii_digit()) {
            continue;
        }
        let major_end = i + bytes[i..].iter().take_while(|c| c.is_ascii_digit()).count();
        if bytes.get(major_end) != Some(&b'.') {
            continue;
        }
        let minor_len = bytes[major_end + 1..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .count();
        if minor_len == 0 {
            continue;
        }
        let major = s[i..major_end].parse().ok()?;
        let minor = s[major_end + 1..major_end + 1 + minor_len].parse().ok()?;
        return Some((major, minor));
    }
    None
}

fn declares_kernel(source: &str, entry_point: &str) -> bool {
    source.lines().any(|line| {
        let Some(void_at) = line.find("void ") else {
            return false;
        };
        if !line[..void_at].contains("kernel") {
            return false;
        }
        let rest = line[void_at + 5..].trim_start();
        rest.strip_prefix(entry_point)
            .is_some_and(|after| after.starts_with('(') || after.starts_with(char::is_whitespace))
    })
}

// === Simulated systems ===

/// One simulated platform and its devices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedPlatform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    #[serde(rename = "device")]
    pub devices: Vec<DeviceProfile>,
}

/// A set of simulated platforms, loadable from TOML
///
/// ```toml
/// [[platform]]
/// name = "Simulated Platform"
/// vendor = "tiercl"
/// version = "OpenCL 2.0"
///
/// [[platform.device]]
/// name = "sim-gpu"
/// version = "OpenCL 2.0 sim"
/// svm_capabilities = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSystem {
    #[serde(rename = "platform", default)]
    pub platforms: Vec<SimulatedPlatform>,
}

impl Default for SimulatedSystem {
    fn default() -> Self {
        Self {
            platforms: vec![SimulatedPlatform {
                name: "tiercl Simulated Platform".to_string(),
                vendor: "tiercl".to_string(),
                version: "OpenCL 2.0 tiercl-sim".to_string(),
                devices: vec![
                    DeviceProfile::opencl20(),
                    DeviceProfile::opencl12(),
                    DeviceProfile::unversioned(),
                ],
            }],
        }
    }
}

impl SimulatedSystem {
    pub fn from_toml_str(text: &str) -> Result<Self, RuntimeError> {
        toml::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Device profiles across all platforms, in enumeration order
    pub fn profiles(&self) -> impl Iterator<Item = &DeviceProfile> {
        self.platforms.iter().flat_map(|p| p.devices.iter())
    }

    /// Open a backend on the `index`-th device across all platforms
    pub fn backend(&self, index: usize) -> Option<SimulatedBackend> {
        self.profiles().nth(index).cloned().map(SimulatedBackend::new)
    }
}

impl DeviceSource for SimulatedSystem {
    fn platform_count(&self) -> DriverResult<usize> {
        Ok(self.platforms.len())
    }

    fn fill_platforms(&self, out: &mut [PlatformInfo]) -> DriverResult<usize> {
        for (slot, platform) in out.iter_mut().zip(&self.platforms) {
            *slot = PlatformInfo {
                name: platform.name.clone(),
                vendor: platform.vendor.clone(),
                version: platform.version.clone(),
            };
        }
        Ok(self.platforms.len())
    }

    fn device_count(&self, platform: usize) -> DriverResult<usize> {
        self.platforms
            .get(platform)
            .map(|p| p.devices.len())
            .ok_or(DriverError::new("clGetDeviceIDs", CL_INVALID_VALUE))
    }

    fn fill_devices(&self, platform: usize, out: &mut [DeviceRecord]) -> DriverResult<usize> {
        let platform = self
            .platforms
            .get(platform)
            .ok_or(DriverError::new("clGetDeviceIDs", CL_INVALID_VALUE))?;
        for (slot, profile) in out.iter_mut().zip(&platform.devices) {
            *slot = profile.record();
        }
        Ok(platform.devices.len())
    }
}
