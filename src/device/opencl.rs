//! OpenCL driver over `opencl3`

use super::{ComputeBackend, DeviceLimit, DeviceParam, KernelArg, SvmAllocFlags};
use crate::diagnostics::{DriverError, DriverResult, RuntimeError};
use crate::inventory::{DeviceKind, DeviceRecord, DeviceSource, PlatformInfo};
use crate::device::SvmCapabilities;
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{
    CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU, Device,
};
use opencl3::error_codes::ClError;
use opencl3::kernel::Kernel;
use opencl3::memory::{
    Buffer, CL_MAP_READ, CL_MAP_WRITE, CL_MEM_READ_WRITE, CL_MEM_SVM_ATOMICS, CL_MEM_SVM_FINE_GRAIN_BUFFER,
    CL_MEM_USE_HOST_PTR, ClMem,
};
use opencl3::platform::{Platform, get_platforms};
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_map_flags, cl_svm_mem_flags};
use std::ffi::c_void;
use std::ptr::NonNull;

fn cl_err(call: &'static str) -> impl Fn(ClError) -> DriverError {
    move |e| DriverError::new(call, e.0)
}

/// Driver flags for an SVM allocation request
fn svm_mem_flags(flags: SvmAllocFlags) -> cl_svm_mem_flags {
    let mut cl_flags: cl_svm_mem_flags = CL_MEM_READ_WRITE;
    if flags.contains(SvmAllocFlags::FINE_GRAIN_BUFFER) {
        cl_flags |= CL_MEM_SVM_FINE_GRAIN_BUFFER;
    }
    if flags.contains(SvmAllocFlags::ATOMICS) {
        cl_flags |= CL_MEM_SVM_ATOMICS;
    }
    cl_flags
}

/// Both map directions, as one blocking map needs
fn map_read_write() -> cl_map_flags {
    CL_MAP_READ | CL_MAP_WRITE
}

/// One OpenCL context bound to one device
pub struct OpenClBackend {
    device: Device,
    context: Context,
}

impl std::fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClBackend")
            .field("device", &self.device.name().unwrap_or_default())
            .finish()
    }
}

impl OpenClBackend {
    /// Open the `device`-th device of the `platform`-th platform
    pub fn open(platform: usize, device: usize) -> Result<Self, RuntimeError> {
        let platforms = get_platforms().map_err(cl_err("clGetPlatformIDs"))?;
        let platform = platforms
            .get(platform)
            .ok_or_else(|| RuntimeError::invalid(format!("no OpenCL platform #{platform}")))?;
        let ids = platform
            .get_devices(CL_DEVICE_TYPE_ALL)
            .map_err(cl_err("clGetDeviceIDs"))?;
        let id = *ids
            .get(device)
            .ok_or_else(|| RuntimeError::invalid(format!("no OpenCL device #{device}")))?;
        Self::from_device(Device::new(id))
    }

    pub fn from_device(device: Device) -> Result<Self, RuntimeError> {
        let context = Context::from_device(&device).map_err(cl_err("clCreateContext"))?;
        tracing::info!("OpenCL context created on {}", device.name().unwrap_or_default());
        Ok(Self { device, context })
    }

    pub fn create_queue(&self) -> DriverResult<CommandQueue> {
        CommandQueue::create_default_with_properties(&self.context, 0, 0)
            .map_err(cl_err("clCreateCommandQueueWithProperties"))
    }
}

impl ComputeBackend for OpenClBackend {
    type Queue = CommandQueue;
    type Program = Program;
    type Kernel = Kernel;
    type Mirror = Buffer<u8>;

    fn device_string(&self, param: DeviceParam) -> DriverResult<String> {
        let result = match param {
            DeviceParam::Name => self.device.name(),
            DeviceParam::Vendor => self.device.vendor(),
            DeviceParam::Version => self.device.version(),
            DeviceParam::Extensions => self.device.extensions(),
        };
        result.map_err(cl_err("clGetDeviceInfo"))
    }

    fn device_limit(&self, limit: DeviceLimit) -> DriverResult<u64> {
        let d = &self.device;
        let value = match limit {
            DeviceLimit::SvmCapabilities => Ok(d.svm_mem_capability()),
            DeviceLimit::MaxWorkGroupSize => d.max_work_group_size().map(|v| v as u64),
            DeviceLimit::MaxComputeUnits => d.max_compute_units().map(u64::from),
            DeviceLimit::MemBaseAddrAlign => d.mem_base_addr_align().map(u64::from),
            DeviceLimit::MaxMemAllocSize => d.max_mem_alloc_size(),
            DeviceLimit::GlobalMemSize => d.global_mem_size(),
        };
        value.map_err(cl_err("clGetDeviceInfo"))
    }

    fn create_program(&self, source: &str) -> DriverResult<Program> {
        Program::create_from_source(&self.context, source).map_err(cl_err("clCreateProgramWithSource"))
    }

    fn build_program(&self, program: &mut Program, options: &str) -> DriverResult<()> {
        program
            .build(&[self.device.id()], options)
            .map_err(cl_err("clBuildProgram"))
    }

    fn build_log(&self, program: &Program) -> DriverResult<String> {
        program
            .get_build_log(self.device.id())
            .map_err(cl_err("clGetProgramBuildInfo"))
    }

    fn create_kernel(&self, program: &Program, entry_point: &str) -> DriverResult<Kernel> {
        Kernel::create(program, entry_point).map_err(cl_err("clCreateKernel"))
    }

    fn release_program(&self, program: Program) {
        drop(program);
    }

    fn release_kernel(&self, kernel: Kernel) {
        drop(kernel);
    }

    fn set_kernel_arg(&self, kernel: &mut Kernel, index: u32, arg: &KernelArg<'_>) -> DriverResult<()> {
        // SAFETY: each pointer stays valid for the call; the driver copies
        // value arguments before returning.
        let result = unsafe {
            match arg {
                KernelArg::Value(bytes) => cl3::kernel::set_kernel_arg(
                    kernel.get(),
                    index,
                    bytes.len(),
                    bytes.as_ptr().cast::<c_void>(),
                ),
                KernelArg::Svm(ptr) => {
                    cl3::kernel::set_kernel_arg_svm_pointer(kernel.get(), index, ptr.as_ptr().cast::<c_void>())
                }
                KernelArg::Local(size) => {
                    cl3::kernel::set_kernel_arg(kernel.get(), index, *size, std::ptr::null())
                }
            }
        };
        result.map_err(|code| DriverError::new("clSetKernelArg", code))
    }

    fn enqueue_kernel(
        &self,
        queue: &CommandQueue,
        kernel: &Kernel,
        global: usize,
        local: Option<usize>,
    ) -> DriverResult<()> {
        let global = [global];
        let local = local.map(|l| [l]);
        let local_ptr = local.as_ref().map_or(std::ptr::null(), |l| l.as_ptr());
        // SAFETY: the size arrays outlive the call and describe one dimension.
        unsafe {
            queue
                .enqueue_nd_range_kernel(kernel.get(), 1, std::ptr::null(), global.as_ptr(), local_ptr, &[])
                .map(drop)
                .map_err(cl_err("clEnqueueNDRangeKernel"))
        }
    }

    fn finish(&self, queue: &CommandQueue) -> DriverResult<()> {
        queue.finish().map_err(cl_err("clFinish"))
    }

    fn svm_alloc(&self, flags: SvmAllocFlags, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let cl_flags = svm_mem_flags(flags);
        let alignment = u32::try_from(alignment).ok()?;
        // SAFETY: plain allocation call on a live context.
        let ptr = unsafe { cl3::memory::svm_alloc(self.context.get(), cl_flags, size, alignment) }.ok()?;
        NonNull::new(ptr.cast::<u8>())
    }

    unsafe fn svm_free(&self, ptr: NonNull<u8>) {
        // SAFETY: forwarded from the caller's contract.
        let _ = unsafe { cl3::memory::svm_free(self.context.get(), ptr.as_ptr().cast::<c_void>()) };
    }

    fn enqueue_svm_map(&self, queue: &CommandQueue, ptr: NonNull<u8>, size: usize) -> DriverResult<()> {
        // SAFETY: `ptr` addresses a live SVM region of `size` bytes.
        unsafe {
            let region = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            queue
                .enqueue_svm_map(CL_BLOCKING, map_read_write(), region, &[])
                .map(drop)
                .map_err(cl_err("clEnqueueSVMMap"))
        }
    }

    fn enqueue_svm_unmap(&self, queue: &CommandQueue, ptr: NonNull<u8>, size: usize) -> DriverResult<()> {
        // SAFETY: as for map.
        unsafe {
            let region = std::slice::from_raw_parts(ptr.as_ptr(), size);
            queue
                .enqueue_svm_unmap(region, &[])
                .map_err(cl_err("clEnqueueSVMUnmap"))?;
        }
        queue.finish().map_err(cl_err("clFinish"))
    }

    unsafe fn create_mirror(&self, host: NonNull<u8>, size: usize) -> DriverResult<Buffer<u8>> {
        // SAFETY: the caller keeps `host` valid for `size` bytes until release.
        unsafe {
            Buffer::<u8>::create(
                &self.context,
                CL_MEM_READ_WRITE | CL_MEM_USE_HOST_PTR,
                size,
                host.as_ptr().cast::<c_void>(),
            )
        }
        .map_err(cl_err("clCreateBuffer"))
    }

    fn release_mirror(&self, mirror: Buffer<u8>) {
        drop(mirror);
    }

    fn mirror_arg(&self, mirror: &Buffer<u8>) -> Vec<u8> {
        (mirror.get() as usize).to_ne_bytes().to_vec()
    }

    fn enqueue_write_mirror(&self, queue: &CommandQueue, mirror: &mut Buffer<u8>, src: &[u8]) -> DriverResult<()> {
        // SAFETY: blocking write from a live slice.
        unsafe {
            queue
                .enqueue_write_buffer(mirror, CL_BLOCKING, 0, src, &[])
                .map(drop)
                .map_err(cl_err("clEnqueueWriteBuffer"))
        }
    }

    fn enqueue_read_mirror(&self, queue: &CommandQueue, mirror: &Buffer<u8>, dst: &mut [u8]) -> DriverResult<()> {
        // SAFETY: blocking read into a live slice.
        unsafe {
            queue
                .enqueue_read_buffer(mirror, CL_BLOCKING, 0, dst, &[])
                .map(drop)
                .map_err(cl_err("clEnqueueReadBuffer"))
        }
    }
}

/// Installed OpenCL platforms as a [`DeviceSource`]
#[derive(Debug, Default)]
pub struct OpenClSystem;

impl OpenClSystem {
    fn platforms() -> DriverResult<Vec<Platform>> {
        get_platforms().map_err(cl_err("clGetPlatformIDs"))
    }

    fn device_ids(platform: usize) -> DriverResult<Vec<Device>> {
        let platforms = Self::platforms()?;
        let platform = platforms
            .get(platform)
            .ok_or(DriverError::new("clGetDeviceIDs", -32))?;
        let ids = platform
            .get_devices(CL_DEVICE_TYPE_ALL)
            .map_err(cl_err("clGetDeviceIDs"))?;
        Ok(ids.into_iter().map(Device::new).collect())
    }

    fn record(device: &Device) -> DeviceRecord {
        let kind = match device.dev_type().unwrap_or(0) {
            t if t & CL_DEVICE_TYPE_GPU != 0 => DeviceKind::Gpu,
            t if t & CL_DEVICE_TYPE_CPU != 0 => DeviceKind::Cpu,
            t if t & CL_DEVICE_TYPE_ACCELERATOR != 0 => DeviceKind::Accelerator,
            _ => DeviceKind::Other,
        };
        DeviceRecord {
            name: device.name().unwrap_or_default(),
            vendor: device.vendor().unwrap_or_default(),
            kind,
            version: device.version().unwrap_or_default(),
            extensions: device.extensions().unwrap_or_default(),
            svm_capabilities: SvmCapabilities(device.svm_mem_capability()),
            global_mem_size: device.global_mem_size().unwrap_or(0),
            compute_units: device.max_compute_units().map(u64::from).unwrap_or(0),
            max_work_group_size: device.max_work_group_size().map(|v| v as u64).unwrap_or(0),
        }
    }
}

impl DeviceSource for OpenClSystem {
    fn platform_count(&self) -> DriverResult<usize> {
        Ok(Self::platforms()?.len())
    }

    fn fill_platforms(&self, out: &mut [PlatformInfo]) -> DriverResult<usize> {
        let platforms = Self::platforms()?;
        for (slot, platform) in out.iter_mut().zip(&platforms) {
            *slot = PlatformInfo {
                name: platform.name().unwrap_or_default(),
                vendor: platform.vendor().unwrap_or_default(),
                version: platform.version().unwrap_or_default(),
            };
        }
        Ok(platforms.len())
    }

    fn device_count(&self, platform: usize) -> DriverResult<usize> {
        Ok(Self::device_ids(platform)?.len())
    }

    fn fill_devices(&self, platform: usize, out: &mut [DeviceRecord]) -> DriverResult<usize> {
        let devices = Self::device_ids(platform)?;
        for (slot, device) in out.iter_mut().zip(&devices) {
            *slot = Self::record(device);
        }
        Ok(devices.len())
    }
}
