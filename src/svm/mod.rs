//! Capability-tiered shared virtual memory
//!
//! An [`SvmContext`] serves allocations through the richest sharing the
//! device supports. Devices without usable native sharing get the emulated
//! path: an aligned host block plus a device buffer that mirrors it. On that
//! path the device only sees host writes after [`SvmContext::unmap`], and the
//! host only sees device writes after [`SvmContext::sync_to_host`].
//!
//! Like the kernel manager, a context is confined to one thread.

pub mod host;
pub mod level;
pub mod table;

pub use host::{AlignedBlock, align_up};
pub use level::{SvmFlags, SvmLevel, SvmProbe, classify};
pub use table::GrowableTable;

use crate::config::SvmConfig;
use crate::device::{ComputeBackend, KernelArg, SvmAllocFlags};
use crate::diagnostics::RuntimeError;
use serde::Serialize;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

enum Backing<B: ComputeBackend> {
    Native,
    Emulated {
        host: AlignedBlock,
        mirror: B::Mirror,
        mirror_arg: Vec<u8>,
    },
}

/// One live allocation
pub struct SvmDescriptor<B: ComputeBackend> {
    ptr: NonNull<u8>,
    size: usize,
    requested: usize,
    flags: SvmFlags,
    level: SvmLevel,
    context_id: u64,
    ref_count: u32,
    mapped: bool,
    backing: Backing<B>,
}

impl<B: ComputeBackend> SvmDescriptor<B> {
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Aligned size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn requested_size(&self) -> usize {
        self.requested
    }

    pub fn flags(&self) -> SvmFlags {
        self.flags
    }

    pub fn level(&self) -> SvmLevel {
        self.level
    }

    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn is_emulated(&self) -> bool {
        matches!(self.backing, Backing::Emulated { .. })
    }

    /// Device buffer behind an emulated allocation
    pub fn mirror(&self) -> Option<&B::Mirror> {
        match &self.backing {
            Backing::Emulated { mirror, .. } => Some(mirror),
            Backing::Native => None,
        }
    }

    fn release(self, backend: &B) {
        match self.backing {
            Backing::Native => {
                // SAFETY: native descriptors hold a pointer from `svm_alloc`
                // on this backend, released exactly once here.
                unsafe { backend.svm_free(self.ptr) };
            }
            Backing::Emulated { host, mirror, .. } => {
                backend.release_mirror(mirror);
                drop(host);
            }
        }
    }
}

/// Aggregate allocation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SvmStats {
    pub level: Option<SvmLevel>,
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub live_descriptors: usize,
    pub table_capacity: usize,
}

/// Shared-memory allocator for one device
pub struct SvmContext<B: ComputeBackend> {
    id: u64,
    backend: Rc<B>,
    level: SvmLevel,
    capabilities: crate::device::SvmCapabilities,
    atomics: bool,
    alignment: usize,
    max_alloc: usize,
    table: GrowableTable<SvmDescriptor<B>>,
    current_bytes: usize,
    peak_bytes: usize,
    alloc_count: u64,
    free_count: u64,
}

impl<B: ComputeBackend> SvmContext<B> {
    pub fn new(backend: Rc<B>, config: &SvmConfig) -> Result<Self, RuntimeError> {
        let probe = SvmProbe::run(backend.as_ref());
        let level = match config.force_level {
            Some(forced) => {
                tracing::info!("SVM level forced to {} (probed {})", forced, probe.level);
                forced
            }
            None => probe.level,
        };
        let alignment = normalize_alignment(probe.alignment, config.default_alignment);
        let max_alloc = if probe.max_alloc == 0 {
            usize::MAX
        } else {
            probe.max_alloc
        };
        let table = GrowableTable::with_capacity("descriptor", config.descriptor_capacity)?;

        tracing::info!(
            "SVM context: level={}, caps={}, atomics={}, alignment={} bytes",
            level,
            probe.capabilities,
            probe.atomics,
            alignment
        );

        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            level,
            capabilities: probe.capabilities,
            atomics: probe.atomics,
            alignment,
            max_alloc,
            table,
            current_bytes: 0,
            peak_bytes: 0,
            alloc_count: 0,
            free_count: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> SvmLevel {
        self.level
    }

    pub fn capabilities(&self) -> crate::device::SvmCapabilities {
        self.capabilities
    }

    pub fn supports_atomics(&self) -> bool {
        self.atomics
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn max_alloc(&self) -> usize {
        self.max_alloc
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn live_count(&self) -> usize {
        self.table.len()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &SvmDescriptor<B>> {
        self.table.iter()
    }

    pub fn descriptor(&self, ptr: NonNull<u8>) -> Option<&SvmDescriptor<B>> {
        self.table
            .position(|d| d.ptr == ptr)
            .and_then(|i| self.table.get(i))
    }

    /// Allocate at least `size` bytes; the stored size is aligned up
    pub fn alloc(&mut self, size: usize, flags: SvmFlags) -> Result<NonNull<u8>, RuntimeError> {
        if size == 0 {
            return Err(RuntimeError::invalid("allocation size is zero"));
        }
        let aligned = align_up(size, self.alignment)
            .filter(|a| *a <= self.max_alloc)
            .ok_or(RuntimeError::AllocationTooLarge {
                size,
                max: self.max_alloc,
            })?;
        self.table.reserve_one()?;

        let (ptr, backing, mapped) = if self.level.is_native() {
            let ptr = self.alloc_native(aligned, flags)?;
            (ptr, Backing::Native, true)
        } else {
            let (ptr, backing) = self.alloc_emulated(aligned)?;
            (ptr, backing, false)
        };

        let descriptor = SvmDescriptor {
            ptr,
            size: aligned,
            requested: size,
            flags,
            level: self.level,
            context_id: self.id,
            ref_count: 1,
            mapped,
            backing,
        };
        if self.table.position(|d| d.ptr == ptr).is_some() {
            descriptor.release(self.backend.as_ref());
            return Err(RuntimeError::DuplicatePointer {
                ptr: ptr.as_ptr() as usize,
            });
        }
        self.table.push(descriptor)?;

        self.current_bytes += aligned;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
        self.alloc_count += 1;
        tracing::debug!(
            "SVM alloc {:p}: {} bytes ({} requested, {})",
            ptr.as_ptr(),
            aligned,
            size,
            self.level
        );
        Ok(ptr)
    }

    fn alloc_native(&self, size: usize, flags: SvmFlags) -> Result<NonNull<u8>, RuntimeError> {
        let mut driver_flags = SvmAllocFlags::READ_WRITE;
        if self.level >= SvmLevel::FineGrain {
            driver_flags = driver_flags | SvmAllocFlags::FINE_GRAIN_BUFFER;
        }
        if self.atomics && flags.contains(SvmFlags::ATOMIC) {
            driver_flags = driver_flags | SvmAllocFlags::ATOMICS;
        }
        self.backend
            .svm_alloc(driver_flags, size, self.alignment)
            .ok_or(RuntimeError::AllocationFailed {
                size,
                level: self.level,
            })
    }

    fn alloc_emulated(&self, size: usize) -> Result<(NonNull<u8>, Backing<B>), RuntimeError> {
        let failed = || RuntimeError::AllocationFailed {
            size,
            level: SvmLevel::Emulated,
        };
        let host = AlignedBlock::zeroed(size, self.alignment).ok_or_else(failed)?;
        let ptr = host.as_ptr();
        // SAFETY: the mirror is released before `host` in `SvmDescriptor::release`.
        let mirror = match unsafe { self.backend.create_mirror(ptr, size) } {
            Ok(mirror) => mirror,
            Err(err) => {
                tracing::warn!("Mirror buffer creation failed: {}", err);
                drop(host);
                return Err(failed());
            }
        };
        let mirror_arg = self.backend.mirror_arg(&mirror);
        Ok((
            ptr,
            Backing::Emulated {
                host,
                mirror,
                mirror_arg,
            },
        ))
    }

    /// Add a reference to a live allocation; returns the new count
    pub fn retain(&mut self, ptr: NonNull<u8>) -> Result<u32, RuntimeError> {
        let descriptor = self.find_mut(ptr)?;
        descriptor.ref_count = descriptor
            .ref_count
            .checked_add(1)
            .ok_or(RuntimeError::RefCountOverflow {
                ptr: ptr.as_ptr() as usize,
            })?;
        Ok(descriptor.ref_count)
    }

    /// Drop one reference; the memory is released with the last one
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), RuntimeError> {
        let index = self.index_of(ptr)?;
        let remaining = match self.table.get_mut(index) {
            Some(descriptor) => {
                descriptor.ref_count = descriptor.ref_count.saturating_sub(1);
                descriptor.ref_count
            }
            None => return Err(not_found(ptr)),
        };
        if remaining > 0 {
            return Ok(());
        }

        let descriptor = self.table.swap_remove(index).ok_or_else(|| not_found(ptr))?;
        let size = descriptor.size;
        descriptor.release(self.backend.as_ref());
        self.current_bytes -= size;
        self.free_count += 1;
        tracing::debug!("SVM free {:p}: {} bytes", ptr.as_ptr(), size);
        Ok(())
    }

    /// Make an allocation host-accessible
    pub fn map(&mut self, ptr: NonNull<u8>, queue: &B::Queue) -> Result<(), RuntimeError> {
        let level = self.level;
        let backend = Rc::clone(&self.backend);
        let descriptor = self.find_mut(ptr)?;
        match level {
            SvmLevel::FineGrain | SvmLevel::FineGrainSystem => Ok(()),
            SvmLevel::CoarseGrain => {
                if !descriptor.mapped {
                    backend
                        .enqueue_svm_map(queue, ptr, descriptor.size)
                        .map_err(|source| sync_error(ptr, source))?;
                    descriptor.mapped = true;
                }
                Ok(())
            }
            SvmLevel::None | SvmLevel::Emulated => {
                descriptor.mapped = true;
                Ok(())
            }
        }
    }

    /// Hand an allocation back to the device.
    ///
    /// On the emulated path this copies the host block into the mirror
    /// buffer, whatever the mapped state.
    pub fn unmap(&mut self, ptr: NonNull<u8>, queue: &B::Queue) -> Result<(), RuntimeError> {
        let level = self.level;
        let backend = Rc::clone(&self.backend);
        let descriptor = self.find_mut(ptr)?;
        match (&mut descriptor.backing, level) {
            (Backing::Emulated { host, mirror, .. }, _) => {
                backend
                    .enqueue_write_mirror(queue, mirror, host.as_slice())
                    .map_err(|source| sync_error(ptr, source))?;
                descriptor.mapped = false;
            }
            (Backing::Native, SvmLevel::CoarseGrain) => {
                if descriptor.mapped {
                    backend
                        .enqueue_svm_unmap(queue, ptr, descriptor.size)
                        .map_err(|source| sync_error(ptr, source))?;
                    descriptor.mapped = false;
                }
            }
            (Backing::Native, _) => {}
        }
        Ok(())
    }

    /// Make device writes visible to the host
    pub fn sync_to_host(&mut self, ptr: NonNull<u8>, queue: &B::Queue) -> Result<(), RuntimeError> {
        let level = self.level;
        let backend = Rc::clone(&self.backend);
        let descriptor = self.find_mut(ptr)?;
        match (&mut descriptor.backing, level) {
            (Backing::Emulated { host, mirror, .. }, _) => {
                backend
                    .enqueue_read_mirror(queue, mirror, host.as_mut_slice())
                    .map_err(|source| sync_error(ptr, source))?;
            }
            (Backing::Native, SvmLevel::CoarseGrain) => {
                if !descriptor.mapped {
                    backend
                        .enqueue_svm_map(queue, ptr, descriptor.size)
                        .map_err(|source| sync_error(ptr, source))?;
                    descriptor.mapped = true;
                }
            }
            (Backing::Native, _) => {}
        }
        Ok(())
    }

    /// Kernel argument that binds an allocation
    pub fn kernel_arg(&self, ptr: NonNull<u8>) -> Result<KernelArg<'_>, RuntimeError> {
        let descriptor = self.descriptor(ptr).ok_or_else(|| not_found(ptr))?;
        Ok(match &descriptor.backing {
            Backing::Native => KernelArg::Svm(ptr),
            Backing::Emulated { mirror_arg, .. } => KernelArg::Value(mirror_arg),
        })
    }

    pub fn stats(&self) -> SvmStats {
        SvmStats {
            level: Some(self.level),
            current_bytes: self.current_bytes,
            peak_bytes: self.peak_bytes,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
            live_descriptors: self.table.len(),
            table_capacity: self.table.capacity(),
        }
    }

    /// Release every remaining allocation and log cumulative statistics
    pub fn destroy(mut self) -> SvmStats {
        let leaked = self.release_all();
        let stats = self.stats();
        tracing::info!(
            "SVM context destroyed: {} allocs, {} frees, peak {} bytes, {} released at teardown",
            stats.alloc_count,
            stats.free_count,
            stats.peak_bytes,
            leaked
        );
        stats
    }

    fn release_all(&mut self) -> usize {
        let mut released = 0;
        while let Some(descriptor) = self.table.pop() {
            self.current_bytes -= descriptor.size;
            self.free_count += 1;
            descriptor.release(self.backend.as_ref());
            released += 1;
        }
        released
    }

    fn index_of(&self, ptr: NonNull<u8>) -> Result<usize, RuntimeError> {
        self.table
            .position(|d| d.ptr == ptr)
            .ok_or_else(|| not_found(ptr))
    }

    fn find_mut(&mut self, ptr: NonNull<u8>) -> Result<&mut SvmDescriptor<B>, RuntimeError> {
        let index = self.index_of(ptr)?;
        self.table.get_mut(index).ok_or_else(|| not_found(ptr))
    }
}

impl<B: ComputeBackend> Drop for SvmContext<B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn not_found(ptr: NonNull<u8>) -> RuntimeError {
    RuntimeError::NotFound {
        ptr: ptr.as_ptr() as usize,
    }
}

fn sync_error(ptr: NonNull<u8>, source: crate::diagnostics::DriverError) -> RuntimeError {
    RuntimeError::Sync {
        ptr: ptr.as_ptr() as usize,
        source,
    }
}

/// Device alignment if usable, else the configured default, as a power of two
fn normalize_alignment(device: usize, default: usize) -> usize {
    let alignment = if device == 0 { default.max(1) } else { device };
    alignment.checked_next_power_of_two().unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProfile, SimulatedBackend, SvmCapabilities};

    fn context(profile: DeviceProfile) -> (Rc<SimulatedBackend>, SvmContext<SimulatedBackend>) {
        let backend = Rc::new(SimulatedBackend::new(profile));
        let ctx = SvmContext::new(backend.clone(), &SvmConfig::default()).expect("should create");
        (backend, ctx)
    }

    #[test]
    fn test_normalize_alignment() {
        assert_eq!(normalize_alignment(0, 64), 64);
        assert_eq!(normalize_alignment(128, 64), 128);
        assert_eq!(normalize_alignment(48, 64), 64);
        assert_eq!(normalize_alignment(0, 0), 1);
    }

    #[test]
    fn test_alignment_from_device_bits() {
        let (_, ctx) = context(DeviceProfile::opencl20());
        assert_eq!(ctx.alignment(), 128);
        let (_, ctx) = context(DeviceProfile {
            mem_base_addr_align: 0,
            ..DeviceProfile::opencl20()
        });
        assert_eq!(ctx.alignment(), 64);
    }

    #[test]
    fn test_native_alloc_requests_atomics_only_when_supported() {
        let caps = SvmCapabilities::FINE_GRAIN_BUFFER | SvmCapabilities::ATOMICS;
        let (backend, mut ctx) = context(DeviceProfile::opencl20().with_svm(caps));
        assert_eq!(ctx.level(), SvmLevel::FineGrain);

        let plain = ctx.alloc(16, SvmFlags::READ_WRITE).expect("alloc");
        let atomic = ctx
            .alloc(16, SvmFlags::READ_WRITE | SvmFlags::ATOMIC)
            .expect("alloc");
        let plain_flags = backend.svm_flags(plain).expect("tracked");
        let atomic_flags = backend.svm_flags(atomic).expect("tracked");
        assert!(plain_flags.contains(SvmAllocFlags::FINE_GRAIN_BUFFER));
        assert!(!plain_flags.contains(SvmAllocFlags::ATOMICS));
        assert!(atomic_flags.contains(SvmAllocFlags::ATOMICS));

        let (backend, mut ctx) =
            context(DeviceProfile::opencl20().with_svm(SvmCapabilities::COARSE_GRAIN_BUFFER));
        let ptr = ctx
            .alloc(16, SvmFlags::READ_WRITE | SvmFlags::ATOMIC)
            .expect("alloc");
        let flags = backend.svm_flags(ptr).expect("tracked");
        assert!(!flags.contains(SvmAllocFlags::ATOMICS));
        assert!(!flags.contains(SvmAllocFlags::FINE_GRAIN_BUFFER));
        assert!(ctx.descriptor(ptr).expect("live").is_mapped());
    }

    #[test]
    fn test_mirror_failure_releases_host_block() {
        let (backend, mut ctx) = context(DeviceProfile {
            fail_mirror_creation: true,
            ..DeviceProfile::opencl11()
        });
        let err = ctx.alloc(100, SvmFlags::READ_WRITE).unwrap_err();
        assert!(matches!(err, RuntimeError::AllocationFailed { .. }));
        assert_eq!(ctx.stats().current_bytes, 0);
        assert_eq!(ctx.live_count(), 0);
        assert_eq!(backend.counters().live_mirrors(), 0);
    }

    #[test]
    fn test_retain_delays_release() {
        let (backend, mut ctx) = context(DeviceProfile::opencl11());
        let ptr = ctx.alloc(10, SvmFlags::READ_WRITE).expect("alloc");
        assert_eq!(ctx.retain(ptr).expect("retain"), 2);
        ctx.free(ptr).expect("first free");
        assert_eq!(ctx.live_count(), 1);
        assert_eq!(backend.counters().live_mirrors(), 1);
        ctx.free(ptr).expect("second free");
        assert_eq!(ctx.live_count(), 0);
        assert_eq!(backend.counters().live_mirrors(), 0);
        assert!(matches!(ctx.free(ptr), Err(RuntimeError::NotFound { .. })));
    }

    #[test]
    fn test_coarse_map_only_on_state_change() {
        let (backend, mut ctx) =
            context(DeviceProfile::opencl20().with_svm(SvmCapabilities::COARSE_GRAIN_BUFFER));
        let queue = backend.create_queue();
        let ptr = ctx.alloc(64, SvmFlags::READ_WRITE).expect("alloc");

        ctx.map(ptr, &queue).expect("map while mapped");
        assert_eq!(backend.counters().svm_maps, 0);
        ctx.unmap(ptr, &queue).expect("unmap");
        ctx.unmap(ptr, &queue).expect("unmap again");
        assert_eq!(backend.counters().svm_unmaps, 1);
        ctx.map(ptr, &queue).expect("map");
        assert_eq!(backend.counters().svm_maps, 1);
    }

    #[test]
    fn test_drop_releases_everything() {
        let backend = Rc::new(SimulatedBackend::new(DeviceProfile::opencl11()));
        {
            let mut ctx = SvmContext::new(backend.clone(), &SvmConfig::default()).expect("ctx");
            let ptr = ctx.alloc(8, SvmFlags::READ_WRITE).expect("alloc");
            ctx.retain(ptr).expect("retain");
            ctx.alloc(8, SvmFlags::READ_WRITE).expect("alloc");
        }
        assert_eq!(backend.counters().live_mirrors(), 0);
    }
}
