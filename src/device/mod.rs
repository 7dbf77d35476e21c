//! Compute device abstraction
//!
//! Everything the runtime needs from a driver goes through
//! [`ComputeBackend`]. A backend value stands for one compute context bound
//! to one device; command queues are created by the caller and passed in.
//!
//! Backends:
//! - [`simulated`]: in-process software device, always available
//! - `opencl`: OpenCL via `opencl3` (feature `opencl`)

pub mod simulated;

#[cfg(feature = "opencl")]
pub mod opencl;

use crate::diagnostics::DriverResult;
use std::fmt;
use std::ops::BitOr;
use std::ptr::NonNull;

pub use simulated::{DeviceProfile, SimCounters, SimulatedBackend, SimulatedSystem};

/// String-valued device queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceParam {
    Name,
    Vendor,
    Version,
    Extensions,
}

/// Numeric device queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLimit {
    /// Raw shared virtual memory capability bitmask
    SvmCapabilities,
    MaxWorkGroupSize,
    MaxComputeUnits,
    /// Base address alignment, in bits
    MemBaseAddrAlign,
    MaxMemAllocSize,
    GlobalMemSize,
}

/// Raw shared virtual memory capability bits reported by a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SvmCapabilities(pub u64);

impl SvmCapabilities {
    pub const NONE: Self = Self(0);
    pub const COARSE_GRAIN_BUFFER: Self = Self(1 << 0);
    pub const FINE_GRAIN_BUFFER: Self = Self(1 << 1);
    pub const FINE_GRAIN_SYSTEM: Self = Self(1 << 2);
    pub const ATOMICS: Self = Self(1 << 3);

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SvmCapabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for SvmCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Flags passed to a native shared memory allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmAllocFlags(pub u64);

impl SvmAllocFlags {
    pub const READ_WRITE: Self = Self(1 << 0);
    pub const FINE_GRAIN_BUFFER: Self = Self(1 << 10);
    pub const ATOMICS: Self = Self(1 << 11);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SvmAllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Primitive numbers that can be passed to a kernel by value.
///
/// Sealed: every implementor has no padding and accepts any bit pattern.
pub trait Scalar: Copy + sealed::Sealed {
    /// Decode from exactly `size_of::<Self>()` native-endian bytes
    fn from_ne_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}

        impl Scalar for $t {
            fn from_ne_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(<$t>::from_ne_bytes)
            }
        }
    )*};
}

impl_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize, f32, f64);

/// One kernel argument, bound at the position it occupies in the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg<'a> {
    /// Plain value: the bytes are copied into the argument slot
    Value(&'a [u8]),
    /// Shared virtual memory pointer
    Svm(NonNull<u8>),
    /// Work-group local scratch of the given byte size
    Local(usize),
}

impl<'a> KernelArg<'a> {
    /// Bind a primitive number by its bytes
    ///
    /// ```compile_fail
    /// let flag = true;
    /// let _ = tiercl::device::KernelArg::scalar(&flag);
    /// ```
    pub fn scalar<T: Scalar>(value: &'a T) -> Self {
        // SAFETY: `Scalar` types have no padding, so every byte of the value
        // is initialized for the lifetime of the borrow.
        let bytes = unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
        };
        KernelArg::Value(bytes)
    }

    /// Byte size of the argument slot
    pub fn size(&self) -> usize {
        match self {
            KernelArg::Value(bytes) => bytes.len(),
            KernelArg::Svm(_) => std::mem::size_of::<*mut u8>(),
            KernelArg::Local(size) => *size,
        }
    }
}

/// A compute context bound to a single device
///
/// Implementations are driven from one thread; the runtime types that hold a
/// backend are deliberately `!Send` and `!Sync`.
pub trait ComputeBackend {
    /// Command queue on this context
    type Queue;
    /// Program object built from source
    type Program;
    /// Kernel object created from a built program
    type Kernel;
    /// Device buffer mirroring a host block on the emulated SVM path
    type Mirror;

    // === Device queries ===

    fn device_string(&self, param: DeviceParam) -> DriverResult<String>;

    fn device_limit(&self, limit: DeviceLimit) -> DriverResult<u64>;

    // === Programs and kernels ===

    fn create_program(&self, source: &str) -> DriverResult<Self::Program>;

    fn build_program(&self, program: &mut Self::Program, options: &str) -> DriverResult<()>;

    fn build_log(&self, program: &Self::Program) -> DriverResult<String>;

    fn create_kernel(&self, program: &Self::Program, entry_point: &str) -> DriverResult<Self::Kernel>;

    fn release_program(&self, program: Self::Program);

    fn release_kernel(&self, kernel: Self::Kernel);

    fn set_kernel_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: &KernelArg<'_>) -> DriverResult<()>;

    /// Enqueue a one-dimensional launch
    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global: usize,
        local: Option<usize>,
    ) -> DriverResult<()>;

    /// Block until every command on `queue` has completed
    fn finish(&self, queue: &Self::Queue) -> DriverResult<()>;

    // === Native shared virtual memory ===

    fn svm_alloc(&self, flags: SvmAllocFlags, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must have been returned by [`ComputeBackend::svm_alloc`] on this
    /// backend and not freed since.
    unsafe fn svm_free(&self, ptr: NonNull<u8>);

    /// Blocking map of a coarse-grained region for host access
    fn enqueue_svm_map(&self, queue: &Self::Queue, ptr: NonNull<u8>, size: usize) -> DriverResult<()>;

    fn enqueue_svm_unmap(&self, queue: &Self::Queue, ptr: NonNull<u8>, size: usize) -> DriverResult<()>;

    // === Emulated shared memory mirrors ===

    /// Create a device buffer over `size` bytes of host memory at `host`.
    ///
    /// # Safety
    /// `host` must stay valid for `size` bytes until the mirror is released.
    unsafe fn create_mirror(&self, host: NonNull<u8>, size: usize) -> DriverResult<Self::Mirror>;

    fn release_mirror(&self, mirror: Self::Mirror);

    /// Bytes that bind `mirror` as a kernel argument
    fn mirror_arg(&self, mirror: &Self::Mirror) -> Vec<u8>;

    /// Blocking host-to-device copy into the mirror
    fn enqueue_write_mirror(&self, queue: &Self::Queue, mirror: &mut Self::Mirror, src: &[u8]) -> DriverResult<()>;

    /// Blocking device-to-host copy out of the mirror
    fn enqueue_read_mirror(&self, queue: &Self::Queue, mirror: &Self::Mirror, dst: &mut [u8]) -> DriverResult<()>;
}

/// Parse `"<API> <major>.<minor>..."`
///
/// Returns `None` unless the second whitespace-separated token starts with
/// two dot-separated integers.
pub fn parse_api_version(version: &str) -> Option<(u32, u32)> {
    let mut tokens = version.split_whitespace();
    let _api = tokens.next()?;
    let number = tokens.next()?;
    let (major, rest) = number.split_once('.')?;
    let minor_digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let major = major.parse().ok()?;
    let minor = minor_digits.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_version() {
        assert_eq!(parse_api_version("OpenCL 2.0 AMD-APP (3444.0)"), Some((2, 0)));
        assert_eq!(parse_api_version("OpenCL 1.2 CUDA"), Some((1, 2)));
        assert_eq!(parse_api_version("OpenCL 3.0"), Some((3, 0)));
    }

    #[test]
    fn test_parse_api_version_rejects_malformed() {
        assert_eq!(parse_api_version("1.1"), None);
        assert_eq!(parse_api_version("OpenCL"), None);
        assert_eq!(parse_api_version("OpenCL two.one"), None);
        assert_eq!(parse_api_version("OpenCL 2"), None);
        assert_eq!(parse_api_version(""), None);
    }

    #[test]
    fn test_svm_capability_bits() {
        let caps = SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::ATOMICS;
        assert!(caps.contains(SvmCapabilities::ATOMICS));
        assert!(!caps.contains(SvmCapabilities::FINE_GRAIN_BUFFER));
        assert_eq!(caps.bits(), 0b1001);
        assert_eq!(caps.to_string(), "0x00000009");
    }

    #[test]
    fn test_scalar_arg_bytes() {
        let n: i32 = 0x0102_0304;
        let arg = KernelArg::scalar(&n);
        assert_eq!(arg.size(), 4);
        assert_eq!(arg, KernelArg::Value(&n.to_ne_bytes()));
    }

    #[test]
    fn test_scalar_decoding_checks_width() {
        let bytes = 0x0a0b_0c0du32.to_ne_bytes();
        assert_eq!(u32::from_ne_slice(&bytes), Some(0x0a0b_0c0d));
        assert_eq!(i32::from_ne_slice(&bytes), Some(0x0a0b_0c0d));
        assert_eq!(u64::from_ne_slice(&bytes), None);
        assert_eq!(u8::from_ne_slice(&bytes), None);
        assert_eq!(f64::from_ne_slice(&2.5f64.to_ne_bytes()), Some(2.5));
    }
}
