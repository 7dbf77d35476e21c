//! Source synthesis for kernel variants
//!
//! A variant's source is the tier header, the portability blocks, and the
//! caller's kernel text, in that order. Kernel code written against the
//! `RIX_*` vocabulary builds unchanged on every tier.

use super::caps::DeviceCapabilities;
use super::strategy::StrategyTier;
use std::fmt::Write;

/// Tier-neutral atomic add / increment / compare-and-swap
pub const ATOMIC_BLOCK: &str = "\
// tiercl atomic operations
#if defined(RIX_TIER_NATIVE)
  #define RIX_ATOMIC_ADD(ptr, val) atomic_fetch_add_explicit(ptr, val, memory_order_relaxed)
  #define RIX_ATOMIC_INC(ptr) atomic_fetch_add_explicit(ptr, 1, memory_order_relaxed)
  #define RIX_ATOMIC_CAS(ptr, expected, desired) atomic_compare_exchange_weak_explicit(ptr, &expected, desired, memory_order_relaxed, memory_order_relaxed)
#elif defined(RIX_TIER_EXTENSION)
  #pragma OPENCL EXTENSION cl_khr_global_int32_base_atomics : enable
  #pragma OPENCL EXTENSION cl_khr_global_int32_extended_atomics : enable
  #define RIX_ATOMIC_ADD(ptr, val) atomic_add(ptr, val)
  #define RIX_ATOMIC_INC(ptr) atomic_inc(ptr)
  #define RIX_ATOMIC_CAS(ptr, expected, desired) atomic_cmpxchg(ptr, expected, desired)
#else
  // work-group barriers around plain read-modify-write
  #define RIX_ATOMIC_ADD(ptr, val) do { barrier(CLK_GLOBAL_MEM_FENCE); *(ptr) += (val); barrier(CLK_GLOBAL_MEM_FENCE); } while (0)
  #define RIX_ATOMIC_INC(ptr) do { barrier(CLK_GLOBAL_MEM_FENCE); (*(ptr))++; barrier(CLK_GLOBAL_MEM_FENCE); } while (0)
  int rix_cas_int(__global int* ptr, int expected, int desired) {
    barrier(CLK_GLOBAL_MEM_FENCE);
    int old = *ptr;
    if (old == expected) *ptr = desired;
    barrier(CLK_GLOBAL_MEM_FENCE);
    return old;
  }
  #define RIX_ATOMIC_CAS(ptr, expected, desired) rix_cas_int(ptr, expected, desired)
#endif

";

/// Tier-neutral global pointer and memory fence
pub const MEMORY_BLOCK: &str = "\
// tiercl memory operations
#ifdef RIX_SVM_SUPPORT
  #define RIX_GLOBAL_PTR(type) __global type*
  #define RIX_MEM_FENCE() mem_fence(CLK_GLOBAL_MEM_FENCE | CLK_LOCAL_MEM_FENCE)
#else
  #define RIX_GLOBAL_PTR(type) __global type*
  #define RIX_MEM_FENCE() barrier(CLK_GLOBAL_MEM_FENCE | CLK_LOCAL_MEM_FENCE)
#endif

";

/// Real-number types that follow double-precision support
pub const VECTOR_BLOCK: &str = "\
// tiercl real types
#ifdef RIX_NATIVE_DOUBLE
  #define RIX_REAL double
  #define RIX_REAL4 double4
#else
  #define RIX_REAL float
  #define RIX_REAL4 float4
#endif

";

/// Separates generated text from the caller's kernel source
pub const USER_SOURCE_MARKER: &str = "// --- user kernel ---\n";

/// Defines identifying the device and tier
pub fn preprocessor_header(caps: &DeviceCapabilities, tier: StrategyTier) -> String {
    let mut header = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(header, "#define RIX_DEVICE_COMPUTE_UNITS {}", caps.compute_units);
    let _ = writeln!(header, "#define {} 1", tier.define());
    if caps.fp64 {
        header.push_str("#define RIX_NATIVE_DOUBLE 1\n");
    }
    if caps.svm {
        header.push_str("#define RIX_SVM_SUPPORT 1\n");
    }
    if caps.atomic32 {
        header.push_str("#define RIX_ATOMIC_32 1\n");
    }
    header
}

/// Complete translation unit for one tier
pub fn synthesize(caps: &DeviceCapabilities, tier: StrategyTier, user_source: &str) -> String {
    let header = preprocessor_header(caps, tier);
    let mut source = String::with_capacity(
        header.len()
            + ATOMIC_BLOCK.len()
            + MEMORY_BLOCK.len()
            + VECTOR_BLOCK.len()
            + USER_SOURCE_MARKER.len()
            + user_source.len()
            + 1,
    );
    source.push_str(&header);
    source.push('\n');
    source.push_str(ATOMIC_BLOCK);
    source.push_str(MEMORY_BLOCK);
    source.push_str(VECTOR_BLOCK);
    source.push_str(USER_SOURCE_MARKER);
    source.push_str(user_source);
    source
}
