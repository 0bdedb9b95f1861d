// A set of helper structs for common operations
pub mod timing;
#[macro_use]
pub mod logging;
pub mod log;
pub mod region;
pub mod ring;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

/// Helper to perform max on PartialOrd types
///
/// We are using PartialOrd so that size and offset can handle
/// floating point types that do not support Ord
pub fn partial_max<T: PartialOrd>(a: T, b: T) -> T {
    if a >= b {
        a
    } else {
        b
    }
}

/// Helper to perform min on PartialOrd types
pub fn partial_min<T: PartialOrd>(a: T, b: T) -> T {
    if a <= b {
        a
    } else {
        b
    }
}

/// Round `val` up to the next power of two.
///
/// Used by the ring buffer to size its backing storage, and by anything
/// else that needs power-of-two capacity for bitmask-based indexing.
pub fn next_power_of_two(val: usize) -> usize {
    if val == 0 {
        return 1;
    }
    val.next_power_of_two()
}
