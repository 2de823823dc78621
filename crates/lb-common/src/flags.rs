//! Masked flag updates.
//!
//! A service flag change arrives as a `(flags, mask)` pair. Only the bits
//! selected by `mask` are written; every other bit keeps its current value.

use serde::{Deserialize, Serialize};

/// Service flag bits.
pub mod service_flags {
    pub const PERSISTENT: u32 = 0x0001;
    pub const HASHED: u32 = 0x0002;
    pub const ONEPACKET: u32 = 0x0004;
    pub const SCHED_FLAG_1: u32 = 0x0008;
    pub const SCHED_FLAG_2: u32 = 0x0010;
    pub const SCHED_FLAG_3: u32 = 0x0020;
}

/// A flag value paired with the mask of bits it is allowed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FlagUpdate {
    pub flags: u32,
    pub mask: u32,
}

impl FlagUpdate {
    pub fn new(flags: u32, mask: u32) -> Self {
        Self { flags, mask }
    }

    /// An update that overwrites every bit.
    pub fn full(flags: u32) -> Self {
        Self {
            flags,
            mask: u32::MAX,
        }
    }

    /// Merges this update into `existing`: `(existing & !mask) | (flags & mask)`.
    #[inline]
    pub fn merge(&self, existing: u32) -> u32 {
        (existing & !self.mask) | (self.flags & self.mask)
    }

    /// The flag value for a record that has no previous state.
    #[inline]
    pub fn apply_to_zero(&self) -> u32 {
        self.merge(0)
    }
}
