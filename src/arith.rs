//! Saturating and checked arithmetic over tick counters.
//!
//! Due times and timer deadlines are 64-bit millisecond counts that user
//! code adds arbitrary deltas to. All of that math goes through these
//! helpers so a hostile or buggy delta can never wrap a deadline into the
//! past.

use crate::error::Error;

/// Adds two tick counts, clamping to `u64::MAX` on overflow.
#[inline]
pub fn saturated_add(lhs: u64, rhs: u64) -> u64 {
    lhs.saturating_add(rhs)
}

/// Subtracts `rhs` from `lhs`, clamping to zero on underflow.
#[inline]
pub fn saturated_sub(lhs: u64, rhs: u64) -> u64 {
    lhs.saturating_sub(rhs)
}

/// Adds two tick counts, failing on overflow.
#[inline]
pub fn checked_add(lhs: u64, rhs: u64) -> Result<u64, Error> {
    lhs.checked_add(rhs)
        .ok_or_else(|| Error::System {
            code: None,
            message: "integral addition overflow".into(),
        })
}

/// Subtracts `rhs` from `lhs`, failing on underflow.
#[inline]
pub fn checked_sub(lhs: u64, rhs: u64) -> Result<u64, Error> {
    lhs.checked_sub(rhs)
        .ok_or_else(|| Error::System {
            code: None,
            message: "integral subtraction overflow".into(),
        })
}
