//! Fast unsigned 64-bit division by a runtime-constant divisor
//!
//! The probe table reduces every hashed key modulo its bucket count. The
//! divisor is turned into a reciprocal once at construction and each
//! reduction becomes two multiplications instead of a hardware `div`.
//!
//! ## Method
//!
//! ```text
//! M        = ceil(2^128 / d)            (precomputed, 128 bits)
//! n / d    = (M * n) >> 128             (exact for all 64-bit n, d > 1)
//! n mod d  = n - (n / d) * d
//! ```
//!
//! Power-of-two divisors take a shift/mask fast path instead.

use serde::{Deserialize, Serialize};

/// Precomputed reciprocal for a fixed divisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct Divider {
    divisor: u64,
    /// ceil(2^128 / divisor), 0 when the shift path applies
    multiplier: u128,
    /// log2(divisor) when the divisor is a power of two
    shift: Option<u32>,
}

impl Divider {
    /// Build a divider. A zero divisor is treated as one.
    pub fn new(divisor: u64) -> Self {
        let divisor = divisor.max(1);
        if divisor.is_power_of_two() {
            return Self {
                divisor,
                multiplier: 0,
                shift: Some(divisor.trailing_zeros()),
            };
        }
        Self {
            divisor,
            multiplier: u128::MAX / divisor as u128 + 1,
            shift: None,
        }
    }

    #[inline]
    pub fn divisor(&self) -> u64 {
        self.divisor
    }

    #[inline(always)]
    pub fn divide(&self, n: u64) -> u64 {
        match self.shift {
            Some(s) => n >> s,
            None => {
                let low = self.multiplier as u64 as u128;
                let high = (self.multiplier >> 64) as u64 as u128;
                let carry = (low * n as u128) >> 64;
                ((high * n as u128 + carry) >> 64) as u64
            }
        }
    }

    #[inline(always)]
    pub fn remainder(&self, n: u64) -> u64 {
        match self.shift {
            Some(_) => n & (self.divisor - 1),
            None => n - self.divide(n) * self.divisor,
        }
    }
}

impl From<u64> for Divider {
    fn from(divisor: u64) -> Self {
        Self::new(divisor)
    }
}

impl From<Divider> for u64 {
    fn from(d: Divider) -> Self {
        d.divisor
    }
}
