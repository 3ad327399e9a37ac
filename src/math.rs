//! Log-space arithmetic and a lock-free `f64` cell.
//!
//! Probabilities and masses are carried as natural logarithms throughout the
//! crate. [`LOG_0`] is the log of zero (negative infinity) and [`LOG_1`] the log of one.
//!
//! [`AtomicF64`] stores the bit pattern of an `f64` in an [`AtomicU64`] so that
//! many workers can accumulate into it without a lock. Updates are
//! load/compute/compare-and-swap retry loops.

use std::sync::atomic::{AtomicU64, Ordering};

/// log(0)
pub const LOG_0: f64 = f64::NEG_INFINITY;
/// log(1)
pub const LOG_1: f64 = 0.0;
/// log(1/2)
pub const LOG_ONEHALF: f64 = -std::f64::consts::LN_2;

/// Smallest positive subnormal `f64`, used as the degenerate weight threshold.
pub const MIN_WEIGHT: f64 = 4.9406564584124654e-324;

/// log(exp(x) + exp(y)), stable when either argument is [`LOG_0`]
#[inline]
pub fn log_add(x: f64, y: f64) -> f64 {
    if x == LOG_0 {
        return y;
    }
    if y == LOG_0 {
        return x;
    }
    let (hi, lo) = if x > y { (x, y) } else { (y, x) };
    hi + f64::ln_1p(f64::exp(lo - hi))
}

/// log(exp(x) - exp(y)), returns [`LOG_0`] if `y >= x`
#[inline]
pub fn log_sub(x: f64, y: f64) -> f64 {
    if y == LOG_0 {
        return x;
    }
    if y >= x {
        return LOG_0;
    }
    x + f64::ln(-f64::exp_m1(y - x))
}

/// Sum a slice of log-values
pub fn log_sum(vals: &[f64]) -> f64 {
    vals.iter().fold(LOG_0, |acc, v| log_add(acc, *v))
}

/// An `f64` that can be shared between threads and updated without locks.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    /// New cell holding `val`
    pub fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    /// Current value
    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Overwrite the value
    #[inline]
    pub fn store(&self, val: f64) {
        self.bits.store(val.to_bits(), Ordering::Release);
    }

    /// Apply `f` to the current value until the swap succeeds. Returns the new value.
    #[inline]
    fn update<F: Fn(f64) -> f64>(&self, f: F) -> f64 {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(current));
            match self.bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// `self += inc` in linear space
    #[inline]
    pub fn fetch_add(&self, inc: f64) -> f64 {
        self.update(|old| old + inc)
    }

    /// `self = log(exp(self) + exp(log_inc))`
    #[inline]
    pub fn log_add_assign(&self, log_inc: f64) -> f64 {
        self.update(|old| log_add(old, log_inc))
    }

    /// Consume the cell
    pub fn into_inner(self) -> f64 {
        f64::from_bits(self.bits.into_inner())
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

/// A vector of `len` atomic cells all holding `val`
pub fn atomic_vec(len: usize, val: f64) -> Vec<AtomicF64> {
    (0..len).map(|_| AtomicF64::new(val)).collect()
}
