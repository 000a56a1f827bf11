// ABOUTME: Injectable randomness for tie-breaking between instances.
// ABOUTME: ThreadRandom uses rand; FixedRandom lets tests force each branch.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of uniformly distributed values in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;

    /// A fair coin flip.
    fn coin_flip(&self) -> bool {
        self.next_f64() < 0.5
    }
}

/// Thread-local RNG from the `rand` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Always returns the same value.
#[derive(Debug)]
pub struct FixedRandom {
    bits: AtomicU64,
}

impl FixedRandom {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    /// Change the returned value.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::SeqCst);
    }
}

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
