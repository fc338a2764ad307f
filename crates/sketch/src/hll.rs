// SPDX-License-Identifier: Apache-2.0

//! HyperLogLog cardinality estimation.
//!
//! Fingerprints are re-hashed with xxh3 before use: the register index is
//! taken from the top `p` bits and the rank from the remaining `64 - p`
//! bits. Standard error is `1.04 / sqrt(2^p)`, about 0.8% at the default
//! `p = 14`.
//!
//! [`SlidingHyperLogLog`] keeps the active sketch plus the previous window's
//! sketch and estimates over their union, smoothing transients across
//! window rotation.

use xxhash_rust::xxh3::xxh3_64;

/// Default precision (`p`), 16384 registers.
pub const DEFAULT_PRECISION: u8 = 14;

const MIN_PRECISION: u8 = 4;
const MAX_PRECISION: u8 = 18;

/// A HyperLogLog sketch over 64-bit fingerprints.
#[derive(Debug, Clone)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    /// Creates a sketch with the given precision, clamped to `[4, 18]`.
    #[must_use]
    pub fn new(precision: u8) -> Self {
        let precision = precision.clamp(MIN_PRECISION, MAX_PRECISION);
        Self {
            precision,
            registers: vec![0; 1 << precision],
        }
    }

    /// The configured precision.
    #[must_use]
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Inserts a fingerprint.
    pub fn insert(&mut self, fingerprint: u64) {
        let hash = xxh3_64(&fingerprint.to_le_bytes());
        let index = (hash >> (64 - self.precision)) as usize;
        let remainder = hash << self.precision;
        // Rank of the first set bit in the remaining 64 - p bits, 1-based.
        let rank = (remainder.leading_zeros() as u8).min(64 - self.precision) + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Estimates the number of distinct fingerprints inserted.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0;
        let mut zeros = 0u64;
        for &r in &self.registers {
            sum += 1.0 / f64::from(1u32 << u32::from(r.min(63)));
            if r == 0 {
                zeros += 1;
            }
        }
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            n => 0.7213 / (1.0 + 1.079 / n as f64),
        };
        let raw = alpha * m * m / sum;

        // Linear counting below 2.5m when empty registers remain.
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }

    /// Folds `other` into `self` (register-wise maximum). Both sketches must
    /// share the same precision; mismatched sketches leave `self` unchanged.
    pub fn merge(&mut self, other: &HyperLogLog) {
        if other.precision != self.precision {
            return;
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// Clears all registers.
    pub fn clear(&mut self) {
        self.registers.fill(0);
    }
}

/// A pair of HyperLogLog sketches rotated on a fixed cadence.
///
/// `estimate()` covers the union of the active and previous windows; callers
/// rotate once per observation window, so the estimate spans two windows.
#[derive(Debug, Clone)]
pub struct SlidingHyperLogLog {
    active: HyperLogLog,
    previous: HyperLogLog,
}

impl SlidingHyperLogLog {
    /// Creates a sliding sketch with the given precision.
    #[must_use]
    pub fn new(precision: u8) -> Self {
        Self {
            active: HyperLogLog::new(precision),
            previous: HyperLogLog::new(precision),
        }
    }

    /// Inserts a fingerprint into the active window.
    pub fn insert(&mut self, fingerprint: u64) {
        self.active.insert(fingerprint);
    }

    /// Estimates distinct fingerprints over the active plus previous window.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        let mut merged = self.previous.clone();
        merged.merge(&self.active);
        merged.estimate()
    }

    /// Retires the active window and starts a fresh one.
    pub fn rotate(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.active);
        self.active.clear();
    }
}

impl Default for SlidingHyperLogLog {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION)
    }
}
