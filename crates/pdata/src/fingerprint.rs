// SPDX-License-Identifier: Apache-2.0

//! Time-series fingerprinting.
//!
//! A fingerprint is the stable 64-bit xxh3 hash of the metric name and the
//! sorted attribute set (resource attributes first, then datapoint
//! attributes). Attribute values are hashed with a one-byte type tag so that
//! e.g. the string `"1"` and the integer `1` produce distinct fingerprints.

use crate::attributes::{AttributeMap, AttributeValue};
use xxhash_rust::xxh3::Xxh3;

// Field separator; attribute keys and metric names never contain NUL.
const SEP: &[u8] = &[0];

fn hash_value(hasher: &mut Xxh3, value: &AttributeValue) {
    match value {
        AttributeValue::Str(s) => {
            hasher.update(&[1]);
            hasher.update(s.as_bytes());
        }
        AttributeValue::Int(i) => {
            hasher.update(&[2]);
            hasher.update(&i.to_le_bytes());
        }
        AttributeValue::Double(d) => {
            hasher.update(&[3]);
            hasher.update(&d.to_bits().to_le_bytes());
        }
        AttributeValue::Bool(b) => {
            hasher.update(&[4, u8::from(*b)]);
        }
    }
}

/// Computes the fingerprint of a series from its metric name and attribute
/// sets. The same inputs always produce the same fingerprint, independent of
/// attribute insertion order (maps are sorted).
#[must_use]
pub fn fingerprint_of(metric: &str, resource: &AttributeMap, attributes: &AttributeMap) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(metric.as_bytes());
    hasher.update(SEP);
    for map in [resource, attributes] {
        for (key, value) in map.iter() {
            hasher.update(key.as_bytes());
            hasher.update(SEP);
            hash_value(&mut hasher, value);
        }
        hasher.update(SEP);
    }
    hasher.digest()
}
