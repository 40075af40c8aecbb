//! Hashing utilities for process specifications

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Compute a hash for any hashable value
pub fn compute_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Render a string map as sorted `key=value` pairs.
///
/// Sorting keeps the rendering independent of map iteration order.
pub fn sorted_pairs(map: &HashMap<String, String>) -> Vec<String> {
    let mut pairs: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.sort();
    pairs
}

/// Incremental hasher over labelled string sections.
///
/// Each section writes its label and length first so that moving a value
/// from one section to the next changes the digest.
#[derive(Default)]
pub struct SectionHasher {
    hasher: DefaultHasher,
}

impl SectionHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section<S: AsRef<str>>(&mut self, label: &str, values: &[S]) -> &mut Self {
        label.hash(&mut self.hasher);
        self.hasher.write_usize(values.len());
        for value in values {
            value.as_ref().hash(&mut self.hasher);
        }
        self
    }

    pub fn finish(&self) -> u64 {
        self.hasher.finish()
    }
}
