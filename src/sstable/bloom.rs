//! Per-table bloom filter over user keys.

use crate::Result;
use probabilistic_collections::bloom::BloomFilter;

/// Filters smaller than this are not worth sizing down further.
const MIN_EXPECTED_KEYS: usize = 16;

#[derive(Debug)]
pub struct KeyFilter {
    inner: BloomFilter<Vec<u8>>,
}

impl KeyFilter {
    pub fn new(expected_keys: usize, false_positive_rate: f64) -> Self {
        KeyFilter {
            inner: BloomFilter::new(expected_keys.max(MIN_EXPECTED_KEYS), false_positive_rate),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.inner.insert(&key.to_vec());
    }

    /// False means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.inner.contains(&key.to_vec())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.inner)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(KeyFilter {
            inner: bincode::deserialize(data)?,
        })
    }
}
