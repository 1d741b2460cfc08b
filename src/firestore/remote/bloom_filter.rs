use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent with an existence filter.
///
/// Membership is tested with `hash_count` probes derived from two 64-bit
/// halves of the SHA-256 digest of the document name (double hashing). A
/// negative answer is definite; a positive one may be a false positive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Builds a filter from its wire parts. `padding` is the number of unused
    /// bits in the last byte of `bitmap`.
    pub fn new(bitmap: Vec<u8>, padding: u32, hash_count: u32) -> FirestoreResult<Self> {
        if padding > 7 {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if bitmap.is_empty() && (padding != 0 || hash_count != 0) {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        let bit_count = (bitmap.len() as u64) * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            bit_count,
            hash_count,
        })
    }

    /// Empty filter sized for `bit_count` bits, used to build filters locally.
    pub fn with_capacity(bit_count: u64, hash_count: u32) -> FirestoreResult<Self> {
        let bytes = bit_count.div_ceil(8) as usize;
        let padding = (bytes as u64 * 8 - bit_count) as u32;
        Self::new(vec![0; bytes], padding, hash_count)
    }

    /// Decodes the base64 bitmap carried in a watch frame.
    pub fn from_base64(bitmap: &str, padding: u32, hash_count: u32) -> FirestoreResult<Self> {
        let bytes = BASE64_STANDARD
            .decode(bitmap)
            .map_err(|err| invalid_argument(format!("Invalid bloom filter bitmap: {err}")))?;
        Self::new(bytes, padding, hash_count)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.bitmap)
    }

    pub fn padding(&self) -> u32 {
        (self.bitmap.len() as u64 * 8 - self.bit_count) as u32
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        self.bit_indexes(value).all(|index| self.is_bit_set(index))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let indexes: Vec<u64> = self.bit_indexes(value).collect();
        for index in indexes {
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_indexes(&self, value: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(value.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[0..8]);
        second.copy_from_slice(&digest[8..16]);
        let hash1 = u64::from_le_bytes(first);
        let hash2 = u64::from_le_bytes(second);
        (0..u64::from(self.hash_count)).map(move |i| {
            hash1.wrapping_add(hash2.wrapping_mul(i)) % self.bit_count
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}
