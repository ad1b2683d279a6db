//! Feature hashing compatible with scikit-learn's `FeatureHasher`.
//!
//! EMBER hashes variable-length string attributes (section names, imported
//! functions, header flags) into fixed-size buckets. Bucket placement must match
//! the trainer bit for bit, so the hash is the signed 32-bit MurmurHash3 with
//! seed 0 and the sign of the hash selects the sign of the contribution.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// MurmurHash3 (x86, 32-bit).
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k ^= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Hashes named features into `n_features` signed buckets.
#[derive(Debug, Clone, Copy)]
pub struct FeatureHasher {
    n_features: usize,
}

impl FeatureHasher {
    pub const fn new(n_features: usize) -> Self {
        Self { n_features }
    }

    /// Bucket index and sign for a feature name.
    fn bucket(&self, name: &str) -> (usize, f64) {
        let h = murmur3_32(name.as_bytes(), 0) as i32;
        // unsigned_abs keeps i32::MIN at 2^31, as sklearn does
        let index = (h.unsigned_abs() as usize) % self.n_features;
        let sign = if h >= 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    /// `input_type="string"`: every occurrence contributes ±1.
    pub fn hash_strings<I, S>(&self, items: I) -> Vec<f64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = vec![0.0; self.n_features];
        for item in items {
            let (index, sign) = self.bucket(item.as_ref());
            out[index] += sign;
        }
        out
    }

    /// `input_type="pair"`: every `(name, value)` contributes ±value.
    pub fn hash_pairs<I, S>(&self, items: I) -> Vec<f64>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        let mut out = vec![0.0; self.n_features];
        for (name, value) in items {
            let (index, sign) = self.bucket(name.as_ref());
            out[index] += sign * value;
        }
        out
    }
}
