//! Printable-string statistics over the raw bytes.

use regex::bytes::Regex;
use std::sync::LazyLock;

pub const STRING_DIM: usize = 104;

const PRINTABLE_BINS: usize = 96;

/// Runs of at least five printable ASCII bytes (0x20..=0x7f).
static PRINTABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)[\x20-\x7f]{5,}").unwrap());
/// Occurrences of `c:\`.
static PATHS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i-u)c:\\").unwrap());
/// Occurrences of `http://` or `https://`.
static URLS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i-u)https?://").unwrap());
/// Registry hive prefixes.
static REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?-u)HKEY_").unwrap());
/// Embedded MZ markers (dropped executables).
static MZ_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?-u)MZ").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct StringFeatures {
    pub num_strings: usize,
    pub avg_length: f64,
    pub printables: u64,
    pub printable_dist: [u64; PRINTABLE_BINS],
    pub entropy: f64,
    pub paths: usize,
    pub urls: usize,
    pub registry: usize,
    pub mz: usize,
}

impl StringFeatures {
    pub fn extract(bytes: &[u8]) -> Self {
        let mut num_strings = 0usize;
        let mut total_len = 0usize;
        let mut dist = [0u64; PRINTABLE_BINS];

        for m in PRINTABLE_RE.find_iter(bytes) {
            num_strings += 1;
            total_len += m.len();
            for &b in m.as_bytes() {
                dist[(b - 0x20) as usize] += 1;
            }
        }

        let printables: u64 = dist.iter().sum();
        let entropy = if printables > 0 {
            dist.iter()
                .filter(|&&c| c > 0)
                .map(|&c| {
                    let p = c as f64 / printables as f64;
                    -p * p.log2()
                })
                .sum()
        } else {
            0.0
        };
        let avg_length = if num_strings > 0 {
            total_len as f64 / num_strings as f64
        } else {
            0.0
        };

        Self {
            num_strings,
            avg_length,
            printables,
            printable_dist: dist,
            entropy,
            paths: PATHS_RE.find_iter(bytes).count(),
            urls: URLS_RE.find_iter(bytes).count(),
            registry: REGISTRY_RE.find_iter(bytes).count(),
            mz: MZ_RE.find_iter(bytes).count(),
        }
    }

    /// numstrings, avlength, printables, distribution / printables,
    /// entropy, paths, urls, registry, MZ.
    pub fn to_vec(&self) -> Vec<f64> {
        let divisor = if self.printables > 0 {
            self.printables as f64
        } else {
            1.0
        };

        let mut out = Vec::with_capacity(STRING_DIM);
        out.push(self.num_strings as f64);
        out.push(self.avg_length);
        out.push(self.printables as f64);
        out.extend(self.printable_dist.iter().map(|&c| c as f64 / divisor));
        out.push(self.entropy);
        out.push(self.paths as f64);
        out.push(self.urls as f64);
        out.push(self.registry as f64);
        out.push(self.mz as f64);
        out
    }
}
