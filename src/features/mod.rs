//! Static feature extraction for Windows PE files.
//!
//! [`EmberExtractor`] produces the 2381-element EMBER (v2) feature vector the
//! classifier was trained on. The vector is the concatenation of nine blocks
//! whose offsets are exported below; byte-level blocks come from the raw
//! payload, structural blocks from the parsed PE.
//!
//! A payload that `goblin` cannot parse as PE, even with unmappable debug,
//! exception, import and export directories dropped, is an
//! [`ExtractError::Parse`]; the scanner decides what verdict that produces.

pub mod bytes;
#[doc(hidden)]
pub mod fixture;
pub mod hashing;
pub mod pe;
pub mod strings;

use self::bytes::{BYTE_ENTROPY_DIM, BYTE_HISTOGRAM_DIM};
use self::pe::{
    DATA_DIRECTORIES_DIM, EXPORTS_DIM, GENERAL_DIM, HEADER_DIM, IMPORTS_DIM, SECTION_DIM,
};
use self::strings::{StringFeatures, STRING_DIM};

/// Length of the feature vector.
pub const FEATURE_DIM: usize = 2381;

pub const BYTE_HISTOGRAM_OFFSET: usize = 0;
pub const BYTE_ENTROPY_OFFSET: usize = BYTE_HISTOGRAM_OFFSET + BYTE_HISTOGRAM_DIM;
pub const STRINGS_OFFSET: usize = BYTE_ENTROPY_OFFSET + BYTE_ENTROPY_DIM;
pub const GENERAL_OFFSET: usize = STRINGS_OFFSET + STRING_DIM;
pub const HEADER_OFFSET: usize = GENERAL_OFFSET + GENERAL_DIM;
pub const SECTION_OFFSET: usize = HEADER_OFFSET + HEADER_DIM;
pub const IMPORTS_OFFSET: usize = SECTION_OFFSET + SECTION_DIM;
pub const EXPORTS_OFFSET: usize = IMPORTS_OFFSET + IMPORTS_DIM;
pub const DATA_DIRECTORIES_OFFSET: usize = EXPORTS_OFFSET + EXPORTS_DIM;

const _: () = assert!(DATA_DIRECTORIES_OFFSET + DATA_DIRECTORIES_DIM == FEATURE_DIM);

/// Index of the `http(s)://` occurrence count inside the vector.
pub const URLS_INDEX: usize = STRINGS_OFFSET + 101;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("empty input")]
    Empty,
    #[error("not a valid PE file: {0}")]
    Parse(String),
    #[error("feature vector has {actual} elements, expected {expected}")]
    Dimension { expected: usize, actual: usize },
}

/// Converts raw bytes into a fixed-length numeric vector.
pub trait FeatureExtractor: Send + Sync {
    /// Length of every vector this extractor returns.
    fn dim(&self) -> usize;

    fn extract(&self, bytes: &[u8]) -> Result<Vec<f32>, ExtractError>;
}

/// EMBER v2 feature extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmberExtractor;

impl EmberExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureExtractor for EmberExtractor {
    fn dim(&self) -> usize {
        FEATURE_DIM
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<f32>, ExtractError> {
        if bytes.is_empty() {
            return Err(ExtractError::Empty);
        }
        let mut scratch = Vec::new();
        let parsed = pe::parse_lenient(bytes, &mut scratch)
            .map_err(|e| ExtractError::Parse(e.to_string()))?;
        let dirs = pe::data_directories(bytes);

        let mut features: Vec<f64> = Vec::with_capacity(FEATURE_DIM);
        features.extend(bytes::byte_histogram(bytes));
        features.extend(bytes::byte_entropy_histogram(bytes));
        features.extend(StringFeatures::extract(bytes).to_vec());
        features.extend(pe::general_info(&parsed, bytes, &dirs));
        features.extend(pe::header_info(&parsed));
        features.extend(pe::section_info(&parsed, bytes));
        features.extend(pe::imports_info(&parsed));
        features.extend(pe::exports_info(&parsed));
        features.extend(pe::data_directories_info(&dirs));

        if features.len() != FEATURE_DIM {
            return Err(ExtractError::Dimension {
                expected: FEATURE_DIM,
                actual: features.len(),
            });
        }

        tracing::debug!(
            size = bytes.len(),
            sections = parsed.sections.len(),
            imports = parsed.imports.len(),
            exports = parsed.exports.len(),
            "extracted EMBER features"
        );

        Ok(features.into_iter().map(|v| v as f32).collect())
    }
}
