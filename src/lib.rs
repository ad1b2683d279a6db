//! PE Defender: a malware classifier service for Windows PE files.
//!
//! Samples are turned into the 2381-element EMBER feature vector and scored by
//! a gradient-boosted tree ensemble loaded from an XGBoost JSON model. The
//! verdict is binary:
//! - **0**: benign
//! - **1**: malicious (model probability at or above the threshold)
//!
//! Samples that cannot be scanned (not a PE, truncated headers, a panic in the
//! parser) are labelled by the configured [`scan::FailurePolicy`].
//!
//! Uses structured logging via [`tracing`]. Set the `RUST_LOG` environment
//! variable to control log verbosity (e.g., `RUST_LOG=pe_defender=debug`).

pub mod evaluate;
pub mod features;
pub mod model;
pub mod scan;
pub mod server;

pub use features::{EmberExtractor, ExtractError, FeatureExtractor, FEATURE_DIM};
pub use model::{Classifier, ClassifyError, GbdtModel};
pub use scan::{FailurePolicy, Label, ScanError, Scanner, Verdict};
