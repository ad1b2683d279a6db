//! Fixtures shared by the integration and regression suites.

#![allow(dead_code)]

use std::path::PathBuf;

pub use pe_defender::features::fixture::{set_data_directory, set_entry_point, synthetic_pe};
use pe_defender::features::URLS_INDEX;
use tempfile::TempDir;

/// Payload that plants two URLs in the `.text` section.
pub const URL_PAYLOAD: &[u8] = b"http://a.example/x\0https://b.example/y\0";

pub fn benign_pe() -> Vec<u8> {
    synthetic_pe(b"hello world\0")
}

pub fn url_pe() -> Vec<u8> {
    synthetic_pe(URL_PAYLOAD)
}

/// XGBoost JSON for a single stump on the URL-count feature: no URLs gives a
/// margin of -3 (p ≈ 0.047), any URL +3 (p ≈ 0.953). Base score 0.5 adds
/// nothing to the margin.
pub fn url_stump_model_json() -> String {
    format!(
        r#"{{
          "learner": {{
            "attributes": {{}},
            "gradient_booster": {{
              "name": "gbtree",
              "model": {{
                "gbtree_model_param": {{ "num_parallel_tree": "1", "num_trees": "1" }},
                "iteration_indptr": [0, 1],
                "trees": [
                  {{
                    "left_children": [1, -1, -1],
                    "right_children": [2, -1, -1],
                    "split_indices": [{URLS_INDEX}, 0, 0],
                    "split_conditions": [0.5, -3.0, 3.0],
                    "default_left": [1, 0, 0],
                    "split_type": [0, 0, 0]
                  }}
                ]
              }}
            }},
            "learner_model_param": {{
              "base_score": "5E-1", "num_feature": "2381", "num_class": "0"
            }},
            "objective": {{ "name": "binary:logistic" }}
          }},
          "version": [2, 1, 0]
        }}"#
    )
}

/// Write the URL stump model into a fresh temp directory.
pub fn write_model() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xgb_model.json");
    std::fs::write(&path, url_stump_model_json()).unwrap();
    (dir, path)
}
