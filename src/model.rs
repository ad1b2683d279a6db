//! Gradient-boosted tree inference over XGBoost JSON models.
//!
//! Loads the document written by `Booster.save_model("model.json")` and
//! evaluates it in-process. Only the pieces needed for binary classification
//! with numerical splits are read:
//!
//! - `learner.learner_model_param`: `base_score`, `num_feature`
//! - `learner.objective.name`: `binary:logistic`, `reg:logistic`, `binary:logitraw`
//! - `learner.attributes.best_iteration`: limits the rounds used, if present
//! - `learner.gradient_booster.model`: `trees`, `iteration_indptr`
//!
//! Sums are carried in `f32`, as XGBoost's own predictor does, so scores
//! match the Python runtime to within rounding of the final sigmoid.

use std::collections::HashMap;
use std::path::Path;

use eyre::{bail, eyre, Result, WrapErr};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Maps a feature vector to the probability of the positive (malicious) class.
pub trait Classifier: Send + Sync {
    /// Number of features every input must have.
    fn num_features(&self) -> usize;

    fn predict_proba(&self, features: &[f32]) -> Result<f64, ClassifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("model expects {expected} features, got {actual}")]
    FeatureCount { expected: usize, actual: usize },
    #[error("model produced a non-finite score")]
    NonFinite,
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

// ---------------------------------------------------------------------------
// JSON document
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ModelDocument {
    learner: LearnerDoc,
}

#[derive(Deserialize)]
struct LearnerDoc {
    #[serde(default)]
    attributes: HashMap<String, String>,
    gradient_booster: GradientBoosterDoc,
    learner_model_param: LearnerModelParamDoc,
    objective: ObjectiveDoc,
}

#[derive(Deserialize)]
struct LearnerModelParamDoc {
    base_score: String,
    num_feature: String,
    #[serde(default)]
    num_class: Option<String>,
}

#[derive(Deserialize)]
struct ObjectiveDoc {
    name: String,
}

#[derive(Deserialize)]
struct GradientBoosterDoc {
    name: String,
    #[serde(default)]
    model: Option<GbtreeDoc>,
}

#[derive(Deserialize)]
struct GbtreeDoc {
    #[serde(default)]
    gbtree_model_param: Option<GbtreeParamDoc>,
    #[serde(default)]
    iteration_indptr: Option<Vec<usize>>,
    trees: Vec<TreeDoc>,
}

#[derive(Deserialize)]
struct GbtreeParamDoc {
    #[serde(default)]
    num_parallel_tree: Option<String>,
}

#[derive(Deserialize)]
struct TreeDoc {
    left_children: Vec<i32>,
    right_children: Vec<i32>,
    split_indices: Vec<i64>,
    split_conditions: Vec<f32>,
    default_left: Vec<FlexBool>,
    #[serde(default)]
    split_type: Vec<u8>,
}

/// `default_left` is written as 0/1 by current XGBoost and as booleans by
/// some older releases.
#[derive(Deserialize, Clone, Copy)]
#[serde(untagged)]
enum FlexBool {
    Int(u8),
    Bool(bool),
}

impl FlexBool {
    fn get(self) -> bool {
        match self {
            FlexBool::Int(v) => v != 0,
            FlexBool::Bool(v) => v,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory model
// ---------------------------------------------------------------------------

/// How the summed margin becomes a probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// `binary:logistic` / `reg:logistic`: base score is a probability.
    Logistic,
    /// `binary:logitraw`: base score is already a margin.
    LogitRaw,
}

impl Objective {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "binary:logistic" | "reg:logistic" => Ok(Objective::Logistic),
            "binary:logitraw" => Ok(Objective::LogitRaw),
            other => bail!("unsupported objective {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    /// -1 for leaves.
    left: i32,
    right: i32,
    feature: usize,
    /// Split threshold for internal nodes, leaf value for leaves.
    value: f32,
    default_left: bool,
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn from_doc(doc: TreeDoc, num_feature: usize) -> Result<Self> {
        let n = doc.left_children.len();
        if n == 0 {
            bail!("tree has no nodes");
        }
        if doc.right_children.len() != n
            || doc.split_indices.len() != n
            || doc.split_conditions.len() != n
            || doc.default_left.len() != n
        {
            bail!("tree arrays have inconsistent lengths");
        }
        if doc.split_type.iter().any(|t| *t != 0) {
            bail!("categorical splits are not supported");
        }

        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let (left, right) = (doc.left_children[i], doc.right_children[i]);
            let is_leaf = left == -1;
            if is_leaf != (right == -1) {
                bail!("node {i} has exactly one child");
            }
            let feature = if is_leaf {
                0
            } else {
                for child in [left, right] {
                    if child < 0 || child as usize >= n {
                        bail!("node {i} has child {child} outside 0..{n}");
                    }
                }
                let split = doc.split_indices[i];
                if split < 0 || split as usize >= num_feature {
                    bail!("node {i} splits on feature {split}, model has {num_feature}");
                }
                split as usize
            };
            nodes.push(Node {
                left,
                right,
                feature,
                value: doc.split_conditions[i],
                default_left: doc.default_left[i].get(),
            });
        }

        let tree = Tree { nodes };
        tree.check_acyclic()?;
        Ok(tree)
    }

    /// Every node must be reachable from the root at most once.
    fn check_acyclic(&self) -> Result<()> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut seen[i], true) {
                bail!("node {i} is reachable along more than one path");
            }
            let node = &self.nodes[i];
            if node.left != -1 {
                stack.push(node.left as usize);
                stack.push(node.right as usize);
            }
        }
        Ok(())
    }

    fn leaf_value(&self, features: &[f32]) -> f32 {
        let mut i = 0usize;
        loop {
            let node = &self.nodes[i];
            if node.left == -1 {
                return node.value;
            }
            let x = features[node.feature];
            let go_left = if x.is_nan() {
                node.default_left
            } else {
                x < node.value
            };
            i = if go_left { node.left } else { node.right } as usize;
        }
    }
}

/// A loaded XGBoost tree ensemble.
#[derive(Debug, Clone)]
pub struct GbdtModel {
    trees: Vec<Tree>,
    num_feature: usize,
    base_margin: f32,
    objective: Objective,
    hash: String,
}

impl GbdtModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read model file {}", path.display()))?;
        let model = Self::from_slice(&bytes)
            .wrap_err_with(|| format!("invalid model file {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            trees = model.trees.len(),
            num_feature = model.num_feature,
            objective = ?model.objective,
            hash = %model.hash,
            "loaded model"
        );
        Ok(model)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let doc: ModelDocument =
            serde_json::from_slice(bytes).wrap_err("model is not valid XGBoost JSON")?;
        let learner = doc.learner;

        let booster = learner.gradient_booster;
        if booster.name != "gbtree" {
            bail!("unsupported booster {:?}", booster.name);
        }
        let gbtree = booster
            .model
            .ok_or_else(|| eyre!("gradient_booster.model is missing"))?;

        let params = &learner.learner_model_param;
        let num_feature: usize = params
            .num_feature
            .trim()
            .parse()
            .wrap_err_with(|| format!("bad num_feature {:?}", params.num_feature))?;
        let base_score = parse_base_score(&params.base_score)?;
        if let Some(num_class) = params.num_class.as_deref() {
            if !matches!(num_class.trim(), "0" | "1") {
                bail!("multi-class models are not supported (num_class {num_class})");
            }
        }
        let objective = Objective::parse(&learner.objective.name)?;

        let rounds = round_boundaries(
            gbtree.iteration_indptr.as_deref(),
            gbtree
                .gbtree_model_param
                .as_ref()
                .and_then(|p| p.num_parallel_tree.as_deref()),
            gbtree.trees.len(),
        )?;
        let tree_count = match best_iteration(&learner.attributes)? {
            Some(best) if best + 1 < rounds.len() => rounds[best + 1],
            _ => gbtree.trees.len(),
        };

        let trees = gbtree
            .trees
            .into_iter()
            .take(tree_count)
            .enumerate()
            .map(|(i, t)| Tree::from_doc(t, num_feature).wrap_err_with(|| format!("tree {i}")))
            .collect::<Result<Vec<_>>>()?;
        if trees.is_empty() {
            bail!("model has no trees");
        }

        let base_margin = match objective {
            Objective::Logistic => {
                if !(base_score > 0.0 && base_score < 1.0) {
                    bail!("base_score {base_score} is not a probability");
                }
                logit(base_score)
            }
            Objective::LogitRaw => base_score,
        } as f32;

        Ok(Self {
            trees,
            num_feature,
            base_margin,
            objective,
            hash: format!("sha256:{}", hex::encode(Sha256::digest(bytes))),
        })
    }

    /// `sha256:<hex>` of the model file.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    /// Raw additive score before the sigmoid.
    pub fn margin(&self, features: &[f32]) -> Result<f32, ClassifyError> {
        if features.len() != self.num_feature {
            return Err(ClassifyError::FeatureCount {
                expected: self.num_feature,
                actual: features.len(),
            });
        }
        Ok(self
            .trees
            .iter()
            .fold(self.base_margin, |acc, t| acc + t.leaf_value(features)))
    }
}

impl Classifier for GbdtModel {
    fn num_features(&self) -> usize {
        self.num_feature
    }

    fn predict_proba(&self, features: &[f32]) -> Result<f64, ClassifyError> {
        let p = sigmoid(self.margin(features)? as f64);
        if p.is_finite() {
            Ok(p)
        } else {
            Err(ClassifyError::NonFinite)
        }
    }
}

/// `"5E-1"`, or `"[5E-1]"` as written by XGBoost 3.
fn parse_base_score(raw: &str) -> Result<f64> {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    let first = trimmed.split(',').next().unwrap_or_default().trim();
    first
        .parse::<f64>()
        .wrap_err_with(|| format!("bad base_score {raw:?}"))
}

fn best_iteration(attributes: &HashMap<String, String>) -> Result<Option<usize>> {
    match attributes.get("best_iteration") {
        None => Ok(None),
        Some(v) => match v.trim().parse::<i64>() {
            Ok(n) if n >= 0 => Ok(Some(n as usize)),
            Ok(_) => Ok(None),
            Err(_) => bail!("bad best_iteration {v:?}"),
        },
    }
}

/// Tree offsets at the start of each boosting round, plus the total.
fn round_boundaries(
    indptr: Option<&[usize]>,
    num_parallel_tree: Option<&str>,
    num_trees: usize,
) -> Result<Vec<usize>> {
    if let Some(indptr) = indptr.filter(|p| !p.is_empty()) {
        if indptr[0] != 0
            || indptr.windows(2).any(|w| w[0] > w[1])
            || indptr[indptr.len() - 1] != num_trees
        {
            bail!("iteration_indptr does not cover the {num_trees} trees");
        }
        return Ok(indptr.to_vec());
    }
    let per_round: usize = match num_parallel_tree {
        Some(v) => v
            .trim()
            .parse()
            .wrap_err_with(|| format!("bad num_parallel_tree {v:?}"))?,
        None => 1,
    };
    let per_round = per_round.max(1);
    let mut bounds: Vec<usize> = (0..num_trees).step_by(per_round).collect();
    bounds.push(num_trees);
    Ok(bounds)
}
