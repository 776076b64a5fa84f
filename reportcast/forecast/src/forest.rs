//! Bagged ensemble of CART regression trees.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{error::ModelError, model::Regressor};

/// Hyperparameters for [`RegressionForest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestConfig {
    /// Number of trees in the ensemble.
    pub trees: usize,
    /// Maximum depth of each tree (root has depth 0).
    pub max_depth: usize,
    /// Minimum samples a node needs before it may split.
    pub min_samples_split: usize,
    /// Seed for bootstrap sampling; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            trees: 100,
            max_depth: 12,
            min_samples_split: 2,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Single regression tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct Samples<'a> {
    features: &'a [Vec<f64>],
    targets: &'a [f64],
}

struct SplitChoice {
    feature: usize,
    threshold: f64,
}

impl RegressionTree {
    fn grow(samples: &Samples<'_>, indices: &[usize], config: &ForestConfig) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.build(samples, indices, 0, config);
        tree
    }

    fn build(
        &mut self,
        samples: &Samples<'_>,
        indices: &[usize],
        depth: usize,
        config: &ForestConfig,
    ) -> usize {
        let id = self.nodes.len();
        let value = mean(indices.iter().map(|&i| samples.targets[i]));
        self.nodes.push(Node::Leaf { value });
        if depth >= config.max_depth || indices.len() < config.min_samples_split.max(2) {
            return id;
        }
        let Some(choice) = best_split(samples, indices) else {
            return id;
        };
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| samples.features[i][choice.feature] <= choice.threshold);
        let left = self.build(samples, &left_idx, depth + 1, config);
        let right = self.build(samples, &right_idx, depth + 1, config);
        self.nodes[id] = Node::Split {
            feature: choice.feature,
            threshold: choice.threshold,
            left,
            right,
        };
        id
    }

    /// Predicts one sample.
    #[must_use]
    pub fn predict(&self, sample: &[f64]) -> f64 {
        let mut cursor = 0;
        loop {
            match self.nodes.get(cursor) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = sample.get(*feature).copied().unwrap_or_default();
                    cursor = if value <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }

    /// Number of nodes in the tree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Checks that every split points forward to an existing node and reads
    /// a feature below `width`, so [`Self::predict`] always reaches a leaf.
    pub fn check_links(&self, width: usize) -> Result<(), ModelError> {
        if self.nodes.is_empty() {
            return Err(ModelError::InvalidInput("tree has no nodes".into()));
        }
        let len = self.nodes.len();
        for (id, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Leaf { value } if !value.is_finite() => {
                    return Err(ModelError::InvalidInput(format!(
                        "leaf {id} holds a non-finite value"
                    )));
                }
                Node::Leaf { .. } => {}
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if let Some(child) = [*left, *right].into_iter().find(|&c| c <= id || c >= len) {
                        return Err(ModelError::InvalidInput(format!(
                            "split {id} links to node {child} of {len}"
                        )));
                    }
                    if *feature >= width || !threshold.is_finite() {
                        return Err(ModelError::InvalidInput(format!(
                            "split {id} tests feature {feature} at {threshold} with width {width}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Lowest total squared error split, or `None` when no split reduces it.
fn best_split(samples: &Samples<'_>, indices: &[usize]) -> Option<SplitChoice> {
    let width = samples.features.first().map_or(0, Vec::len);
    let n = indices.len() as f64;
    let total: f64 = indices.iter().map(|&i| samples.targets[i]).sum();
    let total_sq: f64 = indices.iter().map(|&i| samples.targets[i].powi(2)).sum();
    let parent_sse = total_sq - total * total / n;

    let mut best: Option<(f64, SplitChoice)> = None;
    let mut order = indices.to_vec();
    for feature in 0..width {
        order.sort_by(|&a, &b| {
            samples.features[a][feature].total_cmp(&samples.features[b][feature])
        });
        let (mut left_sum, mut left_sq) = (0.0, 0.0);
        for pos in 0..order.len() - 1 {
            let target = samples.targets[order[pos]];
            left_sum += target;
            left_sq += target * target;
            let here = samples.features[order[pos]][feature];
            let next = samples.features[order[pos + 1]][feature];
            if here >= next {
                continue;
            }
            let left_n = (pos + 1) as f64;
            let right_n = n - left_n;
            let right_sum = total - left_sum;
            let right_sq = total_sq - left_sq;
            let sse = (left_sq - left_sum * left_sum / left_n)
                + (right_sq - right_sum * right_sum / right_n);
            if best.as_ref().map_or(true, |(score, _)| sse < *score) {
                best = Some((
                    sse,
                    SplitChoice {
                        feature,
                        threshold: here + (next - here) / 2.0,
                    },
                ));
            }
        }
    }
    best.filter(|(sse, _)| *sse < parent_sse - 1e-12)
        .map(|(_, choice)| choice)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Random-forest style regressor: bootstrap-sampled trees, predictions averaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionForest {
    config: ForestConfig,
    width: Option<usize>,
    trees: Vec<RegressionTree>,
}

impl RegressionForest {
    /// Creates an unfitted forest.
    #[must_use]
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            width: None,
            trees: Vec::new(),
        }
    }

    /// Hyperparameters in use.
    #[must_use]
    pub const fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Fitted trees.
    #[must_use]
    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Feature width seen at fit time.
    #[must_use]
    pub const fn width(&self) -> Option<usize> {
        self.width
    }

    /// Verifies a decoded forest: fitted forests need trees whose links are sound,
    /// unfitted ones must hold no trees.
    pub fn check_integrity(&self) -> Result<(), ModelError> {
        match self.width {
            None if self.trees.is_empty() => Ok(()),
            None => Err(ModelError::InvalidInput("trees present without a fitted width".into())),
            Some(_) if self.trees.is_empty() => {
                Err(ModelError::InvalidInput("fitted forest has no trees".into()))
            }
            Some(width) => self.trees.iter().enumerate().try_for_each(|(idx, tree)| {
                tree.check_links(width)
                    .map_err(|err| ModelError::InvalidInput(format!("tree {idx}: {err}")))
            }),
        }
    }
}

fn validate_training(features: &[Vec<f64>], targets: &[f64]) -> Result<usize, ModelError> {
    if features.is_empty() {
        return Err(ModelError::InvalidInput("no training rows".into()));
    }
    if features.len() != targets.len() {
        return Err(ModelError::InvalidInput(format!(
            "{} feature rows but {} targets",
            features.len(),
            targets.len()
        )));
    }
    let width = features[0].len();
    if let Some(idx) = features.iter().position(|row| row.len() != width) {
        return Err(ModelError::InvalidInput(format!(
            "row {idx} has {} columns, expected {width}",
            features[idx].len()
        )));
    }
    let all_finite = features.iter().flatten().chain(targets).all(|v| v.is_finite());
    if !all_finite {
        return Err(ModelError::InvalidInput(
            "training data contains non-finite values".into(),
        ));
    }
    Ok(width)
}

impl Regressor for RegressionForest {
    fn name(&self) -> &'static str {
        "regression_forest"
    }

    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<(), ModelError> {
        let width = validate_training(features, targets)?;
        if self.config.trees == 0 {
            return Err(ModelError::InvalidInput("forest needs at least one tree".into()));
        }
        let mut rng = self
            .config
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        let samples = Samples { features, targets };
        let n = features.len();
        let trees = (0..self.config.trees)
            .map(|_| {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::grow(&samples, &bootstrap, &self.config)
            })
            .collect();
        self.trees = trees;
        self.width = Some(width);
        Ok(())
    }

    fn predict(&self, sample: &[f64]) -> Result<f64, ModelError> {
        let width = self.width.ok_or(ModelError::Unfitted)?;
        if self.trees.is_empty() {
            return Err(ModelError::Unfitted);
        }
        if sample.len() != width {
            return Err(ModelError::InvalidInput(format!(
                "sample has {} features, model expects {width}",
                sample.len()
            )));
        }
        if sample.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::InvalidInput("sample contains non-finite values".into()));
        }
        Ok(mean(self.trees.iter().map(|tree| tree.predict(sample))))
    }
}
