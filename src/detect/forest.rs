//! Isolation forest.
//!
//! Each tree isolates points by recursive random axis-aligned splits on a
//! random sub-sample. Points that are isolated after few splits get a low
//! decision score. `fit` produces a [`ForestModel`] that can be kept and
//! reused to score later batches; `score_batch` reproduces the fit-then-score
//! behaviour on a single batch.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::DetectError;
use crate::features::NormalizedVector;
use crate::sensor::CHANNEL_COUNT;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Smallest batch a forest can be fitted on.
pub const MIN_SAMPLES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    /// Upper bound on the per-tree sub-sample size (capped at batch size).
    pub max_samples: usize,
    /// Expected fraction of anomalies, in (0, 0.5].
    pub contamination: f64,
    pub seed: u64,
    /// Batches smaller than this are reported all-normal without fitting.
    pub min_batch_size: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_samples: 256,
            contamination: 0.1,
            seed: 42,
            min_batch_size: MIN_SAMPLES,
        }
    }
}

impl ForestParams {
    pub fn validate(&self) -> Result<(), DetectError> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(DetectError::InvalidContamination(self.contamination));
        }
        if self.n_trees == 0 {
            return Err(DetectError::InvalidForestParams("n_trees must be positive".into()));
        }
        if self.max_samples < MIN_SAMPLES {
            return Err(DetectError::InvalidForestParams(format!(
                "max_samples must be at least {MIN_SAMPLES}"
            )));
        }
        if self.min_batch_size < MIN_SAMPLES {
            return Err(DetectError::InvalidForestParams(format!(
                "min_batch_size must be at least {MIN_SAMPLES}"
            )));
        }
        Ok(())
    }
}

/// Scorer output for one vector. Negative decision scores are anomalous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub decision_score: f64,
    pub is_anomaly: bool,
}

impl AnomalyScore {
    pub fn from_decision(decision_score: f64) -> Self {
        Self {
            decision_score,
            is_anomaly: decision_score < 0.0,
        }
    }

    /// Placeholder for batches too small to fit.
    pub fn normal() -> Self {
        Self {
            decision_score: 0.0,
            is_anomaly: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// A single isolation tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(data: &[NormalizedVector], sample: &mut [usize], max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow_node(data, sample, 0, max_depth, rng);
        tree
    }

    fn grow_node(
        &mut self,
        data: &[NormalizedVector],
        sample: &mut [usize],
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: sample.len() });

        if depth >= max_depth || sample.len() <= 1 {
            return id;
        }

        // Only features that still vary inside this node can split it.
        let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(CHANNEL_COUNT);
        for feature in 0..CHANNEL_COUNT {
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for &i in sample.iter() {
                let v = data[i][feature];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if hi > lo {
                candidates.push((feature, lo, hi));
            }
        }
        if candidates.is_empty() {
            return id;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);
        let mid = partition(sample, |i| data[i][feature] <= threshold);

        let (left_sample, right_sample) = sample.split_at_mut(mid);
        let left = self.grow_node(data, left_sample, depth + 1, max_depth, rng);
        let right = self.grow_node(data, right_sample, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    /// Children must point forward into the arena, which also rules out cycles.
    fn check(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        for (id, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                threshold,
                left,
                right,
            } = node
            {
                if *feature >= CHANNEL_COUNT {
                    return Err(format!("node {id} splits on feature {feature}"));
                }
                if !threshold.is_finite() {
                    return Err(format!("node {id} has a non-finite threshold"));
                }
                for child in [*left, *right] {
                    if child <= id || child >= self.nodes.len() {
                        return Err(format!("node {id} points at node {child}"));
                    }
                }
            }
        }
        Ok(())
    }

    fn path_length(&self, x: &NormalizedVector) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
                Node::Leaf { size } => return depth + average_path_length(*size),
            }
        }
    }
}

/// Move every index matching `pred` to the front; returns how many matched.
fn partition(items: &mut [usize], pred: impl Fn(usize) -> bool) -> usize {
    let mut next = 0;
    for i in 0..items.len() {
        if pred(items[i]) {
            items.swap(next, i);
            next += 1;
        }
    }
    next
}

/// Expected path length of an unsuccessful search in a binary search tree of
/// `n` points; used to normalise path lengths and to credit unsplit leaves.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated percentile (`q` in 0..=100) of unsorted values.
fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// A fitted forest. Self-contained and serializable, so it can be persisted
/// and applied to later batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    /// Raw-score threshold derived from contamination at fit time.
    offset: f64,
    pub contamination: f64,
}

impl ForestModel {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Structural check for a model read back from outside the process.
    /// A model that passes can be scored without panicking.
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.trees.is_empty() {
            return Err(DetectError::InvalidModel("no trees".into()));
        }
        if self.sample_size == 0 {
            return Err(DetectError::InvalidModel("sample_size must be positive".into()));
        }
        if !self.offset.is_finite() {
            return Err(DetectError::InvalidModel("offset is not finite".into()));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.check()
                .map_err(|e| DetectError::InvalidModel(format!("tree {i}: {e}")))?;
        }
        Ok(())
    }

    /// Raw scores in [-1, 0): `-2^(-E[h(x)] / c(psi))`. Lower is more anomalous.
    pub fn score_samples(&self, data: &[NormalizedVector]) -> Vec<f64> {
        let norm = average_path_length(self.sample_size);
        data.iter()
            .map(|x| {
                let mean_depth = self.trees.iter().map(|t| t.path_length(x)).sum::<f64>()
                    / self.trees.len() as f64;
                if norm > 0.0 {
                    -(2.0_f64).powf(-mean_depth / norm)
                } else {
                    -1.0
                }
            })
            .collect()
    }

    /// Raw score shifted so the contamination quantile sits at zero.
    pub fn decision_function(&self, data: &[NormalizedVector]) -> Vec<f64> {
        self.score_samples(data)
            .into_iter()
            .map(|s| s - self.offset)
            .collect()
    }

    pub fn score(&self, data: &[NormalizedVector]) -> Vec<AnomalyScore> {
        self.decision_function(data)
            .into_iter()
            .map(AnomalyScore::from_decision)
            .collect()
    }
}

/// Scores for one batch, plus the model when one could be fitted.
#[derive(Debug, Clone)]
pub struct BatchScores {
    pub scores: Vec<AnomalyScore>,
    pub model: Option<ForestModel>,
}

impl BatchScores {
    pub fn anomaly_count(&self) -> usize {
        self.scores.iter().filter(|s| s.is_anomaly).count()
    }
}

#[derive(Debug, Clone)]
pub struct IsolationForest {
    params: ForestParams,
}

impl IsolationForest {
    pub fn new(params: ForestParams) -> Result<Self, DetectError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Fit a forest on `data`. The contamination threshold is calibrated on
    /// the same data.
    pub fn fit(&self, data: &[NormalizedVector]) -> Result<ForestModel, DetectError> {
        let needed = self.params.min_batch_size;
        if data.len() < needed {
            return Err(DetectError::InsufficientSamples {
                needed,
                have: data.len(),
            });
        }

        let sample_size = self.params.max_samples.min(data.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        let trees = (0..self.params.n_trees)
            .map(|_| {
                let mut sample = index::sample(&mut rng, data.len(), sample_size).into_vec();
                IsolationTree::grow(data, &mut sample, max_depth, &mut rng)
            })
            .collect();

        let mut model = ForestModel {
            trees,
            sample_size,
            offset: 0.0,
            contamination: self.params.contamination,
        };
        let raw = model.score_samples(data);
        model.offset = percentile(&raw, 100.0 * self.params.contamination);

        debug!(
            rows = data.len(),
            sample_size,
            max_depth,
            offset = model.offset,
            "isolation forest fitted"
        );
        Ok(model)
    }

    /// Fit on the batch and score it. Batches too small to fit come back
    /// all-normal instead of failing.
    pub fn score_batch(&self, data: &[NormalizedVector]) -> BatchScores {
        match self.fit(data) {
            Ok(model) => BatchScores {
                scores: model.score(data),
                model: Some(model),
            },
            Err(e) => {
                debug!(error = %e, "batch too small to score, reporting all-normal");
                BatchScores {
                    scores: vec![AnomalyScore::normal(); data.len()],
                    model: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_outlier(n: usize) -> Vec<NormalizedVector> {
        let mut rows: Vec<NormalizedVector> = (0..n)
            .map(|k| {
                let t = k as f64 * 0.37;
                let mut r = [0.0; CHANNEL_COUNT];
                for (i, v) in r.iter_mut().enumerate() {
                    *v = 0.1 * (t + i as f64).sin();
                }
                r
            })
            .collect();
        rows[n / 2][4] = 8.0;
        rows
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        // c(256) is about 10.24
        assert!((average_path_length(256) - 10.24).abs() < 0.01);
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = [4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 50.0), 3.0);
        assert_eq!(percentile(&v, 100.0), 5.0);
        assert!((percentile(&v, 10.0) - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_params_validation() {
        let mut p = ForestParams::default();
        assert!(p.validate().is_ok());

        p.contamination = 0.0;
        assert_eq!(p.validate(), Err(DetectError::InvalidContamination(0.0)));
        p.contamination = 0.51;
        assert!(p.validate().is_err());
        p.contamination = 0.5;
        assert!(p.validate().is_ok());
        p.contamination = f64::NAN;
        assert!(p.validate().is_err());

        let p = ForestParams { n_trees: 0, ..Default::default() };
        assert!(matches!(p.validate(), Err(DetectError::InvalidForestParams(_))));
    }

    #[test]
    fn test_outlier_gets_lowest_score() {
        let data = cluster_with_outlier(40);
        let forest = IsolationForest::new(ForestParams::default()).unwrap();
        let result = forest.score_batch(&data);

        let (worst, _) = result
            .scores
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.decision_score.total_cmp(&b.1.decision_score))
            .unwrap();
        assert_eq!(worst, 20);
        assert!(result.scores[20].is_anomaly);
        assert!(result.model.is_some());
    }

    #[test]
    fn test_same_seed_same_scores() {
        let data = cluster_with_outlier(30);
        let forest = IsolationForest::new(ForestParams::default()).unwrap();
        let a = forest.score_batch(&data).scores;
        let b = forest.score_batch(&data).scores;
        assert_eq!(a, b);
    }

    #[test]
    fn test_contamination_bounds_flag_count() {
        let data = cluster_with_outlier(50);
        let forest = IsolationForest::new(ForestParams {
            contamination: 0.1,
            ..Default::default()
        })
        .unwrap();
        let flagged = forest.score_batch(&data).anomaly_count();
        assert!((1..=5).contains(&flagged), "flagged {flagged}");
    }

    #[test]
    fn test_tiny_batch_falls_back_to_normal() {
        let forest = IsolationForest::new(ForestParams::default()).unwrap();
        let result = forest.score_batch(&[[1.0; CHANNEL_COUNT]]);
        assert_eq!(result.scores, vec![AnomalyScore::normal()]);
        assert!(result.model.is_none());

        let result = forest.score_batch(&[]);
        assert!(result.scores.is_empty());
    }

    #[test]
    fn test_constant_batch_has_no_anomalies() {
        let data = vec![[0.0; CHANNEL_COUNT]; 12];
        let forest = IsolationForest::new(ForestParams::default()).unwrap();
        let result = forest.score_batch(&data);
        assert_eq!(result.anomaly_count(), 0);
        assert!(result.scores.iter().all(|s| s.decision_score == 0.0));
    }

    #[test]
    fn test_fitted_model_scores_new_data() {
        let data = cluster_with_outlier(40);
        let forest = IsolationForest::new(ForestParams::default()).unwrap();
        let model = forest.fit(&data).unwrap();
        assert_eq!(model.n_trees(), 100);
        assert_eq!(model.sample_size(), 40);

        // Scoring the training batch with the kept model matches fit-and-score.
        assert_eq!(model.score(&data), forest.score_batch(&data).scores);

        let json = serde_json::to_string(&model).unwrap();
        let restored: ForestModel = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.n_trees(), model.n_trees());
        for (a, b) in restored.score(&data).iter().zip(model.score(&data)) {
            assert!((a.decision_score - b.decision_score).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fitted_model_is_valid() {
        let forest = IsolationForest::new(ForestParams::default()).unwrap();
        let model = forest.fit(&cluster_with_outlier(40)).unwrap();
        assert_eq!(model.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_dangling_child() {
        let forest = IsolationForest::new(ForestParams {
            n_trees: 3,
            ..Default::default()
        })
        .unwrap();
        let mut model = forest.fit(&cluster_with_outlier(20)).unwrap();

        let root = &mut model.trees[1].nodes[0];
        match root {
            Node::Split { right, .. } => *right = 10_000,
            Node::Leaf { .. } => panic!("root of a fitted tree should split"),
        }
        assert!(matches!(model.validate(), Err(DetectError::InvalidModel(msg)) if msg.contains("tree 1")));

        // A self-loop would never terminate.
        let mut model = forest.fit(&cluster_with_outlier(20)).unwrap();
        if let Node::Split { left, .. } = &mut model.trees[0].nodes[0] {
            *left = 0;
        }
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_feature_and_empty_forest() {
        let tree = IsolationTree {
            nodes: vec![
                Node::Split {
                    feature: CHANNEL_COUNT,
                    threshold: 0.0,
                    left: 1,
                    right: 2,
                },
                Node::Leaf { size: 1 },
                Node::Leaf { size: 1 },
            ],
        };
        let model = ForestModel {
            trees: vec![tree],
            sample_size: 2,
            offset: -0.5,
            contamination: 0.1,
        };
        assert!(model.validate().is_err());

        let empty = ForestModel {
            trees: Vec::new(),
            ..model
        };
        assert!(matches!(empty.validate(), Err(DetectError::InvalidModel(_))));
    }
}
