//! Random forest classifier expressed through linfa's estimator traits
//!
//! Each tree is a weighted Gini CART grown on a bootstrap draw, sampling a
//! subset of features at every split. Leaves keep the weighted class
//! distribution so the forest can report averaged probabilities.

use crate::error::{ChurnError, Result};
use linfa::traits::{Fit, PredictInplace};
use linfa::{DatasetBase, ParamGuard};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix2};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of features considered at each split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaxFeatures {
    /// `floor(sqrt(n_features))`
    Sqrt,
    /// Every feature
    All,
    /// A fraction in (0, 1] of the features
    Fraction(f64),
}

impl MaxFeatures {
    fn resolve(&self, n_features: usize) -> usize {
        let n = n_features as f64;
        let k = match self {
            MaxFeatures::Sqrt => n.sqrt().floor() as usize,
            MaxFeatures::All => n_features,
            MaxFeatures::Fraction(f) => (n * f).ceil() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

/// Per-class sample weighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassWeight {
    /// Every sample counts once
    Uniform,
    /// `n_samples / (n_classes * class_count)` so each class carries equal total weight
    Balanced,
}

/// Checked forest hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestValidParams {
    n_trees: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    max_features: MaxFeatures,
    class_weight: ClassWeight,
    bootstrap: bool,
    seed: u64,
}

impl ForestValidParams {
    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    pub fn min_samples_split(&self) -> usize {
        self.min_samples_split
    }

    pub fn max_features(&self) -> MaxFeatures {
        self.max_features
    }

    pub fn class_weight(&self) -> ClassWeight {
        self.class_weight
    }

    pub fn bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// Unchecked forest hyperparameters
///
/// Defaults: 300 trees, max depth 8, `sqrt` features per split, bootstrap,
/// balanced class weights, seed 42.
#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams(ForestValidParams);

impl Default for ForestParams {
    fn default() -> Self {
        Self(ForestValidParams {
            n_trees: 300,
            max_depth: Some(8),
            min_samples_split: 2,
            max_features: MaxFeatures::Sqrt,
            class_weight: ClassWeight::Balanced,
            bootstrap: true,
            seed: 42,
        })
    }
}

impl ForestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_trees(mut self, n_trees: usize) -> Self {
        self.0.n_trees = n_trees;
        self
    }

    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.0.max_depth = max_depth;
        self
    }

    pub fn min_samples_split(mut self, min_samples_split: usize) -> Self {
        self.0.min_samples_split = min_samples_split;
        self
    }

    pub fn max_features(mut self, max_features: MaxFeatures) -> Self {
        self.0.max_features = max_features;
        self
    }

    pub fn class_weight(mut self, class_weight: ClassWeight) -> Self {
        self.0.class_weight = class_weight;
        self
    }

    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.0.bootstrap = bootstrap;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.0.seed = seed;
        self
    }
}

impl ParamGuard for ForestParams {
    type Checked = ForestValidParams;
    type Error = ChurnError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let p = &self.0;
        if p.n_trees == 0 {
            return Err(ChurnError::invalid_parameter("n_trees must be at least 1"));
        }
        if p.max_depth == Some(0) {
            return Err(ChurnError::invalid_parameter("max_depth must be at least 1"));
        }
        if p.min_samples_split < 2 {
            return Err(ChurnError::invalid_parameter(
                "min_samples_split must be at least 2",
            ));
        }
        if let MaxFeatures::Fraction(f) = p.max_features {
            if !(f > 0.0 && f <= 1.0) {
                return Err(ChurnError::invalid_parameter(format!(
                    "max_features fraction must be in (0, 1], got {}",
                    f
                )));
            }
        }
        Ok(p)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
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
        distribution: Vec<f64>,
    },
}

/// A single fitted tree stored as a node arena rooted at index 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    /// Class distribution of the leaf this row falls into
    fn leaf_for(&self, row: ArrayView1<f64>) -> &[f64] {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
                Node::Leaf { distribution } => return distribution,
            }
        }
    }

    /// Longest root-to-leaf path, counted in splits
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                Node::Leaf { .. } => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Fitted random forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
    n_classes: usize,
}

impl RandomForest {
    pub fn params() -> ForestParams {
        ForestParams::default()
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Class probabilities averaged over trees, shape `(n_samples, n_classes)`
    pub fn predict_proba<D: Data<Elem = f64>>(&self, x: &ArrayBase<D, Ix2>) -> Array2<f64> {
        let mut proba = Array2::<f64>::zeros((x.nrows(), self.n_classes));
        for (row, mut out) in x.outer_iter().zip(proba.outer_iter_mut()) {
            for tree in &self.trees {
                for (o, p) in out.iter_mut().zip(tree.leaf_for(row.view())) {
                    *o += p;
                }
            }
        }
        proba /= self.trees.len() as f64;
        proba
    }
}

impl<D: Data<Elem = f64>> PredictInplace<ArrayBase<D, Ix2>, Array1<usize>> for RandomForest {
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<usize>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );

        let proba = self.predict_proba(x);
        for (row, target) in proba.outer_iter().zip(y.iter_mut()) {
            *target = argmax(row);
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<usize> {
        Array1::zeros(x.nrows())
    }
}

impl<D: Data<Elem = f64>> Fit<ArrayBase<D, Ix2>, Array1<usize>, ChurnError> for ForestValidParams {
    type Object = RandomForest;

    fn fit(&self, dataset: &DatasetBase<ArrayBase<D, Ix2>, Array1<usize>>) -> Result<RandomForest> {
        let x = dataset.records().view();
        let y = dataset.targets();
        let n_samples = x.nrows();

        if n_samples == 0 {
            return Err(ChurnError::insufficient_data("cannot fit a forest on zero rows"));
        }
        if y.len() != n_samples {
            return Err(ChurnError::insufficient_data(format!(
                "{} rows but {} targets",
                n_samples,
                y.len()
            )));
        }

        let n_features = x.ncols();
        if n_features == 0 {
            return Err(ChurnError::insufficient_data("cannot fit a forest without features"));
        }
        let n_classes = y.iter().max().map_or(1, |&m| m + 1);
        let class_weights = class_weights(self.class_weight, y, n_classes);
        let sample_weights: Vec<f64> = (0..n_samples)
            .map(|i| f64::from(dataset.weight_for(i)) * class_weights[y[i]])
            .collect();
        let max_features = self.max_features.resolve(n_features);

        let mut master = StdRng::seed_from_u64(self.seed);
        let mut trees = Vec::with_capacity(self.n_trees);
        for _ in 0..self.n_trees {
            let mut rng = StdRng::seed_from_u64(master.gen());
            let weights: Vec<f64> = if self.bootstrap {
                let mut counts = vec![0usize; n_samples];
                for _ in 0..n_samples {
                    counts[rng.gen_range(0..n_samples)] += 1;
                }
                counts
                    .iter()
                    .zip(&sample_weights)
                    .map(|(&c, &w)| c as f64 * w)
                    .collect()
            } else {
                sample_weights.clone()
            };

            let builder = TreeBuilder {
                x: x.view(),
                y,
                weights: &weights,
                n_classes,
                max_features,
                max_depth: self.max_depth,
                min_samples_split: self.min_samples_split,
                nodes: Vec::new(),
            };
            trees.push(builder.build(&mut rng));
        }

        debug!(
            "Fitted {} trees on {} rows x {} features",
            trees.len(),
            n_samples,
            n_features
        );

        Ok(RandomForest {
            trees,
            n_features,
            n_classes,
        })
    }
}

/// Weight per class index; classes absent from `y` get 0
fn class_weights(strategy: ClassWeight, y: &Array1<usize>, n_classes: usize) -> Vec<f64> {
    let mut counts = vec![0usize; n_classes];
    for &label in y {
        counts[label] += 1;
    }

    match strategy {
        ClassWeight::Uniform => vec![1.0; n_classes],
        ClassWeight::Balanced => {
            let present = counts.iter().filter(|&&c| c > 0).count() as f64;
            let total = y.len() as f64;
            counts
                .iter()
                .map(|&c| if c > 0 { total / (present * c as f64) } else { 0.0 })
                .collect()
        }
    }
}

fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (idx, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = idx;
        }
    }
    best
}

fn gini(class_weights: &[f64], total: f64) -> f64 {
    1.0 - class_weights
        .iter()
        .map(|&w| (w / total).powi(2))
        .sum::<f64>()
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: &'a Array1<usize>,
    weights: &'a [f64],
    n_classes: usize,
    max_features: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    nodes: Vec<Node>,
}

struct Split {
    feature: usize,
    threshold: f64,
}

impl<'a> TreeBuilder<'a> {
    fn build(mut self, rng: &mut StdRng) -> DecisionTree {
        let samples: Vec<usize> = (0..self.x.nrows())
            .filter(|&i| self.weights[i] > 0.0)
            .collect();
        self.grow(samples, 0, rng);
        DecisionTree { nodes: self.nodes }
    }

    fn class_totals(&self, samples: &[usize]) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_classes];
        for &i in samples {
            totals[self.y[i]] += self.weights[i];
        }
        totals
    }

    fn push_leaf(&mut self, totals: Vec<f64>, total: f64) -> usize {
        let distribution = if total > 0.0 {
            totals.into_iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / self.n_classes as f64; self.n_classes]
        };
        self.nodes.push(Node::Leaf { distribution });
        self.nodes.len() - 1
    }

    fn grow(&mut self, samples: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let totals = self.class_totals(&samples);
        let total: f64 = totals.iter().sum();

        let pure = totals.iter().filter(|&&w| w > 0.0).count() <= 1;
        let at_max_depth = self.max_depth.map_or(false, |d| depth >= d);
        if pure || at_max_depth || samples.len() < self.min_samples_split {
            return self.push_leaf(totals, total);
        }

        let Some(split) = self.best_split(&samples, &totals, total, rng) else {
            return self.push_leaf(totals, total);
        };

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            distribution: Vec::new(),
        });

        let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&i| self.x[[i, split.feature]] <= split.threshold);
        let left = self.grow(left_samples, depth + 1, rng);
        let right = self.grow(right_samples, depth + 1, rng);

        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    /// Lowest weighted child impurity over a random subset of features
    fn best_split(
        &self,
        samples: &[usize],
        totals: &[f64],
        total: f64,
        rng: &mut StdRng,
    ) -> Option<Split> {
        let n_features = self.x.ncols();
        let parent_score = gini(totals, total) * total;
        let mut candidates = sample(rng, n_features, self.max_features).into_vec();
        candidates.sort_unstable();

        let mut best: Option<(Split, f64)> = None;
        let mut order = samples.to_vec();
        let mut left = vec![0.0; self.n_classes];
        let mut right = vec![0.0; self.n_classes];

        for feature in candidates {
            let column = self.x.column(feature);
            order.sort_by(|&a, &b| column[a].total_cmp(&column[b]).then(a.cmp(&b)));
            left.iter_mut().for_each(|w| *w = 0.0);
            let mut left_total = 0.0;

            for pos in 0..order.len() - 1 {
                let i = order[pos];
                left[self.y[i]] += self.weights[i];
                left_total += self.weights[i];

                let value = column[i];
                let next = column[order[pos + 1]];
                if next <= value {
                    continue;
                }

                let right_total = total - left_total;
                if left_total <= 0.0 || right_total <= 0.0 {
                    continue;
                }
                for (r, (t, l)) in right.iter_mut().zip(totals.iter().zip(&left)) {
                    *r = t - l;
                }

                let score = left_total * gini(&left, left_total)
                    + right_total * gini(&right, right_total);
                if best.as_ref().map_or(true, |(_, s)| score < *s) {
                    let mut threshold = value + (next - value) / 2.0;
                    if threshold >= next {
                        threshold = value;
                    }
                    best = Some((Split { feature, threshold }, score));
                }
            }
        }

        best.filter(|(_, score)| *score < parent_score - 1e-12)
            .map(|(split, _)| split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linfa::traits::Predict;
    use linfa::Dataset;
    use ndarray::array;

    fn separable() -> Dataset<f64, usize, ndarray::Ix1> {
        let x = array![
            [0.1, 5.0],
            [0.2, 3.0],
            [0.3, 4.0],
            [0.4, 1.0],
            [0.9, 2.0],
            [1.0, 5.0],
            [1.1, 1.0],
            [1.2, 3.0]
        ];
        let y = array![0, 0, 0, 0, 1, 1, 1, 1];
        Dataset::new(x, y)
    }

    fn fit_forest(
        params: ForestParams,
        dataset: &Dataset<f64, usize, ndarray::Ix1>,
    ) -> RandomForest {
        let fitted: Result<RandomForest> = params.fit(dataset);
        fitted.unwrap()
    }

    #[test]
    fn test_fit_separable_data() {
        let dataset = separable();
        let forest = fit_forest(
            RandomForest::params()
                .n_trees(25)
                .max_features(MaxFeatures::All),
            &dataset,
        );

        let predictions = forest.predict(dataset.records());
        assert_eq!(predictions, *dataset.targets());
        assert_eq!(forest.trees().len(), 25);
        assert_eq!(forest.n_classes(), 2);
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let dataset = separable();
        let a = fit_forest(RandomForest::params().n_trees(20).seed(7), &dataset);
        let b = fit_forest(RandomForest::params().n_trees(20).seed(7), &dataset);
        assert_eq!(a, b);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let dataset = separable();
        let forest = fit_forest(RandomForest::params().n_trees(15), &dataset);
        let proba = forest.predict_proba(dataset.records());

        assert_eq!(proba.shape(), &[8, 2]);
        for row in proba.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn test_max_depth_respected() {
        let dataset = separable();
        let forest = fit_forest(RandomForest::params().n_trees(5).max_depth(Some(1)), &dataset);
        assert!(forest.trees().iter().all(|t| t.depth() <= 1));
    }

    #[test]
    fn test_balanced_class_weights() {
        let y = array![0, 0, 0, 1];
        let weights = class_weights(ClassWeight::Balanced, &y, 2);
        assert!((weights[0] - 4.0 / 6.0).abs() < 1e-12);
        assert!((weights[1] - 2.0).abs() < 1e-12);

        // Equal total weight per class
        assert!((weights[0] * 3.0 - weights[1]).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(RandomForest::params().n_trees(0).check().is_err());
        assert!(RandomForest::params().max_depth(Some(0)).check().is_err());
        assert!(RandomForest::params()
            .max_features(MaxFeatures::Fraction(1.5))
            .check()
            .is_err());
        assert!(RandomForest::params().check().is_ok());
    }

    #[test]
    fn test_max_features_resolution() {
        assert_eq!(MaxFeatures::Sqrt.resolve(46), 6);
        assert_eq!(MaxFeatures::Sqrt.resolve(49), 7);
        assert_eq!(MaxFeatures::Sqrt.resolve(2), 1);
        assert_eq!(MaxFeatures::All.resolve(3), 3);
        assert_eq!(MaxFeatures::Fraction(0.01).resolve(10), 1);
    }
}
