//! Binary classification metrics for the held-out split

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Positive class index
pub const POSITIVE: usize = 1;

/// Evaluation record persisted as `metrics.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roc_auc: Option<f64>,
}

impl Metrics {
    /// Compute all metrics for a set of predictions
    ///
    /// # Arguments
    /// * `truth` - True labels
    /// * `predicted` - Predicted labels
    /// * `scores` - Positive-class scores; AUC is omitted when absent or undefined
    pub fn evaluate(truth: &[usize], predicted: &[usize], scores: Option<&[f64]>) -> Self {
        Self {
            accuracy: accuracy(truth, predicted),
            precision: precision(truth, predicted),
            recall: recall(truth, predicted),
            f1: f1(truth, predicted),
            roc_auc: scores.and_then(|s| roc_auc(truth, s)),
        }
    }

    /// Flat key to value mapping
    pub fn as_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("accuracy".to_string(), self.accuracy);
        map.insert("precision".to_string(), self.precision);
        map.insert("recall".to_string(), self.recall);
        map.insert("f1".to_string(), self.f1);
        if let Some(auc) = self.roc_auc {
            map.insert("roc_auc".to_string(), auc);
        }
        map
    }
}

struct Confusion {
    tp: usize,
    fp: usize,
    fn_: usize,
}

fn confusion(truth: &[usize], predicted: &[usize]) -> Confusion {
    let mut c = Confusion { tp: 0, fp: 0, fn_: 0 };
    for (&t, &p) in truth.iter().zip(predicted) {
        match (t == POSITIVE, p == POSITIVE) {
            (true, true) => c.tp += 1,
            (false, true) => c.fp += 1,
            (true, false) => c.fn_ += 1,
            (false, false) => {}
        }
    }
    c
}

/// Zero when the denominator is zero
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub fn accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    let correct = truth.iter().zip(predicted).filter(|(t, p)| t == p).count();
    ratio(correct, truth.len())
}

pub fn precision(truth: &[usize], predicted: &[usize]) -> f64 {
    let c = confusion(truth, predicted);
    ratio(c.tp, c.tp + c.fp)
}

pub fn recall(truth: &[usize], predicted: &[usize]) -> f64 {
    let c = confusion(truth, predicted);
    ratio(c.tp, c.tp + c.fn_)
}

pub fn f1(truth: &[usize], predicted: &[usize]) -> f64 {
    let c = confusion(truth, predicted);
    ratio(2 * c.tp, 2 * c.tp + c.fp + c.fn_)
}

/// Area under the ROC curve from the rank-sum statistic, tied scores sharing the mean rank
///
/// `None` when `truth` holds a single class.
pub fn roc_auc(truth: &[usize], scores: &[f64]) -> Option<f64> {
    let n_pos = truth.iter().filter(|&&t| t == POSITIVE).count();
    let n_neg = truth.len() - n_pos;
    if n_pos == 0 || n_neg == 0 || scores.len() != truth.len() {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        // 1-based ranks start..=end share their mean
        let mean_rank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = mean_rank;
        }
        start = end + 1;
    }

    let pos_rank_sum: f64 = truth
        .iter()
        .zip(&ranks)
        .filter(|&(&t, _)| t == POSITIVE)
        .map(|(_, &r)| r)
        .sum();
    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}
