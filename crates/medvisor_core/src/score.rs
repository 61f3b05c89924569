//! Class score vectors and top-K extraction.

use std::cmp::Ordering;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DiagnosticError, Result};

/// Scale a probability-like score to a 0–100 percentage.
#[must_use]
pub fn confidence_percent(score: f32) -> f32 {
    score * 100.0
}

/// One `(class_id, score)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    /// Index into the model's label set.
    pub class_id: usize,
    /// Probability-like score.
    pub score: f32,
}

impl ClassScore {
    /// Score as a 0–100 percentage.
    #[must_use]
    pub fn confidence(&self) -> f32 {
        confidence_percent(self.score)
    }
}

/// Ordered class scores from one forward pass, indexed by class id.
///
/// Scores are rank-comparable within one call; they need not sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreVector {
    scores: Vec<f32>,
}

/// Descending score, ties to the lower class id. NaN ranks last.
fn rank_order(a: &ClassScore, b: &ClassScore) -> Ordering {
    let key = |s: f32| if s.is_nan() { f32::NEG_INFINITY } else { s };
    key(b.score)
        .total_cmp(&key(a.score))
        .then(a.class_id.cmp(&b.class_id))
}

impl ScoreVector {
    /// Wrap raw scores.
    #[must_use]
    pub fn new(scores: Vec<f32>) -> Self {
        Self { scores }
    }

    /// Read the scores of a `(1, n_classes)` tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch dimension is not 1 or the data cannot be read.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 2>) -> Result<Self> {
        let [batch, n_classes] = tensor.dims();
        if batch != 1 {
            return Err(DiagnosticError::InvalidShape {
                expected: format!("(1, {n_classes})"),
                got: format!("({batch}, {n_classes})"),
            });
        }
        let scores: Vec<f32> = tensor
            .into_data()
            .to_vec()
            .map_err(|e| DiagnosticError::Inference(format!("{e:?}")))?;
        Ok(Self::new(scores))
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Check if there are no classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Score of `class_id`.
    #[must_use]
    pub fn get(&self, class_id: usize) -> Option<f32> {
        self.scores.get(class_id).copied()
    }

    /// Raw scores in class order.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.scores
    }

    /// Iterate `(class_id, score)` pairs in class order.
    pub fn iter(&self) -> impl Iterator<Item = ClassScore> + '_ {
        self.scores
            .iter()
            .enumerate()
            .map(|(class_id, &score)| ClassScore { class_id, score })
    }

    /// Highest-scoring class, ties to the lower class id.
    #[must_use]
    pub fn argmax(&self) -> Option<ClassScore> {
        self.iter().min_by(rank_order)
    }

    /// The `k` highest-scoring classes in descending order, ties to the lower
    /// class id. Returns fewer than `k` entries only when there are fewer classes.
    #[must_use]
    pub fn top_k(&self, k: usize) -> Vec<ClassScore> {
        let mut ranked: Vec<ClassScore> = self.iter().collect();
        ranked.sort_by(rank_order);
        ranked.truncate(k);
        ranked
    }
}

impl From<Vec<f32>> for ScoreVector {
    fn from(scores: Vec<f32>) -> Self {
        Self::new(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NdArray;

    #[test]
    fn test_top_k_order() {
        let scores = ScoreVector::new(vec![0.1, 0.5, 0.05, 0.35]);
        let top = scores.top_k(3);
        let ids: Vec<usize> = top.iter().map(|c| c.class_id).collect();
        assert_eq!(ids, vec![1, 3, 0]);
    }

    #[test]
    fn test_top_k_ties_lower_id_first() {
        let scores = ScoreVector::new(vec![0.2, 0.4, 0.4, 0.0]);
        let ids: Vec<usize> = scores.top_k(2).iter().map(|c| c.class_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(scores.argmax().unwrap().class_id, 1);
    }

    #[test]
    fn test_top_k_larger_than_classes() {
        let scores = ScoreVector::new(vec![0.7, 0.3]);
        assert_eq!(scores.top_k(5).len(), 2);
    }

    #[test]
    fn test_nan_ranks_last() {
        let scores = ScoreVector::new(vec![f32::NAN, 0.1, 0.2]);
        assert_eq!(scores.argmax().unwrap().class_id, 2);
        assert_eq!(scores.top_k(3)[2].class_id, 0);
    }

    #[test]
    fn test_confidence_percent() {
        let c = ClassScore {
            class_id: 0,
            score: 0.85,
        };
        assert!((c.confidence() - 85.0).abs() < 1e-4);
    }

    #[test]
    fn test_from_tensor() {
        let device = Default::default();
        let t = Tensor::<NdArray, 1>::from_floats([0.2, 0.8], &device).reshape([1, 2]);
        let scores = ScoreVector::from_tensor(t).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores.argmax().unwrap().class_id, 1);

        let batched = Tensor::<NdArray, 2>::zeros([2, 2], &device);
        assert!(ScoreVector::from_tensor(batched).is_err());
    }

    #[test]
    fn test_empty() {
        let scores = ScoreVector::new(Vec::new());
        assert!(scores.is_empty());
        assert!(scores.argmax().is_none());
        assert!(scores.top_k(3).is_empty());
    }
}
