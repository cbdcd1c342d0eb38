//! Scoring of candidate directions
//!
//! Every score here works on 1-D projections of the two classes' samples onto
//! a direction. All functions are pure and tolerate single-sample classes
//! (their variance is taken as 0) without producing NaN.

use anyhow::Result;
use ndarray::{Array2, ArrayView1};
use statrs::statistics::Statistics;

/// Mean of a set of scores (0 for an empty set)
pub fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().mean()
    }
}

/// Unbiased (n - 1) variance; 0 when there are fewer than two scores
pub fn sample_variance(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        0.0
    } else {
        scores.iter().variance()
    }
}

/// Unbiased standard deviation; 0 when there are fewer than two scores
pub fn sample_std_dev(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        0.0
    } else {
        scores.iter().std_dev()
    }
}

/// Project each row of `data` onto the unit vector along `direction`.
pub fn project_onto_direction(data: &Array2<f32>, direction: ArrayView1<f32>) -> Result<Vec<f64>> {
    anyhow::ensure!(
        data.ncols() == direction.len(),
        "Direction has dimension {}, samples have {}",
        direction.len(),
        data.ncols()
    );
    let norm = direction.dot(&direction).sqrt();
    anyhow::ensure!(
        norm > 0.0 && norm.is_finite(),
        "Cannot project onto a direction with norm {norm}"
    );
    let unit = direction.mapv(|v| v / norm);
    Ok(data.dot(&unit).iter().map(|&s| f64::from(s)).collect())
}

/// Fisher-style discriminant ratio: between-class over within-class variance.
///
/// Between-class variance weights each class's squared deviation from the
/// pooled mean by its sample count. Returns 0 when the within-class variance
/// is exactly zero.
pub fn discriminant_ratio(scores_a: &[f64], scores_b: &[f64]) -> f64 {
    if scores_a.is_empty() || scores_b.is_empty() {
        return 0.0;
    }
    let mean_a = mean(scores_a);
    let mean_b = mean(scores_b);
    let n_a = scores_a.len() as f64;
    let n_b = scores_b.len() as f64;
    let overall = (mean_a * n_a + mean_b * n_b) / (n_a + n_b);

    let between = n_a * (mean_a - overall).powi(2) + n_b * (mean_b - overall).powi(2);
    let within: f64 = scores_a.iter().map(|s| (s - mean_a).powi(2)).sum::<f64>()
        + scores_b.iter().map(|s| (s - mean_b).powi(2)).sum::<f64>();

    if within == 0.0 {
        0.0
    } else {
        between / within
    }
}

/// Fraction of pooled variance removed by splitting into the two classes,
/// floored at 0.
pub fn variance_reduction(scores_a: &[f64], scores_b: &[f64]) -> f64 {
    let pooled: Vec<f64> = scores_a.iter().chain(scores_b).copied().collect();
    let pooled_variance = sample_variance(&pooled);
    if pooled_variance == 0.0 {
        return 0.0;
    }
    let within = sample_variance(scores_a) + sample_variance(scores_b);
    (1.0 - within / (2.0 * pooled_variance)).max(0.0)
}

/// Balancedness of the two class means, raised to `exponent`.
///
/// 0 when both means have the same sign (or either is zero); otherwise
/// `2·min(|μa|, |μb|) / (|μa| + |μb|)`, which is 1 for equal magnitudes.
pub fn balancedness_score(scores_a: &[f64], scores_b: &[f64], exponent: f64) -> f64 {
    let mean_a = mean(scores_a);
    let mean_b = mean(scores_b);
    if mean_a * mean_b >= 0.0 {
        return 0.0;
    }
    let (abs_a, abs_b) = (mean_a.abs(), mean_b.abs());
    let balancedness = 2.0 * abs_a.min(abs_b) / (abs_a + abs_b);
    balancedness.powf(exponent)
}

/// Per-class summary of a projection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl ClassStats {
    pub fn from_scores(scores: &[f64]) -> Self {
        Self {
            mean: mean(scores),
            std_dev: sample_std_dev(scores),
        }
    }
}

/// Everything recorded about a direction once it has been projected
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionStats {
    /// Discriminant ratio, balancedness-weighted when enabled
    pub discriminant_ratio: f64,
    pub variance_reduction: f64,
    pub classes: [ClassStats; 2],
}

/// Scores directions against a fixed pair of class sample matrices
#[derive(Debug, Clone, Copy)]
pub struct DirectionScorer {
    balancedness_exponent: f64,
}

impl DirectionScorer {
    /// `balancedness_exponent` of 0 disables the balancedness weighting
    pub fn new(balancedness_exponent: f64) -> Self {
        Self {
            balancedness_exponent,
        }
    }

    /// Discriminant ratio, multiplied by the balancedness score when the
    /// exponent is positive.
    pub fn score(&self, scores_a: &[f64], scores_b: &[f64]) -> Result<f64> {
        let mut ratio = discriminant_ratio(scores_a, scores_b);
        if self.balancedness_exponent > 0.0 {
            ratio *= balancedness_score(scores_a, scores_b, self.balancedness_exponent);
        }
        anyhow::ensure!(ratio.is_finite(), "Non-finite discriminant ratio: {ratio}");
        Ok(ratio)
    }

    /// Project both classes onto `direction` and return their scores
    pub fn project(
        &self,
        data: &[Array2<f32>; 2],
        direction: ArrayView1<f32>,
    ) -> Result<[Vec<f64>; 2]> {
        Ok([
            project_onto_direction(&data[0], direction)?,
            project_onto_direction(&data[1], direction)?,
        ])
    }

    /// Full statistics for a projection
    pub fn evaluate(&self, projected: &[Vec<f64>; 2]) -> Result<ProjectionStats> {
        Ok(ProjectionStats {
            discriminant_ratio: self.score(&projected[0], &projected[1])?,
            variance_reduction: variance_reduction(&projected[0], &projected[1]),
            classes: [
                ClassStats::from_scores(&projected[0]),
                ClassStats::from_scores(&projected[1]),
            ],
        })
    }
}
