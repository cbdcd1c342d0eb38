//! Regularisation of the per-class means of a selected direction
//!
//! The composed direction is unit length; each class's output vector is that
//! direction scaled by the class's (regularised) mean projection.

use serde::{Deserialize, Serialize};

use crate::scoring::ClassStats;

/// Shrink `mean` toward zero by `factor · std_dev`, zeroing it if smaller.
///
/// A factor of 0 returns `mean` unchanged.
pub fn soft_threshold(mean: f64, std_dev: f64, factor: f64) -> f64 {
    if factor == 0.0 {
        return mean;
    }
    let threshold = factor * std_dev;
    if mean.abs() < threshold {
        0.0
    } else if mean > 0.0 {
        mean - threshold
    } else {
        mean + threshold
    }
}

/// How raw class means are corrected before scaling the output direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RegularizationPolicy {
    /// Soft-threshold each class mean by `factor` standard deviations
    SoftThreshold { factor: f64 },
    /// Re-centre both means on their midpoint; the midpoint becomes a
    /// separate de-bias direction
    MidpointCentering,
}

impl Default for RegularizationPolicy {
    fn default() -> Self {
        Self::SoftThreshold { factor: 1.0 }
    }
}

/// Class means after regularisation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularizedMeans {
    pub means: [f64; 2],
    /// Shared offset removed by midpoint centering
    pub debias: Option<f64>,
}

impl RegularizedMeans {
    /// Share of the total magnitude carried by the second class
    pub fn second_class_share(&self) -> f64 {
        magnitude_share(self.means)
    }
}

/// `|m1| / (|m0| + |m1|)`, 0 when both are zero
pub fn magnitude_share(means: [f64; 2]) -> f64 {
    let total = means[0].abs() + means[1].abs();
    if total == 0.0 {
        0.0
    } else {
        means[1].abs() / total
    }
}

impl RegularizationPolicy {
    /// Whether this policy changes the raw means at all
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::SoftThreshold { factor } if *factor == 0.0)
    }

    pub fn apply(&self, classes: &[ClassStats; 2]) -> RegularizedMeans {
        match *self {
            Self::SoftThreshold { factor } => RegularizedMeans {
                means: [
                    soft_threshold(classes[0].mean, classes[0].std_dev, factor),
                    soft_threshold(classes[1].mean, classes[1].std_dev, factor),
                ],
                debias: None,
            },
            Self::MidpointCentering => {
                let midpoint = (classes[0].mean + classes[1].mean) / 2.0;
                RegularizedMeans {
                    means: [classes[0].mean - midpoint, classes[1].mean - midpoint],
                    debias: Some(midpoint),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(mean: f64, std_dev: f64) -> ClassStats {
        ClassStats { mean, std_dev }
    }

    #[test]
    fn test_soft_threshold_zero_factor_is_identity() {
        for mean in [-3.5, -1e-9, 0.0, 0.25, 17.0] {
            assert_eq!(soft_threshold(mean, 2.0, 0.0), mean);
        }
    }

    #[test]
    fn test_soft_threshold_zeroes_weak_means() {
        assert_eq!(soft_threshold(0.5, 1.0, 1.0), 0.0);
        assert_eq!(soft_threshold(-0.9, 0.5, 2.0), 0.0);
    }

    #[test]
    fn test_soft_threshold_shrinks_preserving_sign() {
        assert!((soft_threshold(3.0, 1.0, 0.5) - 2.5).abs() < 1e-12);
        assert!((soft_threshold(-3.0, 1.0, 0.5) + 2.5).abs() < 1e-12);

        for (mean, std_dev, factor) in [(1.2, 0.3, 1.0), (-4.0, 2.0, 0.7), (0.01, 5.0, 3.0)] {
            assert!(soft_threshold(mean, std_dev, factor).abs() <= f64::abs(mean));
        }
    }

    #[test]
    fn test_soft_threshold_policy() {
        let policy = RegularizationPolicy::SoftThreshold { factor: 1.0 };
        let result = policy.apply(&[stats(-2.0, 0.5), stats(0.3, 0.4)]);

        assert_eq!(result.means, [-1.5, 0.0]);
        assert_eq!(result.debias, None);
    }

    #[test]
    fn test_midpoint_centering_policy() {
        let result = RegularizationPolicy::MidpointCentering.apply(&[stats(-1.0, 9.0), stats(3.0, 9.0)]);

        assert_eq!(result.means, [-2.0, 2.0]);
        assert_eq!(result.debias, Some(1.0));
    }

    #[test]
    fn test_identity_detection() {
        assert!(RegularizationPolicy::SoftThreshold { factor: 0.0 }.is_identity());
        assert!(!RegularizationPolicy::default().is_identity());
        assert!(!RegularizationPolicy::MidpointCentering.is_identity());
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_string(&RegularizationPolicy::SoftThreshold { factor: 0.5 }).unwrap();
        assert_eq!(json, r#"{"policy":"soft_threshold","factor":0.5}"#);

        let parsed: RegularizationPolicy =
            serde_json::from_str(r#"{"policy":"midpoint_centering"}"#).unwrap();
        assert_eq!(parsed, RegularizationPolicy::MidpointCentering);
    }

    #[test]
    fn test_magnitude_share() {
        assert_eq!(magnitude_share([0.0, 0.0]), 0.0);
        assert!((magnitude_share([-1.0, 3.0]) - 0.75).abs() < 1e-12);
    }
}
