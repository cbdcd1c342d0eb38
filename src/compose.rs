//! Candidate filtering and greedy composition of a compound direction
//!
//! ## Algorithm
//!
//! ```text
//! candidates = [ (score(v), mean_b(v) · v)  for v in eigenvectors  if score(v) >= tol ]
//! stable-sort candidates by score, descending
//! sum = 0, best = 0
//! for (_, c) in candidates:
//!     u = (sum + c) / |sum + c|
//!     if score(u) > best + tol:  sum += c, best = score(u)
//! ```
//!
//! Scaling each eigenvector by the second class's mean projection fixes its
//! otherwise arbitrary sign and weights it by how far that class moves along it.

use std::cmp::Ordering;

use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1};
use tracing::debug;

use crate::scoring::{mean, DirectionScorer, ProjectionStats};

/// A retained eigen-direction, scaled by the second class's mean projection
#[derive(Debug, Clone)]
pub struct Candidate {
    pub discriminant_ratio: f64,
    pub direction: Array1<f32>,
}

/// The compound direction chosen for a layer
#[derive(Debug, Clone)]
pub struct Composition {
    /// Statistics of the best accepted compound direction
    pub stats: ProjectionStats,
    /// Unit-length compound direction
    pub direction: Array1<f32>,
    /// Number of candidates folded into the compound direction
    pub accepted: usize,
    /// Best recorded ratio after each candidate was tried
    pub history: Vec<f64>,
}

/// Filters eigen-directions and greedily sums the best of them
#[derive(Debug, Clone, Copy)]
pub struct GreedyComposer {
    scorer: DirectionScorer,
    tolerance: f64,
}

impl GreedyComposer {
    /// `tolerance` is both the minimum candidate score and the minimum
    /// improvement needed to accept a candidate into the sum.
    pub fn new(scorer: DirectionScorer, tolerance: f64) -> Self {
        Self { scorer, tolerance }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Score every eigenvector (one per row), keep those scoring at least the
    /// tolerance, and sort them best first (ties keep eigen order).
    pub fn candidates(
        &self,
        data: &[Array2<f32>; 2],
        eigenvectors: &Array2<f32>,
    ) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for direction in eigenvectors.rows() {
            let projected = self.scorer.project(data, direction)?;
            let ratio = self.scorer.score(&projected[0], &projected[1])?;
            if ratio >= self.tolerance {
                let scale = mean(&projected[1]) as f32;
                candidates.push(Candidate {
                    discriminant_ratio: ratio,
                    direction: direction.mapv(|v| v * scale),
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.discriminant_ratio
                .partial_cmp(&a.discriminant_ratio)
                .unwrap_or(Ordering::Equal)
        });

        debug!(
            "{}/{} directions passed tolerance {}",
            candidates.len(),
            eigenvectors.nrows(),
            self.tolerance
        );

        Ok(candidates)
    }

    /// Greedily sum candidates, keeping each only if the normalised sum
    /// improves the best score by more than the tolerance.
    ///
    /// Returns `None` when no candidate was accepted.
    pub fn compose(
        &self,
        data: &[Array2<f32>; 2],
        candidates: &[Candidate],
    ) -> Result<Option<Composition>> {
        let Some(first) = candidates.first() else {
            return Ok(None);
        };

        let mut sum = Array1::<f32>::zeros(first.direction.len());
        let mut best: Option<ProjectionStats> = None;
        let mut accepted = 0;
        let mut history = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let tentative = &sum + &candidate.direction;
            let Some(unit) = normalized(tentative.view()) else {
                history.push(best_ratio(best.as_ref()));
                continue;
            };

            let projected = self.scorer.project(data, unit.view())?;
            let stats = self.scorer.evaluate(&projected)?;

            if stats.discriminant_ratio > best_ratio(best.as_ref()) + self.tolerance {
                sum = tentative;
                best = Some(stats);
                accepted += 1;
            }
            history.push(best_ratio(best.as_ref()));
        }

        let Some(stats) = best else {
            return Ok(None);
        };
        let direction = normalized(sum.view())
            .ok_or_else(|| anyhow::anyhow!("Accepted compound direction has zero norm"))?;

        Ok(Some(Composition {
            stats,
            direction,
            accepted,
            history,
        }))
    }
}

fn best_ratio(best: Option<&ProjectionStats>) -> f64 {
    best.map_or(0.0, |s| s.discriminant_ratio)
}

/// Unit vector along `v`, or `None` for a zero or non-finite norm
pub fn normalized(v: ArrayView1<f32>) -> Option<Array1<f32>> {
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 && norm.is_finite() {
        Some(v.mapv(|x| x / norm))
    } else {
        None
    }
}
