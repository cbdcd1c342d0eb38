//! Candidate direction extraction
//!
//! Candidate directions for a layer are the eigenvectors of the symmetrised
//! cross-covariance `S = (AᵗB + (AᵗB)ᵗ) / 2` of the two classes' paired
//! hidden-state deltas.

use anyhow::Result;
use ndarray::Array2;

use crate::backend::NumericBackend;

/// Eigenvectors of the symmetrised cross-covariance of `a` and `b`, as rows.
///
/// Rows come back in ascending eigenvalue order and are left in that order;
/// the composer re-ranks them by discriminant ratio.
///
/// `a` and `b` must be non-empty, have the same feature dimension and the
/// same number of (paired) samples.
pub fn compute_symmetrised_cross_covariance_eigenvectors(
    backend: &dyn NumericBackend,
    a: &Array2<f32>,
    b: &Array2<f32>,
) -> Result<Array2<f32>> {
    anyhow::ensure!(
        a.ncols() == b.ncols(),
        "Feature dimension mismatch: {} vs {}",
        a.ncols(),
        b.ncols()
    );
    anyhow::ensure!(
        a.nrows() > 0 && b.nrows() > 0 && a.ncols() > 0,
        "Empty feature matrix ({}x{} and {}x{})",
        a.nrows(),
        a.ncols(),
        b.nrows(),
        b.ncols()
    );
    anyhow::ensure!(
        a.nrows() == b.nrows(),
        "Sample count mismatch: {} vs {} (datasets must be paired)",
        a.nrows(),
        b.nrows()
    );

    let cross = backend.transpose_matmul(a, b)?;
    let symmetrised = (&cross + &cross.t()) / 2.0;

    backend.symmetric_eigenvectors(&symmetrised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0_f32, 1.0).unwrap();
        Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng))
    }

    #[test]
    fn test_rows_are_orthonormal() {
        let a = random_matrix(20, 6, 1);
        let b = random_matrix(20, 6, 2);

        let vectors = compute_symmetrised_cross_covariance_eigenvectors(&CpuBackend, &a, &b).unwrap();
        assert_eq!(vectors.dim(), (6, 6));

        let gram = vectors.dot(&vectors.t());
        for i in 0..6 {
            for j in 0..6 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (gram[[i, j]] - expected).abs() < 1e-4,
                    "gram[{i},{j}] = {}",
                    gram[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_symmetric_in_arguments() {
        // S(A, B) == S(B, A), so the eigenvectors agree up to sign
        let a = random_matrix(15, 4, 3);
        let b = random_matrix(15, 4, 4);

        let ab = compute_symmetrised_cross_covariance_eigenvectors(&CpuBackend, &a, &b).unwrap();
        let ba = compute_symmetrised_cross_covariance_eigenvectors(&CpuBackend, &b, &a).unwrap();

        for (row_ab, row_ba) in ab.rows().into_iter().zip(ba.rows()) {
            let dot: f32 = row_ab.dot(&row_ba);
            assert!((dot.abs() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_dimension_mismatch_fails() {
        let a = random_matrix(10, 4, 5);
        let b = random_matrix(10, 5, 6);
        assert!(compute_symmetrised_cross_covariance_eigenvectors(&CpuBackend, &a, &b).is_err());
    }

    #[test]
    fn test_empty_fails() {
        let a = Array2::<f32>::zeros((0, 4));
        let b = Array2::<f32>::zeros((0, 4));
        assert!(compute_symmetrised_cross_covariance_eigenvectors(&CpuBackend, &a, &b).is_err());
    }
}
