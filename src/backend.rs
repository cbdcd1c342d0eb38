//! Numeric backends for the heavy matrix work of direction extraction
//!
//! The analysis only needs two expensive primitives: the cross-product
//! `Aᵗ·B` of two sample matrices and the eigenvectors of a symmetric matrix.
//! Both sit behind [`NumericBackend`] so the algorithm does not care whether
//! the product runs through ndarray on the host or through candle on a GPU.
//!
//! Both backends return f32 results and share the same eigensolver, so the
//! CPU and accelerator paths agree to f32 precision.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::Array2;
use tracing::info;

/// Matrix primitives used by the direction extractor.
///
/// Implementations must be deterministic: the same inputs give the same
/// outputs regardless of which thread calls them.
pub trait NumericBackend: Send + Sync {
    /// Short human-readable backend name (for logs)
    fn name(&self) -> String;

    /// Compute `Aᵗ·B` for `A: (n, d)` and `B: (n, d)`, giving `(d, d)`.
    fn transpose_matmul(&self, a: &Array2<f32>, b: &Array2<f32>) -> Result<Array2<f32>>;

    /// Eigenvectors of a symmetric matrix, one per row, in ascending
    /// eigenvalue order.
    fn symmetric_eigenvectors(&self, matrix: &Array2<f32>) -> Result<Array2<f32>> {
        symmetric_eigenvectors_ascending(matrix)
    }
}

/// Host backend: ndarray products
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl NumericBackend for CpuBackend {
    fn name(&self) -> String {
        "cpu (ndarray)".to_string()
    }

    fn transpose_matmul(&self, a: &Array2<f32>, b: &Array2<f32>) -> Result<Array2<f32>> {
        anyhow::ensure!(
            a.nrows() == b.nrows(),
            "Cannot multiply Aᵗ·B: A has {} rows, B has {}",
            a.nrows(),
            b.nrows()
        );
        Ok(a.t().dot(b))
    }
}

/// Candle backend: runs the cross-product on a candle device (CPU or CUDA)
#[derive(Debug, Clone)]
pub struct CandleBackend {
    device: Device,
}

impl CandleBackend {
    /// Use an explicit device
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Try CUDA, fall back to CPU (None = auto-detect)
    pub fn with_device(force_cpu: Option<bool>) -> Self {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn to_tensor(&self, matrix: &Array2<f32>) -> Result<Tensor> {
        let flat: Vec<f32> = matrix.iter().copied().collect();
        Ok(Tensor::from_vec(flat, matrix.dim(), &self.device)?)
    }
}

impl NumericBackend for CandleBackend {
    fn name(&self) -> String {
        format!("candle ({:?})", self.device)
    }

    fn transpose_matmul(&self, a: &Array2<f32>, b: &Array2<f32>) -> Result<Array2<f32>> {
        anyhow::ensure!(
            a.nrows() == b.nrows(),
            "Cannot multiply Aᵗ·B: A has {} rows, B has {}",
            a.nrows(),
            b.nrows()
        );
        let a = self.to_tensor(a)?;
        let b = self.to_tensor(b)?;
        let product = a.t()?.contiguous()?.matmul(&b)?;
        let (rows, cols) = product.dims2()?;
        let flat: Vec<f32> = product
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1()?;
        Array2::from_shape_vec((rows, cols), flat).context("Failed to reshape candle product")
    }
}

/// Shared symmetric eigensolver (nalgebra, f64 internally).
///
/// nalgebra returns eigenpairs unordered; they are re-sorted ascending by
/// eigenvalue (stable) and each eigenvector becomes a row of the result.
pub fn symmetric_eigenvectors_ascending(matrix: &Array2<f32>) -> Result<Array2<f32>> {
    let (rows, cols) = matrix.dim();
    anyhow::ensure!(rows == cols, "Matrix is not square: {rows}x{cols}");
    anyhow::ensure!(rows > 0, "Cannot decompose an empty matrix");
    anyhow::ensure!(
        matrix.iter().all(|v| v.is_finite()),
        "Matrix contains non-finite values"
    );

    let dense = DMatrix::<f64>::from_fn(rows, cols, |i, j| f64::from(matrix[[i, j]]));
    let eigen = SymmetricEigen::new(dense);

    let mut order: Vec<usize> = (0..rows).collect();
    order.sort_by(|&x, &y| {
        eigen.eigenvalues[x]
            .partial_cmp(&eigen.eigenvalues[y])
            .unwrap_or(Ordering::Equal)
    });

    Ok(Array2::from_shape_fn((rows, cols), |(r, c)| {
        eigen.eigenvectors[(c, order[r])] as f32
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_cpu_transpose_matmul() {
        let a = array![[1.0_f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let b = array![[1.0_f32, 0.0], [0.0, 1.0], [1.0, 1.0]];

        let product = CpuBackend.transpose_matmul(&a, &b).unwrap();

        // Aᵗ·B = [[1+5, 3+5], [2+6, 4+6]]
        assert_eq!(product, array![[6.0_f32, 8.0], [8.0, 10.0]]);
    }

    #[test]
    fn test_row_mismatch_rejected() {
        let a = Array2::<f32>::zeros((3, 2));
        let b = Array2::<f32>::zeros((4, 2));
        assert!(CpuBackend.transpose_matmul(&a, &b).is_err());
    }

    #[test]
    fn test_candle_matches_cpu() {
        let a = array![[0.5_f32, -1.0, 2.0], [1.5, 0.25, -0.75]];
        let b = array![[2.0_f32, 1.0, 0.0], [-1.0, 3.0, 0.5]];

        let cpu = CpuBackend.transpose_matmul(&a, &b).unwrap();
        let candle = CandleBackend::new(Device::Cpu)
            .transpose_matmul(&a, &b)
            .unwrap();

        for (x, y) in cpu.iter().zip(candle.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_eigenvectors_ascending() {
        let m = array![[3.0_f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 2.0]];
        let vectors = symmetric_eigenvectors_ascending(&m).unwrap();

        // Eigenvalue 1 -> e1, 2 -> e2, 3 -> e0
        assert!((vectors[[0, 1]].abs() - 1.0).abs() < 1e-6);
        assert!((vectors[[1, 2]].abs() - 1.0).abs() < 1e-6);
        assert!((vectors[[2, 0]].abs() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_non_square_rejected() {
        let m = Array2::<f32>::zeros((2, 3));
        assert!(symmetric_eigenvectors_ascending(&m).is_err());
    }
}
