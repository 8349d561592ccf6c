// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use nalgebra::{Cholesky, DMatrix};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use super::{Backend, DeviceCaps};
use crate::error::{self, Error, Result};

/// Host backend. Batched kernels fan out over the batch axis with rayon.
#[derive(Clone, Copy, Debug)]
pub struct CpuBackend {
    caps: DeviceCaps,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            caps: DeviceCaps::cpu(),
        }
    }

    /// Host backend that advertises accelerator constraints, so code paths
    /// that would index single elements are rejected exactly as on a device.
    pub fn strict() -> Self {
        Self {
            caps: DeviceCaps::accelerator(),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn batch_extent(label: &str, left: usize, right: usize) -> Result<usize> {
    if left == right || right == 1 {
        Ok(left)
    } else if left == 1 {
        Ok(right)
    } else {
        Err(error::shape(format!(
            "{label}: batch extents {left} and {right} cannot be broadcast"
        )))
    }
}

#[inline]
fn pick(extent: usize, index: usize) -> usize {
    if extent == 1 {
        0
    } else {
        index
    }
}

fn stack_batch(label: &str, mats: Vec<Array2<f64>>) -> Result<Array3<f64>> {
    let views: Vec<ArrayView2<'_, f64>> = mats.iter().map(|m| m.view()).collect();
    ndarray::stack(Axis(2), &views).map_err(|err| error::shape(format!("{label}: {err}")))
}

fn to_matrix(a: ArrayView2<'_, f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn from_matrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}

fn cholesky_single(a: ArrayView2<'_, f64>, batch: usize) -> Result<Array2<f64>> {
    let factor = Cholesky::new(to_matrix(a)).ok_or(Error::NotPositiveDefinite { batch })?;
    let upper = factor.l().transpose();
    if upper.diagonal().iter().any(|d| !(*d > 0.0) || !d.is_finite()) {
        return Err(Error::NotPositiveDefinite { batch });
    }
    Ok(from_matrix(&upper))
}

fn solve_upper_single(
    u: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
    transpose: bool,
    batch: usize,
) -> Result<Array2<f64>> {
    let (u, b) = (to_matrix(u), to_matrix(b));
    let solved = if transpose {
        u.tr_solve_upper_triangular(&b)
    } else {
        u.solve_upper_triangular(&b)
    };
    solved
        .map(|x| from_matrix(&x))
        .ok_or_else(|| Error::Backend(format!("solve_upper: singular factor in batch element {batch}")))
}

impl Backend for CpuBackend {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn batched_gemm(
        &self,
        a: ArrayView3<'_, f64>,
        b: ArrayView3<'_, f64>,
        transpose_a: bool,
        transpose_b: bool,
    ) -> Result<Array3<f64>> {
        let (ar, ac, ab) = a.dim();
        let (br, bc, bb) = b.dim();
        let (m, k) = if transpose_a { (ac, ar) } else { (ar, ac) };
        let (kb, n) = if transpose_b { (bc, br) } else { (br, bc) };
        if k != kb {
            return Err(error::shape(format!(
                "batched_gemm: inner dimensions {k} and {kb} differ"
            )));
        }
        let batch = batch_extent("batched_gemm", ab, bb)?;
        let mats: Vec<Array2<f64>> = (0..batch)
            .into_par_iter()
            .map(|i| {
                let ai = a.index_axis(Axis(2), pick(ab, i));
                let bi = b.index_axis(Axis(2), pick(bb, i));
                let ai = if transpose_a { ai.reversed_axes() } else { ai };
                let bi = if transpose_b { bi.reversed_axes() } else { bi };
                ai.dot(&bi)
            })
            .collect();
        if batch == 0 {
            return Ok(Array3::zeros((m, n, 0)));
        }
        stack_batch("batched_gemm", mats)
    }

    fn cholesky_upper(&self, a: ArrayView3<'_, f64>) -> Result<Array3<f64>> {
        let (rows, cols, batch) = a.dim();
        if rows != cols {
            return Err(error::shape(format!(
                "cholesky: expected square matrices, got {rows}x{cols}"
            )));
        }
        let mats = (0..batch)
            .into_par_iter()
            .map(|i| cholesky_single(a.index_axis(Axis(2), i), i))
            .collect::<Result<Vec<_>>>()?;
        if batch == 0 {
            return Ok(Array3::zeros((rows, cols, 0)));
        }
        stack_batch("cholesky", mats)
    }

    fn solve_upper(
        &self,
        u: ArrayView3<'_, f64>,
        b: ArrayView3<'_, f64>,
        transpose: bool,
    ) -> Result<Array3<f64>> {
        let (ur, uc, ub) = u.dim();
        let (br, bc, bb) = b.dim();
        if ur != uc || ur != br {
            return Err(error::shape(format!(
                "solve_upper: cannot solve a {ur}x{uc} system against {br} rows"
            )));
        }
        let batch = batch_extent("solve_upper", ub, bb)?;
        let mats = (0..batch)
            .into_par_iter()
            .map(|i| {
                solve_upper_single(
                    u.index_axis(Axis(2), pick(ub, i)),
                    b.index_axis(Axis(2), pick(bb, i)),
                    transpose,
                    i,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        if batch == 0 {
            return Ok(Array3::zeros((br, bc, 0)));
        }
        stack_batch("solve_upper", mats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn batch_of(m: Array2<f64>) -> Array3<f64> {
        m.insert_axis(Axis(2))
    }

    #[test]
    fn gemm_broadcasts_singleton_batch() {
        let backend = CpuBackend::new();
        let a = Array3::from_shape_fn((2, 3, 4), |(i, j, b)| (i + j + b) as f64);
        let w = batch_of(array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let out = backend.batched_gemm(a.view(), w.view(), false, false).unwrap();
        assert_eq!(out.dim(), (2, 2, 4));
        let expected = a.index_axis(Axis(2), 3).dot(&w.index_axis(Axis(2), 0));
        assert_eq!(out.index_axis(Axis(2), 3), expected);
    }

    #[test]
    fn gemm_rejects_incompatible_batches() {
        let backend = CpuBackend::new();
        let a = Array3::<f64>::zeros((2, 2, 3));
        let b = Array3::<f64>::zeros((2, 2, 2));
        assert!(backend.batched_gemm(a.view(), b.view(), false, false).is_err());
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let backend = CpuBackend::new();
        let a = batch_of(array![[4.0, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]]);
        let u = backend.cholesky_upper(a.view()).unwrap();
        let rebuilt = backend.batched_gemm(u.view(), u.view(), true, false).unwrap();
        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn cholesky_reports_indefinite_batch_element() {
        let backend = CpuBackend::new();
        let good = array![[1.0, 0.0], [0.0, 1.0]];
        let bad = array![[1.0, 2.0], [2.0, 1.0]];
        let a = ndarray::stack(Axis(2), &[good.view(), bad.view()]).unwrap();
        assert!(matches!(
            backend.cholesky_upper(a.view()),
            Err(Error::NotPositiveDefinite { batch: 1 })
        ));
    }

    #[test]
    fn non_finite_and_singular_inputs_are_reported() {
        let backend = CpuBackend::new();
        let nan = batch_of(array![[f64::NAN, 0.0], [0.0, 1.0]]);
        assert!(matches!(
            backend.cholesky_upper(nan.view()),
            Err(Error::NotPositiveDefinite { batch: 0 })
        ));
        let semidefinite = batch_of(array![[1.0, 1.0], [1.0, 1.0]]);
        assert!(matches!(
            backend.cholesky_upper(semidefinite.view()),
            Err(Error::NotPositiveDefinite { batch: 0 })
        ));
        let singular = batch_of(array![[1.0, 1.0], [0.0, 0.0]]);
        let rhs = batch_of(array![[1.0], [1.0]]);
        assert!(matches!(
            backend.solve_upper(singular.view(), rhs.view(), false),
            Err(Error::Backend(_))
        ));
    }

    #[test]
    fn triangular_solves_invert_factor() {
        let backend = CpuBackend::new();
        let u = batch_of(array![[2.0, 1.0], [0.0, 3.0]]);
        let rhs = batch_of(array![[1.0], [2.0]]);
        let x = backend.solve_upper(u.view(), rhs.view(), false).unwrap();
        let back = backend.batched_gemm(u.view(), x.view(), false, false).unwrap();
        assert_abs_diff_eq!(back[[0, 0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[[1, 0, 0]], 2.0, epsilon = 1e-12);
        let y = backend.solve_upper(u.view(), rhs.view(), true).unwrap();
        let back = backend.batched_gemm(u.view(), y.view(), true, false).unwrap();
        assert_abs_diff_eq!(back[[0, 0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[[1, 0, 0]], 2.0, epsilon = 1e-12);
    }
}
