// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Batched linear algebra on the two leading (matrix) axes.
//!
//! Batch axes trail the matrix axes. Products accept operands whose batch
//! shapes differ only when one of them has a single batch element; both
//! operands are coerced to rank 3 by flattening their trailing axes and the
//! result is reshaped back.

use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn, Zip};

use super::{apply_one, broadcast_view, Operation};
use crate::backend::ExecContext;
use crate::error::{self, Result};
use crate::Tensor;

/// Flattens every axis after the first two into a single batch axis.
pub fn coerce_rank3(array: &ArrayD<f64>) -> Result<Array3<f64>> {
    let shape = array.shape();
    if shape.len() < 2 {
        return Err(error::shape(format!(
            "expected at least two matrix axes, got shape {shape:?}"
        )));
    }
    let batch: usize = shape[2..].iter().product();
    array
        .as_standard_layout()
        .into_owned()
        .into_shape((shape[0], shape[1], batch))
        .map_err(|err| error::shape(format!("coerce_rank3: {err}")))
}

/// Inverse of [`coerce_rank3`]: restores the trailing batch axes.
pub fn uncoerce_rank3(array: Array3<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
    array
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(shape))
        .map_err(|err| error::shape(format!("uncoerce_rank3 to {shape:?}: {err}")))
}

/// Identity of size `n` laid out as `(n, n, 1, …, 1)` with `rank` axes.
pub(crate) fn batched_eye(n: usize, rank: usize) -> Result<ArrayD<f64>> {
    let mut shape = vec![1usize; rank.max(2)];
    shape[0] = n;
    shape[1] = n;
    Array2::<f64>::eye(n)
        .into_shape(IxDyn(&shape))
        .map_err(|err| error::shape(format!("batched_eye: {err}")))
}

fn reduce_batch(grad: Array3<f64>, batch: usize) -> Array3<f64> {
    if batch == 1 && grad.len_of(Axis(2)) != 1 {
        grad.sum_axis(Axis(2)).insert_axis(Axis(2))
    } else {
        grad
    }
}

fn batch_len(shape: &[usize]) -> usize {
    shape[2..].iter().product()
}

#[derive(Debug)]
struct BatchedTranspose;

fn swap_leading(array: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    if array.ndim() < 2 {
        return Err(error::shape(format!(
            "batched_transpose needs two matrix axes, got shape {:?}",
            array.shape()
        )));
    }
    let mut out = array.clone();
    out.swap_axes(0, 1);
    Ok(out.as_standard_layout().into_owned())
}

impl Operation for BatchedTranspose {
    fn name(&self) -> &'static str {
        "batched_transpose"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        Ok(vec![swap_leading(inputs[0])?])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        _inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        Ok(vec![Some(swap_leading(&grads[0])?)])
    }
}

#[derive(Debug)]
struct BatchedMul;

impl BatchedMul {
    fn output_shape(x: &[usize], y: &[usize]) -> Result<Vec<usize>> {
        if x.len() < 2 || y.len() < 2 {
            return Err(error::shape(format!(
                "batched_mul needs two matrix axes, got {x:?} and {y:?}"
            )));
        }
        if x[1] != y[0] {
            return Err(error::shape(format!(
                "batched_mul: inner dimensions differ for {x:?} · {y:?}"
            )));
        }
        let (bx, by) = (&x[2..], &y[2..]);
        let batch = if bx == by || batch_len(y) == 1 {
            bx
        } else if batch_len(x) == 1 {
            by
        } else {
            return Err(error::shape(format!(
                "batched_mul: batch shapes {bx:?} and {by:?} are incompatible"
            )));
        };
        let mut shape = vec![x[0], y[1]];
        shape.extend_from_slice(batch);
        Ok(shape)
    }
}

impl Operation for BatchedMul {
    fn name(&self) -> &'static str {
        "batched_mul"
    }

    fn forward(&self, ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let (x, y) = (inputs[0], inputs[1]);
        let shape = Self::output_shape(x.shape(), y.shape())?;
        let product = ctx.backend().batched_gemm(
            coerce_rank3(x)?.view(),
            coerce_rank3(y)?.view(),
            false,
            false,
        )?;
        Ok(vec![uncoerce_rank3(product, &shape)?])
    }

    fn backward(
        &self,
        ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let (x, y) = (&inputs[0], &inputs[1]);
        let (x3, y3, g3) = (coerce_rank3(x)?, coerce_rank3(y)?, coerce_rank3(&grads[0])?);
        let backend = ctx.backend();
        let gx = backend.batched_gemm(g3.view(), y3.view(), false, true)?;
        let gy = backend.batched_gemm(x3.view(), g3.view(), true, false)?;
        Ok(vec![
            Some(uncoerce_rank3(reduce_batch(gx, batch_len(x.shape())), x.shape())?),
            Some(uncoerce_rank3(reduce_batch(gy, batch_len(y.shape())), y.shape())?),
        ])
    }
}

/// Embeds `(n, batch…)` vectors as `(n, n, batch…)` diagonal matrices.
#[derive(Debug)]
struct Diagonal;

impl Operation for Diagonal {
    fn name(&self) -> &'static str {
        "diagonal"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let x = inputs[0];
        if x.ndim() == 0 {
            return Err(error::shape("diagonal needs at least one axis"));
        }
        let n = x.len_of(Axis(0));
        let column = x.view().insert_axis(Axis(1));
        let mut shape = column.shape().to_vec();
        shape[1] = n;
        let eye = batched_eye(n, shape.len())?;
        let column = column
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| error::shape("diagonal: broadcast failed"))?;
        let eye = broadcast_view(&eye, &shape)?;
        Ok(vec![Zip::from(&column).and(&eye).map_collect(|v, e| v * e)])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        _inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let g = &grads[0];
        let eye = batched_eye(g.len_of(Axis(0)), g.ndim())?;
        let eye = broadcast_view(&eye, g.shape())?;
        let masked = Zip::from(g).and(&eye).map_collect(|g, e| g * e);
        Ok(vec![Some(masked.sum_axis(Axis(1)))])
    }
}

/// Swaps the two leading axes; batch axes are untouched.
pub fn batched_transpose(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    apply_one(ctx, BatchedTranspose, &[x])
}

/// Matrix product over the leading axes, broadcast over batch axes.
pub fn batched_mul(ctx: &ExecContext, x: &Tensor, y: &Tensor) -> Result<Tensor> {
    apply_one(ctx, BatchedMul, &[x, y])
}

/// Diagonal matrix from a batch of vectors.
pub fn diagonal(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    apply_one(ctx, Diagonal, &[x])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rank_coercion_is_inverse_on_shape() {
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4, 5]), |ix| (ix[0] + 10 * ix[3]) as f64);
        let flat = coerce_rank3(&x).unwrap();
        assert_eq!(flat.dim(), (2, 3, 20));
        let restored = uncoerce_rank3(flat, &[2, 3, 4, 5]).unwrap();
        assert_eq!(restored, x);
    }

    #[test]
    fn matrix_times_shared_weight() {
        let ctx = ExecContext::cpu();
        let x = Tensor::from_array(ArrayD::from_elem(IxDyn(&[4, 3, 2, 5]), 1.0));
        let w = Tensor::parameter(array![[1.0], [2.0], [3.0]].into_dyn());
        let y = batched_mul(&ctx, &x, &w).unwrap();
        assert_eq!(y.shape(), vec![4, 1, 2, 5]);
        assert!(y.to_vec().iter().all(|&v| v == 6.0));
        y.backward().unwrap();
        assert_eq!(w.grad().unwrap().iter().copied().collect::<Vec<f64>>(), vec![40.0; 3]);
    }

    #[test]
    fn diagonal_embeds_vectors() {
        let ctx = ExecContext::cpu();
        let v = Tensor::from_array(array![[1.0, 4.0], [2.0, 5.0]].into_dyn());
        let d = diagonal(&ctx, &v).unwrap();
        assert_eq!(d.shape(), vec![2, 2, 2]);
        let data = d.data();
        assert_eq!(data[[0, 0, 1]], 4.0);
        assert_eq!(data[[1, 1, 0]], 2.0);
        assert_eq!(data[[0, 1, 0]], 0.0);
    }

    #[test]
    fn transpose_swaps_matrix_axes_only() {
        let ctx = ExecContext::cpu();
        let x = Tensor::from_array(ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |ix| {
            (100 * ix[0] + 10 * ix[1] + ix[2]) as f64
        }));
        let t = batched_transpose(&ctx, &x).unwrap();
        assert_eq!(t.shape(), vec![3, 2, 4]);
        assert_eq!(t.data()[[2, 1, 3]], 123.0);
    }
}
