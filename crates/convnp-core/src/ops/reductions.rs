// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reductions with max-shifted, overflow-free forms.

use ndarray::{ArrayD, Axis, Zip};

use super::{apply_one, broadcast_view, normalise_axes, Operation};
use crate::backend::ExecContext;
use crate::error::Result;
use crate::Tensor;

fn sum_keepdims(array: ArrayD<f64>, axes: &[usize]) -> ArrayD<f64> {
    axes.iter().fold(array, |acc, &axis| {
        acc.sum_axis(Axis(axis)).insert_axis(Axis(axis))
    })
}

/// Running maximum over `axes`, kept as singleton axes. Non-finite maxima are
/// replaced by zero so that all-`-inf` slices do not produce `inf - inf`.
fn shift(array: &ArrayD<f64>, axes: &[usize]) -> ArrayD<f64> {
    let mut max = axes.iter().fold(array.clone(), |acc, &axis| {
        acc.fold_axis(Axis(axis), f64::NEG_INFINITY, |m, v| m.max(*v))
            .insert_axis(Axis(axis))
    });
    max.mapv_inplace(|m| if m.is_finite() { m } else { 0.0 });
    max
}

#[derive(Debug)]
struct LogSumExp {
    axes: Vec<usize>,
}

impl Operation for LogSumExp {
    fn name(&self) -> &'static str {
        "logsumexp"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let x = inputs[0];
        let max = shift(x, &self.axes);
        let max_b = broadcast_view(&max, x.shape())?;
        let shifted = Zip::from(x).and(&max_b).map_collect(|x, m| (x - m).exp());
        let total = sum_keepdims(shifted, &self.axes);
        Ok(vec![Zip::from(&max).and(&total).map_collect(|m, s| m + s.ln())])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let x = &inputs[0];
        let result = broadcast_view(&outputs[0], x.shape())?;
        let g = broadcast_view(&grads[0], x.shape())?;
        let gx = Zip::from(x).and(&result).and(&g).map_collect(|x, r, g| {
            let w = (x - r).exp();
            if w.is_nan() {
                0.0
            } else {
                g * w
            }
        });
        Ok(vec![Some(gx)])
    }
}

#[derive(Debug)]
struct Softmax {
    axes: Vec<usize>,
}

impl Operation for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let x = inputs[0];
        let max = shift(x, &self.axes);
        let max_b = broadcast_view(&max, x.shape())?;
        let e = Zip::from(x).and(&max_b).map_collect(|x, m| (x - m).exp());
        let total = sum_keepdims(e.clone(), &self.axes);
        let total_b = broadcast_view(&total, x.shape())?;
        Ok(vec![Zip::from(&e).and(&total_b).map_collect(|e, s| e / s)])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        _inputs: &[ArrayD<f64>],
        outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let (y, g) = (&outputs[0], &grads[0]);
        let dot = sum_keepdims(g * y, &self.axes);
        let dot_b = broadcast_view(&dot, y.shape())?;
        let gx = Zip::from(y)
            .and(g)
            .and(&dot_b)
            .map_collect(|y, g, d| y * (g - d));
        Ok(vec![Some(gx)])
    }
}

#[derive(Debug)]
struct Sum {
    axes: Vec<usize>,
    keepdim: bool,
}

impl Operation for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let kept = sum_keepdims(inputs[0].clone(), &self.axes);
        if self.keepdim {
            return Ok(vec![kept]);
        }
        let out = self
            .axes
            .iter()
            .rev()
            .fold(kept, |acc, &axis| acc.index_axis_move(Axis(axis), 0));
        Ok(vec![out])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let mut g = grads[0].clone();
        if !self.keepdim {
            for &axis in &self.axes {
                g = g.insert_axis(Axis(axis));
            }
        }
        Ok(vec![Some(broadcast_view(&g, inputs[0].shape())?.to_owned())])
    }
}

/// `max + log Σ exp(x − max)` over `axes`, keeping them as singleton axes.
///
/// When every reduced axis already has size one the input is returned as is
/// and nothing is recorded on the tape.
pub fn logsumexp(ctx: &ExecContext, x: &Tensor, axes: &[usize]) -> Result<Tensor> {
    let shape = x.shape();
    let axes = normalise_axes("logsumexp", axes, shape.len())?;
    if axes.iter().all(|&axis| shape[axis] == 1) {
        return Ok(x.clone());
    }
    apply_one(ctx, LogSumExp { axes }, &[x])
}

/// Softmax over `axes`.
pub fn softmax(ctx: &ExecContext, x: &Tensor, axes: &[usize]) -> Result<Tensor> {
    let axes = normalise_axes("softmax", axes, x.ndim())?;
    apply_one(ctx, Softmax { axes }, &[x])
}

/// Sum over `axes`; an empty axis list sums everything.
pub fn sum(ctx: &ExecContext, x: &Tensor, axes: &[usize], keepdim: bool) -> Result<Tensor> {
    let axes = if axes.is_empty() {
        (0..x.ndim()).collect()
    } else {
        normalise_axes("sum", axes, x.ndim())?
    };
    apply_one(ctx, Sum { axes, keepdim }, &[x])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn logsumexp_survives_huge_inputs() {
        let ctx = ExecContext::cpu();
        let x = Tensor::from_shape_vec(&[3], vec![1e30, 0.0, 0.0]).unwrap();
        let y = logsumexp(&ctx, &x, &[0]).unwrap().item().unwrap();
        assert!(y.is_finite());
        assert_relative_eq!(y, 1e30, max_relative = 1e-12);
    }

    #[test]
    fn logsumexp_skips_singleton_axes() {
        let ctx = ExecContext::cpu();
        let x = Tensor::parameter(ndarray::ArrayD::zeros(ndarray::IxDyn(&[4, 1])));
        let y = logsumexp(&ctx, &x, &[1]).unwrap();
        assert_eq!(y.id(), x.id());
        assert!(y.is_leaf());
    }

    #[test]
    fn softmax_normalises() {
        let ctx = ExecContext::cpu();
        let x = Tensor::from_shape_vec(&[2, 3], vec![1.0, 2.0, 3.0, 1e300, -1e300, 0.0]).unwrap();
        let y = softmax(&ctx, &x, &[1]).unwrap().data();
        for row in y.outer_iter() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn sum_drops_axes_unless_kept() {
        let ctx = ExecContext::cpu();
        let x = Tensor::ones(&[2, 3, 4]);
        assert_eq!(sum(&ctx, &x, &[0, 2], false).unwrap().shape(), vec![3]);
        assert_eq!(sum(&ctx, &x, &[1], true).unwrap().shape(), vec![2, 1, 4]);
        assert_eq!(sum(&ctx, &x, &[], false).unwrap().item().unwrap(), 24.0);
    }
}
