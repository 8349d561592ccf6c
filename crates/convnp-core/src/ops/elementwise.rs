// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Broadcasting element-wise arithmetic and pointwise transforms.

use ndarray::{ArrayD, Zip};

use super::{apply_one, broadcast_shape, broadcast_view, unbroadcast, Operation};
use crate::backend::ExecContext;
use crate::error::Result;
use crate::Tensor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug)]
struct Binary(BinaryKind);

impl Operation for Binary {
    fn name(&self) -> &'static str {
        match self.0 {
            BinaryKind::Add => "add",
            BinaryKind::Sub => "sub",
            BinaryKind::Mul => "mul",
            BinaryKind::Div => "div",
        }
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let (a, b) = (inputs[0], inputs[1]);
        let shape = broadcast_shape(a.shape(), b.shape())?;
        let av = broadcast_view(a, &shape)?;
        let bv = broadcast_view(b, &shape)?;
        let out = match self.0 {
            BinaryKind::Add => Zip::from(&av).and(&bv).map_collect(|x, y| x + y),
            BinaryKind::Sub => Zip::from(&av).and(&bv).map_collect(|x, y| x - y),
            BinaryKind::Mul => Zip::from(&av).and(&bv).map_collect(|x, y| x * y),
            BinaryKind::Div => Zip::from(&av).and(&bv).map_collect(|x, y| x / y),
        };
        Ok(vec![out])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let (a, b, g) = (&inputs[0], &inputs[1], &grads[0]);
        let shape = g.shape().to_vec();
        let (ga, gb) = match self.0 {
            BinaryKind::Add => (g.clone(), g.clone()),
            BinaryKind::Sub => (g.clone(), g.mapv(|v| -v)),
            BinaryKind::Mul => {
                let av = broadcast_view(a, &shape)?;
                let bv = broadcast_view(b, &shape)?;
                (
                    Zip::from(g).and(&bv).map_collect(|g, y| g * y),
                    Zip::from(g).and(&av).map_collect(|g, x| g * x),
                )
            }
            BinaryKind::Div => {
                let av = broadcast_view(a, &shape)?;
                let bv = broadcast_view(b, &shape)?;
                (
                    Zip::from(g).and(&bv).map_collect(|g, y| g / y),
                    Zip::from(g)
                        .and(&av)
                        .and(&bv)
                        .map_collect(|g, x, y| -g * x / (y * y)),
                )
            }
        };
        Ok(vec![
            Some(unbroadcast(ga, a.shape())),
            Some(unbroadcast(gb, b.shape())),
        ])
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum UnaryKind {
    Neg,
    Exp,
    Log,
    Sqrt,
    Square,
    Relu,
    Scale(f64),
    AddScalar(f64),
}

#[derive(Debug)]
struct Unary(UnaryKind);

impl Operation for Unary {
    fn name(&self) -> &'static str {
        match self.0 {
            UnaryKind::Neg => "neg",
            UnaryKind::Exp => "exp",
            UnaryKind::Log => "log",
            UnaryKind::Sqrt => "sqrt",
            UnaryKind::Square => "square",
            UnaryKind::Relu => "relu",
            UnaryKind::Scale(_) => "scale",
            UnaryKind::AddScalar(_) => "add_scalar",
        }
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let x = inputs[0];
        let out = match self.0 {
            UnaryKind::Neg => x.mapv(|v| -v),
            UnaryKind::Exp => x.mapv(f64::exp),
            UnaryKind::Log => x.mapv(f64::ln),
            UnaryKind::Sqrt => x.mapv(f64::sqrt),
            UnaryKind::Square => x.mapv(|v| v * v),
            UnaryKind::Relu => x.mapv(|v| v.max(0.0)),
            UnaryKind::Scale(c) => x.mapv(|v| c * v),
            UnaryKind::AddScalar(c) => x.mapv(|v| v + c),
        };
        Ok(vec![out])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let (x, y, g) = (&inputs[0], &outputs[0], &grads[0]);
        let gx = match self.0 {
            UnaryKind::Neg => g.mapv(|v| -v),
            UnaryKind::Exp => g * y,
            UnaryKind::Log => g / x,
            UnaryKind::Sqrt => Zip::from(g).and(y).map_collect(|g, y| g / (2.0 * y)),
            UnaryKind::Square => Zip::from(g).and(x).map_collect(|g, x| 2.0 * x * g),
            UnaryKind::Relu => Zip::from(g)
                .and(x)
                .map_collect(|&g, &x| if x > 0.0 { g } else { 0.0 }),
            UnaryKind::Scale(c) => g.mapv(|v| c * v),
            UnaryKind::AddScalar(_) => g.clone(),
        };
        Ok(vec![Some(gx)])
    }
}

/// `log(1 + exp(x))` written as `log(1 + exp(-|x|)) + max(x, 0)`.
///
/// The result is floored at the smallest positive normal so that it stays
/// strictly positive even when `exp(-|x|)` underflows.
#[derive(Debug)]
struct Softplus;

fn softplus_scalar(x: f64) -> f64 {
    ((-x.abs()).exp().ln_1p() + x.max(0.0)).max(f64::MIN_POSITIVE)
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Operation for Softplus {
    fn name(&self) -> &'static str {
        "softplus"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        Ok(vec![inputs[0].mapv(softplus_scalar)])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let gx = Zip::from(&grads[0])
            .and(&inputs[0])
            .map_collect(|&g, &x| g * sigmoid(x));
        Ok(vec![Some(gx)])
    }
}

fn binary(ctx: &ExecContext, kind: BinaryKind, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    apply_one(ctx, Binary(kind), &[a, b])
}

fn unary(ctx: &ExecContext, kind: UnaryKind, x: &Tensor) -> Result<Tensor> {
    apply_one(ctx, Unary(kind), &[x])
}

pub fn add(ctx: &ExecContext, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(ctx, BinaryKind::Add, a, b)
}

pub fn sub(ctx: &ExecContext, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(ctx, BinaryKind::Sub, a, b)
}

pub fn mul(ctx: &ExecContext, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(ctx, BinaryKind::Mul, a, b)
}

pub fn div(ctx: &ExecContext, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(ctx, BinaryKind::Div, a, b)
}

pub fn neg(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    unary(ctx, UnaryKind::Neg, x)
}

pub fn exp(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    unary(ctx, UnaryKind::Exp, x)
}

pub fn log(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    unary(ctx, UnaryKind::Log, x)
}

pub fn sqrt(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    unary(ctx, UnaryKind::Sqrt, x)
}

pub fn square(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    unary(ctx, UnaryKind::Square, x)
}

pub fn relu(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    unary(ctx, UnaryKind::Relu, x)
}

/// `c · x` for a constant `c`.
pub fn scale(ctx: &ExecContext, x: &Tensor, c: f64) -> Result<Tensor> {
    unary(ctx, UnaryKind::Scale(c), x)
}

/// `x + c` for a constant `c`.
pub fn add_scalar(ctx: &ExecContext, x: &Tensor, c: f64) -> Result<Tensor> {
    unary(ctx, UnaryKind::AddScalar(c), x)
}

/// Strictly positive, overflow-free softplus.
pub fn softplus(ctx: &ExecContext, x: &Tensor) -> Result<Tensor> {
    apply_one(ctx, Softplus, &[x])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn softplus_is_positive_and_finite_at_extremes() {
        let ctx = ExecContext::cpu();
        let x = Tensor::from_shape_vec(&[5], vec![-1e4, -40.0, 0.0, 40.0, 1e4]).unwrap();
        let y = softplus(&ctx, &x).unwrap().to_vec();
        assert!(y.iter().all(|v| *v > 0.0 && v.is_finite()));
        assert_abs_diff_eq!(y[2], std::f64::consts::LN_2, epsilon = 1e-15);
        assert_abs_diff_eq!(y[4], 1e4, epsilon = 1e-9);
    }

    #[test]
    fn mul_gradient_is_reduced_over_broadcast_axes() {
        let ctx = ExecContext::cpu();
        let a = Tensor::parameter(ArrayD::from_elem(ndarray::IxDyn(&[3, 2]), 2.0));
        let b = Tensor::parameter(ArrayD::from_elem(ndarray::IxDyn(&[1, 2]), 5.0));
        let y = mul(&ctx, &a, &b).unwrap();
        assert_eq!(y.shape(), vec![3, 2]);
        y.backward().unwrap();
        assert_eq!(a.grad().unwrap().iter().copied().collect::<Vec<f64>>(), vec![5.0; 6]);
        assert_eq!(b.grad().unwrap().iter().copied().collect::<Vec<f64>>(), vec![6.0; 2]);
    }

    #[test]
    fn incompatible_shapes_fail() {
        let ctx = ExecContext::cpu();
        let a = Tensor::zeros(&[3, 2]);
        let b = Tensor::zeros(&[4, 2]);
        assert!(add(&ctx, &a, &b).is_err());
    }
}
