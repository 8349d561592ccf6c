// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Gaussian log-densities and the diagonal Gaussian KL divergence.

use std::f64::consts::PI;

use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn, Zip};

use super::linalg::{coerce_rank3, uncoerce_rank3};
use super::{
    add, add_scalar, apply_one, broadcast_shape, broadcast_view, div, log, scale, square, sub,
    unbroadcast, Operation,
};
use crate::backend::ExecContext;
use crate::error::{self, Result};
use crate::Tensor;

fn ln_2pi() -> f64 {
    (2.0 * PI).ln()
}

/// Element-wise `−½(log 2π + log σ² + (x − μ)²/σ²)` with broadcasting.
#[derive(Debug)]
struct GaussianLogpdf;

impl Operation for GaussianLogpdf {
    fn name(&self) -> &'static str {
        "gaussian_logpdf"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let (x, mean, var) = (inputs[0], inputs[1], inputs[2]);
        let shape = broadcast_shape(&broadcast_shape(x.shape(), mean.shape())?, var.shape())?;
        let (x, mean, var) = (
            broadcast_view(x, &shape)?,
            broadcast_view(mean, &shape)?,
            broadcast_view(var, &shape)?,
        );
        let constant = ln_2pi();
        let log_var = var.mapv(f64::ln);
        let residual = Zip::from(&x).and(&mean).map_collect(|x, m| x - m);
        let quadratic = Zip::from(&residual).and(&var).map_collect(|r, v| r * r / v);
        let out = Zip::from(&log_var)
            .and(&quadratic)
            .map_collect(|lv, q| -0.5 * (constant + lv + q));
        Ok(vec![out])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let g = &grads[0];
        let shape = g.shape().to_vec();
        let x = broadcast_view(&inputs[0], &shape)?;
        let mean = broadcast_view(&inputs[1], &shape)?;
        let var = broadcast_view(&inputs[2], &shape)?;
        let scaled = Zip::from(&x)
            .and(&mean)
            .and(&var)
            .map_collect(|x, m, v| (x - m) / v);
        let gx = Zip::from(g).and(&scaled).map_collect(|g, s| -g * s);
        let gmean = Zip::from(g).and(&scaled).map_collect(|g, s| g * s);
        let gvar = Zip::from(g)
            .and(&scaled)
            .and(&var)
            .map_collect(|g, s, v| -0.5 * g * (1.0 / v - s * s));
        Ok(vec![
            Some(unbroadcast(gx, inputs[0].shape())),
            Some(unbroadcast(gmean, inputs[1].shape())),
            Some(unbroadcast(gvar, inputs[2].shape())),
        ])
    }
}

/// Multivariate Gaussian log-density of column vectors.
///
/// `x` and `mean` are `(n, 1, batch…)`, the covariance is `(n, n, batch…)` and
/// the result has shape `(batch…)`. Only the upper triangle of the covariance
/// is read, so the reverse rule returns the symmetric gradient.
#[derive(Debug)]
struct MvGaussianLogpdf;

struct Factorised {
    upper: Array3<f64>,
    whitened: Array3<f64>,
}

impl MvGaussianLogpdf {
    fn check(x: &[usize], mean: &[usize], cov: &[usize]) -> Result<()> {
        if x != mean {
            return Err(error::shape(format!(
                "mv_gaussian_logpdf: x {x:?} and mean {mean:?} differ"
            )));
        }
        if x.len() < 2 || x[1] != 1 {
            return Err(error::shape(format!(
                "mv_gaussian_logpdf: expected (n, 1, batch…) vectors, got {x:?}"
            )));
        }
        if cov.len() != x.len() || cov[0] != x[0] || cov[1] != x[0] || cov[2..] != x[2..] {
            return Err(error::shape(format!(
                "mv_gaussian_logpdf: covariance {cov:?} does not match vectors {x:?}"
            )));
        }
        Ok(())
    }

    fn factorise(ctx: &ExecContext, x: &ArrayD<f64>, mean: &ArrayD<f64>, cov: &ArrayD<f64>) -> Result<Factorised> {
        Self::check(x.shape(), mean.shape(), cov.shape())?;
        let residual = coerce_rank3(&(x - mean))?;
        let upper = ctx.backend().cholesky_upper(coerce_rank3(cov)?.view())?;
        let whitened = ctx.backend().solve_upper(upper.view(), residual.view(), true)?;
        Ok(Factorised { upper, whitened })
    }
}

fn eye3(n: usize) -> Array3<f64> {
    Array2::<f64>::eye(n).insert_axis(Axis(2))
}

/// Multiplies every batch element of `a` by the matching scalar of `g`.
fn scale_batch(a: &Array3<f64>, g: &Array3<f64>) -> Result<Array3<f64>> {
    let g = g
        .broadcast(a.dim())
        .ok_or_else(|| error::shape("mv_gaussian_logpdf: gradient batch mismatch"))?;
    Ok(Zip::from(a).and(&g).map_collect(|a, g| a * g))
}

impl Operation for MvGaussianLogpdf {
    fn name(&self) -> &'static str {
        "mv_gaussian_logpdf"
    }

    fn forward(&self, ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let f = Self::factorise(ctx, inputs[0], inputs[1], inputs[2])?;
        let n = f.upper.len_of(Axis(0)) as f64;
        let eye = eye3(f.upper.len_of(Axis(0)));
        let eye = eye
            .broadcast(f.upper.dim())
            .ok_or_else(|| error::shape("mv_gaussian_logpdf: diagonal mask"))?;
        let diag = Zip::from(&f.upper).and(&eye).map_collect(|u, e| u * e).sum_axis(Axis(1));
        let log_det = diag.mapv(f64::ln).sum_axis(Axis(0)).mapv(|v| 2.0 * v);
        let quadratic = f.whitened.mapv(|z| z * z).sum_axis(Axis(1)).sum_axis(Axis(0));
        let constant = n * ln_2pi();
        let logpdf = Zip::from(&log_det)
            .and(&quadratic)
            .map_collect(|ld, q| -0.5 * (constant + ld + q));
        let batch_shape = &inputs[0].shape()[2..];
        let out = logpdf
            .into_shape(IxDyn(batch_shape))
            .map_err(|err| error::shape(format!("mv_gaussian_logpdf: {err}")))?;
        Ok(vec![out])
    }

    fn backward(
        &self,
        ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let f = Self::factorise(ctx, &inputs[0], &inputs[1], &inputs[2])?;
        let backend = ctx.backend();
        let n = f.upper.len_of(Axis(0));
        let batch = f.whitened.len_of(Axis(2));
        let g = grads[0]
            .as_standard_layout()
            .into_owned()
            .into_shape((1, 1, batch))
            .map_err(|err| error::shape(format!("mv_gaussian_logpdf backward: {err}")))?;

        let u = backend.solve_upper(f.upper.view(), f.whitened.view(), false)?;
        let uut = backend.batched_gemm(u.view(), u.view(), false, true)?;
        let lower_inv = backend.solve_upper(f.upper.view(), eye3(n).view(), true)?;
        let precision = backend.solve_upper(f.upper.view(), lower_inv.view(), false)?;
        let gcov = Zip::from(&uut).and(&precision).map_collect(|a, p| 0.5 * (a - p));

        let gmean = scale_batch(&u, &g)?;
        let gx = gmean.mapv(|v| -v);
        let gcov = scale_batch(&gcov, &g)?;
        Ok(vec![
            Some(uncoerce_rank3(gx, inputs[0].shape())?),
            Some(uncoerce_rank3(gmean, inputs[1].shape())?),
            Some(uncoerce_rank3(gcov, inputs[2].shape())?),
        ])
    }
}

/// Univariate Gaussian log-density, element-wise with broadcasting.
pub fn gaussian_logpdf(ctx: &ExecContext, x: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    apply_one(ctx, GaussianLogpdf, &[x, mean, var])
}

/// Multivariate Gaussian log-density of `(n, 1, batch…)` vectors under a
/// `(n, n, batch…)` covariance. Fails with
/// [`Error::NotPositiveDefinite`](crate::Error::NotPositiveDefinite) when the
/// factorisation breaks down.
pub fn mv_gaussian_logpdf(ctx: &ExecContext, x: &Tensor, mean: &Tensor, cov: &Tensor) -> Result<Tensor> {
    apply_one(ctx, MvGaussianLogpdf, &[x, mean, cov])
}

/// Element-wise `KL(p ‖ q)` between diagonal Gaussians given by means and
/// variances.
pub fn kl_divergence(
    ctx: &ExecContext,
    mean_p: &Tensor,
    var_p: &Tensor,
    mean_q: &Tensor,
    var_q: &Tensor,
) -> Result<Tensor> {
    let log_ratio = sub(ctx, &log(ctx, var_q)?, &log(ctx, var_p)?)?;
    let gap = square(ctx, &sub(ctx, mean_p, mean_q)?)?;
    let spread = div(ctx, &add(ctx, var_p, &gap)?, var_q)?;
    let total = add_scalar(ctx, &add(ctx, &log_ratio, &spread)?, -1.0)?;
    scale(ctx, &total, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn univariate_matches_closed_form() {
        let ctx = ExecContext::cpu();
        let x = Tensor::scalar(1.5);
        let mean = Tensor::scalar(0.5);
        let var = Tensor::scalar(4.0);
        let lp = gaussian_logpdf(&ctx, &x, &mean, &var).unwrap().item().unwrap();
        let expected = -0.5 * ((2.0 * PI).ln() + 4.0f64.ln() + 0.25);
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-14);
    }

    #[test]
    fn multivariate_with_diagonal_covariance_sums_univariate_terms() {
        let ctx = ExecContext::cpu();
        let x = Tensor::from_shape_vec(&[2, 1, 1], vec![0.3, -1.2]).unwrap();
        let mean = Tensor::zeros(&[2, 1, 1]);
        let cov = Tensor::from_shape_vec(&[2, 2, 1], vec![2.0, 0.0, 0.0, 0.5]).unwrap();
        let mv = mv_gaussian_logpdf(&ctx, &x, &mean, &cov).unwrap();
        assert_eq!(mv.shape(), vec![1]);
        let var = Tensor::from_shape_vec(&[2, 1, 1], vec![2.0, 0.5]).unwrap();
        let uni = gaussian_logpdf(&ctx, &x, &mean, &var).unwrap().to_vec();
        assert_abs_diff_eq!(mv.item().unwrap(), uni.iter().sum::<f64>(), epsilon = 1e-12);
    }

    #[test]
    fn indefinite_covariance_is_reported() {
        let ctx = ExecContext::cpu();
        let x = Tensor::zeros(&[2, 1, 1]);
        let cov = Tensor::from_shape_vec(&[2, 2, 1], vec![1.0, 3.0, 3.0, 1.0]).unwrap();
        assert!(matches!(
            mv_gaussian_logpdf(&ctx, &x, &x, &cov),
            Err(crate::Error::NotPositiveDefinite { batch: 0 })
        ));
    }

    #[test]
    fn kl_of_identical_distributions_is_zero() {
        let ctx = ExecContext::cpu();
        let mean = Tensor::from_shape_vec(&[4], vec![-3.0, 0.0, 0.7, 12.5]).unwrap();
        let var = Tensor::from_shape_vec(&[4], vec![1e-6, 0.3, 1.0, 250.0]).unwrap();
        let kl = kl_divergence(&ctx, &mean, &var, &mean, &var).unwrap();
        assert!(kl.to_vec().iter().all(|&v| v == 0.0));
    }
}
