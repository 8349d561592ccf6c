// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_core::gradcheck::{check_gradients, GradCheckOptions};
use convnp_core::ops;
use convnp_core::{ExecContext, Result, Tensor};
use ndarray::{ArrayD, IxDyn};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn fixture(shape: &[usize], seed: u64, low: f64, high: f64) -> ArrayD<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(low..high))
}

fn assert_grads<F>(inputs: &[ArrayD<f64>], f: F)
where
    F: Fn(&ExecContext, &[Tensor]) -> Result<Tensor>,
{
    let ctx = ExecContext::cpu();
    let report = check_gradients(&ctx, inputs, GradCheckOptions::default(), f).unwrap();
    assert!(report.checked > 0);
    assert!(report.passed(), "{report:#?}");
}

#[test]
fn broadcasting_arithmetic() {
    let a = fixture(&[3, 2, 2], 1, -1.0, 1.0);
    let b = fixture(&[1, 2, 1], 2, 0.5, 2.0);
    let inputs = [a, b];
    assert_grads(&inputs, |ctx, t| ops::add(ctx, &t[0], &t[1]));
    assert_grads(&inputs, |ctx, t| ops::sub(ctx, &t[0], &t[1]));
    assert_grads(&inputs, |ctx, t| ops::mul(ctx, &t[0], &t[1]));
    assert_grads(&inputs, |ctx, t| ops::div(ctx, &t[0], &t[1]));
}

#[test]
fn pointwise_transforms() {
    let signed = [fixture(&[4, 3], 3, -2.0, 2.0)];
    let positive = [fixture(&[4, 3], 4, 0.3, 3.0)];
    assert_grads(&signed, |ctx, t| ops::neg(ctx, &t[0]));
    assert_grads(&signed, |ctx, t| ops::exp(ctx, &t[0]));
    assert_grads(&signed, |ctx, t| ops::square(ctx, &t[0]));
    assert_grads(&signed, |ctx, t| ops::scale(ctx, &t[0], -1.7));
    assert_grads(&signed, |ctx, t| ops::add_scalar(ctx, &t[0], 0.25));
    assert_grads(&signed, |ctx, t| ops::softplus(ctx, &t[0]));
    assert_grads(&positive, |ctx, t| ops::log(ctx, &t[0]));
    assert_grads(&positive, |ctx, t| ops::sqrt(ctx, &t[0]));
    assert_grads(&positive, |ctx, t| {
        let shifted = ops::add_scalar(ctx, &t[0], -1.5)?;
        ops::relu(ctx, &shifted)
    });
}

#[test]
fn batched_linear_algebra() {
    let x = fixture(&[3, 4, 2, 2], 5, -1.0, 1.0);
    let w = fixture(&[4, 2], 6, -1.0, 1.0);
    assert_grads(&[x.clone(), w], |ctx, t| ops::batched_mul(ctx, &t[0], &t[1]));
    let y = fixture(&[4, 5, 2, 2], 7, -1.0, 1.0);
    assert_grads(&[x.clone(), y], |ctx, t| ops::batched_mul(ctx, &t[0], &t[1]));
    assert_grads(&[x], |ctx, t| ops::batched_transpose(ctx, &t[0]));
    let v = fixture(&[3, 2], 8, -1.0, 1.0);
    assert_grads(&[v], |ctx, t| ops::diagonal(ctx, &t[0]));
}

#[test]
fn stable_reductions() {
    let x = fixture(&[4, 3, 2], 9, -3.0, 3.0);
    assert_grads(&[x.clone()], |ctx, t| ops::logsumexp(ctx, &t[0], &[0]));
    assert_grads(&[x.clone()], |ctx, t| ops::logsumexp(ctx, &t[0], &[0, 2]));
    assert_grads(&[x.clone()], |ctx, t| ops::softmax(ctx, &t[0], &[1]));
    assert_grads(&[x.clone()], |ctx, t| ops::sum(ctx, &t[0], &[1], false));
    assert_grads(&[x], |ctx, t| ops::sum(ctx, &t[0], &[0, 2], true));
}

#[test]
fn shape_primitives() {
    let x = fixture(&[4, 2, 3], 10, -1.0, 1.0);
    assert_grads(&[x.clone()], |ctx, t| ops::reshape(ctx, &t[0], &[2, 12]));
    assert_grads(&[x.clone()], |ctx, t| ops::narrow(ctx, &t[0], 0, 1, 2));
    assert_grads(&[x.clone()], |ctx, t| ops::pad(ctx, &t[0], 0, 2, 1));
    assert_grads(&[x.clone()], |ctx, t| {
        let (mean, raw) = ops::split(ctx, &t[0], 1)?;
        ops::add(ctx, &mean, &ops::scale(ctx, &raw, 2.0)?)
    });
    let small = fixture(&[1, 2, 1], 11, -1.0, 1.0);
    assert_grads(&[small], |ctx, t| ops::broadcast_to(ctx, &t[0], &[4, 2, 3]));
    let density = fixture(&[4, 1, 1], 12, 0.0, 1.0);
    assert_grads(&[density, x], |ctx, t| ops::repeat_cat(ctx, &[&t[0], &t[1]], 1));
}

#[test]
fn gaussian_densities() {
    let x = fixture(&[5, 1, 2], 13, -1.0, 1.0);
    let mean = fixture(&[5, 1, 2], 14, -1.0, 1.0);
    let var = fixture(&[1, 1, 2], 15, 0.2, 2.0);
    assert_grads(&[x.clone(), mean.clone(), var], |ctx, t| {
        ops::gaussian_logpdf(ctx, &t[0], &t[1], &t[2])
    });

    let factor = fixture(&[5, 3, 2], 16, -1.0, 1.0);
    assert_grads(&[x, mean, factor], |ctx, t| {
        let outer = ops::batched_mul(ctx, &t[2], &ops::batched_transpose(ctx, &t[2])?)?;
        let jitter = ops::diagonal(ctx, &Tensor::ones(&[5, 2]))?;
        let cov = ops::add(ctx, &outer, &jitter)?;
        ops::mv_gaussian_logpdf(ctx, &t[0], &t[1], &cov)
    });
}

#[test]
fn reparameterised_sample_and_kl() {
    let mean = fixture(&[3, 2, 2], 17, -1.0, 1.0);
    let var = fixture(&[3, 2, 2], 18, 0.3, 2.0);
    let noise = fixture(&[3, 2, 2, 4], 19, -2.0, 2.0);
    assert_grads(&[mean.clone(), var.clone(), noise], |ctx, t| {
        let mean = ops::reshape(ctx, &t[0], &[3, 2, 2, 1])?;
        let var = ops::reshape(ctx, &t[1], &[3, 2, 2, 1])?;
        ops::reparam_sample(ctx, &mean, &var, &t[2])
    });
    let mean_q = fixture(&[3, 2, 2], 20, -1.0, 1.0);
    let var_q = fixture(&[3, 2, 2], 21, 0.3, 2.0);
    assert_grads(&[mean, var, mean_q, var_q], |ctx, t| {
        ops::kl_divergence(ctx, &t[0], &t[1], &t[2], &t[3])
    });
}

#[test]
fn transpose_product_is_positive_semidefinite() {
    let ctx = ExecContext::cpu();
    let x = Tensor::from_array(fixture(&[6, 3, 4], 22, -2.0, 2.0));
    let gram = ops::batched_mul(&ctx, &ops::batched_transpose(&ctx, &x).unwrap(), &x).unwrap();
    assert_eq!(gram.shape(), vec![3, 3, 4]);
    let data = gram.data();
    for b in 0..4 {
        for i in 0..3 {
            for j in 0..3 {
                assert!((data[[i, j, b]] - data[[j, i, b]]).abs() < 1e-12);
            }
        }
    }
    let vectors = Tensor::from_array(fixture(&[3, 1, 4], 23, -1.0, 1.0));
    let projected = ops::batched_mul(&ctx, &gram, &vectors).unwrap();
    let quadratic = ops::batched_mul(
        &ctx,
        &ops::batched_transpose(&ctx, &vectors).unwrap(),
        &projected,
    )
    .unwrap();
    assert!(quadratic.to_vec().iter().all(|&q| q >= -1e-12));
}

#[test]
fn strict_context_runs_whole_tensor_primitives() {
    let ctx = ExecContext::strict();
    let x = Tensor::parameter(fixture(&[4, 2, 3], 24, -1.0, 1.0));
    let y = ops::logsumexp(&ctx, &ops::softplus(&ctx, &x).unwrap(), &[0]).unwrap();
    let total = ops::sum(&ctx, &y, &[], false).unwrap();
    total.backward().unwrap();
    assert_eq!(x.grad().unwrap().shape(), &[4, 2, 3]);
}
