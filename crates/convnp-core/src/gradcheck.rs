// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Central-difference gradient checking.
//!
//! The checker contracts the output with a random cotangent `c`, runs the
//! tape once to get the analytic vector-Jacobian product and compares it
//! against `(⟨c, f(x + εeᵢ)⟩ − ⟨c, f(x − εeᵢ)⟩) / 2ε` for every input element.
//! It necessarily touches single elements, so it refuses to run in a context
//! that forbids scalar indexing.

use convnp_config::determinism::rng_from_optional;
use ndarray::{ArrayD, IxDyn, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::backend::ExecContext;
use crate::error::{self, Result};
use crate::Tensor;

#[derive(Clone, Copy, Debug)]
pub struct GradCheckOptions {
    /// Perturbation size.
    pub epsilon: f64,
    pub atol: f64,
    pub rtol: f64,
    /// Seed for the cotangent; `None` defers to the determinism config.
    pub seed: Option<u64>,
}

impl Default for GradCheckOptions {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            atol: 1e-6,
            rtol: 1e-4,
            seed: Some(0x5eed),
        }
    }
}

/// An input element whose analytic and numeric derivatives disagree.
#[derive(Clone, Debug, PartialEq)]
pub struct GradMismatch {
    pub input: usize,
    /// Row-major position inside the input.
    pub index: usize,
    pub analytic: f64,
    pub numeric: f64,
}

#[derive(Clone, Debug, Default)]
pub struct GradCheckReport {
    /// Number of input elements perturbed.
    pub checked: usize,
    pub max_abs_error: f64,
    pub mismatches: Vec<GradMismatch>,
}

impl GradCheckReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Checks the reverse rules reachable from `f` at `inputs`.
pub fn check_gradients<F>(
    ctx: &ExecContext,
    inputs: &[ArrayD<f64>],
    options: GradCheckOptions,
    f: F,
) -> Result<GradCheckReport>
where
    F: Fn(&ExecContext, &[Tensor]) -> Result<Tensor>,
{
    ctx.ensure_scalar_indexing("gradcheck")?;

    let mut working: Vec<ArrayD<f64>> = inputs
        .iter()
        .map(|array| array.as_standard_layout().into_owned())
        .collect();
    let params: Vec<Tensor> = working.iter().cloned().map(Tensor::parameter).collect();
    let output = f(ctx, &params)?;

    let mut rng = rng_from_optional(options.seed, "convnp-core::gradcheck");
    let cotangent: ArrayD<f64> =
        ArrayD::from_shape_simple_fn(IxDyn(&output.shape()), || rng.sample(StandardNormal));
    output.backward_with_grad(cotangent.clone())?;

    let contract = |arrays: &[ArrayD<f64>]| -> Result<f64> {
        let tensors: Vec<Tensor> = arrays.iter().cloned().map(Tensor::from_array).collect();
        let value = f(ctx, &tensors)?.data();
        if value.shape() != cotangent.shape() {
            return Err(error::shape(format!(
                "gradcheck: output shape changed from {:?} to {:?}",
                cotangent.shape(),
                value.shape()
            )));
        }
        Ok(Zip::from(&value)
            .and(&cotangent)
            .fold(0.0, |acc, &v, &c| acc + v * c))
    };

    let mut report = GradCheckReport::default();
    for (input, param) in params.iter().enumerate() {
        let analytic = param
            .grad()
            .unwrap_or_else(|| ArrayD::zeros(IxDyn(&param.shape())));
        for (index, &expected) in analytic.iter().enumerate() {
            let original = element(&working[input], index)?;
            set_element(&mut working[input], index, original + options.epsilon)?;
            let plus = contract(&working)?;
            set_element(&mut working[input], index, original - options.epsilon)?;
            let minus = contract(&working)?;
            set_element(&mut working[input], index, original)?;

            let numeric = (plus - minus) / (2.0 * options.epsilon);
            let err = (expected - numeric).abs();
            report.checked += 1;
            report.max_abs_error = report.max_abs_error.max(err);
            if !(err <= options.atol + options.rtol * numeric.abs()) {
                report.mismatches.push(GradMismatch {
                    input,
                    index,
                    analytic: expected,
                    numeric,
                });
            }
        }
    }
    debug!(
        checked = report.checked,
        max_abs_error = report.max_abs_error,
        mismatches = report.mismatches.len(),
        "gradient check finished"
    );
    Ok(report)
}

fn element(array: &ArrayD<f64>, index: usize) -> Result<f64> {
    array
        .as_slice()
        .and_then(|slice| slice.get(index).copied())
        .ok_or_else(|| error::shape(format!("gradcheck: element {index} out of range")))
}

fn set_element(array: &mut ArrayD<f64>, index: usize, value: f64) -> Result<()> {
    let slot = array
        .as_slice_mut()
        .and_then(|slice| slice.get_mut(index))
        .ok_or_else(|| error::shape(format!("gradcheck: element {index} out of range")))?;
    *slot = value;
    Ok(())
}
