// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::module::{Module, Parameter};

fn validate_positive(value: usize, label: &'static str) -> Result<()> {
    if value == 0 {
        return Err(error::invalid(label, "must be positive"));
    }
    Ok(())
}

/// Rounds up to the next odd integer so a kernel has a centre tap.
pub fn ceil_odd(value: f64) -> usize {
    let rounded = value.ceil().max(1.0) as usize;
    if rounded % 2 == 0 {
        rounded + 1
    } else {
        rounded
    }
}

/// One-dimensional "same" convolution over the leading (grid) axis.
///
/// Inputs are `(n, in_channels, batch...)`; any number of trailing batch
/// axes is accepted and carried through unchanged. The kernel is stored as a
/// `(kernel * in_channels, out_channels)` matrix so the whole convolution is a
/// single batched product over shifted copies of the zero-padded input.
#[derive(Debug)]
pub struct Conv1d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
}

impl Conv1d {
    pub fn new<R: Rng>(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        validate_positive(in_channels, "conv1d.in_channels")?;
        validate_positive(out_channels, "conv1d.out_channels")?;
        validate_positive(kernel_size, "conv1d.kernel_size")?;
        if kernel_size % 2 == 0 {
            return Err(error::invalid(
                "conv1d.kernel_size",
                format!("same padding needs an odd kernel, got {kernel_size}"),
            ));
        }
        let span = kernel_size * in_channels;
        let fan_out = kernel_size * out_channels;
        let bound = (6.0 / (span + fan_out) as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weight = ArrayD::from_shape_fn(IxDyn(&[span, out_channels]), |_| dist.sample(rng));
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(
                format!("{name}::bias"),
                ArrayD::zeros(IxDyn(&[1, out_channels])),
            ),
            in_channels,
            out_channels,
            kernel_size,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn forward(&self, ctx: &ExecContext, input: &Tensor) -> Result<Tensor> {
        let shape = input.shape();
        if shape.len() < 3 || shape[1] != self.in_channels {
            return Err(error::shape(format!(
                "conv1d: expected (n, {}, batch...), got {shape:?}",
                self.in_channels
            )));
        }
        let len = shape[0];
        let half = self.kernel_size / 2;
        let windows = if self.kernel_size == 1 {
            input.clone()
        } else {
            let padded = ops::pad(ctx, input, 0, half, half)?;
            let taps = (0..self.kernel_size)
                .map(|offset| ops::narrow(ctx, &padded, 0, offset, len))
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&Tensor> = taps.iter().collect();
            ops::repeat_cat(ctx, &refs, 1)?
        };
        let out = ops::batched_mul(ctx, &windows, self.weight.value())?;
        let mut bias_shape = vec![1, self.out_channels];
        bias_shape.resize(shape.len(), 1);
        let bias = ops::reshape(ctx, self.bias.value(), &bias_shape)?;
        ops::add(ctx, &out, &bias)
    }
}

impl Module for Conv1d {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn conv(in_channels: usize, out_channels: usize, kernel: usize) -> Conv1d {
        let mut rng = StdRng::seed_from_u64(7);
        Conv1d::new("conv", in_channels, out_channels, kernel, &mut rng).unwrap()
    }

    #[test]
    fn ceil_odd_rounds_up() {
        assert_eq!(ceil_odd(4.0), 5);
        assert_eq!(ceil_odd(4.2), 5);
        assert_eq!(ceil_odd(5.0), 5);
        assert_eq!(ceil_odd(0.1), 1);
    }

    #[test]
    fn rejects_even_kernels() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Conv1d::new("conv", 1, 1, 4, &mut rng).is_err());
        assert!(Conv1d::new("conv", 0, 1, 3, &mut rng).is_err());
    }

    #[test]
    fn same_padding_keeps_length_and_batch_axes() {
        let ctx = ExecContext::cpu();
        let layer = conv(2, 3, 5);
        let input = Tensor::ones(&[7, 2, 4, 2]);
        let out = layer.forward(&ctx, &input).unwrap();
        assert_eq!(out.shape(), vec![7, 3, 4, 2]);
    }

    #[test]
    fn matches_direct_convolution() {
        let ctx = ExecContext::cpu();
        let mut layer = conv(1, 1, 3);
        let mut state = layer.state_dict().unwrap();
        state.insert(
            "conv::weight".into(),
            Tensor::from_shape_vec(&[3, 1], vec![1.0, 2.0, 3.0]).unwrap(),
        );
        state.insert("conv::bias".into(), Tensor::full(&[1, 1], 0.5));
        layer.load_state_dict(&state).unwrap();

        let input = Tensor::from_shape_vec(&[4, 1, 1], vec![1.0, 0.0, -1.0, 2.0]).unwrap();
        let out = layer.forward(&ctx, &input).unwrap().to_vec();
        // out[i] = x[i-1] + 2 x[i] + 3 x[i+1] + 0.5 with zero padding.
        let expected = [2.5, -1.5, 4.5, 3.5];
        for (got, want) in out.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn gradients_reach_weight_and_bias() {
        let ctx = ExecContext::cpu();
        let layer = conv(2, 2, 3);
        let input = Tensor::ones(&[5, 2, 3]);
        let out = layer.forward(&ctx, &input).unwrap();
        ops::sum(&ctx, &out, &[], false).unwrap().backward().unwrap();
        let mut seen = 0;
        layer
            .visit_parameters(&mut |param| {
                assert!(param.gradient().is_some(), "{}", param.name());
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 2);
        // Every output element contributes exactly once to each bias entry.
        let bias_grad = layer.bias.gradient().unwrap();
        assert_eq!(bias_grad.iter().copied().collect::<Vec<_>>(), vec![15.0, 15.0]);
    }
}
