// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fmt;

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use rand::Rng;

use super::conv::{ceil_odd, Conv1d};
use crate::module::{Module, Parameter};

/// Geometry of a convolutional stack expressed in input-space units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StackGeometry {
    /// Width of input space each output point can see.
    pub receptive_field: f64,
    /// Grid density the stack runs at.
    pub points_per_unit: f64,
    pub num_layers: usize,
    /// Width of the hidden layers.
    pub num_channels: usize,
}

impl StackGeometry {
    /// Odd kernel size that spreads the receptive field evenly over the layers.
    pub fn kernel_size(&self) -> Result<usize> {
        if self.num_layers == 0 {
            return Err(error::invalid("conv_stack.num_layers", "must be positive"));
        }
        if !(self.receptive_field > 0.0) || !(self.points_per_unit > 0.0) {
            return Err(error::invalid(
                "conv_stack.receptive_field",
                format!(
                    "receptive field {} and points per unit {} must be positive",
                    self.receptive_field, self.points_per_unit
                ),
            ));
        }
        Ok(ceil_odd(
            self.receptive_field * self.points_per_unit / self.num_layers as f64,
        ))
    }
}

/// Plain convolutional stack with a ReLU between consecutive layers and a
/// linear output layer.
pub struct ConvStack {
    layers: Vec<Conv1d>,
}

impl fmt::Debug for ConvStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConvStack(num_layers={},kernel_size={})",
            self.layers.len(),
            self.layers.first().map(Conv1d::kernel_size).unwrap_or(0)
        )
    }
}

impl ConvStack {
    pub fn new<R: Rng>(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        geometry: StackGeometry,
        rng: &mut R,
    ) -> Result<Self> {
        let kernel = geometry.kernel_size()?;
        let mut layers = Vec::with_capacity(geometry.num_layers);
        for index in 0..geometry.num_layers {
            let cin = if index == 0 {
                in_channels
            } else {
                geometry.num_channels
            };
            let cout = if index + 1 == geometry.num_layers {
                out_channels
            } else {
                geometry.num_channels
            };
            layers.push(Conv1d::new(
                &format!("{name}::conv{index}"),
                cin,
                cout,
                kernel,
                rng,
            )?);
        }
        Ok(Self { layers })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn in_channels(&self) -> usize {
        self.layers.first().map(Conv1d::in_channels).unwrap_or(0)
    }

    pub fn out_channels(&self) -> usize {
        self.layers.last().map(Conv1d::out_channels).unwrap_or(0)
    }

    pub fn forward(&self, ctx: &ExecContext, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            x = layer.forward(ctx, &x)?;
            if index + 1 < self.layers.len() {
                x = ops::relu(ctx, &x)?;
            }
        }
        Ok(x)
    }
}

impl Module for ConvStack {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn geometry(num_layers: usize) -> StackGeometry {
        StackGeometry {
            receptive_field: 1.0,
            points_per_unit: 8.0,
            num_layers,
            num_channels: 4,
        }
    }

    #[test]
    fn kernel_size_covers_receptive_field() {
        assert_eq!(geometry(2).kernel_size().unwrap(), 5);
        assert_eq!(geometry(1).kernel_size().unwrap(), 9);
        assert!(geometry(0).kernel_size().is_err());
    }

    #[test]
    fn stack_maps_channels_and_names_layers() {
        let mut rng = StdRng::seed_from_u64(1);
        let stack = ConvStack::new("decoder", 3, 2, geometry(3), &mut rng).unwrap();
        assert_eq!(stack.len(), 3);
        assert_eq!((stack.in_channels(), stack.out_channels()), (3, 2));
        let names: Vec<String> = stack.state_dict().unwrap().into_keys().collect();
        assert!(names.contains(&"decoder::conv2::bias".to_string()));

        let ctx = ExecContext::cpu();
        let out = stack.forward(&ctx, &Tensor::ones(&[6, 3, 2])).unwrap();
        assert_eq!(out.shape(), vec![6, 2, 2]);
    }
}
