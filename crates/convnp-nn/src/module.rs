// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::HashMap;
use std::fmt;

use convnp_core::{Error, Result, Tensor};
use ndarray::ArrayD;

/// Trainable leaf tensor with a stable, namespaced name.
pub struct Parameter {
    name: String,
    value: Tensor,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter(name={},shape={:?},has_grad={})",
            self.name,
            self.value.shape(),
            self.value.grad().is_some()
        )
    }
}

impl Parameter {
    /// Creates a parameter that records gradients.
    pub fn new(name: impl Into<String>, value: ArrayD<f64>) -> Self {
        Self {
            name: name.into(),
            value: Tensor::parameter(value),
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tensor handle to pass into operations.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Gradient accumulated by the last backward passes, if any.
    pub fn gradient(&self) -> Option<ArrayD<f64>> {
        self.value.grad()
    }

    pub fn zero_gradient(&self) {
        self.value.zero_grad();
    }

    /// Squared L2 norm of the accumulated gradient.
    pub fn gradient_norm_sq(&self) -> f64 {
        self.value
            .grad()
            .map(|grad| grad.iter().map(|g| g * g).sum())
            .unwrap_or(0.0)
    }

    /// Plain gradient descent step followed by clearing the accumulator.
    pub fn apply_step(&mut self, learning_rate: f64) -> Result<()> {
        if let Some(grad) = self.value.grad() {
            let updated = self.value.data() - &(grad * learning_rate);
            self.value.set_data(updated)?;
            self.value.zero_grad();
        }
        Ok(())
    }

    /// Overwrites the value, keeping the shape.
    pub fn load_value(&mut self, value: &Tensor) -> Result<()> {
        self.value.set_data(value.data())
    }
}

/// Container of named parameters.
pub trait Module {
    /// Visits immutable parameters.
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()>;

    /// Applies a gradient descent step to every parameter.
    fn apply_step(&mut self, learning_rate: f64) -> Result<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    /// Clears accumulated gradients across every parameter.
    fn zero_grad(&mut self) -> Result<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Global L2 norm of the accumulated gradients.
    fn gradient_norm(&self) -> Result<f64> {
        let mut total = 0.0;
        self.visit_parameters(&mut |param| {
            total += param.gradient_norm_sq();
            Ok(())
        })?;
        Ok(total.sqrt())
    }

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> Result<usize> {
        let mut total = 0;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a snapshot of all parameters keyed by their names.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().detach());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(Error::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    struct Pair {
        a: Parameter,
        b: Parameter,
    }

    impl Module for Pair {
        fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
            visitor(&self.a)?;
            visitor(&self.b)
        }

        fn visit_parameters_mut(
            &mut self,
            visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
        ) -> Result<()> {
            visitor(&mut self.a)?;
            visitor(&mut self.b)
        }
    }

    fn pair() -> Pair {
        Pair {
            a: Parameter::new("pair::a", ArrayD::from_elem(IxDyn(&[2]), 1.0)),
            b: Parameter::new("pair::b", ArrayD::from_elem(IxDyn(&[1, 3]), -1.0)),
        }
    }

    #[test]
    fn step_descends_and_clears_gradients() {
        let mut module = pair();
        module.a.value().backward().unwrap();
        assert_eq!(module.gradient_norm().unwrap(), 2f64.sqrt());
        module.apply_step(0.5).unwrap();
        assert_eq!(module.a.value().to_vec(), vec![0.5, 0.5]);
        assert_eq!(module.b.value().to_vec(), vec![-1.0; 3]);
        assert!(module.a.gradient().is_none());
    }

    #[test]
    fn state_dict_round_trip_and_missing_names() {
        let mut module = pair();
        let state = module.state_dict().unwrap();
        assert_eq!(module.num_parameters().unwrap(), 5);
        module.a.value().backward().unwrap();
        module.apply_step(1.0).unwrap();
        module.load_state_dict(&state).unwrap();
        assert_eq!(module.a.value().to_vec(), vec![1.0, 1.0]);

        let mut partial = state.clone();
        partial.remove("pair::b");
        assert!(matches!(
            module.load_state_dict(&partial),
            Err(Error::MissingParameter { name }) if name == "pair::b"
        ));
    }
}
