// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Operation objects and the glue that records them on the tape.
//!
//! An [`Operation`] is a pure pair of array functions: `forward` maps input
//! arrays to output arrays, `backward` maps output gradients back to one
//! gradient per input with exactly the input's shape. [`apply`] looks the
//! operation up in the context's operator table, runs it, and attaches a
//! backward node when any input is tracked.

pub mod elementwise;
pub mod gaussian;
pub mod linalg;
pub mod reductions;
pub mod registry;
pub mod sample;
pub mod shape;

use std::cell::Ref;
use std::fmt;
use std::rc::Rc;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

use crate::autograd::{BackwardNode, GradFn};
use crate::backend::ExecContext;
use crate::error::{self, Error, Result};
use crate::Tensor;

pub use elementwise::{
    add, add_scalar, div, exp, log, mul, neg, relu, scale, softplus, sqrt, square, sub,
};
pub use gaussian::{gaussian_logpdf, kl_divergence, mv_gaussian_logpdf};
pub use linalg::{batched_mul, batched_transpose, coerce_rank3, diagonal, uncoerce_rank3};
pub use reductions::{logsumexp, softmax, sum};
pub use registry::{OperatorBuilder, OperatorMetadata, OperatorRegistry, OperatorSignature};
pub use sample::{reparam_sample, standard_normal};
pub use shape::{broadcast_to, narrow, pad, repeat_cat, reshape, split};

/// A differentiable primitive expressed over whole arrays.
pub trait Operation: fmt::Debug {
    /// Name under which the operation is registered.
    fn name(&self) -> &'static str;

    fn forward(&self, ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>>;

    /// `grads` holds one gradient per output; outputs that received none are
    /// passed as zeros. Returns one optional gradient per input.
    fn backward(
        &self,
        ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>>;
}

struct OpNode {
    op: Rc<dyn Operation>,
    ctx: ExecContext,
    differentiable: bool,
    parents: Vec<Tensor>,
    inputs: Vec<ArrayD<f64>>,
    outputs: Vec<ArrayD<f64>>,
}

impl BackwardNode for OpNode {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn parents(&self) -> Vec<Tensor> {
        self.parents.clone()
    }

    fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    fn backward_multi(&self, grads_out: &[Option<ArrayD<f64>>]) -> Result<Vec<Option<ArrayD<f64>>>> {
        if !self.differentiable {
            return Err(Error::NotDifferentiable(self.op.name().to_string()));
        }
        let grads: Vec<ArrayD<f64>> = self
            .outputs
            .iter()
            .zip(grads_out)
            .map(|(out, grad)| match grad {
                Some(grad) => grad.clone(),
                None => ArrayD::zeros(out.raw_dim()),
            })
            .collect();
        let grads_in = self
            .op
            .backward(&self.ctx, &self.inputs, &self.outputs, &grads)?;
        if grads_in.len() != self.inputs.len() {
            return Err(error::shape(format!(
                "{}: backward produced {} gradients for {} inputs",
                self.op.name(),
                grads_in.len(),
                self.inputs.len()
            )));
        }
        for (input, grad) in self.inputs.iter().zip(&grads_in) {
            if let Some(grad) = grad {
                if grad.shape() != input.shape() {
                    return Err(error::shape(format!(
                        "{}: gradient shape {:?} does not match input shape {:?}",
                        self.op.name(),
                        grad.shape(),
                        input.shape()
                    )));
                }
            }
        }
        Ok(grads_in)
    }
}

/// Runs `op` on `inputs` and records it on the tape when any input is tracked.
pub fn apply<O: Operation + 'static>(
    ctx: &ExecContext,
    op: O,
    inputs: &[&Tensor],
) -> Result<Vec<Tensor>> {
    let signature = ctx.registry().validate(op.name(), inputs.len())?;
    let (num_outputs, differentiable) = (signature.num_outputs, signature.differentiable);

    let borrowed: Vec<Ref<'_, ArrayD<f64>>> = inputs.iter().map(|t| t.borrow_data()).collect();
    let arrays: Vec<&ArrayD<f64>> = borrowed.iter().map(|data| &**data).collect();
    let outputs = op.forward(ctx, &arrays)?;
    if outputs.len() != num_outputs {
        return Err(error::shape(format!(
            "{}: forward produced {} outputs, signature declares {num_outputs}",
            op.name(),
            outputs.len()
        )));
    }

    let tensors: Vec<Tensor> = outputs.iter().cloned().map(Tensor::from_array).collect();
    if inputs.iter().any(|t| t.is_tracked()) {
        let node = OpNode {
            op: Rc::new(op),
            ctx: ctx.clone(),
            differentiable,
            parents: inputs.iter().map(|t| (*t).clone()).collect(),
            inputs: arrays.iter().map(|a| (*a).clone()).collect(),
            outputs,
        };
        let grad_fn = GradFn::new(node);
        for (index, tensor) in tensors.iter().enumerate() {
            tensor.attach_grad_fn(grad_fn.clone(), index);
        }
    }
    Ok(tensors)
}

/// [`apply`] for single-output operations.
pub fn apply_one<O: Operation + 'static>(
    ctx: &ExecContext,
    op: O,
    inputs: &[&Tensor],
) -> Result<Tensor> {
    let name = op.name();
    apply(ctx, op, inputs)?
        .into_iter()
        .next()
        .ok_or_else(|| error::shape(format!("{name} produced no output")))
}

/// Numpy-style broadcast of two shapes, aligned on trailing axes.
pub fn broadcast_shape(left: &[usize], right: &[usize]) -> Result<Vec<usize>> {
    let nd = left.len().max(right.len());
    let mut out = vec![1usize; nd];
    for i in 0..nd {
        let a = if i < left.len() { left[left.len() - 1 - i] } else { 1 };
        let b = if i < right.len() { right[right.len() - 1 - i] } else { 1 };
        out[nd - 1 - i] = if a == b || b == 1 {
            a
        } else if a == 1 {
            b
        } else {
            return Err(Error::Broadcast {
                left: left.to_vec(),
                right: right.to_vec(),
            });
        };
    }
    Ok(out)
}

pub(crate) fn broadcast_view<'a>(
    array: &'a ArrayD<f64>,
    shape: &[usize],
) -> Result<ArrayViewD<'a, f64>> {
    array.broadcast(IxDyn(shape)).ok_or_else(|| Error::Broadcast {
        left: array.shape().to_vec(),
        right: shape.to_vec(),
    })
}

/// Sums `grad` down to `target`, undoing a trailing-aligned broadcast.
pub(crate) fn unbroadcast(grad: ArrayD<f64>, target: &[usize]) -> ArrayD<f64> {
    let mut grad = grad;
    while grad.ndim() > target.len() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, &size) in target.iter().enumerate() {
        if size == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    grad
}

/// Validates reduction axes: in range, sorted, without duplicates.
pub(crate) fn normalise_axes(label: &str, axes: &[usize], ndim: usize) -> Result<Vec<usize>> {
    let mut axes = axes.to_vec();
    axes.sort_unstable();
    axes.dedup();
    if let Some(&bad) = axes.iter().find(|&&axis| axis >= ndim) {
        return Err(error::shape(format!(
            "{label}: axis {bad} out of range for rank {ndim}"
        )));
    }
    Ok(axes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_aligns_trailing_axes() {
        assert_eq!(broadcast_shape(&[5, 1, 3], &[2, 1]).unwrap(), vec![5, 2, 3]);
        assert_eq!(broadcast_shape(&[], &[4, 2]).unwrap(), vec![4, 2]);
        assert!(matches!(
            broadcast_shape(&[3, 2], &[4, 2]),
            Err(Error::Broadcast { .. })
        ));
    }

    #[test]
    fn unbroadcast_keeps_singleton_axes() {
        let grad = ArrayD::<f64>::ones(IxDyn(&[4, 3, 2]));
        let reduced = unbroadcast(grad, &[1, 3, 1]);
        assert_eq!(reduced.shape(), &[1, 3, 1]);
        assert!(reduced.iter().all(|&v| v == 8.0));
        let leading = unbroadcast(ArrayD::<f64>::ones(IxDyn(&[4, 3, 2])), &[2]);
        assert_eq!(leading.shape(), &[2]);
        assert!(leading.iter().all(|&v| v == 12.0));
    }

    #[test]
    fn unregistered_operations_are_refused() {
        #[derive(Debug)]
        struct Identity;
        impl Operation for Identity {
            fn name(&self) -> &'static str {
                "identity"
            }
            fn forward(&self, _: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
                Ok(vec![inputs[0].clone()])
            }
            fn backward(
                &self,
                _: &ExecContext,
                _: &[ArrayD<f64>],
                _: &[ArrayD<f64>],
                grads: &[ArrayD<f64>],
            ) -> Result<Vec<Option<ArrayD<f64>>>> {
                Ok(vec![Some(grads[0].clone())])
            }
        }

        let x = Tensor::parameter(ArrayD::from_elem(IxDyn(&[3]), 2.0));
        let ctx = ExecContext::cpu();
        assert!(matches!(
            apply_one(&ctx, Identity, &[&x]),
            Err(Error::UnknownOperator(_))
        ));

        let mut registry = OperatorRegistry::standard();
        registry
            .register(OperatorBuilder::new("identity", 1, 1).build())
            .unwrap();
        let ctx = ctx.with_registry(registry);
        let y = apply_one(&ctx, Identity, &[&x]).unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().iter().copied().collect::<Vec<f64>>(), vec![1.0; 3]);
    }
}
