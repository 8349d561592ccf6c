// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shape manipulation: reshape, explicit broadcast, slicing, padding,
//! repeat-concatenation and halving splits.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};

use super::{apply_one, apply, broadcast_view, unbroadcast, Operation};
use crate::backend::ExecContext;
use crate::error::{self, Error, Result};
use crate::Tensor;

fn reshape_array(array: &ArrayD<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
    array
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(shape))
        .map_err(|_| {
            error::shape(format!(
                "cannot reshape {:?} into {shape:?}",
                array.shape()
            ))
        })
}

#[derive(Debug)]
struct Reshape {
    shape: Vec<usize>,
}

impl Operation for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        Ok(vec![reshape_array(inputs[0], &self.shape)?])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        Ok(vec![Some(reshape_array(&grads[0], inputs[0].shape())?)])
    }
}

#[derive(Debug)]
struct BroadcastTo {
    shape: Vec<usize>,
}

impl Operation for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        Ok(vec![broadcast_view(inputs[0], &self.shape)?.to_owned()])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        Ok(vec![Some(unbroadcast(grads[0].clone(), inputs[0].shape()))])
    }
}

#[derive(Debug)]
struct Narrow {
    axis: usize,
    start: usize,
    len: usize,
}

impl Operation for Narrow {
    fn name(&self) -> &'static str {
        "narrow"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let x = inputs[0];
        let end = self.start + self.len;
        if self.axis >= x.ndim() || end > x.len_of(Axis(self.axis)) {
            return Err(error::shape(format!(
                "narrow: range {}..{end} on axis {} out of bounds for {:?}",
                self.start,
                self.axis,
                x.shape()
            )));
        }
        let slice = Slice::from(self.start..end);
        Ok(vec![x.slice_axis(Axis(self.axis), slice).to_owned()])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let mut gx = ArrayD::zeros(inputs[0].raw_dim());
        let slice = Slice::from(self.start..self.start + self.len);
        gx.slice_axis_mut(Axis(self.axis), slice).assign(&grads[0]);
        Ok(vec![Some(gx)])
    }
}

#[derive(Debug)]
struct Pad {
    axis: usize,
    before: usize,
    after: usize,
}

impl Operation for Pad {
    fn name(&self) -> &'static str {
        "pad"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let x = inputs[0];
        if self.axis >= x.ndim() {
            return Err(error::shape(format!(
                "pad: axis {} out of range for {:?}",
                self.axis,
                x.shape()
            )));
        }
        let len = x.len_of(Axis(self.axis));
        let mut shape = x.shape().to_vec();
        shape[self.axis] = self.before + len + self.after;
        let mut out = ArrayD::zeros(IxDyn(&shape));
        out.slice_axis_mut(Axis(self.axis), Slice::from(self.before..self.before + len))
            .assign(x);
        Ok(vec![out])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let len = inputs[0].len_of(Axis(self.axis));
        let slice = Slice::from(self.before..self.before + len);
        Ok(vec![Some(
            grads[0].slice_axis(Axis(self.axis), slice).to_owned(),
        )])
    }
}

/// Concatenates along `dim` after repeating singleton axes of every input up
/// to the largest size seen on that axis. The concatenation axis itself is
/// never repeated.
#[derive(Debug)]
struct RepeatCat {
    dim: usize,
}

impl RepeatCat {
    fn targets(&self, shapes: &[&[usize]]) -> Result<Vec<Vec<usize>>> {
        let ndim = shapes[0].len();
        if self.dim >= ndim {
            return Err(error::shape(format!(
                "repeat_cat: axis {} out of range for rank {ndim}",
                self.dim
            )));
        }
        if let Some(bad) = shapes.iter().find(|s| s.len() != ndim) {
            return Err(error::shape(format!(
                "repeat_cat: inputs must share a rank, got {:?} and {bad:?}",
                shapes[0]
            )));
        }
        let mut max = vec![0usize; ndim];
        for shape in shapes {
            for (m, &s) in max.iter_mut().zip(shape.iter()) {
                *m = (*m).max(s);
            }
        }
        let mut targets = Vec::with_capacity(shapes.len());
        for (input, shape) in shapes.iter().enumerate() {
            let mut target = max.clone();
            target[self.dim] = shape[self.dim];
            for axis in (0..ndim).filter(|&axis| axis != self.dim) {
                if shape[axis] != 1 && shape[axis] != max[axis] {
                    return Err(Error::RepeatCat {
                        input,
                        axis,
                        size: shape[axis],
                        expected: max[axis],
                    });
                }
            }
            targets.push(target);
        }
        Ok(targets)
    }
}

impl Operation for RepeatCat {
    fn name(&self) -> &'static str {
        "repeat_cat"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let shapes: Vec<&[usize]> = inputs.iter().map(|a| a.shape()).collect();
        let targets = self.targets(&shapes)?;
        let views = inputs
            .iter()
            .zip(&targets)
            .map(|(array, target)| broadcast_view(array, target))
            .collect::<Result<Vec<ArrayViewD<'_, f64>>>>()?;
        let out = ndarray::concatenate(Axis(self.dim), &views)
            .map_err(|err| error::shape(format!("repeat_cat: {err}")))?;
        Ok(vec![out])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let mut offset = 0;
        let mut out = Vec::with_capacity(inputs.len());
        for input in inputs {
            let len = input.len_of(Axis(self.dim));
            let piece = grads[0]
                .slice_axis(Axis(self.dim), Slice::from(offset..offset + len))
                .to_owned();
            offset += len;
            out.push(Some(unbroadcast(piece, input.shape())));
        }
        Ok(out)
    }
}

#[derive(Debug)]
struct Split {
    dim: usize,
}

impl Operation for Split {
    fn name(&self) -> &'static str {
        "split"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let x = inputs[0];
        if self.dim >= x.ndim() {
            return Err(error::shape(format!(
                "split: axis {} out of range for {:?}",
                self.dim,
                x.shape()
            )));
        }
        let size = x.len_of(Axis(self.dim));
        if size % 2 != 0 {
            return Err(Error::OddSplit {
                axis: self.dim,
                size,
            });
        }
        let half = size / 2;
        Ok(vec![
            x.slice_axis(Axis(self.dim), Slice::from(..half)).to_owned(),
            x.slice_axis(Axis(self.dim), Slice::from(half..)).to_owned(),
        ])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        _inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let gx = ndarray::concatenate(Axis(self.dim), &[grads[0].view(), grads[1].view()])
            .map_err(|err| error::shape(format!("split backward: {err}")))?;
        Ok(vec![Some(gx)])
    }
}

pub fn reshape(ctx: &ExecContext, x: &Tensor, shape: &[usize]) -> Result<Tensor> {
    apply_one(ctx, Reshape { shape: shape.to_vec() }, &[x])
}

pub fn broadcast_to(ctx: &ExecContext, x: &Tensor, shape: &[usize]) -> Result<Tensor> {
    apply_one(ctx, BroadcastTo { shape: shape.to_vec() }, &[x])
}

/// `len` consecutive entries of `axis` starting at `start`.
pub fn narrow(ctx: &ExecContext, x: &Tensor, axis: usize, start: usize, len: usize) -> Result<Tensor> {
    apply_one(ctx, Narrow { axis, start, len }, &[x])
}

/// Zero padding along `axis`.
pub fn pad(ctx: &ExecContext, x: &Tensor, axis: usize, before: usize, after: usize) -> Result<Tensor> {
    apply_one(ctx, Pad { axis, before, after }, &[x])
}

/// Concatenates `inputs` along `dim`, repeating singleton axes first.
pub fn repeat_cat(ctx: &ExecContext, inputs: &[&Tensor], dim: usize) -> Result<Tensor> {
    apply_one(ctx, RepeatCat { dim }, inputs)
}

/// Splits `x` into two equal halves along `dim`.
pub fn split(ctx: &ExecContext, x: &Tensor, dim: usize) -> Result<(Tensor, Tensor)> {
    let mut halves = apply(ctx, Split { dim }, &[x])?.into_iter();
    match (halves.next(), halves.next()) {
        (Some(first), Some(second)) => Ok((first, second)),
        _ => Err(error::shape("split produced fewer than two outputs")),
    }
}
