// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reference-counted tensor handle participating in the reverse-mode tape.
//!
//! Tensors are value-like: operators never mutate their inputs. The only
//! in-place state is the gradient buffer on leaves, which accumulates across
//! `backward` calls until [`Tensor::zero_grad`] clears it.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{ArrayD, IxDyn};

use crate::autograd::{run_backward, GradFn};
use crate::error::{self, Result};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone)]
pub struct Tensor(Rc<RefCell<Inner>>);

struct Inner {
    id: usize,
    data: ArrayD<f64>,
    requires_grad: bool,
    grad: Option<ArrayD<f64>>,
    grad_fn: Option<GradFn>,
    out_index: usize,
}

impl Tensor {
    pub fn from_array(data: ArrayD<f64>) -> Self {
        let inner = Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            data,
            requires_grad: false,
            grad: None,
            grad_fn: None,
            out_index: 0,
        };
        Tensor(Rc::new(RefCell::new(inner)))
    }

    pub fn from_shape_vec(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        let got = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|_| error::shape(format!("expected {expected} values for {shape:?}, got {got}")))?;
        Ok(Self::from_array(array))
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::from_array(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f64) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Zero-dimensional tensor holding a single value.
    pub fn scalar(value: f64) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Leaf tensor that records gradients.
    pub fn parameter(data: ArrayD<f64>) -> Self {
        Self::from_array(data).requires_grad(true)
    }

    pub fn id(&self) -> usize {
        self.0.borrow().id
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().data.shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.0.borrow().data.ndim()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of the tensor contents.
    pub fn data(&self) -> ArrayD<f64> {
        self.0.borrow().data.clone()
    }

    /// Borrowed view of the tensor contents.
    pub fn borrow_data(&self) -> Ref<'_, ArrayD<f64>> {
        Ref::map(self.0.borrow(), |inner| &inner.data)
    }

    /// Host copy of all values in logical (row-major) order.
    pub fn to_vec(&self) -> Vec<f64> {
        self.0.borrow().data.iter().copied().collect()
    }

    /// Reads the value of a single-element tensor (e.g. a reduced loss).
    pub fn item(&self) -> Result<f64> {
        let inner = self.0.borrow();
        if inner.data.len() != 1 {
            return Err(error::shape(format!(
                "item() requires a single element, tensor has shape {:?}",
                inner.data.shape()
            )));
        }
        inner
            .data
            .iter()
            .next()
            .copied()
            .ok_or_else(|| error::shape("item() on an empty tensor"))
    }

    pub fn requires_grad(self, flag: bool) -> Self {
        self.0.borrow_mut().requires_grad = flag;
        self
    }

    /// Whether gradients flow into this tensor: it is either a leaf that
    /// requires gradients or the output of a recorded operation.
    pub fn is_tracked(&self) -> bool {
        let inner = self.0.borrow();
        inner.requires_grad || inner.grad_fn.is_some()
    }

    pub fn is_leaf(&self) -> bool {
        self.0.borrow().grad_fn.is_none()
    }

    pub fn grad(&self) -> Option<ArrayD<f64>> {
        self.0.borrow().grad.clone()
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    /// Replaces the contents of a leaf tensor, keeping its shape.
    pub fn set_data(&self, data: ArrayD<f64>) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.data.shape() != data.shape() {
            return Err(error::shape(format!(
                "set_data: expected shape {:?}, got {:?}",
                inner.data.shape(),
                data.shape()
            )));
        }
        inner.data = data;
        Ok(())
    }

    /// Copy of the values that does not participate in the tape.
    pub fn detach(&self) -> Tensor {
        Tensor::from_array(self.data())
    }

    pub(crate) fn grad_fn(&self) -> Option<GradFn> {
        self.0.borrow().grad_fn.clone()
    }

    pub(crate) fn out_index(&self) -> usize {
        self.0.borrow().out_index
    }

    pub(crate) fn attach_grad_fn(&self, grad_fn: GradFn, out_index: usize) {
        let mut inner = self.0.borrow_mut();
        inner.grad_fn = Some(grad_fn);
        inner.out_index = out_index;
        inner.requires_grad = true;
    }

    pub(crate) fn accumulate_grad(&self, grad: &ArrayD<f64>) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.data.shape() != grad.shape() {
            return Err(error::shape(format!(
                "gradient shape {:?} does not match tensor shape {:?}",
                grad.shape(),
                inner.data.shape()
            )));
        }
        inner.grad = Some(match inner.grad.take() {
            Some(existing) => existing + grad,
            None => grad.clone(),
        });
        Ok(())
    }

    /// Backpropagates from this tensor seeded with ones.
    pub fn backward(&self) -> Result<()> {
        let seed = ArrayD::from_elem(IxDyn(&self.shape()), 1.0);
        run_backward(self, seed)
    }

    pub fn backward_with_grad(&self, grad: ArrayD<f64>) -> Result<()> {
        if grad.shape() != self.shape().as_slice() {
            return Err(error::shape(format!(
                "seed gradient shape {:?} does not match tensor shape {:?}",
                grad.shape(),
                self.shape()
            )));
        }
        run_backward(self, grad)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Tensor")
            .field("id", &inner.id)
            .field("shape", &inner.data.shape())
            .field("requires_grad", &inner.requires_grad)
            .field(
                "grad_fn",
                &inner.grad_fn.as_ref().map(|grad_fn| grad_fn.name()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_is_reported() {
        assert!(Tensor::from_shape_vec(&[2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn item_requires_single_element() {
        assert_eq!(Tensor::scalar(3.5).item().unwrap(), 3.5);
        assert!(Tensor::zeros(&[2]).item().is_err());
    }

    #[test]
    fn set_data_keeps_shape() {
        let t = Tensor::zeros(&[2, 2]);
        assert!(t.set_data(ArrayD::zeros(IxDyn(&[3]))).is_err());
        t.set_data(ArrayD::from_elem(IxDyn(&[2, 2]), 4.0)).unwrap();
        assert_eq!(t.to_vec(), vec![4.0; 4]);
    }

    #[test]
    fn leaves_accumulate_until_zeroed() {
        let t = Tensor::parameter(ArrayD::zeros(IxDyn(&[3])));
        t.backward().unwrap();
        t.backward().unwrap();
        assert_eq!(t.grad().unwrap().iter().copied().collect::<Vec<f64>>(), vec![2.0; 3]);
        t.zero_grad();
        assert!(t.grad().is_none());
    }
}
