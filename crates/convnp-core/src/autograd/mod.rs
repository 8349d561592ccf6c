// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Autograd core: the backward-node trait, the `GradFn` wrapper and the engine.

use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::ArrayD;

use crate::error::Result;
use crate::Tensor;

/// Nodes implement this trait to participate in backprop.
pub trait BackwardNode {
    fn name(&self) -> &'static str;
    fn parents(&self) -> Vec<Tensor>;
    fn num_outputs(&self) -> usize;
    /// Maps the gradients of every output (`None` when an output did not
    /// receive any) to one optional gradient per parent.
    fn backward_multi(&self, grads_out: &[Option<ArrayD<f64>>]) -> Result<Vec<Option<ArrayD<f64>>>>;
}

static NEXT_GF_KEY: AtomicUsize = AtomicUsize::new(1);

/// Small wrapper around the node trait object with a stable key.
#[derive(Clone)]
pub struct GradFn(Rc<dyn BackwardNode>, usize);

impl GradFn {
    pub fn new<N: BackwardNode + 'static>(node: N) -> Self {
        let k = NEXT_GF_KEY.fetch_add(1, Ordering::Relaxed);
        Self(Rc::new(node), k)
    }
    #[inline]
    pub fn key(&self) -> usize {
        self.1
    }
    #[inline]
    pub fn name(&self) -> &'static str {
        self.0.name()
    }
    #[inline]
    pub fn parents(&self) -> Vec<Tensor> {
        self.0.parents()
    }
    #[inline]
    pub fn num_outputs(&self) -> usize {
        self.0.num_outputs()
    }
    #[inline]
    pub fn backward_multi(&self, grads_out: &[Option<ArrayD<f64>>]) -> Result<Vec<Option<ArrayD<f64>>>> {
        self.0.backward_multi(grads_out)
    }
}

pub mod engine;
pub use engine::run_backward;
