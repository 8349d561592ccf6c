// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::{HashMap, HashSet};

use ndarray::ArrayD;
use tracing::trace;

use super::GradFn;
use crate::error::{self, Result};
use crate::Tensor;

/// Runs reverse-mode accumulation from `root`, seeded with `seed`.
///
/// Gradients are retained on leaves that require them; intermediate outputs
/// only forward their gradient to the node that produced them.
pub fn run_backward(root: &Tensor, seed: ArrayD<f64>) -> Result<()> {
    let Some(root_fn) = root.grad_fn() else {
        if root.is_tracked() {
            root.accumulate_grad(&seed)?;
        }
        return Ok(());
    };

    let mut topo: Vec<GradFn> = Vec::new();
    let mut visited: HashSet<usize> = HashSet::new();
    collect(&root_fn, &mut topo, &mut visited);
    trace!(nodes = topo.len(), root = root_fn.name(), "running backward");

    let mut out_grads: HashMap<usize, Vec<Option<ArrayD<f64>>>> = HashMap::new();
    push_grad_to_node(root, seed, &mut out_grads)?;

    for gf in topo.into_iter().rev() {
        let num = gf.num_outputs();
        let grads_vec = out_grads.remove(&gf.key()).unwrap_or_else(|| vec![None; num]);
        if grads_vec.iter().all(Option::is_none) {
            continue;
        }
        let parents = gf.parents();
        let grads_in = gf.backward_multi(&grads_vec)?;
        if grads_in.len() != parents.len() {
            return Err(error::shape(format!(
                "{} returned {} gradients for {} parents",
                gf.name(),
                grads_in.len(),
                parents.len()
            )));
        }
        for (parent, maybe_grad) in parents.into_iter().zip(grads_in) {
            let Some(grad) = maybe_grad else { continue };
            if !parent.is_tracked() {
                continue;
            }
            if parent.is_leaf() {
                parent.accumulate_grad(&grad)?;
            } else {
                push_grad_to_node(&parent, grad, &mut out_grads)?;
            }
        }
    }
    Ok(())
}

fn collect(gf: &GradFn, topo: &mut Vec<GradFn>, visited: &mut HashSet<usize>) {
    if !visited.insert(gf.key()) {
        return;
    }
    for parent in gf.parents() {
        if let Some(parent_fn) = parent.grad_fn() {
            collect(&parent_fn, topo, visited);
        }
    }
    topo.push(gf.clone());
}

fn push_grad_to_node(
    t: &Tensor,
    grad: ArrayD<f64>,
    out: &mut HashMap<usize, Vec<Option<ArrayD<f64>>>>,
) -> Result<()> {
    let Some(gf) = t.grad_fn() else {
        return Ok(());
    };
    let num = gf.num_outputs();
    let idx = t.out_index();
    if idx >= num {
        return Err(error::shape(format!(
            "output index {idx} out of range for {} with {num} outputs",
            gf.name()
        )));
    }
    let entry = out.entry(gf.key()).or_insert_with(|| vec![None; num]);
    entry[idx] = Some(match entry[idx].take() {
        Some(prev) => prev + &grad,
        None => grad,
    });
    Ok(())
}
