// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Operator table.
//!
//! Every operation object is looked up here by name before it runs. The table
//! records the signature the tape relies on (arity, number of outputs and
//! whether a reverse rule exists) so a malformed call fails before any work is
//! done. Custom operators are registered on a fresh table which is then handed
//! to [`ExecContext::with_registry`](crate::backend::ExecContext::with_registry).

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Signature describing an operator's inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperatorSignature {
    /// Operator name.
    pub name: String,
    /// Number of input tensors, `None` for variadic operators.
    pub num_inputs: Option<usize>,
    /// Number of output tensors.
    pub num_outputs: usize,
    /// Whether the operator carries a reverse-mode rule.
    pub differentiable: bool,
}

/// Metadata for a registered operator.
#[derive(Debug, Clone)]
pub struct OperatorMetadata {
    pub signature: OperatorSignature,
    /// Human-readable description.
    pub description: String,
    /// Backends known to run the operator without scalar indexing.
    pub backends: Vec<String>,
}

/// Builder for operator metadata.
pub struct OperatorBuilder {
    signature: OperatorSignature,
    description: String,
    backends: Vec<String>,
}

impl OperatorBuilder {
    pub fn new(name: impl Into<String>, num_inputs: usize, num_outputs: usize) -> Self {
        Self {
            signature: OperatorSignature {
                name: name.into(),
                num_inputs: Some(num_inputs),
                num_outputs,
                differentiable: true,
            },
            description: String::new(),
            backends: Vec::new(),
        }
    }

    /// Operator accepting any positive number of inputs.
    pub fn variadic(name: impl Into<String>, num_outputs: usize) -> Self {
        let mut builder = Self::new(name, 0, num_outputs);
        builder.signature.num_inputs = None;
        builder
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backends.push(backend.into());
        self
    }

    pub fn with_differentiable(mut self, diff: bool) -> Self {
        self.signature.differentiable = diff;
        self
    }

    pub fn build(self) -> OperatorMetadata {
        OperatorMetadata {
            signature: self.signature,
            description: self.description,
            backends: self.backends,
        }
    }
}

/// Name-indexed operator table.
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, OperatorMetadata>,
}

const STANDARD: &[(&str, Option<usize>, usize, &str)] = &[
    ("add", Some(2), 1, "broadcasting element-wise sum"),
    ("sub", Some(2), 1, "broadcasting element-wise difference"),
    ("mul", Some(2), 1, "broadcasting element-wise product"),
    ("div", Some(2), 1, "broadcasting element-wise quotient"),
    ("neg", Some(1), 1, "negation"),
    ("exp", Some(1), 1, "natural exponential"),
    ("log", Some(1), 1, "natural logarithm"),
    ("sqrt", Some(1), 1, "square root"),
    ("square", Some(1), 1, "element-wise square"),
    ("relu", Some(1), 1, "rectified linear unit"),
    ("scale", Some(1), 1, "multiplication by a constant"),
    ("add_scalar", Some(1), 1, "addition of a constant"),
    ("softplus", Some(1), 1, "overflow-free log(1 + exp(x)), strictly positive"),
    ("batched_transpose", Some(1), 1, "swap of the two leading (matrix) axes"),
    ("batched_mul", Some(2), 1, "matrix product on the leading axes, broadcast over batch axes"),
    ("diagonal", Some(1), 1, "embeds a batch of vectors as diagonal matrices"),
    ("logsumexp", Some(1), 1, "max-shifted log-sum-exp over the given axes"),
    ("softmax", Some(1), 1, "max-shifted softmax over the given axes"),
    ("sum", Some(1), 1, "sum over the given axes"),
    ("reshape", Some(1), 1, "row-major reshape"),
    ("broadcast_to", Some(1), 1, "explicit broadcast to a larger shape"),
    ("narrow", Some(1), 1, "contiguous slice along one axis"),
    ("pad", Some(1), 1, "zero padding along one axis"),
    ("repeat_cat", None, 1, "concatenation after repeating singleton axes"),
    ("split", Some(1), 2, "split into two equal halves along one axis"),
    ("gaussian_logpdf", Some(3), 1, "element-wise Gaussian log-density"),
    ("mv_gaussian_logpdf", Some(3), 1, "multivariate Gaussian log-density via Cholesky"),
    ("reparam_sample", Some(3), 1, "reparameterised Gaussian draw mean + sqrt(var) * noise"),
];

impl OperatorRegistry {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every built-in primitive registered.
    pub fn standard() -> Self {
        let mut operators = HashMap::with_capacity(STANDARD.len());
        for &(name, num_inputs, num_outputs, description) in STANDARD {
            let builder = match num_inputs {
                Some(n) => OperatorBuilder::new(name, n, num_outputs),
                None => OperatorBuilder::variadic(name, num_outputs),
            };
            let metadata = builder
                .with_description(description)
                .with_backend("cpu")
                .with_backend("accelerator")
                .build();
            operators.insert(name.to_string(), metadata);
        }
        Self { operators }
    }

    /// Registers an operator; names are unique.
    pub fn register(&mut self, metadata: OperatorMetadata) -> Result<()> {
        let name = metadata.signature.name.clone();
        if self.operators.contains_key(&name) {
            return Err(Error::DuplicateOperator(name));
        }
        self.operators.insert(name, metadata);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OperatorMetadata> {
        self.operators.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn list_operators(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.keys().cloned().collect();
        names.sort();
        names
    }

    /// Operators advertised for a backend.
    pub fn find_by_backend(&self, backend: &str) -> Vec<&OperatorMetadata> {
        self.operators
            .values()
            .filter(|op| op.backends.iter().any(|b| b == backend))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Looks up `name` and checks the call arity against its signature.
    pub fn validate(&self, name: &str, num_inputs: usize) -> Result<&OperatorSignature> {
        let metadata = self
            .operators
            .get(name)
            .ok_or_else(|| Error::UnknownOperator(name.to_string()))?;
        let signature = &metadata.signature;
        match signature.num_inputs {
            Some(expected) if expected != num_inputs => Err(Error::Arity {
                name: name.to_string(),
                expected,
                got: num_inputs,
            }),
            None if num_inputs == 0 => Err(Error::Arity {
                name: name.to_string(),
                expected: 1,
                got: 0,
            }),
            _ => Ok(signature),
        }
    }
}
