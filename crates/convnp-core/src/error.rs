// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape error: {0}")]
    Shape(String),
    #[error("broadcast: incompatible shapes {left:?} and {right:?}")]
    Broadcast { left: Vec<usize>, right: Vec<usize> },
    #[error("cannot split axis {axis} of size {size} into two equal halves")]
    OddSplit { axis: usize, size: usize },
    #[error("repeat_cat: input {input} has size {size} on axis {axis}; expected 1 or {expected}")]
    RepeatCat {
        input: usize,
        axis: usize,
        size: usize,
        expected: usize,
    },
    #[error("matrix for batch element {batch} is not positive definite")]
    NotPositiveDefinite { batch: usize },
    #[error("scalar indexing is disabled in this execution context ({0})")]
    ScalarIndexing(&'static str),
    #[error("operator '{0}' is not registered")]
    UnknownOperator(String),
    #[error("operator '{0}' is already registered")]
    DuplicateOperator(String),
    #[error("operator '{name}' expects {expected} inputs, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("operator '{0}' does not support gradient computation")]
    NotDifferentiable(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("missing parameter '{name}' while loading module state")]
    MissingParameter { name: String },
    #[error("invalid value for {label}: {message}")]
    InvalidValue { label: &'static str, message: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn shape(m: impl Into<String>) -> Error {
    Error::Shape(m.into())
}

pub fn invalid(label: &'static str, message: impl Into<String>) -> Error {
    Error::InvalidValue {
        label,
        message: message.into(),
    }
}
