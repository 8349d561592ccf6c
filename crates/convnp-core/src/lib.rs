// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Differentiable batched tensor primitives.
//!
//! Tensors carry `f64` data laid out as `(rows, cols, batch…)`: the two
//! leading axes are matrix axes, every trailing axis is a batch axis. All
//! primitives run through an explicit [`ExecContext`] holding the backend
//! strategy, the operator table and the scalar-indexing policy.

pub mod autograd;
pub mod backend;
pub mod error;
pub mod gradcheck;
pub mod ops;
pub mod tensor;

pub use backend::{Backend, BackendKind, CpuBackend, DeviceCaps, ExecContext};
pub use error::{Error, Result};
pub use tensor::Tensor;
