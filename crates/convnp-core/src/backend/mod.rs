// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Backend capability objects and the execution context threaded through
//! every primitive.
//!
//! A backend only exposes whole-tensor kernels. Batched kernels take arrays
//! laid out as `(rows, cols, batch)`; a batch extent of one broadcasts against
//! the other operand.

mod cpu;

use std::fmt;
use std::sync::Arc;

use ndarray::{Array3, ArrayView3};

use crate::error::{Error, Result};
use crate::ops::registry::OperatorRegistry;

pub use cpu::CpuBackend;

/// Enumerates the execution targets a backend can describe itself as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Host execution.
    Cpu,
    /// Device execution where element-wise host access is prohibitively slow.
    Accelerator,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => f.write_str("cpu"),
            BackendKind::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Minimal capability description shared across backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Backend discriminator.
    pub backend: BackendKind,
    /// Whether reading or writing individual elements is acceptable.
    pub scalar_indexing: bool,
}

impl DeviceCaps {
    /// Host capabilities: scalar indexing is cheap.
    pub fn cpu() -> Self {
        Self {
            backend: BackendKind::Cpu,
            scalar_indexing: true,
        }
    }

    /// Accelerator capabilities: every computation must stay whole-tensor.
    pub fn accelerator() -> Self {
        Self {
            backend: BackendKind::Accelerator,
            scalar_indexing: false,
        }
    }
}

/// Strategy object implementing the batched linear-algebra kernels.
pub trait Backend: fmt::Debug {
    fn caps(&self) -> DeviceCaps;

    /// `out[.., .., b] = a[.., .., b] · b[.., .., b]`, optionally transposing
    /// either operand's matrix axes first.
    fn batched_gemm(
        &self,
        a: ArrayView3<'_, f64>,
        b: ArrayView3<'_, f64>,
        transpose_a: bool,
        transpose_b: bool,
    ) -> Result<Array3<f64>>;

    /// Upper Cholesky factor `U` with `UᵗU = A` for every batch element.
    ///
    /// This is the one kernel allowed to work per batch element: the
    /// factorisation cannot be expressed as a whole-tensor operation.
    fn cholesky_upper(&self, a: ArrayView3<'_, f64>) -> Result<Array3<f64>>;

    /// Solves `U X = B` (or `Uᵗ X = B` when `transpose` is set) for upper
    /// triangular `U`, per batch element.
    fn solve_upper(
        &self,
        u: ArrayView3<'_, f64>,
        b: ArrayView3<'_, f64>,
        transpose: bool,
    ) -> Result<Array3<f64>>;
}

/// Explicit execution state passed into the primitive layer.
///
/// The scalar-indexing flag is fixed when the context is built and never
/// changes afterwards; build a new context to change it.
#[derive(Clone)]
pub struct ExecContext {
    backend: Arc<dyn Backend>,
    registry: Arc<OperatorRegistry>,
    allow_scalar_indexing: bool,
}

impl ExecContext {
    /// Context over `backend` with the standard operator table. Scalar
    /// indexing follows the backend capabilities.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let allow_scalar_indexing = backend.caps().scalar_indexing;
        Self {
            backend,
            registry: Arc::new(OperatorRegistry::standard()),
            allow_scalar_indexing,
        }
    }

    /// Host context with scalar indexing allowed.
    pub fn cpu() -> Self {
        Self::new(Arc::new(CpuBackend::new()))
    }

    /// Host context that enforces accelerator constraints.
    pub fn strict() -> Self {
        Self::new(Arc::new(CpuBackend::strict()))
    }

    /// Replaces the operator table, e.g. after registering custom operators.
    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Overrides the scalar-indexing flag. Enabling it on a backend that does
    /// not support it is refused.
    pub fn with_scalar_indexing(mut self, allow: bool) -> Result<Self> {
        if allow && !self.backend.caps().scalar_indexing {
            return Err(Error::ScalarIndexing("backend forbids scalar indexing"));
        }
        self.allow_scalar_indexing = allow;
        Ok(self)
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    pub fn caps(&self) -> DeviceCaps {
        self.backend.caps()
    }

    pub fn allows_scalar_indexing(&self) -> bool {
        self.allow_scalar_indexing
    }

    /// Fails unless element-wise host access is permitted for this context.
    pub fn ensure_scalar_indexing(&self, label: &'static str) -> Result<()> {
        if self.allow_scalar_indexing {
            Ok(())
        } else {
            Err(Error::ScalarIndexing(label))
        }
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("backend", &self.backend)
            .field("operators", &self.registry.len())
            .field("allow_scalar_indexing", &self.allow_scalar_indexing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_context_refuses_scalar_indexing() {
        let ctx = ExecContext::strict();
        assert!(!ctx.allows_scalar_indexing());
        assert!(matches!(
            ctx.ensure_scalar_indexing("element read"),
            Err(Error::ScalarIndexing("element read"))
        ));
        assert!(ctx.clone().with_scalar_indexing(true).is_err());
    }

    #[test]
    fn cpu_context_can_opt_out_of_scalar_indexing() {
        let ctx = ExecContext::cpu().with_scalar_indexing(false).unwrap();
        assert!(ctx.ensure_scalar_indexing("element read").is_err());
        assert_eq!(ctx.caps().backend, BackendKind::Cpu);
    }
}
