//! Error types for graph compilation.
//!
//! Every failure is returned as a [`CompileError`]; nothing on a library path
//! panics. Errors fall into three categories (see [`ErrorCategory`]):
//! structural problems with the graph or kernel templates, capability gaps
//! (an operation or configuration the compiler cannot handle yet), and
//! failures reported by the compute device.

use thiserror::Error;

use crate::compiler::graph::TensorId;

/// Coarse classification of a [`CompileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed templates, unknown names, broken graph invariants.
    Structural,
    /// Unimplemented or unsupported operations; callers may recover.
    Capability,
    /// Allocation, compilation, binding or dispatch failed on the device.
    Device,
}

/// Failures reported by a [`crate::device::ComputeDevice`] or
/// [`crate::device::CommandQueue`] implementation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("allocation of {size} bytes failed: {reason}")]
    Allocation { size: usize, reason: String },

    #[error("kernel compilation failed: {0}")]
    Compilation(String),

    #[error("kernel argument binding failed: {0}")]
    Binding(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("invalid device handle {0}")]
    InvalidHandle(u64),

    #[error("timed out after {0} ms waiting for the command queue")]
    Timeout(u64),
}

/// Result alias for device calls.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors produced while compiling a graph into kernels.
#[derive(Debug, Error)]
pub enum CompileError {
    // ── Structural ──
    #[error("malformed selector expression at byte {position}: {reason}")]
    MalformedSelector { position: usize, reason: String },

    #[error("unbalanced '{bracket}' opened at byte {position}")]
    UnbalancedBracket { bracket: char, position: usize },

    #[error("unknown kernel object '{0}'")]
    UnknownObject(String),

    #[error("unknown kernel argument '{0}'")]
    UnknownArgument(String),

    #[error("object '{object}' has no selector '{selector}'")]
    UnsupportedSelector { object: String, selector: String },

    #[error("selector '{selector}' expects {expected} arguments, got {got}")]
    SelectorArity {
        selector: String,
        expected: usize,
        got: usize,
    },

    #[error("argument '{0}' already exists in the merge target")]
    DuplicateArgument(String),

    #[error("invalid kernel template: {0}")]
    InvalidTemplate(String),

    #[error("cannot bind object '{object}': {reason}")]
    ObjectMismatch { object: String, reason: String },

    #[error("kernel argument '{0}' has no bound memory")]
    UnboundArgument(String),

    #[error("no reservation for tensor {0:?}")]
    MissingTensor(TensorId),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("invalid usage record #{index}: first task {first} is after last task {last}")]
    InvalidUsageRecord {
        index: usize,
        first: usize,
        last: usize,
    },

    #[error("invalid compute node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("snapshot does not match the graph: {0}")]
    SnapshotMismatch(String),

    #[error("snapshot codec error: {0}")]
    Snapshot(#[from] serde_json::Error),

    // ── Capability ──
    #[error("operation not implemented: {0}")]
    Unimplemented(String),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    // ── Device ──
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl CompileError {
    /// Category used by callers to decide between aborting and recovering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CompileError::Unimplemented(_) | CompileError::Unsupported(_) => {
                ErrorCategory::Capability
            }
            CompileError::Device(_) => ErrorCategory::Device,
            _ => ErrorCategory::Structural,
        }
    }

    /// Capability errors leave the compiler in a consistent state.
    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Capability
    }
}

/// Result alias used across the crate.
pub type CompileResult<T> = Result<T, CompileError>;
