//! gllm-gpu-graph: compiles tensor dataflow graphs into GPU kernel schedules.
//!
//! The crate provides:
//! - **Kernel selection**: one parameterized kernel per operation, chosen by
//!   shape, attributes and device vendor
//! - **Fusion**: element-wise consumers are linked into their producer's kernel
//! - **Memory planning**: lifetime-based reuse of shared buffers with pluggable
//!   strategies (greedy, min-cost-flow, arena offsets)
//! - **Argument resolution**: `args.` templates become final kernel source plus
//!   an ordered, typed argument list
//!
//! # Quick Start
//!
//! ```ignore
//! use gllm_gpu_graph::{CompileOptions, CompiledGraph, DeviceInfo, DryRunDevice, Graph};
//!
//! let mut device = DryRunDevice::new(DeviceInfo::adreno(6));
//! let mut compiled = CompiledGraph::compile(&graph, &CompileOptions::default(), &mut device)?;
//! compiled.add_to_queue(&mut device)?;
//! compiled.finish(&mut device)?;
//! ```

pub mod compiler;
pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod kernel_generator;
pub mod ops;
pub mod selectors;
pub mod types;

pub use compiler::buffer_alloc::MemoryReport;
pub use compiler::graph::{Graph, GraphOperation, OpId, TensorId};
pub use compiler::node::ComputeNode;
pub use compiler::CompiledGraph;
pub use config::{BufferLayout, CompileOptions, ModelHints, UnimplementedPolicy};
pub use device::dry_run::DryRunDevice;
pub use device::{CommandQueue, ComputeDevice, DeviceInfo, GpuVendor};
pub use error::{CompileError, CompileResult, DeviceError, ErrorCategory};
pub use types::{Bhwc, CalculationsPrecision, DataType, TensorStorageType};
