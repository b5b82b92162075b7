//! Graph compiler: turns a [`Graph`] into compiled, bound kernels.
//!
//! # Pipeline
//!
//! ```text
//! Graph → reserve_graph → KernelGenerator (one node per op) → merge_nodes
//!       → plan_memory → allocate_memory → bind_memory_to_operations
//!       → compile + update_params per node → CompiledGraph::add_to_queue
//! ```
//!
//! The state after fusion can be captured as a snapshot
//! ([`CompiledGraph::compile_with_snapshot`]) and restored against the same
//! graph on a fresh device ([`CompiledGraph::restore`]).

pub mod buffer_alloc;
pub mod fusion;
pub mod graph;
pub mod memory;
pub mod node;
pub mod reservation;
pub mod snapshot;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::compiler::buffer_alloc::{
    allocate_memory, bind_memory_to_operations, plan_memory, AllocatedMemory, GraphIo,
    MemoryPlan, MemoryReport,
};
use crate::compiler::fusion::merge_nodes;
use crate::compiler::graph::{Graph, GraphOperation, TensorId};
use crate::compiler::node::ComputeNode;
use crate::compiler::reservation::{reserve_graph, TensorReserver};
use crate::compiler::snapshot::{GraphSnapshot, SnapshotView, SNAPSHOT_VERSION};
use crate::config::{CompileOptions, UnimplementedPolicy};
use crate::device::{CommandQueue, ComputeDevice, EventHandle};
use crate::error::{CompileError, CompileResult};
use crate::kernel::object::BoundTensor;
use crate::kernel_generator::KernelGenerator;
use crate::types::CalculationsPrecision;

pub use buffer_alloc::TensorMemoryType;
pub use graph::{Activation, Axis, BinaryOp, Conv2DParams, OpId, OpKind, Padding2D, Pool2DParams, PoolingKind, UnaryOp};
pub use memory::MemoryStrategy;

/// Output id → tensor it reads through (pass-through ops).
type Aliases = BTreeMap<TensorId, TensorId>;

/// Everything the device stages need, from compilation or a snapshot.
struct Prepared {
    reserver: TensorReserver,
    nodes: Vec<ComputeNode>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    variables: BTreeMap<TensorId, u32>,
    aliases: Aliases,
    precision: CalculationsPrecision,
}

impl Prepared {
    fn snapshot(&self) -> CompileResult<Vec<u8>> {
        SnapshotView {
            version: SNAPSHOT_VERSION,
            tensors: self.reserver.tensor_descs(),
            next_id: self.reserver.next_id(),
            nodes: &self.nodes,
            inputs: &self.inputs,
            outputs: &self.outputs,
            variables: self.variables.iter().map(|(k, v)| (*k, *v)).collect(),
            aliases: self.aliases.iter().map(|(k, v)| (*k, *v)).collect(),
        }
        .encode()
    }

    /// Graph outputs with aliases resolved.
    fn resolved_outputs(&self) -> Vec<TensorId> {
        self.outputs
            .iter()
            .map(|id| resolve(&self.aliases, *id))
            .collect()
    }
}

fn resolve(aliases: &Aliases, id: TensorId) -> TensorId {
    aliases.get(&id).copied().unwrap_or(id)
}

/// A graph compiled for one device: ordered nodes with compiled kernels and
/// bound memory, ready to be enqueued.
#[derive(Debug)]
pub struct CompiledGraph {
    nodes: Vec<ComputeNode>,
    reserver: TensorReserver,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    aliases: Aliases,
    plan: MemoryPlan,
    memory: AllocatedMemory,
    precision: CalculationsPrecision,
    need_flush: bool,
    need_manual_release: bool,
    flush_period: Option<usize>,
    dispatch_timeout: Option<Duration>,
    prev_enqueue_start_point: Option<EventHandle>,
}

impl CompiledGraph {
    pub fn compile(
        graph: &Graph,
        options: &CompileOptions,
        device: &mut dyn ComputeDevice,
    ) -> CompileResult<Self> {
        let prepared = prepare(graph, options, device)?;
        Self::build(prepared, options, device)
    }

    /// Like [`CompiledGraph::compile`], also returning the encoded snapshot.
    pub fn compile_with_snapshot(
        graph: &Graph,
        options: &CompileOptions,
        device: &mut dyn ComputeDevice,
    ) -> CompileResult<(Self, Vec<u8>)> {
        let prepared = prepare(graph, options, device)?;
        let snapshot = prepared.snapshot()?;
        log::debug!("encoded snapshot of {} bytes", snapshot.len());
        Ok((Self::build(prepared, options, device)?, snapshot))
    }

    /// Rebuild from a snapshot of `graph`. Reservations and the graph
    /// interface must match what `options` and `device` produce today.
    pub fn restore(
        snapshot: &[u8],
        graph: &Graph,
        options: &CompileOptions,
        device: &mut dyn ComputeDevice,
    ) -> CompileResult<Self> {
        let decoded = GraphSnapshot::decode(snapshot)?;
        graph.validate()?;
        let precision = options.effective_precision(device.info());
        let expected = reserve_graph(graph, device.info(), precision, options.storage_type);

        let mut reserver = TensorReserver::new();
        reserver.add_descs(decoded.tensors);
        if reserver.tensor_descs() != expected.tensor_descs() {
            return Err(CompileError::SnapshotMismatch(
                "tensor reservations differ".into(),
            ));
        }
        if decoded.next_id < expected.next_id() {
            return Err(CompileError::SnapshotMismatch(format!(
                "next tensor id {:?} collides with graph tensors",
                decoded.next_id
            )));
        }
        if decoded.inputs != graph.inputs() || decoded.outputs != graph.outputs() {
            return Err(CompileError::SnapshotMismatch(
                "graph inputs or outputs differ".into(),
            ));
        }
        let variables: BTreeMap<TensorId, u32> = decoded.variables.into_iter().collect();
        if &variables != graph.variables() {
            return Err(CompileError::SnapshotMismatch("variables differ".into()));
        }
        for node in &decoded.nodes {
            if node.operation.definition().precision != precision {
                return Err(CompileError::SnapshotMismatch(format!(
                    "node '{}' was compiled for {:?}",
                    node.name,
                    node.operation.definition().precision
                )));
            }
            for &id in node.inputs.iter().chain(&node.outputs) {
                reserver.get(id)?;
            }
        }
        reserver.set_next(decoded.next_id);

        log::info!("restored {} nodes from snapshot", decoded.nodes.len());
        let prepared = Prepared {
            reserver,
            nodes: decoded.nodes,
            inputs: decoded.inputs,
            outputs: decoded.outputs,
            variables,
            aliases: decoded.aliases.into_iter().collect(),
            precision,
        };
        Self::build(prepared, options, device)
    }

    fn build(
        prepared: Prepared,
        options: &CompileOptions,
        device: &mut dyn ComputeDevice,
    ) -> CompileResult<Self> {
        let Prepared {
            reserver,
            mut nodes,
            inputs,
            outputs,
            variables,
            aliases,
            precision,
        } = prepared;
        let resolved_outputs: Vec<TensorId> =
            outputs.iter().map(|id| resolve(&aliases, *id)).collect();
        let io = GraphIo {
            inputs: &inputs,
            outputs: &resolved_outputs,
            variables: &variables,
        };
        let plan = plan_memory(
            &nodes,
            &io,
            &reserver,
            options.memory_strategy,
            options.buffer_layout,
        )?;
        let memory = allocate_memory(&plan, &reserver, device)?;
        bind_memory_to_operations(&mut nodes, &memory)?;

        for node in &mut nodes {
            node.operation.compile(device)?;
            node.operation.update_params(device)?;
        }

        let info = device.info();
        let flush_period = (info.is_adreno()
            && !options.hints.reduce_kernels_count
            && options.flush_period > 0)
            .then_some(options.flush_period);
        log::info!(
            "compiled {} nodes for {} ({} shared bytes)",
            nodes.len(),
            info.name,
            plan.report.shared_bytes
        );
        Ok(Self {
            nodes,
            reserver,
            inputs,
            outputs,
            aliases,
            need_flush: info.is_mali(),
            need_manual_release: info.is_mali(),
            flush_period,
            dispatch_timeout: options.dispatch_timeout(),
            plan,
            memory,
            precision,
            prev_enqueue_start_point: None,
        })
    }

    /// Enqueue every node in order.
    pub fn add_to_queue(&mut self, queue: &mut dyn CommandQueue) -> CompileResult<()> {
        if self.need_manual_release {
            if let Some(prev) = self.prev_enqueue_start_point.take() {
                queue.wait_event(prev)?;
            }
            self.prev_enqueue_start_point = Some(queue.enqueue_marker()?);
        }
        for (counter, node) in self.nodes.iter().enumerate() {
            node.operation.add_to_queue(queue)?;
            if let Some(period) = self.flush_period {
                if (counter + 1) % period == 0 {
                    queue.flush()?;
                }
            }
        }
        if self.need_flush {
            queue.flush()?;
        }
        Ok(())
    }

    /// Block until the queue drains, honouring the dispatch timeout.
    pub fn finish(&self, queue: &mut dyn CommandQueue) -> CompileResult<()> {
        Ok(queue.wait_for_completion(self.dispatch_timeout)?)
    }

    pub fn nodes(&self) -> &[ComputeNode] {
        &self.nodes
    }

    /// Memory bound to a graph tensor; pass-through outputs resolve to the
    /// tensor they alias.
    pub fn tensor(&self, id: TensorId) -> CompileResult<&BoundTensor> {
        self.memory.tensor(resolve(&self.aliases, id))
    }

    pub fn memory_report(&self) -> &MemoryReport {
        &self.plan.report
    }

    pub fn memory_plan(&self) -> &MemoryPlan {
        &self.plan
    }

    pub fn reserver(&self) -> &TensorReserver {
        &self.reserver
    }

    pub fn precision(&self) -> CalculationsPrecision {
        self.precision
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }
}

/// Reserve, generate and fuse.
fn prepare(
    graph: &Graph,
    options: &CompileOptions,
    device: &dyn ComputeDevice,
) -> CompileResult<Prepared> {
    graph.validate()?;
    let info = device.info();
    let precision = options.effective_precision(info);
    let reserver = reserve_graph(graph, info, precision, options.storage_type);
    let generator = KernelGenerator::new(graph, &reserver, info, precision);

    let order = graph.topological_order()?;
    let mut nodes = Vec::with_capacity(order.len());
    let mut aliases = Aliases::new();
    for id in order {
        match generator.generate(id) {
            Ok(mut node) => {
                for input in &mut node.inputs {
                    *input = resolve(&aliases, *input);
                }
                nodes.push(node);
            }
            Err(CompileError::Unimplemented(what))
                if options.unimplemented_policy == UnimplementedPolicy::PassThrough =>
            {
                let op = graph
                    .op(id)
                    .ok_or_else(|| CompileError::InvalidGraph(format!("unknown operation {id:?}")))?;
                let Some((input, output)) = pass_through(op, &reserver)? else {
                    return Err(CompileError::Unimplemented(what));
                };
                log::warn!("passing through unimplemented {what}");
                aliases.insert(output, resolve(&aliases, input));
            }
            Err(e) => return Err(e),
        }
    }

    let mut prepared = Prepared {
        reserver,
        nodes,
        inputs: graph.inputs().to_vec(),
        outputs: graph.outputs().to_vec(),
        variables: graph.variables().clone(),
        aliases,
        precision,
    };
    let outputs = prepared.resolved_outputs();
    merge_nodes(&mut prepared.nodes, &prepared.inputs, &outputs)?;
    log::info!(
        "{} operations became {} nodes",
        graph.num_ops(),
        prepared.nodes.len()
    );
    Ok(prepared)
}

/// `(input, output)` when `op` can be dropped in favour of its input.
fn pass_through(
    op: &GraphOperation,
    reserver: &TensorReserver,
) -> CompileResult<Option<(TensorId, TensorId)>> {
    let ([input], [output]) = (&op.inputs[..], &op.outputs[..]) else {
        return Ok(None);
    };
    let same = reserver.get(*input)? == reserver.get(*output)?;
    Ok(same.then_some((*input, *output)))
}
