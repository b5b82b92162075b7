//! Tensor memory planning, allocation and binding.
//!
//! Every runtime tensor falls into one storage category:
//!
//! | category      | tensors                    | memory                                  |
//! |---------------|----------------------------|-----------------------------------------|
//! | `External`    | graph inputs               | one dedicated tensor each               |
//! | `Variable`    | stateful tensors           | one dedicated tensor per variable ref   |
//! | `StrongShape` | image-backed storage       | shaped tensors, reused on equal shapes  |
//! | `Buffer`      | buffer-backed storage      | shared byte buffers (strategy-packed)   |
//!
//! Planning is pure. Allocation creates device memory for all categories;
//! binding then resolves every node input and output to its memory.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::compiler::graph::TensorId;
use crate::compiler::memory::{
    assign_objects_to_shaped_tensors, assign_objects_to_tensors, objects_to_offsets,
    MemoryStrategy, ObjectsAssignment, OffsetsAssignment, TensorUsageRecord,
};
use crate::compiler::node::ComputeNode;
use crate::compiler::reservation::{DummyTensor, TensorReserver};
use crate::config::BufferLayout;
use crate::device::{ComputeDevice, MemoryHandle};
use crate::error::{CompileError, CompileResult};
use crate::kernel::object::BoundTensor;

/// Sub-buffer offsets in an arena are aligned to this many bytes.
pub const ARENA_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TensorMemoryType {
    External,
    Variable,
    StrongShape,
    Buffer,
}

/// Graph-level facts the planner needs besides the node list.
#[derive(Debug, Clone, Copy)]
pub struct GraphIo<'a> {
    pub inputs: &'a [TensorId],
    pub outputs: &'a [TensorId],
    /// Tensor id → variable ref id.
    pub variables: &'a BTreeMap<TensorId, u32>,
}

impl GraphIo<'_> {
    pub fn classify(&self, id: TensorId, dummy: &DummyTensor) -> TensorMemoryType {
        if self.inputs.contains(&id) {
            TensorMemoryType::External
        } else if self.variables.contains_key(&id) {
            TensorMemoryType::Variable
        } else if dummy.descriptor.storage_type.is_buffer_based() {
            TensorMemoryType::Buffer
        } else {
            TensorMemoryType::StrongShape
        }
    }
}

/// Live interval `[first, last]` of every tensor over the node order.
///
/// Graph inputs are used at task 0 and graph outputs at task `nodes.len()`,
/// so outputs stay alive until the end.
pub fn get_usages(nodes: &[ComputeNode], io: &GraphIo<'_>) -> BTreeMap<TensorId, (usize, usize)> {
    let mut usages: BTreeMap<TensorId, (usize, usize)> = BTreeMap::new();
    let mut add_usage = |id: TensorId, task: usize| {
        usages
            .entry(id)
            .and_modify(|(first, last)| {
                *first = (*first).min(task);
                *last = (*last).max(task);
            })
            .or_insert((task, task));
    };
    for &id in io.inputs {
        add_usage(id, 0);
    }
    for (task, node) in nodes.iter().enumerate() {
        for &id in node.inputs.iter().chain(&node.outputs) {
            add_usage(id, task);
        }
    }
    for &id in io.outputs {
        add_usage(id, nodes.len());
    }
    usages
}

/// Peak memory figures of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MemoryReport {
    pub external_bytes: usize,
    pub variable_bytes: usize,
    pub strong_shape_bytes: usize,
    pub shared_bytes: usize,
    pub shared_objects: usize,
    /// Shared bytes without any reuse.
    pub shared_bytes_without_reuse: usize,
    pub strategy: MemoryStrategy,
}

impl MemoryReport {
    /// Bytes of memory held for intermediate (non-external, non-variable)
    /// tensors.
    pub fn size_of_memory_allocated_for_intermediate_tensors(&self) -> usize {
        self.strong_shape_bytes + self.shared_bytes
    }

    pub fn total_bytes(&self) -> usize {
        self.external_bytes + self.variable_bytes + self.strong_shape_bytes + self.shared_bytes
    }
}

/// Device-independent memory plan.
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    pub external: Vec<TensorId>,
    /// Variable ref id → tensors sharing it.
    pub variables: BTreeMap<u32, Vec<TensorId>>,
    pub strong_shape: Vec<TensorId>,
    pub strong_shape_assignment: ObjectsAssignment<DummyTensor>,
    pub shared: Vec<TensorId>,
    pub shared_assignment: ObjectsAssignment<usize>,
    pub shared_offsets: OffsetsAssignment,
    pub layout: BufferLayout,
    pub report: MemoryReport,
}

impl MemoryPlan {
    pub fn category(&self, id: TensorId) -> Option<TensorMemoryType> {
        if self.external.contains(&id) {
            Some(TensorMemoryType::External)
        } else if self.variables.values().any(|ids| ids.contains(&id)) {
            Some(TensorMemoryType::Variable)
        } else if self.strong_shape.contains(&id) {
            Some(TensorMemoryType::StrongShape)
        } else if self.shared.contains(&id) {
            Some(TensorMemoryType::Buffer)
        } else {
            None
        }
    }
}

/// Classify every tensor touched by `nodes` and assign shared objects.
pub fn plan_memory(
    nodes: &[ComputeNode],
    io: &GraphIo<'_>,
    reserver: &TensorReserver,
    strategy: MemoryStrategy,
    layout: BufferLayout,
) -> CompileResult<MemoryPlan> {
    let usages = get_usages(nodes, io);

    let mut external = Vec::new();
    let mut variables: BTreeMap<u32, Vec<TensorId>> = BTreeMap::new();
    let mut strong_shape = Vec::new();
    let mut strong_records = Vec::new();
    let mut shared = Vec::new();
    let mut shared_records = Vec::new();
    let mut report = MemoryReport {
        strategy,
        ..MemoryReport::default()
    };

    for (&id, &(first, last)) in &usages {
        let dummy = reserver.get(id)?;
        let bytes = dummy.size_in_bytes();
        match io.classify(id, dummy) {
            TensorMemoryType::External => {
                external.push(id);
                report.external_bytes += bytes;
            }
            TensorMemoryType::Variable => {
                let ref_id = io.variables[&id];
                let ids = variables.entry(ref_id).or_default();
                if ids.is_empty() {
                    report.variable_bytes += bytes;
                }
                ids.push(id);
            }
            TensorMemoryType::StrongShape => {
                strong_shape.push(id);
                strong_records.push(TensorUsageRecord::new(dummy.clone(), first, last));
            }
            TensorMemoryType::Buffer => {
                let size = match layout {
                    BufferLayout::Objects => bytes,
                    BufferLayout::Arena => bytes.next_multiple_of(ARENA_ALIGNMENT),
                };
                shared.push(id);
                shared_records.push(TensorUsageRecord::new(size, first, last));
                report.shared_bytes_without_reuse += size;
            }
        }
    }

    let strong_shape_assignment =
        assign_objects_to_shaped_tensors(&strong_records, MemoryStrategy::Equality)?;
    let shared_assignment = assign_objects_to_tensors(&shared_records, strategy)?;
    let shared_offsets = objects_to_offsets(&shared_assignment);

    report.strong_shape_bytes = strong_shape_assignment
        .object_sizes
        .iter()
        .map(DummyTensor::size_in_bytes)
        .sum();
    report.shared_bytes = shared_assignment.total_size();
    report.shared_objects = match layout {
        BufferLayout::Objects => shared_assignment.object_sizes.len(),
        BufferLayout::Arena => usize::from(!shared.is_empty()),
    };
    log::info!(
        "memory plan: {} external, {} variable, {} strong-shape in {} objects, {} shared in {} bytes ({} without reuse)",
        external.len(),
        variables.len(),
        strong_shape.len(),
        strong_shape_assignment.object_sizes.len(),
        shared.len(),
        report.shared_bytes,
        report.shared_bytes_without_reuse
    );

    Ok(MemoryPlan {
        external,
        variables,
        strong_shape,
        strong_shape_assignment,
        shared,
        shared_assignment,
        shared_offsets,
        layout,
        report,
    })
}

/// Device memory created for a plan.
#[derive(Debug, Clone, Default)]
pub struct AllocatedMemory {
    tensors: BTreeMap<TensorId, BoundTensor>,
    /// Backing objects of the shared category (one per object, or the arena).
    shared_objects: Vec<MemoryHandle>,
    strong_objects: Vec<MemoryHandle>,
}

impl AllocatedMemory {
    pub fn tensor(&self, id: TensorId) -> CompileResult<&BoundTensor> {
        self.tensors.get(&id).ok_or(CompileError::MissingTensor(id))
    }

    pub fn shared_objects(&self) -> &[MemoryHandle] {
        &self.shared_objects
    }

    pub fn strong_objects(&self) -> &[MemoryHandle] {
        &self.strong_objects
    }

    pub fn tensors(&self) -> impl Iterator<Item = (&TensorId, &BoundTensor)> {
        self.tensors.iter()
    }
}

/// Create device memory for every category of `plan`.
pub fn allocate_memory(
    plan: &MemoryPlan,
    reserver: &TensorReserver,
    device: &mut dyn ComputeDevice,
) -> CompileResult<AllocatedMemory> {
    let mut memory = AllocatedMemory::default();
    let bind = |memory: &mut AllocatedMemory, id: TensorId, handle: MemoryHandle, dummy: &DummyTensor| {
        memory.tensors.insert(
            id,
            BoundTensor {
                memory: handle,
                shape: dummy.shape,
                descriptor: dummy.descriptor.clone(),
            },
        );
    };

    for &id in &plan.external {
        let dummy = reserver.get(id)?;
        let handle = device.create_tensor(&dummy.descriptor, &dummy.shape)?;
        bind(&mut memory, id, handle, dummy);
    }

    for (ref_id, ids) in &plan.variables {
        let Some(&first) = ids.first() else {
            continue;
        };
        let owner = reserver.get(first)?;
        let handle = device.create_tensor(&owner.descriptor, &owner.shape)?;
        for &id in ids {
            let dummy = reserver.get(id)?;
            if dummy != owner {
                return Err(CompileError::InvalidGraph(format!(
                    "variable {ref_id} is used with different shapes or storage"
                )));
            }
            bind(&mut memory, id, handle, dummy);
        }
    }

    for object in &plan.strong_shape_assignment.object_sizes {
        let handle = device.create_tensor(&object.descriptor, &object.shape)?;
        memory.strong_objects.push(handle);
    }
    for (t, &id) in plan.strong_shape.iter().enumerate() {
        let handle = memory.strong_objects[plan.strong_shape_assignment.object_ids[t]];
        bind(&mut memory, id, handle, reserver.get(id)?);
    }

    match plan.layout {
        BufferLayout::Objects => {
            for &size in &plan.shared_assignment.object_sizes {
                memory.shared_objects.push(device.create_buffer(size)?);
            }
            for (t, &id) in plan.shared.iter().enumerate() {
                let dummy = reserver.get(id)?;
                let parent = memory.shared_objects[plan.shared_assignment.object_ids[t]];
                let view = device.create_tensor_view(parent, 0, &dummy.descriptor, &dummy.shape)?;
                bind(&mut memory, id, view, dummy);
            }
        }
        BufferLayout::Arena => {
            if !plan.shared.is_empty() {
                let arena = device.create_buffer(plan.shared_offsets.total_size)?;
                memory.shared_objects.push(arena);
                for (t, &id) in plan.shared.iter().enumerate() {
                    let dummy = reserver.get(id)?;
                    let offset = plan.shared_offsets.offsets[t];
                    let view =
                        device.create_tensor_view(arena, offset, &dummy.descriptor, &dummy.shape)?;
                    bind(&mut memory, id, view, dummy);
                }
            }
        }
    }

    log::debug!(
        "allocated {} tensors over {} shared and {} strong-shape objects",
        memory.tensors.len(),
        memory.shared_objects.len(),
        memory.strong_objects.len()
    );
    Ok(memory)
}

/// Point every node's sources and destinations at their memory.
pub fn bind_memory_to_operations(
    nodes: &mut [ComputeNode],
    memory: &AllocatedMemory,
) -> CompileResult<()> {
    for node in nodes {
        for (i, &id) in node.inputs.iter().enumerate() {
            node.operation.set_src(memory.tensor(id)?.clone(), i);
        }
        for (i, &id) in node.outputs.iter().enumerate() {
            node.operation.set_dst(memory.tensor(id)?.clone(), i);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dry_run::{DryRunDevice, DryRunMemory};
    use crate::device::{DeviceInfo, GpuVendor};
    use crate::kernel::operation::{GpuOperation, OperationDef};
    use crate::kernel::tensor_desc::TensorDescriptor;
    use crate::types::{Bhwc, CalculationsPrecision, DataType, Layout, TensorStorageType};

    fn desc(storage: TensorStorageType) -> TensorDescriptor {
        TensorDescriptor::new(DataType::Float32, storage, Layout::Hwc)
    }

    fn node(inputs: &[u32], output: u32) -> ComputeNode {
        let def = OperationDef {
            precision: CalculationsPrecision::F32,
            src_tensors: vec![desc(TensorStorageType::Buffer); inputs.len()],
            dst_tensors: vec![desc(TensorStorageType::Buffer)],
        };
        ComputeNode::new(
            GpuOperation::new(def, "op", "$0".into()),
            inputs.iter().map(|i| TensorId(*i)).collect(),
            vec![TensorId(output)],
            format!("op{output}"),
        )
        .unwrap()
    }

    fn reserver(ids: &[(u32, usize, TensorStorageType)]) -> TensorReserver {
        let mut reserver = TensorReserver::new();
        for &(id, c, storage) in ids {
            reserver.add_with_id(
                TensorId(id),
                DummyTensor {
                    shape: Bhwc::new(1, 2, 2, c),
                    descriptor: desc(storage),
                },
            );
        }
        reserver
    }

    #[test]
    fn test_usages() {
        let nodes = vec![node(&[0], 1), node(&[1], 2), node(&[0, 2], 3)];
        let variables = BTreeMap::new();
        let io = GraphIo {
            inputs: &[TensorId(0)],
            outputs: &[TensorId(3)],
            variables: &variables,
        };
        let usages = get_usages(&nodes, &io);
        assert_eq!(usages[&TensorId(0)], (0, 2));
        assert_eq!(usages[&TensorId(1)], (0, 1));
        assert_eq!(usages[&TensorId(2)], (1, 2));
        assert_eq!(usages[&TensorId(3)], (2, 3));
    }

    #[test]
    fn test_chain_shares_two_buffers() {
        use TensorStorageType::Buffer;
        let nodes = vec![node(&[0], 1), node(&[1], 2), node(&[2], 3), node(&[3], 4)];
        let variables = BTreeMap::new();
        let io = GraphIo {
            inputs: &[TensorId(0)],
            outputs: &[TensorId(4)],
            variables: &variables,
        };
        let reserver = reserver(&[(0, 4, Buffer), (1, 4, Buffer), (2, 4, Buffer), (3, 4, Buffer), (4, 4, Buffer)]);
        let plan = plan_memory(&nodes, &io, &reserver, MemoryStrategy::GreedyInOrder, BufferLayout::Objects)
            .unwrap();
        assert_eq!(plan.external, vec![TensorId(0)]);
        assert_eq!(plan.shared.len(), 4);
        assert_eq!(plan.report.shared_objects, 2);
        assert_eq!(plan.report.shared_bytes, 128);
        assert_eq!(plan.report.shared_bytes_without_reuse, 256);
        assert_eq!(plan.report.external_bytes, 64);

        let mut device = DryRunDevice::new(DeviceInfo::generic("gpu", GpuVendor::Nvidia));
        let memory = allocate_memory(&plan, &reserver, &mut device).unwrap();
        assert_eq!(device.buffer_count(), 2);
        assert_eq!(device.tensor_count(), 1);
        assert_ne!(
            memory.tensor(TensorId(0)).unwrap().memory,
            memory.tensor(TensorId(1)).unwrap().memory
        );

        let mut nodes = nodes;
        bind_memory_to_operations(&mut nodes, &memory).unwrap();
    }

    #[test]
    fn test_categories_and_variables() {
        use TensorStorageType::{Buffer, Texture2D};
        let nodes = vec![node(&[0, 5], 1), node(&[1], 2), node(&[2], 6)];
        let mut variables = BTreeMap::new();
        variables.insert(TensorId(5), 7);
        variables.insert(TensorId(6), 7);
        let io = GraphIo {
            inputs: &[TensorId(0)],
            outputs: &[TensorId(6)],
            variables: &variables,
        };
        let reserver = reserver(&[
            (0, 4, Texture2D),
            (1, 8, Texture2D),
            (2, 8, Buffer),
            (5, 4, Texture2D),
            (6, 4, Texture2D),
        ]);
        let plan = plan_memory(&nodes, &io, &reserver, MemoryStrategy::Naive, BufferLayout::Objects)
            .unwrap();
        assert_eq!(plan.category(TensorId(0)), Some(TensorMemoryType::External));
        assert_eq!(plan.category(TensorId(1)), Some(TensorMemoryType::StrongShape));
        assert_eq!(plan.category(TensorId(2)), Some(TensorMemoryType::Buffer));
        assert_eq!(plan.category(TensorId(5)), Some(TensorMemoryType::Variable));
        assert_eq!(plan.variables[&7], vec![TensorId(5), TensorId(6)]);

        let mut device = DryRunDevice::new(DeviceInfo::adreno(6));
        let memory = allocate_memory(&plan, &reserver, &mut device).unwrap();
        assert_eq!(
            memory.tensor(TensorId(5)).unwrap().memory,
            memory.tensor(TensorId(6)).unwrap().memory
        );
        // input, variable, one strong-shape object
        assert_eq!(device.tensor_count(), 3);
    }

    #[test]
    fn test_arena_views_at_offsets() {
        use TensorStorageType::Buffer;
        let nodes = vec![node(&[0], 1), node(&[1], 2), node(&[2], 3)];
        let variables = BTreeMap::new();
        let io = GraphIo {
            inputs: &[TensorId(0)],
            outputs: &[TensorId(3)],
            variables: &variables,
        };
        let reserver = reserver(&[(0, 4, Buffer), (1, 4, Buffer), (2, 4, Buffer), (3, 8, Buffer)]);
        let plan = plan_memory(&nodes, &io, &reserver, MemoryStrategy::Naive, BufferLayout::Arena)
            .unwrap();
        assert_eq!(plan.shared_offsets.offsets, vec![0, 64, 128]);
        assert_eq!(plan.report.shared_objects, 1);

        let mut device = DryRunDevice::new(DeviceInfo::generic("gpu", GpuVendor::Amd));
        let memory = allocate_memory(&plan, &reserver, &mut device).unwrap();
        assert_eq!(device.buffer_count(), 1);
        let view = memory.tensor(TensorId(3)).unwrap().memory;
        assert!(matches!(
            device.memory(view),
            Some(DryRunMemory::View { offset_bytes: 128, .. })
        ));
    }

    #[test]
    fn test_missing_reservation() {
        let nodes = vec![node(&[0], 1)];
        let variables = BTreeMap::new();
        let io = GraphIo {
            inputs: &[TensorId(0)],
            outputs: &[TensorId(1)],
            variables: &variables,
        };
        let reserver = reserver(&[(0, 4, TensorStorageType::Buffer)]);
        assert!(matches!(
            plan_memory(&nodes, &io, &reserver, MemoryStrategy::Naive, BufferLayout::Objects),
            Err(CompileError::MissingTensor(TensorId(1)))
        ));
    }
}
