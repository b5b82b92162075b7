//! Property-based tests for the graph compiler.
//!
//! Uses proptest to verify invariants that must hold for all inputs:
//! - every memory strategy yields a valid, never-overlapping assignment
//! - offsets are prefix sums that keep every tensor inside the arena
//! - fusion collapses exactly the linkable links and is idempotent

use proptest::prelude::*;

use gllm_gpu_graph::compiler::fusion::merge_nodes;
use gllm_gpu_graph::compiler::graph::{Graph, OpKind, UnaryOp};
use gllm_gpu_graph::compiler::memory::{
    assign_objects_to_tensors, objects_to_offsets, MemoryStrategy, ObjectsAssignment,
    TensorUsageRecord,
};
use gllm_gpu_graph::compiler::reservation::reserve_graph;
use gllm_gpu_graph::kernel_generator::KernelGenerator;
use gllm_gpu_graph::{
    Bhwc, CalculationsPrecision, CompileOptions, CompiledGraph, ComputeNode, DeviceInfo,
    DryRunDevice, GpuVendor, TensorStorageType,
};

// ═══════════════════════════════════════════════════════════════════════
// 1. Memory assignment validity
// ═══════════════════════════════════════════════════════════════════════

fn arb_records(max_len: usize) -> impl Strategy<Value = Vec<TensorUsageRecord<usize>>> {
    prop::collection::vec((1usize..4096, 0usize..32, 0usize..8), 0..=max_len).prop_map(|raw| {
        raw.into_iter()
            .map(|(size, first, span)| TensorUsageRecord::new(size, first, first + span))
            .collect()
    })
}

fn check_assignment(
    records: &[TensorUsageRecord<usize>],
    assignment: &ObjectsAssignment<usize>,
) -> Result<(), TestCaseError> {
    prop_assert_eq!(assignment.object_ids.len(), records.len());
    for (t, record) in records.iter().enumerate() {
        let object = assignment.object_ids[t];
        prop_assert!(object < assignment.object_sizes.len());
        prop_assert!(assignment.object_sizes[object] >= record.tensor_size);
        for (u, other) in records.iter().enumerate().skip(t + 1) {
            if assignment.object_ids[u] == object {
                prop_assert!(
                    !record.overlaps(other.first_task, other.last_task),
                    "tensors {} and {} share object {} while both alive",
                    t,
                    u,
                    object
                );
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_every_strategy_valid(records in arb_records(24)) {
        let naive_total: usize = records.iter().map(|r| r.tensor_size).sum();
        for strategy in MemoryStrategy::ALL {
            let assignment = assign_objects_to_tensors(&records, strategy).unwrap();
            check_assignment(&records, &assignment)?;
            prop_assert!(assignment.total_size() <= naive_total, "{} exceeds naive", strategy);
        }
        let naive = assign_objects_to_tensors(&records, MemoryStrategy::Naive).unwrap();
        prop_assert_eq!(naive.total_size(), naive_total);
    }

    #[test]
    fn prop_offsets_fit_arena(records in arb_records(24)) {
        let assignment = assign_objects_to_tensors(&records, MemoryStrategy::GreedyBest).unwrap();
        let offsets = objects_to_offsets(&assignment);
        prop_assert_eq!(offsets.total_size, assignment.total_size());
        for (t, record) in records.iter().enumerate() {
            prop_assert!(offsets.offsets[t] + record.tensor_size <= offsets.total_size);
        }
    }

    #[test]
    fn prop_inverted_record_rejected(first in 1usize..100, back in 1usize..100) {
        let records = vec![TensorUsageRecord::new(16, first + back, first)];
        for strategy in MemoryStrategy::ALL {
            prop_assert!(assign_objects_to_tensors(&records, strategy).is_err());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 2. Fusion
// ═══════════════════════════════════════════════════════════════════════

/// Linear chain; `true` is a linkable unary op, `false` a softmax.
fn chain_graph(kinds: &[bool]) -> Graph {
    let shape = Bhwc::new(1, 4, 4, 8);
    let mut g = Graph::new();
    let mut t = g.add_input(shape, "x");
    for (i, &linkable) in kinds.iter().enumerate() {
        let next = g.add_tensor(shape, &format!("t{i}"));
        let kind = if linkable {
            OpKind::ElementwiseUnary(UnaryOp::Abs)
        } else {
            OpKind::Softmax
        };
        g.add_op(kind, &[t], &[next]).unwrap();
        t = next;
    }
    g.mark_output(t).unwrap();
    g
}

fn generate(graph: &Graph) -> Vec<ComputeNode> {
    let info = DeviceInfo::generic("dev", GpuVendor::Nvidia);
    let precision = CalculationsPrecision::F32;
    let reserver = reserve_graph(graph, &info, precision, Some(TensorStorageType::Buffer));
    let generator = KernelGenerator::new(graph, &reserver, &info, precision);
    graph
        .topological_order()
        .unwrap()
        .into_iter()
        .map(|op| generator.generate(op).unwrap())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_fusion_collapses_linkable_links(kinds in prop::collection::vec(any::<bool>(), 1..10)) {
        let graph = chain_graph(&kinds);
        let mut nodes = generate(&graph);
        let merged = merge_nodes(&mut nodes, graph.inputs(), graph.outputs()).unwrap();

        let expected = 1 + kinds[1..].iter().filter(|linkable| !**linkable).count();
        prop_assert_eq!(nodes.len(), expected);
        prop_assert_eq!(merged, kinds.len() - expected);
        prop_assert_eq!(nodes.last().unwrap().outputs.clone(), graph.outputs().to_vec());

        // a second pass finds nothing left to merge
        let again = merge_nodes(&mut nodes, graph.inputs(), graph.outputs()).unwrap();
        prop_assert_eq!(again, 0);
        prop_assert_eq!(nodes.len(), expected);
    }

    #[test]
    fn prop_chain_compiles_into_two_buffers(kinds in prop::collection::vec(any::<bool>(), 1..10)) {
        let graph = chain_graph(&kinds);
        let options = CompileOptions {
            storage_type: Some(TensorStorageType::Buffer),
            ..CompileOptions::default()
        };
        let mut device = DryRunDevice::new(DeviceInfo::generic("dev", GpuVendor::Nvidia));
        let compiled = CompiledGraph::compile(&graph, &options, &mut device).unwrap();
        let nodes = compiled.nodes().len();
        // a chain needs at most two live intermediates at a time
        prop_assert_eq!(device.buffer_count(), nodes.min(2));
        prop_assert_eq!(device.kernel_count(), nodes);
    }
}
