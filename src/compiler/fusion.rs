//! Fusion pass: merges a node with the sole linkable consumer of its output.
//!
//! Single forward pass over the node list in creation order. A producer `P`
//! with one output `t` absorbs consumer `C` when:
//!
//! - `t` is read exactly once, by `C`, at input slot 0
//! - `C` is linkable and has exactly one output
//! - every input of `C` is already available at `P`
//! - both destination descriptors are equal
//! - `t` is not a graph output
//!
//! The merged node keeps `P`'s inputs followed by `C`'s other inputs, and
//! writes `C`'s output. The same index is re-examined afterwards, so chains
//! collapse into one node.

use std::collections::HashSet;

use crate::compiler::graph::TensorId;
use crate::compiler::node::ComputeNode;
use crate::error::CompileResult;

/// Run the pass in place; returns the number of merges performed.
pub fn merge_nodes(
    nodes: &mut Vec<ComputeNode>,
    graph_inputs: &[TensorId],
    graph_outputs: &[TensorId],
) -> CompileResult<usize> {
    let mut ready: HashSet<TensorId> = graph_inputs.iter().copied().collect();
    let mut merged = 0;
    let mut i = 0;
    while i < nodes.len() {
        ready.extend(nodes[i].outputs.iter().copied());
        match find_link(nodes, i, &ready, graph_outputs) {
            Some(j) => {
                let consumer = nodes.remove(j);
                let producer = &mut nodes[i];
                log::debug!("fusing '{}' into '{}'", consumer.name, producer.name);
                producer
                    .inputs
                    .extend(consumer.inputs.iter().skip(1).copied());
                producer.outputs[0] = consumer.outputs[0];
                producer.name = format!("{} linked : {}", producer.name, consumer.name);
                producer.operation.add_operation(consumer.operation)?;
                merged += 1;
            }
            None => i += 1,
        }
    }
    if merged > 0 {
        log::info!("fusion merged {merged} nodes, {} remain", nodes.len());
    }
    Ok(merged)
}

/// Index of the consumer node `nodes[i]` can absorb, if any.
fn find_link(
    nodes: &[ComputeNode],
    i: usize,
    ready: &HashSet<TensorId>,
    graph_outputs: &[TensorId],
) -> Option<usize> {
    let producer = &nodes[i];
    let [output] = producer.outputs[..] else {
        return None;
    };
    if graph_outputs.contains(&output) {
        return None;
    }

    let mut readers = nodes
        .iter()
        .enumerate()
        .skip(i + 1)
        .flat_map(|(j, node)| {
            node.inputs
                .iter()
                .enumerate()
                .filter(move |(_, id)| **id == output)
                .map(move |(slot, _)| (j, slot))
        });
    let (j, slot) = readers.next()?;
    if readers.next().is_some() || slot != 0 {
        return None;
    }

    let consumer = &nodes[j];
    let linkable = consumer.operation.is_linkable()
        && consumer.outputs.len() == 1
        && consumer.inputs.iter().all(|t| ready.contains(t))
        && producer.operation.definition().dst_tensors.first()
            == consumer.operation.definition().dst_tensors.first();
    linkable.then_some(j)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::operation::{GpuOperation, OperationDef};
    use crate::kernel::tensor_desc::TensorDescriptor;
    use crate::types::{CalculationsPrecision, DataType, Layout, TensorStorageType};

    fn desc(storage: TensorStorageType) -> TensorDescriptor {
        TensorDescriptor::new(DataType::Float32, storage, Layout::Hwc)
    }

    fn def(srcs: usize, storage: TensorStorageType) -> OperationDef {
        OperationDef {
            precision: CalculationsPrecision::F32,
            src_tensors: vec![desc(storage); srcs],
            dst_tensors: vec![desc(storage)],
        }
    }

    fn opaque(name: &str, inputs: &[u32], output: u32) -> ComputeNode {
        let op = GpuOperation::new(def(inputs.len(), TensorStorageType::Buffer), name, "$0".into());
        node(op, name, inputs, output)
    }

    fn unary(name: &str, input: u32, output: u32) -> ComputeNode {
        let op = GpuOperation::elementwise(
            def(1, TensorStorageType::Buffer),
            name,
            "in_out_value = exp(in_out_value);".into(),
        );
        node(op, name, &[input], output)
    }

    fn binary(name: &str, inputs: [u32; 2], output: u32) -> ComputeNode {
        let mut op = GpuOperation::elementwise(
            def(2, TensorStorageType::Buffer),
            name,
            "in_out_value *= args.second_tensor.Read(X_COORD, Y_COORD, S_COORD);".into(),
        );
        op.add_src_tensor("second_tensor", desc(TensorStorageType::Buffer));
        node(op, name, &inputs, output)
    }

    fn node(op: GpuOperation, name: &str, inputs: &[u32], output: u32) -> ComputeNode {
        ComputeNode::new(
            op,
            inputs.iter().map(|i| TensorId(*i)).collect(),
            vec![TensorId(output)],
            name.into(),
        )
        .unwrap()
    }

    fn names(nodes: &[ComputeNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_non_linkable_graph_unchanged() {
        let mut nodes = vec![
            opaque("a", &[0], 1),
            opaque("b", &[1], 2),
            opaque("c", &[2], 3),
        ];
        let merged = merge_nodes(&mut nodes, &[TensorId(0)], &[TensorId(3)]).unwrap();
        assert_eq!(merged, 0);
        assert_eq!(names(&nodes), ["a", "b", "c"]);
    }

    #[test]
    fn test_chain_collapses() {
        let mut nodes = vec![opaque("conv", &[0], 1), unary("exp", 1, 2), unary("exp2", 2, 3)];
        let merged = merge_nodes(&mut nodes, &[TensorId(0)], &[TensorId(3)]).unwrap();
        assert_eq!(merged, 2);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "conv linked : exp linked : exp2");
        assert_eq!(nodes[0].inputs, vec![TensorId(0)]);
        assert_eq!(nodes[0].outputs, vec![TensorId(3)]);
        assert_eq!(nodes[0].operation.linked_count(), 2);
    }

    #[test]
    fn test_extra_inputs_appended_in_order() {
        // 0 -> conv -> 1; side input 5; mul(1, 5) -> 2
        let mut nodes = vec![opaque("conv", &[0], 1), binary("mul", [1, 5], 2)];
        merge_nodes(&mut nodes, &[TensorId(0), TensorId(5)], &[TensorId(2)]).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].inputs, vec![TensorId(0), TensorId(5)]);
        assert_eq!(nodes[0].outputs, vec![TensorId(2)]);
        assert_eq!(nodes[0].operation.definition().src_tensors.len(), 2);
    }

    #[test]
    fn test_second_slot_reader_not_fused() {
        let mut nodes = vec![opaque("conv", &[0], 1), binary("mul", [5, 1], 2)];
        merge_nodes(&mut nodes, &[TensorId(0), TensorId(5)], &[TensorId(2)]).unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_multiple_readers_not_fused() {
        let mut nodes = vec![
            opaque("conv", &[0], 1),
            unary("exp", 1, 2),
            unary("exp2", 1, 3),
        ];
        merge_nodes(&mut nodes, &[TensorId(0)], &[TensorId(2), TensorId(3)]).unwrap();
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn test_unready_input_not_fused() {
        // mul reads tensor 4 which is produced after it would be fused
        let mut nodes = vec![
            opaque("conv", &[0], 1),
            opaque("late", &[0], 4),
            binary("mul", [1, 4], 2),
        ];
        let merged = merge_nodes(&mut nodes, &[TensorId(0)], &[TensorId(2)]).unwrap();
        assert_eq!(merged, 0);
        assert_eq!(names(&nodes), ["conv", "late", "mul"]);
    }

    #[test]
    fn test_graph_output_not_fused_away() {
        let mut nodes = vec![opaque("conv", &[0], 1), unary("exp", 1, 2)];
        merge_nodes(&mut nodes, &[TensorId(0)], &[TensorId(1), TensorId(2)]).unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_descriptor_mismatch_not_fused() {
        let mut nodes = vec![opaque("conv", &[0], 1)];
        let op = GpuOperation::elementwise(
            def(1, TensorStorageType::Texture2D),
            "exp",
            "in_out_value = exp(in_out_value);".into(),
        );
        nodes.push(node(op, "exp", &[1], 2));
        merge_nodes(&mut nodes, &[TensorId(0)], &[TensorId(2)]).unwrap();
        assert_eq!(nodes.len(), 2);
    }
}
