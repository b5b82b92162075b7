//! Turns one graph operation into one [`ComputeNode`].
//!
//! Runtime inputs become node inputs (and kernel sources, in order); constant
//! inputs are folded into the kernel as owned buffers or scalar arguments.
//! Fused activations are linked into the generated operation right away.

use crate::compiler::graph::{Activation, BinaryOp, Graph, GraphOperation, OpId, OpKind, TensorId};
use crate::compiler::node::ComputeNode;
use crate::compiler::reservation::TensorReserver;
use crate::device::DeviceInfo;
use crate::error::{CompileError, CompileResult};
use crate::kernel::operation::{GpuOperation, OperationDef};
use crate::ops::conv::ConvWeights;
use crate::ops::elementwise::create_activation;
use crate::selectors::{
    select_add, select_concat, select_convolution, select_depthwise_convolution,
    select_elementwise_binary, select_elementwise_unary, select_fully_connected, select_pooling,
    select_reshape, select_softmax, BinaryOperand,
};
use crate::types::{Bhwc, CalculationsPrecision};

pub struct KernelGenerator<'a> {
    graph: &'a Graph,
    reserver: &'a TensorReserver,
    device_info: &'a DeviceInfo,
    precision: CalculationsPrecision,
}

impl<'a> KernelGenerator<'a> {
    pub fn new(
        graph: &'a Graph,
        reserver: &'a TensorReserver,
        device_info: &'a DeviceInfo,
        precision: CalculationsPrecision,
    ) -> Self {
        Self {
            graph,
            reserver,
            device_info,
            precision,
        }
    }

    pub fn generate(&self, id: OpId) -> CompileResult<ComputeNode> {
        let op = self
            .graph
            .op(id)
            .ok_or_else(|| CompileError::InvalidGraph(format!("unknown operation {id:?}")))?;
        let [output] = op.outputs[..] else {
            return Err(self.invalid(op, format!("expected one output, got {}", op.outputs.len())));
        };
        let runtime: Vec<TensorId> = op
            .inputs
            .iter()
            .copied()
            .filter(|t| !self.graph.is_constant(*t))
            .collect();
        if runtime.is_empty() {
            return Err(self.invalid(op, "no runtime inputs".into()));
        }

        let (mut operation, inputs) = match &op.kind {
            OpKind::Add { .. } => self.add(op, &runtime, output)?,
            OpKind::BinaryArithmetic { op: binary, .. } => self.binary(op, *binary, output)?,
            OpKind::ElementwiseUnary(unary) => {
                self.same_shape(op, runtime[0], output)?;
                let def = self.definition(&runtime, output)?;
                (select_elementwise_unary(def, *unary), runtime)
            }
            OpKind::Conv2D(params) => {
                let (src, dst) = (self.shape(runtime[0])?, self.shape(output)?);
                let weights = self.weights(op)?;
                let def = self.definition(&runtime, output)?;
                let info = self.device_info;
                (select_convolution(params, &weights, &src, &dst, def, info)?, runtime)
            }
            OpKind::DepthwiseConv2D(params) => {
                let (src, dst) = (self.shape(runtime[0])?, self.shape(output)?);
                let weights = self.weights(op)?;
                let def = self.definition(&runtime, output)?;
                let info = self.device_info;
                (select_depthwise_convolution(params, &weights, &src, &dst, def, info)?, runtime)
            }
            OpKind::FullyConnected { .. } => {
                let (src, dst) = (self.shape(runtime[0])?, self.shape(output)?);
                let weights = self.weights(op)?;
                let def = self.definition(&runtime, output)?;
                (select_fully_connected(&weights, &src, &dst, def, self.device_info)?, runtime)
            }
            OpKind::Pool2D(params) => {
                self.expect_runtime(op, &runtime)?;
                let src = self.shape(runtime[0])?;
                let def = self.definition(&runtime, output)?;
                (select_pooling(params, &src, def)?, runtime)
            }
            OpKind::Softmax => {
                self.expect_runtime(op, &runtime)?;
                self.same_shape(op, runtime[0], output)?;
                let shape = self.shape(output)?;
                let def = self.definition(&runtime, output)?;
                (select_softmax(&shape, def)?, runtime)
            }
            OpKind::Reshape => {
                self.expect_runtime(op, &runtime)?;
                let (src, dst) = (self.shape(runtime[0])?, self.shape(output)?);
                let def = self.definition(&runtime, output)?;
                (select_reshape(&src, &dst, def)?, runtime)
            }
            OpKind::Concat { axis } => {
                self.expect_runtime(op, &runtime)?;
                let shapes = runtime
                    .iter()
                    .map(|t| self.shape(*t))
                    .collect::<CompileResult<Vec<_>>>()?;
                let channels: Vec<usize> = shapes.iter().map(|s| s.c).collect();
                let batch = self.shape(output)?.b;
                let def = self.definition(&runtime, output)?;
                (select_concat(*axis, &channels, batch, def)?, runtime)
            }
            OpKind::Mean | OpKind::Transpose | OpKind::Resize => {
                return Err(CompileError::Unimplemented(format!(
                    "{} ('{}')",
                    op.kind.name(),
                    op.label
                )))
            }
        };

        if let Some(activation) = fused_activation(&op.kind) {
            let dst = &self.reserver.get(output)?.descriptor;
            if let Some(linked) = create_activation(self.precision, dst, activation) {
                operation.add_operation(linked)?;
            }
        }
        log::debug!(
            "generated '{}' for '{}' with inputs {:?}",
            operation.kernel_name(),
            op.label,
            inputs
        );
        ComputeNode::new(operation, inputs, vec![output], op.label.clone())
    }

    fn invalid(&self, op: &GraphOperation, reason: String) -> CompileError {
        CompileError::InvalidNode {
            node: op.label.clone(),
            reason,
        }
    }

    fn shape(&self, id: TensorId) -> CompileResult<Bhwc> {
        Ok(self.reserver.get(id)?.shape)
    }

    fn definition(&self, inputs: &[TensorId], output: TensorId) -> CompileResult<OperationDef> {
        let src_tensors = inputs
            .iter()
            .map(|t| Ok(self.reserver.get(*t)?.descriptor.clone()))
            .collect::<CompileResult<Vec<_>>>()?;
        Ok(OperationDef {
            precision: self.precision,
            src_tensors,
            dst_tensors: vec![self.reserver.get(output)?.descriptor.clone()],
        })
    }

    fn constant(&self, id: TensorId) -> Option<(Bhwc, &'a [f32])> {
        let tensor = self.graph.tensor(id)?;
        tensor.constant.as_deref().map(|data| (tensor.shape, data))
    }

    /// Every input is a runtime tensor.
    fn expect_runtime(&self, op: &GraphOperation, runtime: &[TensorId]) -> CompileResult<()> {
        if runtime.len() == op.inputs.len() {
            Ok(())
        } else {
            Err(CompileError::Unsupported(format!(
                "constant inputs of {} ('{}')",
                op.kind.name(),
                op.label
            )))
        }
    }

    fn same_shape(&self, op: &GraphOperation, input: TensorId, output: TensorId) -> CompileResult<()> {
        let (src, dst) = (self.shape(input)?, self.shape(output)?);
        if src == dst {
            Ok(())
        } else {
            Err(self.invalid(op, format!("input {src:?} and output {dst:?} differ")))
        }
    }

    /// Constant weights (input 1) and optional bias (input 2).
    fn weights(&self, op: &GraphOperation) -> CompileResult<ConvWeights<'a>> {
        if self.graph.is_constant(op.inputs[0]) {
            return Err(self.invalid(op, "first input must be a runtime tensor".into()));
        }
        let (shape, data) = op
            .inputs
            .get(1)
            .and_then(|t| self.constant(*t))
            .ok_or_else(|| CompileError::Unsupported(format!("runtime weights of '{}'", op.label)))?;
        let bias = match op.inputs.get(2) {
            Some(t) => Some(self.constant(*t).map(|(_, b)| b).ok_or_else(|| {
                CompileError::Unsupported(format!("runtime bias of '{}'", op.label))
            })?),
            None => None,
        };
        Ok(ConvWeights { shape, data, bias })
    }

    fn add(
        &self,
        op: &GraphOperation,
        runtime: &[TensorId],
        output: TensorId,
    ) -> CompileResult<(GpuOperation, Vec<TensorId>)> {
        let constants: Vec<TensorId> = op
            .inputs
            .iter()
            .copied()
            .filter(|t| self.graph.is_constant(*t))
            .collect();
        let dst = self.shape(output)?;
        match (runtime, &constants[..]) {
            (_, []) => {
                let mut channels = Vec::with_capacity(runtime.len());
                for &input in runtime {
                    let src = self.shape(input)?;
                    if (src.b, src.h, src.w) != (dst.b, dst.h, dst.w) {
                        return Err(CompileError::Unsupported(format!(
                            "spatial broadcast in add '{}' ({src:?} -> {dst:?})",
                            op.label
                        )));
                    }
                    channels.push(src.c);
                }
                let def = self.definition(runtime, output)?;
                Ok((select_add(def, &channels, dst.c), runtime.to_vec()))
            }
            ([input], [constant]) => {
                self.same_shape(op, *input, output)?;
                let operand = self.constant_operand(op, *constant, &dst)?;
                let def = self.definition(runtime, output)?;
                let operation = select_elementwise_binary(def, BinaryOp::Add, operand, &dst, false)?;
                Ok((operation, runtime.to_vec()))
            }
            _ => Err(CompileError::Unsupported(format!(
                "add '{}' with {} constant inputs",
                op.label,
                constants.len()
            ))),
        }
    }

    fn binary(
        &self,
        op: &GraphOperation,
        binary: BinaryOp,
        output: TensorId,
    ) -> CompileResult<(GpuOperation, Vec<TensorId>)> {
        let dst = self.shape(output)?;
        let (lhs, rhs) = (op.inputs[0], op.inputs[1]);
        let (first, operand, swapped, inputs) =
            match (self.graph.is_constant(lhs), self.graph.is_constant(rhs)) {
                (false, false) => {
                    let (a, b) = (self.shape(lhs)?, self.shape(rhs)?);
                    if a == dst {
                        (lhs, BinaryOperand::Tensor(b), false, vec![lhs, rhs])
                    } else if b == dst {
                        (rhs, BinaryOperand::Tensor(a), true, vec![rhs, lhs])
                    } else {
                        return Err(CompileError::Unsupported(format!(
                            "'{}' broadcasts both operands ({a:?}, {b:?} -> {dst:?})",
                            op.label
                        )));
                    }
                }
                (false, true) => (lhs, self.constant_operand(op, rhs, &dst)?, false, vec![lhs]),
                (true, false) => (rhs, self.constant_operand(op, lhs, &dst)?, true, vec![rhs]),
                (true, true) => return Err(self.invalid(op, "both operands are constant".into())),
            };
        self.same_shape(op, first, output)?;
        let def = self.definition(&inputs, output)?;
        let operation = select_elementwise_binary(def, binary, operand, &dst, swapped)?;
        Ok((operation, inputs))
    }

    fn constant_operand(
        &self,
        op: &GraphOperation,
        id: TensorId,
        dst: &Bhwc,
    ) -> CompileResult<BinaryOperand<'a>> {
        let (shape, data) = self
            .constant(id)
            .ok_or_else(|| self.invalid(op, format!("tensor {id:?} is not constant")))?;
        match data {
            [value] => Ok(BinaryOperand::Scalar(*value)),
            values if shape.b * shape.h * shape.w == 1 && shape.c == dst.c => {
                Ok(BinaryOperand::PerChannel(values))
            }
            _ => Err(CompileError::Unsupported(format!(
                "constant operand {shape:?} of '{}'",
                op.label
            ))),
        }
    }
}

fn fused_activation(kind: &OpKind) -> Option<Activation> {
    match kind {
        OpKind::Add { activation }
        | OpKind::BinaryArithmetic { activation, .. }
        | OpKind::FullyConnected { activation } => Some(*activation),
        OpKind::Conv2D(params) | OpKind::DepthwiseConv2D(params) => Some(params.activation),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::graph::{Conv2DParams, UnaryOp};
    use crate::compiler::reservation::reserve_graph;
    use crate::device::GpuVendor;
    use crate::types::TensorStorageType;

    fn generate(graph: &Graph, op: OpId) -> CompileResult<ComputeNode> {
        let info = DeviceInfo::generic("dev", GpuVendor::Nvidia);
        let reserver = reserve_graph(
            graph,
            &info,
            CalculationsPrecision::F32,
            Some(TensorStorageType::Buffer),
        );
        KernelGenerator::new(graph, &reserver, &info, CalculationsPrecision::F32).generate(op)
    }

    #[test]
    fn test_add_with_constant_folds_scalar() {
        let mut g = Graph::new();
        let x = g.add_input(Bhwc::new(1, 4, 4, 8), "x");
        let c = g.add_constant(Bhwc::new(1, 1, 1, 1), vec![1.5], "c").unwrap();
        let y = g.add_tensor(Bhwc::new(1, 4, 4, 8), "y");
        let op = g
            .add_op(OpKind::Add { activation: Activation::Relu }, &[x, c], &[y])
            .unwrap();

        let node = generate(&g, op).unwrap();
        assert_eq!(node.inputs, vec![x]);
        assert_eq!(node.outputs, vec![y]);
        assert_eq!(node.operation.kernel_name(), "add+relu");
        assert!(node.operation.is_linkable());
    }

    #[test]
    fn test_runtime_add_with_narrow_first_input() {
        let mut g = Graph::new();
        let a = g.add_input(Bhwc::new(1, 2, 2, 4), "a");
        let b = g.add_input(Bhwc::new(1, 2, 2, 8), "b");
        let y = g.add_tensor(Bhwc::new(1, 2, 2, 8), "y");
        let op = g
            .add_op(OpKind::Add { activation: Activation::None }, &[a, b], &[y])
            .unwrap();
        let node = generate(&g, op).unwrap();
        assert_eq!(node.inputs, vec![a, b]);
        assert!(!node.operation.is_linkable());
    }

    #[test]
    fn test_binary_swaps_broadcast_operand() {
        let mut g = Graph::new();
        let a = g.add_input(Bhwc::new(1, 1, 1, 8), "a");
        let b = g.add_input(Bhwc::new(1, 4, 4, 8), "b");
        let y = g.add_tensor(Bhwc::new(1, 4, 4, 8), "y");
        let kind = OpKind::BinaryArithmetic {
            op: BinaryOp::Sub,
            activation: Activation::None,
        };
        let op = g.add_op(kind, &[a, b], &[y]).unwrap();
        let node = generate(&g, op).unwrap();
        assert_eq!(node.inputs, vec![b, a]);
    }

    #[test]
    fn test_per_channel_constant() {
        let mut g = Graph::new();
        let x = g.add_input(Bhwc::new(1, 4, 4, 3), "x");
        let c = g
            .add_constant(Bhwc::new(1, 1, 1, 3), vec![1.0, 2.0, 3.0], "scale")
            .unwrap();
        let y = g.add_tensor(Bhwc::new(1, 4, 4, 3), "y");
        let kind = OpKind::BinaryArithmetic {
            op: BinaryOp::Mul,
            activation: Activation::None,
        };
        let op = g.add_op(kind, &[c, x], &[y]).unwrap();
        let node = generate(&g, op).unwrap();
        assert_eq!(node.inputs, vec![x]);
        assert!(node.operation.args().has_object("linear_buffer"));
    }

    #[test]
    fn test_conv_with_bias_and_activation() {
        let mut g = Graph::new();
        let x = g.add_input(Bhwc::new(1, 8, 8, 4), "x");
        let w = g
            .add_constant(Bhwc::new(8, 3, 3, 4), vec![0.1; 8 * 9 * 4], "w")
            .unwrap();
        let b = g.add_constant(Bhwc::new(1, 1, 1, 8), vec![0.0; 8], "b").unwrap();
        let y = g.add_tensor(Bhwc::new(1, 6, 6, 8), "y");
        let params = Conv2DParams {
            activation: Activation::Relu6,
            ..Conv2DParams::default()
        };
        let op = g.add_op(OpKind::Conv2D(params), &[x, w, b], &[y]).unwrap();
        let node = generate(&g, op).unwrap();
        assert_eq!(node.inputs, vec![x]);
        assert_eq!(node.operation.kernel_name(), "conv_generic+relu6");
        assert!(!node.operation.is_linkable());
    }

    #[test]
    fn test_depthwise_bias_must_cover_channels() {
        let mut g = Graph::new();
        let x = g.add_input(Bhwc::new(1, 8, 8, 8), "x");
        let w = g
            .add_constant(Bhwc::new(1, 3, 3, 8), vec![0.1; 9 * 8], "w")
            .unwrap();
        let b = g
            .add_constant(Bhwc::new(1, 1, 1, 3), vec![0.0; 3], "b")
            .unwrap();
        let y = g.add_tensor(Bhwc::new(1, 6, 6, 8), "y");
        let op = g
            .add_op(OpKind::DepthwiseConv2D(Conv2DParams::default()), &[x, w, b], &[y])
            .unwrap();
        assert!(matches!(
            generate(&g, op),
            Err(CompileError::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_runtime_weights_unsupported() {
        let mut g = Graph::new();
        let x = g.add_input(Bhwc::new(1, 8, 8, 4), "x");
        let w = g.add_input(Bhwc::new(4, 1, 1, 4), "w");
        let y = g.add_tensor(Bhwc::new(1, 8, 8, 4), "y");
        let op = g
            .add_op(OpKind::Conv2D(Conv2DParams::default()), &[x, w], &[y])
            .unwrap();
        let err = generate(&g, op).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unimplemented_kinds() {
        let mut g = Graph::new();
        let x = g.add_input(Bhwc::new(1, 4, 4, 4), "x");
        let y = g.add_tensor(Bhwc::new(1, 4, 4, 4), "y");
        let op = g.add_op(OpKind::Transpose, &[x], &[y]).unwrap();
        assert!(matches!(
            generate(&g, op),
            Err(CompileError::Unimplemented(_))
        ));
    }

    #[test]
    fn test_unary_shape_mismatch() {
        let mut g = Graph::new();
        let x = g.add_input(Bhwc::new(1, 4, 4, 4), "x");
        let y = g.add_tensor(Bhwc::new(1, 4, 4, 8), "y");
        let op = g
            .add_op(OpKind::ElementwiseUnary(UnaryOp::Exp), &[x], &[y])
            .unwrap();
        assert!(matches!(
            generate(&g, op),
            Err(CompileError::InvalidNode { .. })
        ));
    }
}
