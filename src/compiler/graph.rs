//! The dataflow graph handed to the compiler.
//!
//! Tensors are SSA-like: each tensor has exactly one producer (or is a graph
//! input or a constant) and zero or more consumers. Constants carry their
//! `f32` data and are folded into kernels; they never get device memory.
//!
//! Pipeline: Graph → reserve → generate → fuse → plan memory → compile

use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::types::Bhwc;

// ── Identifiers ────────────────────────────────────────────────────

/// Unique tensor identifier within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

/// Unique operation identifier within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

// ── Tensors ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GraphTensor {
    pub id: TensorId,
    pub shape: Bhwc,
    /// Constant payload in HWC order per batch; `None` for runtime tensors.
    pub constant: Option<Vec<f32>>,
    /// The op that produces this tensor (None for inputs and constants).
    pub producer: Option<OpId>,
    pub consumers: Vec<OpId>,
    pub name: String,
}

impl GraphTensor {
    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }
}

// ── Operation parameters ───────────────────────────────────────────

/// Activation fused into the producing kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
    Tanh,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Cos,
    Exp,
    Log,
    Neg,
    Relu,
    Relu6,
    Rsqrt,
    Sigmoid,
    Sin,
    Sqrt,
    Square,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Pow,
    SquaredDiff,
}

/// Zero padding around the spatial dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Padding2D {
    pub top: usize,
    pub left: usize,
    pub bottom: usize,
    pub right: usize,
}

impl Padding2D {
    pub const fn is_zero(&self) -> bool {
        self.top == 0 && self.left == 0 && self.bottom == 0 && self.right == 0
    }
}

/// Convolution parameters. The kernel size comes from the weights tensor:
/// `[O, KH, KW, I]` for regular and `[1, KH, KW, C]` for depthwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2DParams {
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub padding: Padding2D,
    pub activation: Activation,
}

impl Default for Conv2DParams {
    fn default() -> Self {
        Self {
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            padding: Padding2D::default(),
            activation: Activation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingKind {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pool2DParams {
    pub kind: PoolingKind,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub padding: Padding2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Height,
    Width,
    Channels,
}

// ── Operation kinds ────────────────────────────────────────────────

/// The set of operations a graph can contain.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    // ── Element-wise ──
    /// N-ary sum. A constant operand turns it into a binary add.
    Add { activation: Activation },
    /// `a <op> b`; `b` may be a runtime tensor or a constant (scalar or
    /// per-channel vector). Either operand may be the constant.
    BinaryArithmetic { op: BinaryOp, activation: Activation },
    ElementwiseUnary(UnaryOp),

    // ── Convolution ──
    /// Inputs: source, weights `[O, KH, KW, I]`, optional bias `[O]`.
    Conv2D(Conv2DParams),
    /// Inputs: source, weights `[1, KH, KW, C]`, optional bias `[C]`.
    DepthwiseConv2D(Conv2DParams),
    /// Inputs: source `[B, 1, 1, I]`, weights `[O, 1, 1, I]`, optional bias.
    FullyConnected { activation: Activation },

    // ── Reduction ──
    Pool2D(Pool2DParams),
    /// Softmax over channels.
    Softmax,

    // ── Layout ──
    /// Output shape is the shape of the output tensor.
    Reshape,
    Concat { axis: Axis },

    // ── Not yet implemented ──
    Mean,
    Transpose,
    Resize,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add { .. } => "add",
            OpKind::BinaryArithmetic { .. } => "binary",
            OpKind::ElementwiseUnary(_) => "unary",
            OpKind::Conv2D(_) => "conv_2d",
            OpKind::DepthwiseConv2D(_) => "depthwise_conv_2d",
            OpKind::FullyConnected { .. } => "fully_connected",
            OpKind::Pool2D(_) => "pooling_2d",
            OpKind::Softmax => "softmax",
            OpKind::Reshape => "reshape",
            OpKind::Concat { .. } => "concat",
            OpKind::Mean => "mean",
            OpKind::Transpose => "transpose",
            OpKind::Resize => "resize",
        }
    }

    /// Accepted number of inputs (constants included).
    pub fn input_arity(&self) -> RangeInclusive<usize> {
        match self {
            OpKind::Add { .. } => 2..=usize::MAX,
            OpKind::BinaryArithmetic { .. } => 2..=2,
            OpKind::Conv2D(_) | OpKind::DepthwiseConv2D(_) | OpKind::FullyConnected { .. } => 2..=3,
            OpKind::Concat { .. } => 1..=usize::MAX,
            OpKind::ElementwiseUnary(_)
            | OpKind::Pool2D(_)
            | OpKind::Softmax
            | OpKind::Reshape
            | OpKind::Mean
            | OpKind::Transpose
            | OpKind::Resize => 1..=1,
        }
    }

    /// Number of outputs the kind declares.
    pub fn output_arity(&self) -> usize {
        1
    }
}

// ── Graph operation ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GraphOperation {
    pub id: OpId,
    pub kind: OpKind,
    /// Input tensor ids (order matches `OpKind` semantics).
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub label: String,
}

// ── Graph ──────────────────────────────────────────────────────────

/// Dataflow graph of tensor operations.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    tensors: Vec<GraphTensor>,
    ops: Vec<GraphOperation>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    /// Stateful tensors: tensor id → variable ref id. Tensors sharing a ref
    /// id share one persistent buffer.
    variables: BTreeMap<TensorId, u32>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an intermediate (or output) tensor.
    pub fn add_tensor(&mut self, shape: Bhwc, name: &str) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(GraphTensor {
            id,
            shape,
            constant: None,
            producer: None,
            consumers: Vec::new(),
            name: name.to_string(),
        });
        id
    }

    /// Add a graph input tensor.
    pub fn add_input(&mut self, shape: Bhwc, name: &str) -> TensorId {
        let id = self.add_tensor(shape, name);
        self.inputs.push(id);
        id
    }

    /// Add a constant tensor. `data` must hold exactly `shape.elements()`
    /// values, or a single value broadcast over the shape.
    pub fn add_constant(&mut self, shape: Bhwc, data: Vec<f32>, name: &str) -> CompileResult<TensorId> {
        if data.len() != shape.elements() && data.len() != 1 {
            return Err(CompileError::InvalidGraph(format!(
                "constant '{name}' has {} values for shape {:?}",
                data.len(),
                shape
            )));
        }
        let id = self.add_tensor(shape, name);
        self.tensors[id.0 as usize].constant = Some(data);
        Ok(id)
    }

    pub fn mark_output(&mut self, id: TensorId) -> CompileResult<()> {
        self.tensor_checked(id)?;
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    /// Declare `id` as a stateful tensor backed by variable `ref_id`.
    pub fn mark_variable(&mut self, id: TensorId, ref_id: u32) -> CompileResult<()> {
        if self.tensor_checked(id)?.is_constant() {
            return Err(CompileError::InvalidGraph(format!(
                "constant tensor {id:?} cannot be a variable"
            )));
        }
        self.variables.insert(id, ref_id);
        Ok(())
    }

    /// Add an operation. Outputs must not already have a producer.
    pub fn add_op(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> CompileResult<OpId> {
        let id = OpId(self.ops.len() as u32);
        if !kind.input_arity().contains(&inputs.len()) {
            return Err(CompileError::InvalidGraph(format!(
                "{} takes {:?} inputs, got {}",
                kind.name(),
                kind.input_arity(),
                inputs.len()
            )));
        }
        if outputs.len() != kind.output_arity() {
            return Err(CompileError::InvalidGraph(format!(
                "{} declares {} outputs, got {}",
                kind.name(),
                kind.output_arity(),
                outputs.len()
            )));
        }
        for &input in inputs {
            self.tensor_checked(input)?;
        }
        for &output in outputs {
            let tensor = self.tensor_checked(output)?;
            if tensor.producer.is_some() || tensor.is_constant() || self.inputs.contains(&output) {
                return Err(CompileError::InvalidGraph(format!(
                    "tensor {output:?} already has a producer"
                )));
            }
        }

        for &input in inputs {
            self.tensors[input.0 as usize].consumers.push(id);
        }
        for &output in outputs {
            self.tensors[output.0 as usize].producer = Some(id);
        }
        self.ops.push(GraphOperation {
            id,
            label: format!("{}_{}", kind.name(), id.0),
            kind,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        Ok(id)
    }

    // ── Queries ──

    pub fn tensor(&self, id: TensorId) -> Option<&GraphTensor> {
        self.tensors.get(id.0 as usize)
    }

    fn tensor_checked(&self, id: TensorId) -> CompileResult<&GraphTensor> {
        self.tensor(id)
            .ok_or_else(|| CompileError::InvalidGraph(format!("unknown tensor {id:?}")))
    }

    pub fn op(&self, id: OpId) -> Option<&GraphOperation> {
        self.ops.get(id.0 as usize)
    }

    pub fn ops(&self) -> &[GraphOperation] {
        &self.ops
    }

    pub fn tensors(&self) -> &[GraphTensor] {
        &self.tensors
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn variables(&self) -> &BTreeMap<TensorId, u32> {
        &self.variables
    }

    pub fn is_constant(&self, id: TensorId) -> bool {
        self.tensor(id).is_some_and(GraphTensor::is_constant)
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Kahn's algorithm over tensor dependencies. Ties resolve by op id, so
    /// ops added in dependency order keep their insertion order.
    pub fn topological_order(&self) -> CompileResult<Vec<OpId>> {
        let mut pending: Vec<usize> = self
            .ops
            .iter()
            .map(|op| {
                op.inputs
                    .iter()
                    .filter(|t| self.tensors[t.0 as usize].producer.is_some())
                    .count()
            })
            .collect();
        let mut ready: VecDeque<OpId> = self
            .ops
            .iter()
            .filter(|op| pending[op.id.0 as usize] == 0)
            .map(|op| op.id)
            .collect();

        let mut order = Vec::with_capacity(self.ops.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let mut released = Vec::new();
            for output in &self.ops[id.0 as usize].outputs {
                for consumer in &self.tensors[output.0 as usize].consumers {
                    let count = &mut pending[consumer.0 as usize];
                    *count -= 1;
                    if *count == 0 {
                        released.push(*consumer);
                    }
                }
            }
            released.sort();
            ready.extend(released);
        }

        if order.len() != self.ops.len() {
            return Err(CompileError::InvalidGraph(
                "graph contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// Structural checks run before compilation.
    pub fn validate(&self) -> CompileResult<()> {
        if self.outputs.is_empty() {
            return Err(CompileError::InvalidGraph("graph has no outputs".into()));
        }
        for op in &self.ops {
            for input in &op.inputs {
                let tensor = &self.tensors[input.0 as usize];
                if tensor.producer.is_none()
                    && !tensor.is_constant()
                    && !self.inputs.contains(input)
                {
                    return Err(CompileError::InvalidGraph(format!(
                        "{} reads tensor '{}' which is neither produced, an input nor a constant",
                        op.label, tensor.name
                    )));
                }
            }
            let runtime_inputs = op.inputs.iter().filter(|t| !self.is_constant(**t)).count();
            if runtime_inputs == 0 {
                return Err(CompileError::InvalidGraph(format!(
                    "{} has only constant inputs",
                    op.label
                )));
            }
        }
        for output in &self.outputs {
            let tensor = &self.tensors[output.0 as usize];
            if tensor.producer.is_none() && !self.inputs.contains(output) {
                return Err(CompileError::InvalidGraph(format!(
                    "output '{}' is never produced",
                    tensor.name
                )));
            }
        }
        self.topological_order().map(|_| ())
    }
}
