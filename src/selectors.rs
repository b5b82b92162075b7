//! Pure selection of a kernel implementation per operation kind.
//!
//! Selectors look only at shapes, attributes, the operation definition and
//! device capabilities; they never touch the graph or the device.

use crate::compiler::graph::{Axis, BinaryOp, Conv2DParams, Pool2DParams, UnaryOp};
use crate::device::DeviceInfo;
use crate::error::{CompileError, CompileResult};
use crate::kernel::operation::{GpuOperation, OperationDef};
use crate::ops::add::create_add;
use crate::ops::concat::{create_concat_xy, create_concat_z};
use crate::ops::conv::{create_conv_generic, create_conv_pointwise, ConvWeights};
use crate::ops::depthwise_conv::create_depthwise_convolution;
use crate::ops::elementwise::{
    create_elementwise_one_input, create_elementwise_per_channel, create_elementwise_scalar,
    create_elementwise_two_input,
};
use crate::ops::pooling::create_pooling;
use crate::ops::reshape::{create_reshape, create_reshape_x4};
use crate::ops::softmax::{create_softmax, create_softmax_1x1};
use crate::types::Bhwc;

/// Second operand of a binary element-wise operation.
#[derive(Debug, Clone, Copy)]
pub enum BinaryOperand<'a> {
    /// Runtime tensor of this shape (the operation's second source).
    Tensor(Bhwc),
    Scalar(f32),
    /// One value per destination channel.
    PerChannel(&'a [f32]),
}

pub fn select_add(definition: OperationDef, channels: &[usize], dst_channels: usize) -> GpuOperation {
    create_add(definition, channels, dst_channels)
}

pub fn select_elementwise_unary(definition: OperationDef, op: UnaryOp) -> GpuOperation {
    create_elementwise_one_input(definition, op)
}

/// `swapped` puts the runtime tensor on the right-hand side (`c - x`).
pub fn select_elementwise_binary(
    definition: OperationDef,
    op: BinaryOp,
    operand: BinaryOperand<'_>,
    dst: &Bhwc,
    swapped: bool,
) -> CompileResult<GpuOperation> {
    match operand {
        BinaryOperand::Tensor(shape) => {
            create_elementwise_two_input(definition, op, &shape, dst, swapped)
        }
        BinaryOperand::Scalar(value) => Ok(create_elementwise_scalar(definition, op, value, swapped)),
        BinaryOperand::PerChannel(values) => {
            if values.len() != dst.c {
                return Err(CompileError::Unsupported(format!(
                    "per-channel operand of {} values for {} channels",
                    values.len(),
                    dst.c
                )));
            }
            Ok(create_elementwise_per_channel(definition, op, values, swapped))
        }
    }
}

pub fn select_convolution(
    params: &Conv2DParams,
    weights: &ConvWeights<'_>,
    src: &Bhwc,
    dst: &Bhwc,
    definition: OperationDef,
    info: &DeviceInfo,
) -> CompileResult<GpuOperation> {
    let pointwise = weights.is_pointwise()
        && params.stride_h == 1
        && params.stride_w == 1
        && params.padding.is_zero();
    if pointwise {
        create_conv_pointwise(definition, weights, src, dst, info)
    } else {
        create_conv_generic(definition, params, weights, src, dst, info)
    }
}

pub fn select_depthwise_convolution(
    params: &Conv2DParams,
    weights: &ConvWeights<'_>,
    src: &Bhwc,
    dst: &Bhwc,
    definition: OperationDef,
    info: &DeviceInfo,
) -> CompileResult<GpuOperation> {
    create_depthwise_convolution(definition, params, weights, src, dst, info)
}

/// Fully connected layer as a pointwise convolution over `[B, 1, 1, C]`.
pub fn select_fully_connected(
    weights: &ConvWeights<'_>,
    src: &Bhwc,
    dst: &Bhwc,
    definition: OperationDef,
    info: &DeviceInfo,
) -> CompileResult<GpuOperation> {
    if src.h != 1 || src.w != 1 || dst.h != 1 || dst.w != 1 {
        return Err(CompileError::Unsupported(format!(
            "fully connected over spatial input {src:?}"
        )));
    }
    let reshaped = ConvWeights {
        shape: Bhwc::new(dst.c, 1, 1, src.c),
        ..*weights
    };
    create_conv_pointwise(definition, &reshaped, src, dst, info)
}

pub fn select_pooling(
    params: &Pool2DParams,
    src: &Bhwc,
    definition: OperationDef,
) -> CompileResult<GpuOperation> {
    create_pooling(definition, params, src)
}

pub fn select_softmax(shape: &Bhwc, definition: OperationDef) -> CompileResult<GpuOperation> {
    if shape.w == 1 && shape.h == 1 {
        create_softmax_1x1(definition, shape.c)
    } else {
        create_softmax(definition, shape.c)
    }
}

pub fn select_reshape(src: &Bhwc, dst: &Bhwc, definition: OperationDef) -> CompileResult<GpuOperation> {
    if src.elements() != dst.elements() {
        return Err(CompileError::InvalidNode {
            node: "reshape".into(),
            reason: format!("{src:?} and {dst:?} hold different element counts"),
        });
    }
    if src.b != dst.b {
        return Err(CompileError::Unsupported(format!(
            "reshape across batches ({} -> {})",
            src.b, dst.b
        )));
    }
    if src.c % 4 == 0 && dst.c % 4 == 0 {
        create_reshape_x4(definition)
    } else {
        create_reshape(definition)
    }
}

pub fn select_concat(
    axis: Axis,
    channels: &[usize],
    batch: usize,
    definition: OperationDef,
) -> CompileResult<GpuOperation> {
    match axis {
        Axis::Channels => create_concat_z(definition, channels),
        Axis::Height | Axis::Width if batch > 1 => Err(CompileError::Unsupported(format!(
            "spatial concat over batch {batch}"
        ))),
        Axis::Height | Axis::Width => create_concat_xy(definition, axis),
    }
}
