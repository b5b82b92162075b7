//! One- and two-input element-wise operations.
//!
//! These are snippets over `in_out_value` at `(X_COORD, Y_COORD, S_COORD)`;
//! they run standalone through the element-wise template or get linked into
//! the kernel that produces their first input.

use crate::compiler::graph::{Activation, BinaryOp, UnaryOp};
use crate::error::{CompileError, CompileResult};
use crate::kernel::object::ObjectDescriptor;
use crate::kernel::operation::{GpuOperation, OperationDef};
use crate::kernel::tensor_desc::TensorDescriptor;
use crate::ops::constant_buffer;
use crate::types::{Bhwc, CalculationsPrecision};

pub fn unary_code(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Abs => "in_out_value = fabs(in_out_value);",
        UnaryOp::Cos => "in_out_value = cos(in_out_value);",
        UnaryOp::Exp => "in_out_value = exp(in_out_value);",
        UnaryOp::Log => "in_out_value = log(in_out_value);",
        UnaryOp::Neg => "in_out_value = -(in_out_value);",
        UnaryOp::Relu => "in_out_value = max(in_out_value, (FLT4)(0.0f));",
        UnaryOp::Relu6 => "in_out_value = clamp(in_out_value, (FLT4)(0.0f), (FLT4)(6.0f));",
        UnaryOp::Rsqrt => "in_out_value = rsqrt(in_out_value);",
        UnaryOp::Sigmoid => {
            "in_out_value = (FLT4)(1.0f) / ((FLT4)(1.0f) + exp(-(in_out_value)));"
        }
        UnaryOp::Sin => "in_out_value = sin(in_out_value);",
        UnaryOp::Sqrt => "in_out_value = sqrt(in_out_value);",
        UnaryOp::Square => "in_out_value = in_out_value * in_out_value;",
        UnaryOp::Tanh => "in_out_value = tanh(in_out_value);",
    }
}

pub fn unary_name(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Abs => "abs",
        UnaryOp::Cos => "cos",
        UnaryOp::Exp => "exp",
        UnaryOp::Log => "log",
        UnaryOp::Neg => "neg",
        UnaryOp::Relu => "relu",
        UnaryOp::Relu6 => "relu6",
        UnaryOp::Rsqrt => "rsqrt",
        UnaryOp::Sigmoid => "sigmoid",
        UnaryOp::Sin => "sin",
        UnaryOp::Sqrt => "sqrt",
        UnaryOp::Square => "square",
        UnaryOp::Tanh => "tanh",
    }
}

pub fn binary_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Maximum => "maximum",
        BinaryOp::Minimum => "minimum",
        BinaryOp::Pow => "pow",
        BinaryOp::SquaredDiff => "squared_diff",
    }
}

fn binary_expr(op: BinaryOp, a: &str, b: &str) -> String {
    match op {
        BinaryOp::Add => format!("{a} + {b}"),
        BinaryOp::Sub => format!("{a} - {b}"),
        BinaryOp::Mul => format!("{a} * {b}"),
        BinaryOp::Div => format!("{a} / {b}"),
        BinaryOp::Maximum => format!("max({a}, {b})"),
        BinaryOp::Minimum => format!("min({a}, {b})"),
        BinaryOp::Pow => format!("pow({a}, {b})"),
        BinaryOp::SquaredDiff => format!("({a} - {b}) * ({a} - {b})"),
    }
}

/// `in_out_value = op(in_out_value, second_val)`, or with the operands
/// swapped when the runtime tensor is the right-hand side.
fn assign_binary(op: BinaryOp, swapped: bool) -> String {
    let expr = if swapped {
        binary_expr(op, "second_val", "in_out_value")
    } else {
        binary_expr(op, "in_out_value", "second_val")
    };
    format!("in_out_value = {expr};")
}

pub fn create_elementwise_one_input(definition: OperationDef, op: UnaryOp) -> GpuOperation {
    GpuOperation::elementwise(definition, unary_name(op), unary_code(op).to_string())
}

/// Unary op for a fused activation, reading and writing tensors like `dst`.
pub fn create_activation(
    precision: CalculationsPrecision,
    dst: &TensorDescriptor,
    activation: Activation,
) -> Option<GpuOperation> {
    let op = match activation {
        Activation::None => return None,
        Activation::Relu => UnaryOp::Relu,
        Activation::Relu6 => UnaryOp::Relu6,
        Activation::Tanh => UnaryOp::Tanh,
        Activation::Sigmoid => UnaryOp::Sigmoid,
    };
    let definition = OperationDef {
        precision,
        src_tensors: vec![dst.clone()],
        dst_tensors: vec![dst.clone()],
    };
    Some(create_elementwise_one_input(definition, op))
}

/// Binary op with a runtime second tensor, broadcast along every axis where
/// `second` has extent 1.
pub fn create_elementwise_two_input(
    definition: OperationDef,
    op: BinaryOp,
    second: &Bhwc,
    dst: &Bhwc,
    swapped: bool,
) -> CompileResult<GpuOperation> {
    let broadcast = |name: &str, extent: usize, full: usize| -> CompileResult<bool> {
        if extent == full {
            Ok(false)
        } else if extent == 1 {
            Ok(true)
        } else {
            Err(CompileError::Unsupported(format!(
                "{} operand {name} {extent} does not broadcast to {full}",
                binary_name(op)
            )))
        }
    };
    let x = if broadcast("width", second.w * second.b, dst.w * dst.b)? { "0" } else { "X_COORD" };
    let y = if broadcast("height", second.h, dst.h)? { "0" } else { "Y_COORD" };
    let channel_broadcast = broadcast("channels", second.c, dst.c)?;
    let s = if channel_broadcast { "0" } else { "S_COORD" };

    let second_desc = definition.src(1)?.clone();
    let mut code = format!("FLT4 second_val = args.second_tensor.Read({x}, {y}, {s});\n");
    if channel_broadcast {
        code.push_str("second_val = second_val.xxxx;\n");
    }
    code.push_str(&assign_binary(op, swapped));

    let mut operation = GpuOperation::elementwise(definition, binary_name(op), code);
    operation.add_src_tensor("second_tensor", second_desc);
    Ok(operation)
}

/// Binary op with a constant scalar operand.
pub fn create_elementwise_scalar(
    definition: OperationDef,
    op: BinaryOp,
    value: f32,
    swapped: bool,
) -> GpuOperation {
    let precision = definition.precision;
    let code = format!(
        "FLT4 second_val = (FLT4)(args.scalar);\n{}",
        assign_binary(op, swapped)
    );
    let mut operation = GpuOperation::elementwise(definition, binary_name(op), code);
    match precision {
        CalculationsPrecision::F32 => operation.args_mut().add_float("scalar", value),
        CalculationsPrecision::F32F16 | CalculationsPrecision::F16 => operation
            .args_mut()
            .add_half("scalar", half::f16::from_f32(value)),
    }
    operation
}

/// Binary op with a constant per-channel vector operand.
pub fn create_elementwise_per_channel(
    definition: OperationDef,
    op: BinaryOp,
    values: &[f32],
    swapped: bool,
) -> GpuOperation {
    let buffer = constant_buffer(values, definition.data_type());
    let code = format!(
        "FLT4 second_val = args.linear_buffer.Read(S_COORD);\n{}",
        assign_binary(op, swapped)
    );
    let mut operation = GpuOperation::elementwise(definition, binary_name(op), code);
    operation
        .args_mut()
        .add_object("linear_buffer", ObjectDescriptor::Buffer(buffer));
    operation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dry_run::DryRunDevice;
    use crate::device::{DeviceInfo, GpuVendor};
    use crate::types::{DataType, Layout, TensorStorageType};

    fn desc() -> TensorDescriptor {
        TensorDescriptor::new(DataType::Float32, TensorStorageType::Buffer, Layout::Hwc)
    }

    fn def(srcs: usize) -> OperationDef {
        OperationDef {
            precision: CalculationsPrecision::F32,
            src_tensors: vec![desc(); srcs],
            dst_tensors: vec![desc()],
        }
    }

    fn compiled_source(mut op: GpuOperation) -> String {
        let mut device = DryRunDevice::new(DeviceInfo::generic("dev", GpuVendor::Nvidia));
        op.compile(&mut device).unwrap();
        op.source().unwrap().to_string()
    }

    #[test]
    fn test_activation_mapping() {
        assert!(create_activation(CalculationsPrecision::F32, &desc(), Activation::None).is_none());
        let relu6 =
            create_activation(CalculationsPrecision::F32, &desc(), Activation::Relu6).unwrap();
        assert_eq!(relu6.kernel_name(), "relu6");
        assert!(relu6.is_linkable());
    }

    #[test]
    fn test_unary_standalone() {
        let source = compiled_source(create_elementwise_one_input(def(1), UnaryOp::Neg));
        assert!(source.contains("src = -(src);"));
        assert!(!source.contains("args."));
    }

    #[test]
    fn test_scalar_operand_uses_float_pool() {
        let op = create_elementwise_scalar(def(1), BinaryOp::Sub, 2.0, true);
        let source = compiled_source(op);
        assert!(source.contains("FLT4 second_val = (FLT4)(shared_float4_0.x);"));
        assert!(source.contains("src = second_val - src;"));
    }

    #[test]
    fn test_scalar_operand_half_precision() {
        let mut definition = def(1);
        definition.precision = CalculationsPrecision::F16;
        let op = create_elementwise_scalar(definition, BinaryOp::Mul, 0.5, false);
        let source = compiled_source(op);
        assert!(source.contains("(FLT4)(shared_half4_0.x)"));
    }

    #[test]
    fn test_per_channel_operand() {
        let op = create_elementwise_per_channel(def(1), BinaryOp::Add, &[1.0, 2.0, 3.0], false);
        let source = compiled_source(op);
        assert!(source.contains("FLT4 second_val = linear_buffer_buffer[Z];"));
    }

    #[test]
    fn test_second_tensor_broadcast() {
        let op = create_elementwise_two_input(
            def(2),
            BinaryOp::Maximum,
            &Bhwc::new(1, 1, 1, 1),
            &Bhwc::new(1, 4, 4, 8),
            false,
        )
        .unwrap();
        assert_eq!(op.src_tensor_names(), ["second_tensor"]);
        let source = compiled_source(op);
        assert!(source.contains("second_tensor_buffer[((0) * shared_int4_"));
        assert!(source.contains("second_val = second_val.xxxx;"));
        assert!(source.contains("src = max(src, second_val);"));
    }

    #[test]
    fn test_incompatible_broadcast() {
        let err = create_elementwise_two_input(
            def(2),
            BinaryOp::Add,
            &Bhwc::new(1, 2, 4, 8),
            &Bhwc::new(1, 4, 4, 8),
            false,
        )
        .unwrap_err();
        assert!(err.is_recoverable());
    }
}
