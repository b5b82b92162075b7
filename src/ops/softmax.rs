//! Softmax over channels.

use crate::error::CompileResult;
use crate::kernel::operation::{GpuOperation, GridOrigin, OperationDef};
use crate::types::Dim3;

/// Components of the last slice that hold real channels.
pub fn channel_mask(channels: usize) -> [f32; 4] {
    let used = match channels % 4 {
        0 => 4,
        rem => rem,
    };
    std::array::from_fn(|i| if i < used { 1.0 } else { 0.0 })
}

const MASK: &str = "(float4)(args.mask_x, args.mask_y, args.mask_z, args.mask_w)";

fn add_mask(op: &mut GpuOperation, channels: usize) {
    let mask = channel_mask(channels);
    for (name, value) in ["mask_x", "mask_y", "mask_z", "mask_w"].iter().zip(mask) {
        op.args_mut().add_float(name, value);
    }
}

fn code() -> String {
    let mut c = String::new();
    c.push_str("__kernel void main_function(\n$0) {\n");
    c.push_str("  int X = get_global_id(0);\n");
    c.push_str("  int Y = get_global_id(1);\n");
    c.push_str("  if (X >= args.dst_tensor.Width() || Y >= args.dst_tensor.Height()) return;\n");
    c.push_str("  float sum = 0.0f;\n");
    c.push_str("  for (int d = 0; d < args.dst_tensor.Slices(); ++d) {\n");
    c.push_str(&format!(
        "    float4 mask_val = d == args.dst_tensor.Slices() - 1 ? {MASK} : (float4)(1.0f);\n"
    ));
    c.push_str("    float4 t = args.src_tensor.Read<float>(X, Y, d);\n");
    c.push_str("    sum += dot(mask_val, exp(t));\n");
    c.push_str("  }\n");
    c.push_str("  for (int d = 0; d < args.dst_tensor.Slices(); ++d) {\n");
    c.push_str("    float4 t = args.src_tensor.Read<float>(X, Y, d);\n");
    c.push_str("    FLT4 result = TO_FLT4(exp(t) / sum);\n");
    c.push_str("    args.dst_tensor.Write(result, X, Y, d);\n");
    c.push_str("  }\n");
    c.push_str("}\n");
    c
}

/// Single work item walking every batch of a `[B, 1, 1, C]` tensor.
fn code_1x1() -> String {
    let mut c = String::new();
    c.push_str("__kernel void main_function(\n$0) {\n");
    c.push_str("  for (int B = 0; B < args.dst_tensor.Width(); ++B) {\n");
    c.push_str("    float sum = 0.0f;\n");
    c.push_str("    for (int d = 0; d < args.dst_tensor.Slices(); ++d) {\n");
    c.push_str(&format!(
        "      float4 mask_val = d == args.dst_tensor.Slices() - 1 ? {MASK} : (float4)(1.0f);\n"
    ));
    c.push_str("      sum += dot(mask_val, exp(args.src_tensor.Read<float>(B, 0, d)));\n");
    c.push_str("    }\n");
    c.push_str("    for (int d = 0; d < args.dst_tensor.Slices(); ++d) {\n");
    c.push_str("      float4 t = args.src_tensor.Read<float>(B, 0, d);\n");
    c.push_str("      FLT4 result = TO_FLT4(exp(t) / sum);\n");
    c.push_str("      args.dst_tensor.Write(result, B, 0, d);\n");
    c.push_str("    }\n");
    c.push_str("  }\n");
    c.push_str("}\n");
    c
}

pub fn create_softmax(definition: OperationDef, channels: usize) -> CompileResult<GpuOperation> {
    let mut op = GpuOperation::new(definition.clone(), "softmax", code());
    op.add_src_tensor("src_tensor", definition.src(0)?.clone());
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    add_mask(&mut op, channels);
    op.set_grid_origin(GridOrigin::WidthHeight);
    op.set_work_group_size(Dim3::new(8, 4, 1));
    Ok(op)
}

pub fn create_softmax_1x1(definition: OperationDef, channels: usize) -> CompileResult<GpuOperation> {
    let mut op = GpuOperation::new(definition.clone(), "softmax_1x1", code_1x1());
    op.add_src_tensor("src_tensor", definition.src(0)?.clone());
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    add_mask(&mut op, channels);
    op.set_grid_origin(GridOrigin::Single);
    op.set_work_group_size(Dim3::new(1, 1, 1));
    Ok(op)
}
