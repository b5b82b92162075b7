//! Concatenation along channels (`ConcatZ`) or a spatial axis (`ConcatXY`).

use crate::compiler::graph::Axis;
use crate::error::{CompileError, CompileResult};
use crate::kernel::operation::{GpuOperation, GridOrigin, OperationDef};
use crate::ops::kernel_header;

fn src_name(i: usize) -> String {
    format!("src_tensor_{i}")
}

fn add_tensors(op: &mut GpuOperation, definition: &OperationDef) -> CompileResult<()> {
    for (i, desc) in definition.src_tensors.iter().enumerate() {
        op.add_src_tensor(&src_name(i), desc.clone());
    }
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    Ok(())
}

/// Every source starts on a slice boundary: copy whole slices.
fn code_z_aligned(inputs: usize) -> String {
    let mut c = String::new();
    c.push_str("__kernel void main_function(\n$0) {\n");
    c.push_str("  int X = get_global_id(0);\n");
    c.push_str("  int Y = get_global_id(1);\n");
    c.push_str("  if (X >= args.dst_tensor.Width() || Y >= args.dst_tensor.Height()) return;\n");
    c.push_str("  int Z = 0;\n");
    for i in 0..inputs {
        let src = src_name(i);
        c.push_str(&format!("  for (int i = 0; i < args.{src}.Slices(); ++i) {{\n"));
        c.push_str(&format!("    FLT4 result = args.{src}.Read(X, Y, i);\n"));
        c.push_str("    args.dst_tensor.Write(result, X, Y, Z);\n");
        c.push_str("    Z++;\n");
        c.push_str("  }\n");
    }
    c.push_str("}\n");
    c
}

/// Channel-by-channel packing for arbitrary channel counts.
fn code_z(inputs: usize) -> String {
    let mut c = String::new();
    c.push_str("__kernel void main_function(\n$0) {\n");
    c.push_str("  int X = get_global_id(0);\n");
    c.push_str("  int Y = get_global_id(1);\n");
    c.push_str("  if (X >= args.dst_tensor.Width() || Y >= args.dst_tensor.Height()) return;\n");
    c.push_str("  FLT res_ar[4] = {(FLT)(0.0f), (FLT)(0.0f), (FLT)(0.0f), (FLT)(0.0f)};\n");
    c.push_str("  int out_channel = 0;\n");
    c.push_str("  int Z = 0;\n");
    for i in 0..inputs {
        let src = src_name(i);
        c.push_str(&format!("  for (int i = 0; i < args.{src}.Slices(); ++i) {{\n"));
        c.push_str(&format!("    FLT4 t = args.{src}.Read(X, Y, i);\n"));
        c.push_str("    FLT t_ar[4] = {t.x, t.y, t.z, t.w};\n");
        c.push_str("    for (int ch = 0; ch < 4; ++ch) {\n");
        c.push_str(&format!(
            "      if (i * 4 + ch >= args.{src}.Channels()) break;\n"
        ));
        c.push_str("      res_ar[out_channel] = t_ar[ch];\n");
        c.push_str("      out_channel++;\n");
        c.push_str("      if (out_channel == 4) {\n");
        c.push_str("        FLT4 result = (FLT4)(res_ar[0], res_ar[1], res_ar[2], res_ar[3]);\n");
        c.push_str("        args.dst_tensor.Write(result, X, Y, Z);\n");
        c.push_str("        out_channel = 0;\n");
        c.push_str("        Z++;\n");
        c.push_str("      }\n");
        c.push_str("    }\n");
        c.push_str("  }\n");
    }
    c.push_str("  if (out_channel != 0) {\n");
    c.push_str("    for (int ch = out_channel; ch < 4; ++ch) {\n");
    c.push_str("      res_ar[ch] = (FLT)(0.0f);\n");
    c.push_str("    }\n");
    c.push_str("    FLT4 result = (FLT4)(res_ar[0], res_ar[1], res_ar[2], res_ar[3]);\n");
    c.push_str("    args.dst_tensor.Write(result, X, Y, Z);\n");
    c.push_str("  }\n");
    c.push_str("}\n");
    c
}

fn code_xy(inputs: usize, axis: Axis) -> String {
    let (coord, member) = match axis {
        Axis::Width => ("X", "Width"),
        _ => ("Y", "Height"),
    };
    let mut c = String::new();
    kernel_header(&mut c);
    c.push_str("  FLT4 result = (FLT4)(0.0f);\n");
    c.push_str("  int offset = 0;\n");
    for i in 0..inputs {
        let src = src_name(i);
        let (x, y) = match axis {
            Axis::Width => ("X - offset", "Y"),
            _ => ("X", "Y - offset"),
        };
        c.push_str(&format!(
            "  if ({coord} >= offset && {coord} < offset + args.{src}.{member}()) {{\n"
        ));
        c.push_str(&format!("    result = args.{src}.Read({x}, {y}, Z);\n"));
        c.push_str("  }\n");
        c.push_str(&format!("  offset += args.{src}.{member}();\n"));
    }
    c.push_str("  args.dst_tensor.Write(result, X, Y, Z);\n");
    c.push_str("}\n");
    c
}

/// Channel concatenation; `channels[i]` is the channel count of source `i`.
pub fn create_concat_z(definition: OperationDef, channels: &[usize]) -> CompileResult<GpuOperation> {
    let aligned = channels.iter().all(|c| c % 4 == 0);
    let code = if aligned {
        code_z_aligned(channels.len())
    } else {
        code_z(channels.len())
    };
    let mut op = GpuOperation::new(definition.clone(), "concat_z", code);
    add_tensors(&mut op, &definition)?;
    op.set_grid_origin(GridOrigin::WidthHeight);
    Ok(op)
}

/// Concatenation along width or height.
pub fn create_concat_xy(definition: OperationDef, axis: Axis) -> CompileResult<GpuOperation> {
    if axis == Axis::Channels {
        return Err(CompileError::InvalidNode {
            node: "concat_xy".into(),
            reason: "channel concatenation goes through concat_z".into(),
        });
    }
    let inputs = definition.src_tensors.len();
    let mut op = GpuOperation::new(definition.clone(), "concat_xy", code_xy(inputs, axis));
    add_tensors(&mut op, &definition)?;
    Ok(op)
}
