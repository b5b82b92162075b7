//! Reshape: re-index the flattened `HWC` data of every batch.
//!
//! Batches are interleaved along X (`x * batch + b`), so both kernels split
//! the global X id into a spatial position and a batch index first.

use crate::error::CompileResult;
use crate::kernel::operation::{GpuOperation, OperationDef};
use crate::ops::kernel_header;

fn batch_prologue(c: &mut String, batched: bool) {
    if batched {
        c.push_str("  int batch_count = args.dst_tensor.Batch();\n");
    } else {
        c.push_str("  int batch_count = 1;\n");
    }
    c.push_str("  int B = X % batch_count;\n");
    c.push_str("  int dst_x = X / batch_count;\n");
    c.push_str("  int dst_w = args.dst_tensor.Width() / batch_count;\n");
    c.push_str("  int src_w = args.src_tensor.Width() / batch_count;\n");
}

/// Channel-by-channel copy for arbitrary channel counts.
fn code(batched: bool) -> String {
    let mut c = String::new();
    kernel_header(&mut c);
    batch_prologue(&mut c, batched);
    c.push_str("  FLT temps[4];\n");
    c.push_str("  for (int i = 0; i < 4; ++i) {\n");
    c.push_str("    temps[i] = (FLT)(0.0f);\n");
    c.push_str("    int dst_channel = Z * 4 + i;\n");
    c.push_str("    if (dst_channel < args.dst_tensor.Channels()) {\n");
    c.push_str("      int p = dst_channel + args.dst_tensor.Channels() * (dst_x + dst_w * Y);\n");
    c.push_str("      int src_c = p % args.src_tensor.Channels();\n");
    c.push_str("      p = p / args.src_tensor.Channels();\n");
    c.push_str("      int src_x = p % src_w;\n");
    c.push_str("      int src_y = p / src_w;\n");
    c.push_str("      FLT4 t = args.src_tensor.Read(src_x * batch_count + B, src_y, src_c / 4);\n");
    c.push_str("      FLT t_ar[4] = {t.x, t.y, t.z, t.w};\n");
    c.push_str("      temps[i] = t_ar[src_c % 4];\n");
    c.push_str("    }\n");
    c.push_str("  }\n");
    c.push_str("  FLT4 result = (FLT4)(temps[0], temps[1], temps[2], temps[3]);\n");
    c.push_str("  args.dst_tensor.Write(result, X, Y, Z);\n");
    c.push_str("}\n");
    c
}

/// Whole-slice copy when both channel counts are multiples of 4.
fn code_x4(batched: bool) -> String {
    let mut c = String::new();
    kernel_header(&mut c);
    batch_prologue(&mut c, batched);
    c.push_str("  int p = Z + args.dst_tensor.Slices() * (dst_x + dst_w * Y);\n");
    c.push_str("  int src_z = p % args.src_tensor.Slices();\n");
    c.push_str("  p = p / args.src_tensor.Slices();\n");
    c.push_str("  int src_x = p % src_w;\n");
    c.push_str("  int src_y = p / src_w;\n");
    c.push_str("  FLT4 result = args.src_tensor.Read(src_x * batch_count + B, src_y, src_z);\n");
    c.push_str("  args.dst_tensor.Write(result, X, Y, Z);\n");
    c.push_str("}\n");
    c
}

fn build(definition: OperationDef, name: &str, code: String) -> CompileResult<GpuOperation> {
    let mut op = GpuOperation::new(definition.clone(), name, code);
    op.add_src_tensor("src_tensor", definition.src(0)?.clone());
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    Ok(op)
}

pub fn create_reshape(definition: OperationDef) -> CompileResult<GpuOperation> {
    let batched = definition.is_batch_supported();
    build(definition, "reshape", code(batched))
}

pub fn create_reshape_x4(definition: OperationDef) -> CompileResult<GpuOperation> {
    let batched = definition.is_batch_supported();
    build(definition, "reshape_x4", code_x4(batched))
}
