//! Depthwise 2D convolution with channel multiplier 1.

use crate::compiler::graph::Conv2DParams;
use crate::device::DeviceInfo;
use crate::error::{CompileError, CompileResult};
use crate::kernel::object::ObjectDescriptor;
use crate::kernel::operation::{GpuOperation, OperationDef};
use crate::ops::conv::{expand_bias, to_int, ConvWeights};
use crate::ops::{constant_buffer, kernel_header, spatial_work_group};
use crate::types::Bhwc;

/// `[1, KH, KW, C]` → one `FLT4` per `(slice, ky, kx)`.
pub fn rearrange_depthwise_weights(weights: &ConvWeights<'_>) -> Vec<f32> {
    let Bhwc { h: kh, w: kw, c, .. } = weights.shape;
    let slices = c.div_ceil(4);
    let mut out = Vec::with_capacity(slices * kh * kw * 4);
    for d in 0..slices {
        for ky in 0..kh {
            for kx in 0..kw {
                for j in 0..4 {
                    let ch = d * 4 + j;
                    out.push(if ch < c {
                        weights.data[(ky * kw + kx) * c + ch]
                    } else {
                        0.0
                    });
                }
            }
        }
    }
    out
}

fn code() -> String {
    let mut c = String::new();
    kernel_header(&mut c);
    c.push_str("  ACCUM_FLT4 r = (ACCUM_FLT4)(0.0f);\n");
    c.push_str("  int x_origin = X * args.stride_x - args.padding_x;\n");
    c.push_str("  int y_origin = Y * args.stride_y - args.padding_y;\n");
    c.push_str("  int f_base = Z * args.kernel_size_y * args.kernel_size_x;\n");
    c.push_str("  for (int ky = 0; ky < args.kernel_size_y; ++ky) {\n");
    c.push_str("    int y_c = y_origin + ky * args.dilation_y;\n");
    c.push_str("    bool outside_y = y_c < 0 || y_c >= args.src_tensor.Height();\n");
    c.push_str("    for (int kx = 0; kx < args.kernel_size_x; ++kx) {\n");
    c.push_str("      int x_c = x_origin + kx * args.dilation_x;\n");
    c.push_str("      if (!outside_y && x_c >= 0 && x_c < args.src_tensor.Width()) {\n");
    c.push_str("        FLT4 src = args.src_tensor.Read(x_c, y_c, Z);\n");
    c.push_str("        FLT4 f = args.weights.Read(f_base + ky * args.kernel_size_x + kx);\n");
    c.push_str("        r += TO_ACCUM_TYPE(src * f);\n");
    c.push_str("      }\n");
    c.push_str("    }\n");
    c.push_str("  }\n");
    c.push_str("  FLT4 res = TO_FLT4(r) + args.biases.Read(Z);\n");
    c.push_str("  args.dst_tensor.Write(res, X, Y, Z);\n");
    c.push_str("}\n");
    c
}

pub fn create_depthwise_convolution(
    definition: OperationDef,
    params: &Conv2DParams,
    weights: &ConvWeights<'_>,
    src: &Bhwc,
    dst: &Bhwc,
    info: &DeviceInfo,
) -> CompileResult<GpuOperation> {
    if weights.shape.b != 1 || weights.data.len() != weights.shape.elements() {
        return Err(CompileError::InvalidNode {
            node: "depthwise convolution".into(),
            reason: format!("weights shape {:?} is not [1, KH, KW, C]", weights.shape),
        });
    }
    if weights.shape.c != src.c || dst.c != src.c {
        return Err(CompileError::Unsupported(format!(
            "depthwise convolution with channel multiplier ({} -> {})",
            src.c, dst.c
        )));
    }
    if src.b > 1 {
        return Err(CompileError::Unsupported(format!(
            "depthwise convolution over batch {}",
            src.b
        )));
    }
    weights.check_bias(dst.c)?;

    let data_type = definition.data_type();
    let mut op = GpuOperation::new(definition.clone(), "depthwise_conv", code());
    op.add_src_tensor("src_tensor", definition.src(0)?.clone());
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    let rearranged = rearrange_depthwise_weights(weights);
    let bias = expand_bias(weights.bias, dst.c);
    let args = op.args_mut();
    args.add_object(
        "weights",
        ObjectDescriptor::Buffer(constant_buffer(&rearranged, data_type)),
    );
    args.add_object("biases", ObjectDescriptor::Buffer(constant_buffer(&bias, data_type)));
    args.add_int("kernel_size_x", to_int(weights.shape.w));
    args.add_int("kernel_size_y", to_int(weights.shape.h));
    args.add_int("stride_x", to_int(params.stride_w));
    args.add_int("stride_y", to_int(params.stride_h));
    args.add_int("dilation_x", to_int(params.dilation_w));
    args.add_int("dilation_y", to_int(params.dilation_h));
    args.add_int("padding_x", to_int(params.padding.left));
    args.add_int("padding_y", to_int(params.padding.top));
    op.set_work_group_size(spatial_work_group(info));
    Ok(op)
}
