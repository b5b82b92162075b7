//! 2D convolution: a generic windowed kernel and a 1x1 pointwise kernel.
//!
//! Weights are re-laid out as four `FLT4` vectors per
//! `(dst slice, ky, kx, src slice)`: vector `k` holds, in component `j`, the
//! weight from input channel `4 * s + k` to output channel `4 * d + j`, so a
//! source texel `src` contributes `src.x * w0 + src.y * w1 + src.z * w2 + src.w * w3`.

use crate::compiler::graph::Conv2DParams;
use crate::device::DeviceInfo;
use crate::error::{CompileError, CompileResult};
use crate::kernel::object::ObjectDescriptor;
use crate::kernel::operation::{GpuOperation, OperationDef};
use crate::ops::{constant_buffer, kernel_header, spatial_work_group};
use crate::types::Bhwc;

/// Constant weights `[O, KH, KW, I]` and an optional bias `[O]`.
#[derive(Debug, Clone, Copy)]
pub struct ConvWeights<'a> {
    pub shape: Bhwc,
    pub data: &'a [f32],
    pub bias: Option<&'a [f32]>,
}

impl ConvWeights<'_> {
    pub fn dst_channels(&self) -> usize {
        self.shape.b
    }

    pub fn src_channels(&self) -> usize {
        self.shape.c
    }

    pub fn is_pointwise(&self) -> bool {
        self.shape.h == 1 && self.shape.w == 1
    }

    fn check(&self) -> CompileResult<()> {
        if self.data.len() != self.shape.elements() {
            return Err(CompileError::InvalidNode {
                node: "convolution".into(),
                reason: format!(
                    "weights hold {} values, shape {:?} needs {}",
                    self.data.len(),
                    self.shape,
                    self.shape.elements()
                ),
            });
        }
        self.check_bias(self.dst_channels())
    }

    /// Bias must hold one value per output channel or a single broadcast value.
    pub(crate) fn check_bias(&self, channels: usize) -> CompileResult<()> {
        match self.bias {
            Some(bias) if bias.len() != channels && bias.len() != 1 => {
                Err(CompileError::InvalidNode {
                    node: "convolution".into(),
                    reason: format!(
                        "bias holds {} values for {} output channels",
                        bias.len(),
                        channels
                    ),
                })
            }
            _ => Ok(()),
        }
    }
}

/// `[O, KH, KW, I]` → slice-interleaved layout described in the module docs.
pub fn rearrange_weights(weights: &ConvWeights<'_>) -> Vec<f32> {
    let Bhwc { b: o, h: kh, w: kw, c: i, .. } = weights.shape;
    let dst_slices = o.div_ceil(4);
    let src_slices = i.div_ceil(4);
    let mut out = Vec::with_capacity(dst_slices * kh * kw * src_slices * 16);
    for d in 0..dst_slices {
        for ky in 0..kh {
            for kx in 0..kw {
                for s in 0..src_slices {
                    for k in 0..4 {
                        for j in 0..4 {
                            let (oc, ic) = (d * 4 + j, s * 4 + k);
                            let value = if oc < o && ic < i {
                                weights.data[((oc * kh + ky) * kw + kx) * i + ic]
                            } else {
                                0.0
                            };
                            out.push(value);
                        }
                    }
                }
            }
        }
    }
    out
}

/// Bias padded to whole slices; a single value is broadcast.
pub(crate) fn expand_bias(bias: Option<&[f32]>, channels: usize) -> Vec<f32> {
    match bias {
        Some([value]) => vec![*value; channels],
        Some(values) => values.to_vec(),
        None => vec![0.0; channels],
    }
}

fn add_weight_objects(op: &mut GpuOperation, weights: &ConvWeights<'_>, definition: &OperationDef) {
    let data_type = definition.data_type();
    let rearranged = rearrange_weights(weights);
    let bias = expand_bias(weights.bias, weights.dst_channels());
    op.args_mut().add_object(
        "weights",
        ObjectDescriptor::Buffer(constant_buffer(&rearranged, data_type)),
    );
    op.args_mut()
        .add_object("biases", ObjectDescriptor::Buffer(constant_buffer(&bias, data_type)));
}

fn accumulate(c: &mut String, indent: &str) {
    c.push_str(indent);
    c.push_str("r += TO_ACCUM_TYPE(src.x * args.weights.Read(f_offset + 0) + src.y * args.weights.Read(f_offset + 1) + src.z * args.weights.Read(f_offset + 2) + src.w * args.weights.Read(f_offset + 3));\n");
}

fn generic_code() -> String {
    let mut c = String::new();
    kernel_header(&mut c);
    c.push_str("  ACCUM_FLT4 r = (ACCUM_FLT4)(0.0f);\n");
    c.push_str("  int x_origin = X * args.stride_x - args.padding_x;\n");
    c.push_str("  int y_origin = Y * args.stride_y - args.padding_y;\n");
    c.push_str("  int f_base = Z * args.kernel_size_y * args.kernel_size_x * args.src_tensor.Slices() * 4;\n");
    c.push_str("  for (int ky = 0; ky < args.kernel_size_y; ++ky) {\n");
    c.push_str("    int y_c = y_origin + ky * args.dilation_y;\n");
    c.push_str("    bool outside_y = y_c < 0 || y_c >= args.src_tensor.Height();\n");
    c.push_str("    for (int kx = 0; kx < args.kernel_size_x; ++kx) {\n");
    c.push_str("      int x_c = x_origin + kx * args.dilation_x;\n");
    c.push_str("      bool outside = outside_y || x_c < 0 || x_c >= args.src_tensor.Width();\n");
    c.push_str("      if (!outside) {\n");
    c.push_str("        for (int s = 0; s < args.src_tensor.Slices(); ++s) {\n");
    c.push_str("          int f_offset = f_base + ((ky * args.kernel_size_x + kx) * args.src_tensor.Slices() + s) * 4;\n");
    c.push_str("          FLT4 src = args.src_tensor.Read(x_c, y_c, s);\n");
    accumulate(&mut c, "          ");
    c.push_str("        }\n");
    c.push_str("      }\n");
    c.push_str("    }\n");
    c.push_str("  }\n");
    c.push_str("  FLT4 res = TO_FLT4(r) + args.biases.Read(Z);\n");
    c.push_str("  args.dst_tensor.Write(res, X, Y, Z);\n");
    c.push_str("}\n");
    c
}

fn pointwise_code() -> String {
    let mut c = String::new();
    kernel_header(&mut c);
    c.push_str("  ACCUM_FLT4 r = (ACCUM_FLT4)(0.0f);\n");
    c.push_str("  for (int s = 0; s < args.src_tensor.Slices(); ++s) {\n");
    c.push_str("    int f_offset = (Z * args.src_tensor.Slices() + s) * 4;\n");
    c.push_str("    FLT4 src = args.src_tensor.Read(X, Y, s);\n");
    accumulate(&mut c, "    ");
    c.push_str("  }\n");
    c.push_str("  FLT4 res = TO_FLT4(r) + args.biases.Read(Z);\n");
    c.push_str("  args.dst_tensor.Write(res, X, Y, Z);\n");
    c.push_str("}\n");
    c
}

fn check_channels(weights: &ConvWeights<'_>, src: &Bhwc, dst: &Bhwc) -> CompileResult<()> {
    weights.check()?;
    if weights.src_channels() != src.c || weights.dst_channels() != dst.c {
        return Err(CompileError::InvalidNode {
            node: "convolution".into(),
            reason: format!(
                "weights {:?} do not map {} to {} channels",
                weights.shape, src.c, dst.c
            ),
        });
    }
    Ok(())
}

/// Windowed convolution for any kernel size, stride, dilation and padding.
pub fn create_conv_generic(
    definition: OperationDef,
    params: &Conv2DParams,
    weights: &ConvWeights<'_>,
    src: &Bhwc,
    dst: &Bhwc,
    info: &DeviceInfo,
) -> CompileResult<GpuOperation> {
    check_channels(weights, src, dst)?;
    if src.b > 1 {
        return Err(CompileError::Unsupported(format!(
            "windowed convolution over batch {}",
            src.b
        )));
    }
    let mut op = GpuOperation::new(definition.clone(), "conv_generic", generic_code());
    op.add_src_tensor("src_tensor", definition.src(0)?.clone());
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    add_weight_objects(&mut op, weights, &definition);
    let args = op.args_mut();
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

/// 1x1 convolution with unit stride and no padding; per-pixel, so batched
/// tensors are fine.
pub fn create_conv_pointwise(
    definition: OperationDef,
    weights: &ConvWeights<'_>,
    src: &Bhwc,
    dst: &Bhwc,
    info: &DeviceInfo,
) -> CompileResult<GpuOperation> {
    check_channels(weights, src, dst)?;
    let mut op = GpuOperation::new(definition.clone(), "conv_pointwise", pointwise_code());
    op.add_src_tensor("src_tensor", definition.src(0)?.clone());
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    add_weight_objects(&mut op, weights, &definition);
    op.set_work_group_size(spatial_work_group(info));
    Ok(op)
}

pub(crate) fn to_int(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
