//! Windowed max / average pooling.

use crate::compiler::graph::{Pool2DParams, PoolingKind};
use crate::error::{CompileError, CompileResult};
use crate::kernel::operation::{GpuOperation, OperationDef};
use crate::ops::conv::to_int;
use crate::ops::kernel_header;
use crate::types::Bhwc;

fn code(kind: PoolingKind) -> String {
    let mut c = String::new();
    kernel_header(&mut c);
    match kind {
        PoolingKind::Max => c.push_str("  FLT4 maximum = (FLT4)(-10000.0f);\n"),
        PoolingKind::Average => {
            c.push_str("  ACCUM_FLT4 r = (ACCUM_FLT4)(0.0f);\n");
            c.push_str("  float window_size = 0.0f;\n");
        }
    }
    c.push_str("  int x_origin = X * args.stride_x - args.padding_x;\n");
    c.push_str("  int y_origin = Y * args.stride_y - args.padding_y;\n");
    c.push_str("  for (int ky = 0; ky < args.kernel_size_y; ++ky) {\n");
    c.push_str("    int y_c = y_origin + ky;\n");
    c.push_str("    bool outside_y = y_c < 0 || y_c >= args.src_tensor.Height();\n");
    c.push_str("    for (int kx = 0; kx < args.kernel_size_x; ++kx) {\n");
    c.push_str("      int x_c = x_origin + kx;\n");
    c.push_str("      if (!outside_y && x_c >= 0 && x_c < args.src_tensor.Width()) {\n");
    match kind {
        PoolingKind::Max => {
            c.push_str("        maximum = max(maximum, args.src_tensor.Read(x_c, y_c, Z));\n");
        }
        PoolingKind::Average => {
            c.push_str("        r += TO_ACCUM_TYPE(args.src_tensor.Read(x_c, y_c, Z));\n");
            c.push_str("        window_size += 1.0f;\n");
        }
    }
    c.push_str("      }\n");
    c.push_str("    }\n");
    c.push_str("  }\n");
    match kind {
        PoolingKind::Max => c.push_str("  FLT4 result = maximum;\n"),
        PoolingKind::Average => {
            c.push_str("  FLT4 result = TO_FLT4(r / (ACCUM_FLT)(max(window_size, 1.0f)));\n")
        }
    }
    c.push_str("  args.dst_tensor.Write(result, X, Y, Z);\n");
    c.push_str("}\n");
    c
}

pub fn create_pooling(
    definition: OperationDef,
    params: &Pool2DParams,
    src: &Bhwc,
) -> CompileResult<GpuOperation> {
    if params.kernel_h == 0 || params.kernel_w == 0 || params.stride_h == 0 || params.stride_w == 0 {
        return Err(CompileError::InvalidNode {
            node: "pooling".into(),
            reason: format!("degenerate window {params:?}"),
        });
    }
    if src.b > 1 {
        return Err(CompileError::Unsupported(format!("pooling over batch {}", src.b)));
    }
    let name = match params.kind {
        PoolingKind::Max => "max_pooling",
        PoolingKind::Average => "average_pooling",
    };
    let mut op = GpuOperation::new(definition.clone(), name, code(params.kind));
    op.add_src_tensor("src_tensor", definition.src(0)?.clone());
    op.add_dst_tensor("dst_tensor", definition.dst(0)?.clone());
    let args = op.args_mut();
    args.add_int("kernel_size_x", to_int(params.kernel_w));
    args.add_int("kernel_size_y", to_int(params.kernel_h));
    args.add_int("stride_x", to_int(params.stride_w));
    args.add_int("stride_y", to_int(params.stride_h));
    args.add_int("padding_x", to_int(params.padding.left));
    args.add_int("padding_y", to_int(params.padding.top));
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::graph::Padding2D;
    use crate::device::dry_run::DryRunDevice;
    use crate::device::{DeviceInfo, GpuVendor};
    use crate::kernel::tensor_desc::TensorDescriptor;
    use crate::types::{CalculationsPrecision, DataType, Layout, TensorStorageType};

    fn def() -> OperationDef {
        let desc =
            TensorDescriptor::new(DataType::Float16, TensorStorageType::Texture2D, Layout::Hwc);
        OperationDef {
            precision: CalculationsPrecision::F16,
            src_tensors: vec![desc.clone()],
            dst_tensors: vec![desc],
        }
    }

    fn params(kind: PoolingKind) -> Pool2DParams {
        Pool2DParams {
            kind,
            kernel_h: 2,
            kernel_w: 2,
            stride_h: 2,
            stride_w: 2,
            padding: Padding2D::default(),
        }
    }

    #[test]
    fn test_max_pooling_on_images() {
        let mut op = create_pooling(def(), &params(PoolingKind::Max), &Bhwc::new(1, 8, 8, 4)).unwrap();
        let mut device = DryRunDevice::new(DeviceInfo::adreno(6));
        op.compile(&mut device).unwrap();
        let source = op.source().unwrap();
        assert!(source.contains("maximum = max(maximum, read_imageh(src_tensor_image2d, smp_zero,"));
        assert!(source.contains("write_imageh(dst_tensor_image2d,"));
        assert!(!source.contains("args."));
    }

    #[test]
    fn test_average_pooling_divides_by_window() {
        let op = create_pooling(def(), &params(PoolingKind::Average), &Bhwc::new(1, 8, 8, 4)).unwrap();
        assert_eq!(op.kernel_name(), "average_pooling");
    }

    #[test]
    fn test_zero_stride_rejected() {
        let mut p = params(PoolingKind::Max);
        p.stride_w = 0;
        assert!(create_pooling(def(), &p, &Bhwc::new(1, 8, 8, 4)).is_err());
    }
}
