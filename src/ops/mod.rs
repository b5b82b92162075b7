//! Kernel templates, one module per operation family.
//!
//! Every `create_*` function returns a [`GpuOperation`] whose template refers
//! to tensors and constants through `args.` markers only. Templates never
//! declare locals named like tensor members (`width`, `height`, `slices`,
//! `channels`, `batch`, `buffer`, `length`, `image2d`, `image_buffer`):
//! resolved selector output is rewritten word by word against those names.

pub mod add;
pub mod concat;
pub mod conv;
pub mod depthwise_conv;
pub mod elementwise;
pub mod pooling;
pub mod reshape;
pub mod softmax;

use half::f16;

use crate::device::DeviceInfo;
use crate::kernel::object::{BufferDescriptor, MemoryType};
use crate::types::{DataType, Dim3};

/// Kernel entry, global ids and the bounds check against `dst_tensor`.
pub(crate) fn kernel_header(c: &mut String) {
    c.push_str("__kernel void main_function(\n$0) {\n");
    c.push_str("  int X = get_global_id(0);\n");
    c.push_str("  int Y = get_global_id(1);\n");
    c.push_str("  int Z = get_global_id(2);\n");
    c.push_str(
        "  if (X >= args.dst_tensor.Width() || Y >= args.dst_tensor.Height() || Z >= args.dst_tensor.Slices()) return;\n",
    );
}

/// Read-only vec4 buffer holding `values`, zero-padded to whole vectors and
/// stored in `data_type`.
pub(crate) fn constant_buffer(values: &[f32], data_type: DataType) -> BufferDescriptor {
    let mut padded = values.to_vec();
    padded.resize(values.len().div_ceil(4) * 4, 0.0);
    let (data_type, data) = match data_type {
        DataType::Float16 => {
            let halves: Vec<f16> = padded.iter().copied().map(f16::from_f32).collect();
            (DataType::Float16, bytemuck::cast_slice(&halves).to_vec())
        }
        DataType::Float32 | DataType::Int32 => {
            (DataType::Float32, bytemuck::cast_slice(&padded).to_vec())
        }
    };
    BufferDescriptor {
        data_type,
        element_size: 4,
        memory_type: MemoryType::Global,
        elements: padded.len() / 4,
        data,
    }
}

/// Per-vendor work group for the heavier spatial kernels, clamped to the
/// device limit.
pub(crate) fn spatial_work_group(info: &DeviceInfo) -> Dim3 {
    use crate::device::GpuVendor;
    let preferred = match info.vendor {
        GpuVendor::Adreno => Dim3::new(16, 4, 1),
        GpuVendor::Mali => Dim3::new(4, 4, 4),
        GpuVendor::PowerVr | GpuVendor::Apple => Dim3::new(8, 8, 1),
        _ => Dim3::new(8, 4, 2),
    };
    let max = info.max_work_group_size;
    Dim3::new(
        preferred.x.min(max.x).max(1),
        preferred.y.min(max.y).max(1),
        preferred.z.min(max.z).max(1),
    )
}
