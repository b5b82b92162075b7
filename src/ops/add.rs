//! N-ary element-wise add of runtime tensors.

use crate::kernel::operation::{GpuOperation, OperationDef};

/// Sum of every source. `channels[i]` is the channel count of source `i`;
/// sources with fewer slices than the destination contribute zeros to the
/// missing slices.
///
/// The result is linkable only when the first source covers every
/// destination slice: a consumer linked into a producer would otherwise read
/// past the producer's output.
pub fn create_add(definition: OperationDef, channels: &[usize], dst_channels: usize) -> GpuOperation {
    let dst_slices = dst_channels.div_ceil(4);
    let src0_slices = channels.first().copied().unwrap_or(0).div_ceil(4);
    let extra: Vec<_> = definition.src_tensors.iter().skip(1).cloned().collect();

    let mut code = String::new();
    for i in 1..=extra.len() {
        code.push_str(&format!("if (S_COORD < args.src_data_{i}.Slices()) {{\n"));
        code.push_str(&format!(
            "  in_out_value += args.src_data_{i}.Read(X_COORD, Y_COORD, S_COORD);\n"
        ));
        code.push_str("}\n");
    }

    let mut add = GpuOperation::elementwise(definition, "add", code);
    add.set_linkable(src0_slices == dst_slices);
    add.set_check_src_channels_size(src0_slices < dst_slices);
    for (i, desc) in extra.into_iter().enumerate() {
        add.add_src_tensor(&format!("src_data_{}", i + 1), desc);
    }
    add
}
