//! Tensor descriptor: how a tensor is stored and how kernels address it.
//!
//! Tensors are stored as 4-channel slices. The `width` member is the batched
//! width (`w * b`), so kernels iterate `X` over all batches at once.
//!
//! | storage     | member       | element address                          |
//! |-------------|--------------|------------------------------------------|
//! | Buffer      | `buffer`     | `((S) * height + (Y)) * width + (X)`     |
//! | ImageBuffer | `image_buffer` | same linear index                      |
//! | Texture2D   | `image2d`    | `(int2)((X), (Y) * slices + (S))`        |

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::kernel::object::{
    expect_arity, to_i32, BoundTensor, GpuBufferDescriptor, GpuImageDescriptor, GpuResources,
    GpuResourcesWithValue, MemoryType,
};
use crate::types::{AccessType, Bhwc, DataType, Layout, TensorStorageType};

/// Data type, storage and layout of a device tensor.
///
/// Equality is structural; two tensors with equal descriptors (and equal
/// shapes) are interchangeable for kernel linking and memory reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub data_type: DataType,
    pub storage_type: TensorStorageType,
    pub layout: Layout,
}

/// Names extracted from a `Write(value, X, Y, S)` call; the linked code of a
/// fused consumer is rewritten against them.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkingContext {
    pub var_name: String,
    pub x_coord: String,
    pub y_coord: String,
    pub s_coord: String,
}

impl TensorDescriptor {
    pub const fn new(data_type: DataType, storage_type: TensorStorageType, layout: Layout) -> Self {
        Self {
            data_type,
            storage_type,
            layout,
        }
    }

    /// Bytes of device memory a tensor of `shape` occupies.
    pub fn size_in_bytes(&self, shape: &Bhwc) -> usize {
        shape.padded_elements() * self.data_type.size_bytes()
    }

    pub fn resources(&self, access: AccessType) -> GpuResources {
        let mut resources = GpuResources {
            ints: vec![
                "width".into(),
                "height".into(),
                "slices".into(),
                "channels".into(),
            ],
            ..GpuResources::default()
        };
        if self.layout.has_batch() {
            resources.ints.push("batch".into());
        }
        match self.storage_type {
            TensorStorageType::Buffer => resources.buffers.push((
                "buffer".into(),
                GpuBufferDescriptor {
                    data_type: self.data_type,
                    element_size: 4,
                    memory_type: MemoryType::Global,
                    access,
                },
            )),
            TensorStorageType::ImageBuffer => resources.image_buffers.push((
                "image_buffer".into(),
                GpuImageDescriptor {
                    data_type: self.data_type,
                    access,
                },
            )),
            TensorStorageType::Texture2D => resources.images2d.push((
                "image2d".into(),
                GpuImageDescriptor {
                    data_type: self.data_type,
                    access,
                },
            )),
        }
        resources
    }

    pub fn resource_values(&self, tensor: &BoundTensor) -> GpuResourcesWithValue {
        let shape = &tensor.shape;
        let mut values = GpuResourcesWithValue {
            ints: vec![
                ("width".into(), to_i32(shape.w * shape.b)),
                ("height".into(), to_i32(shape.h)),
                ("slices".into(), to_i32(shape.slices())),
                ("channels".into(), to_i32(shape.c)),
            ],
            ..GpuResourcesWithValue::default()
        };
        if self.layout.has_batch() {
            values.ints.push(("batch".into(), to_i32(shape.b)));
        }
        let memory = tensor.memory;
        match self.storage_type {
            TensorStorageType::Buffer => values.buffers.push(("buffer".into(), memory)),
            TensorStorageType::ImageBuffer => {
                values.image_buffers.push(("image_buffer".into(), memory))
            }
            TensorStorageType::Texture2D => values.images2d.push(("image2d".into(), memory)),
        }
        values
    }

    pub fn perform_selector(
        &self,
        selector: &str,
        args: &[String],
        template_args: &[String],
    ) -> CompileResult<String> {
        let member = |name: &str| -> CompileResult<String> {
            expect_arity(selector, args, 0)?;
            Ok(name.to_string())
        };
        match selector {
            "Width" => member("width"),
            "Height" => member("height"),
            "Slices" => member("slices"),
            "Channels" => member("channels"),
            "Batch" if self.layout.has_batch() => member("batch"),
            "Read" => self.read(args, template_args),
            "Write" => self.write(args),
            _ => Err(CompileError::UnsupportedSelector {
                object: format!("{:?} tensor", self.storage_type),
                selector: selector.to_string(),
            }),
        }
    }

    pub fn write_linking_context(&self, args: &[String]) -> CompileResult<LinkingContext> {
        expect_arity("Write", args, 4)?;
        Ok(LinkingContext {
            var_name: args[0].clone(),
            x_coord: args[1].clone(),
            y_coord: args[2].clone(),
            s_coord: args[3].clone(),
        })
    }

    fn linear_index(x: &str, y: &str, s: &str) -> String {
        format!("(({s}) * height + ({y})) * width + ({x})")
    }

    fn read(&self, args: &[String], template_args: &[String]) -> CompileResult<String> {
        expect_arity("Read", args, 3)?;
        let (x, y, s) = (&args[0], &args[1], &args[2]);
        let suffix = self.data_type.image_suffix();
        let value = match self.storage_type {
            TensorStorageType::Buffer => format!("buffer[{}]", Self::linear_index(x, y, s)),
            TensorStorageType::ImageBuffer => format!(
                "read_image{suffix}(image_buffer, {})",
                Self::linear_index(x, y, s)
            ),
            TensorStorageType::Texture2D => format!(
                "read_image{suffix}(image2d, smp_zero, (int2)(({x}), ({y}) * slices + ({s})))"
            ),
        };
        match template_args.first() {
            Some(ty) if *ty != self.data_type.kernel_type(1) => {
                Ok(format!("convert_{ty}4({value})"))
            }
            _ => Ok(value),
        }
    }

    fn write(&self, args: &[String]) -> CompileResult<String> {
        let ctx = self.write_linking_context(args)?;
        let (x, y, s) = (&ctx.x_coord, &ctx.y_coord, &ctx.s_coord);
        let value = &ctx.var_name;
        let suffix = self.data_type.image_suffix();
        Ok(match self.storage_type {
            TensorStorageType::Buffer => {
                format!("buffer[{}] = {value}", Self::linear_index(x, y, s))
            }
            TensorStorageType::ImageBuffer => format!(
                "write_image{suffix}(image_buffer, {}, {value})",
                Self::linear_index(x, y, s)
            ),
            TensorStorageType::Texture2D => format!(
                "write_image{suffix}(image2d, (int2)(({x}), ({y}) * slices + ({s})), {value})"
            ),
        })
    }
}
