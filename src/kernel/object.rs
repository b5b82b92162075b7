//! GPU object descriptors and the resources they expand into.
//!
//! A kernel refers to high-level objects (tensors, constant buffers) by name.
//! Before a template is resolved, each object is expanded into plain kernel
//! resources (`<object>_<member>` ints, floats, buffers, images) described by
//! [`GpuResources`]; binding fills them with [`GpuResourcesWithValue`].

use serde::{Deserialize, Serialize};

use crate::device::MemoryHandle;
use crate::error::{CompileError, CompileResult};
use crate::kernel::tensor_desc::TensorDescriptor;
use crate::types::{AccessType, Bhwc, DataType};

// ── Plain resources ────────────────────────────────────────────────

/// Address space of a buffer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    Global,
    Constant,
}

/// Buffer parameter of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuBufferDescriptor {
    pub data_type: DataType,
    /// Vector width of one element (4 for `float4*`).
    pub element_size: usize,
    pub memory_type: MemoryType,
    pub access: AccessType,
}

impl GpuBufferDescriptor {
    pub fn declaration(&self, name: &str) -> String {
        let space = match self.memory_type {
            MemoryType::Global => "__global",
            MemoryType::Constant => "__constant",
        };
        format!(
            "{space} {}* {name}",
            self.data_type.kernel_type(self.element_size)
        )
    }
}

/// Image parameter of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuImageDescriptor {
    pub data_type: DataType,
    pub access: AccessType,
}

/// Plain resources an object expands into, keyed by member name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuResources {
    pub ints: Vec<String>,
    pub floats: Vec<String>,
    pub buffers: Vec<(String, GpuBufferDescriptor)>,
    pub image_buffers: Vec<(String, GpuImageDescriptor)>,
    pub images2d: Vec<(String, GpuImageDescriptor)>,
}

impl GpuResources {
    /// Every member name, used to rewrite selector output.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        names.extend(self.ints.iter().map(String::as_str));
        names.extend(self.floats.iter().map(String::as_str));
        names.extend(self.buffers.iter().map(|(n, _)| n.as_str()));
        names.extend(self.image_buffers.iter().map(|(n, _)| n.as_str()));
        names.extend(self.images2d.iter().map(|(n, _)| n.as_str()));
        names
    }
}

/// Values for the members declared by [`GpuResources`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuResourcesWithValue {
    pub ints: Vec<(String, i32)>,
    pub floats: Vec<(String, f32)>,
    pub buffers: Vec<(String, MemoryHandle)>,
    pub image_buffers: Vec<(String, MemoryHandle)>,
    pub images2d: Vec<(String, MemoryHandle)>,
}

// ── Constant buffers ───────────────────────────────────────────────

/// Read-only buffer owned by an operation (weights, biases, per-channel
/// constants). The data is uploaded when the kernel is compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub data_type: DataType,
    pub element_size: usize,
    pub memory_type: MemoryType,
    /// Number of vector elements.
    pub elements: usize,
    pub data: Vec<u8>,
}

impl BufferDescriptor {
    fn resources(&self, access: AccessType) -> GpuResources {
        GpuResources {
            ints: vec!["length".into()],
            buffers: vec![(
                "buffer".into(),
                GpuBufferDescriptor {
                    data_type: self.data_type,
                    element_size: self.element_size,
                    memory_type: self.memory_type,
                    access,
                },
            )],
            ..GpuResources::default()
        }
    }

    fn perform_selector(&self, selector: &str, args: &[String]) -> CompileResult<String> {
        match selector {
            "Read" => {
                expect_arity(selector, args, 1)?;
                Ok(format!("buffer[{}]", args[0]))
            }
            "GetPtr" => {
                expect_arity(selector, args, 0)?;
                Ok("buffer".into())
            }
            "Length" => {
                expect_arity(selector, args, 0)?;
                Ok("length".into())
            }
            _ => Err(CompileError::UnsupportedSelector {
                object: "buffer".into(),
                selector: selector.into(),
            }),
        }
    }
}

pub(crate) fn expect_arity(selector: &str, args: &[String], expected: usize) -> CompileResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(CompileError::SelectorArity {
            selector: selector.into(),
            expected,
            got: args.len(),
        })
    }
}

// ── Object descriptors ─────────────────────────────────────────────

/// Descriptor of a named kernel object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectDescriptor {
    Tensor(TensorDescriptor),
    Buffer(BufferDescriptor),
}

impl ObjectDescriptor {
    pub fn resources(&self, access: AccessType) -> GpuResources {
        match self {
            ObjectDescriptor::Tensor(t) => t.resources(access),
            ObjectDescriptor::Buffer(b) => b.resources(access),
        }
    }

    /// Expand `selector(args)` into code referring to member names.
    pub fn perform_selector(
        &self,
        selector: &str,
        args: &[String],
        template_args: &[String],
    ) -> CompileResult<String> {
        match self {
            ObjectDescriptor::Tensor(t) => t.perform_selector(selector, args, template_args),
            ObjectDescriptor::Buffer(b) => b.perform_selector(selector, args),
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorDescriptor> {
        match self {
            ObjectDescriptor::Tensor(t) => Some(t),
            ObjectDescriptor::Buffer(_) => None,
        }
    }
}

// ── Bound objects ──────────────────────────────────────────────────

/// A tensor backed by device memory.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundTensor {
    pub memory: MemoryHandle,
    pub shape: Bhwc,
    pub descriptor: TensorDescriptor,
}

/// A device object bound to a named kernel object.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundObject {
    Tensor(BoundTensor),
    Buffer { memory: MemoryHandle, elements: usize },
}

impl BoundObject {
    /// Resource values for `descriptor`, failing when the bound object is of
    /// a different kind or storage than the kernel expects.
    pub fn resource_values(
        &self,
        object: &str,
        descriptor: &ObjectDescriptor,
    ) -> CompileResult<GpuResourcesWithValue> {
        match (self, descriptor) {
            (BoundObject::Tensor(bound), ObjectDescriptor::Tensor(desc)) => {
                if bound.descriptor.storage_type != desc.storage_type
                    || bound.descriptor.data_type != desc.data_type
                {
                    return Err(CompileError::ObjectMismatch {
                        object: object.into(),
                        reason: format!(
                            "kernel expects {:?}/{:?}, bound tensor is {:?}/{:?}",
                            desc.storage_type,
                            desc.data_type,
                            bound.descriptor.storage_type,
                            bound.descriptor.data_type
                        ),
                    });
                }
                Ok(desc.resource_values(bound))
            }
            (BoundObject::Buffer { memory, elements }, ObjectDescriptor::Buffer(_)) => {
                Ok(GpuResourcesWithValue {
                    ints: vec![("length".into(), to_i32(*elements))],
                    buffers: vec![("buffer".into(), *memory)],
                    ..GpuResourcesWithValue::default()
                })
            }
            _ => Err(CompileError::ObjectMismatch {
                object: object.into(),
                reason: "bound object kind differs from its descriptor".into(),
            }),
        }
    }
}

/// Kernel int arguments are 32-bit; shapes never approach the limit.
pub(crate) fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Layout, TensorStorageType};

    fn constant_buffer() -> ObjectDescriptor {
        ObjectDescriptor::Buffer(BufferDescriptor {
            data_type: DataType::Float32,
            element_size: 4,
            memory_type: MemoryType::Constant,
            elements: 2,
            data: vec![0; 32],
        })
    }

    #[test]
    fn test_buffer_declaration() {
        let desc = GpuBufferDescriptor {
            data_type: DataType::Float16,
            element_size: 4,
            memory_type: MemoryType::Global,
            access: AccessType::Read,
        };
        assert_eq!(desc.declaration("w"), "__global half4* w");
    }

    #[test]
    fn test_buffer_selectors() {
        let desc = constant_buffer();
        assert_eq!(
            desc.perform_selector("Read", &["S".into()], &[]).unwrap(),
            "buffer[S]"
        );
        assert!(matches!(
            desc.perform_selector("Read", &[], &[]),
            Err(CompileError::SelectorArity { expected: 1, got: 0, .. })
        ));
        assert!(desc.perform_selector("Write", &[], &[]).is_err());
        assert_eq!(desc.resources(AccessType::Read).names(), vec!["length", "buffer"]);
    }

    #[test]
    fn test_bound_kind_mismatch() {
        let tensor_desc = ObjectDescriptor::Tensor(TensorDescriptor::new(
            DataType::Float32,
            TensorStorageType::Buffer,
            Layout::Hwc,
        ));
        let bound = BoundObject::Buffer {
            memory: MemoryHandle(1),
            elements: 2,
        };
        assert!(bound.resource_values("src", &tensor_desc).is_err());
        assert!(bound.resource_values("w", &constant_buffer()).is_ok());
    }

    #[test]
    fn test_bound_storage_mismatch() {
        let desc = TensorDescriptor::new(DataType::Float32, TensorStorageType::Texture2D, Layout::Hwc);
        let bound = BoundObject::Tensor(BoundTensor {
            memory: MemoryHandle(4),
            shape: Bhwc::new(1, 2, 2, 4),
            descriptor: TensorDescriptor::new(
                DataType::Float32,
                TensorStorageType::Buffer,
                Layout::Hwc,
            ),
        });
        let err = bound
            .resource_values("src_tensor", &ObjectDescriptor::Tensor(desc))
            .unwrap_err();
        assert!(matches!(err, CompileError::ObjectMismatch { .. }));
    }
}
