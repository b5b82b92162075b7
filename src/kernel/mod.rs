//! Kernel templates and their argument machinery.
//!
//! - [`selector`]: lexical helpers for `args.` references in templates
//! - [`object`] / [`tensor_desc`]: objects a template can address and the
//!   selectors they support
//! - [`arguments`]: the per-kernel symbol table and template resolver
//! - [`operation`]: a selected kernel (template + arguments + linking state)

pub mod arguments;
pub mod object;
pub mod operation;
pub mod selector;
pub mod tensor_desc;

pub use arguments::Arguments;
pub use object::{BoundObject, BoundTensor, BufferDescriptor, ObjectDescriptor};
pub use operation::{GpuOperation, GridOrigin, OperationDef};
pub use tensor_desc::TensorDescriptor;
