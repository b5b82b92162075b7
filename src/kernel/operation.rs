//! A selected kernel: template, arguments, linking state and device handles.
//!
//! Lifecycle of a [`GpuOperation`]:
//!
//! ```text
//! selector ──▶ add_operation(linked)* ──▶ set_src/set_dst ──▶ compile ──▶ update_params ──▶ add_to_queue
//! ```
//!
//! Element-wise operations carry only a snippet operating on `in_out_value`;
//! [`GpuOperation::assemble_code`] wraps them into a full kernel. Linked
//! snippets are spliced in front of every `args.dst_tensor.Write(...)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::{CommandQueue, ComputeDevice, EventHandle, KernelHandle};
use crate::error::{CompileError, CompileResult};
use crate::kernel::arguments::Arguments;
use crate::kernel::object::{BoundObject, BoundTensor, ObjectDescriptor};
use crate::kernel::selector::rename_args;
use crate::kernel::tensor_desc::TensorDescriptor;
use crate::types::{AccessType, CalculationsPrecision, DataType, Dim3};

/// Entry point every kernel template defines.
pub const KERNEL_ENTRY_POINT: &str = "main_function";

/// Precision plus the descriptors of every source and destination tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDef {
    pub precision: CalculationsPrecision,
    pub src_tensors: Vec<TensorDescriptor>,
    pub dst_tensors: Vec<TensorDescriptor>,
}

impl OperationDef {
    pub fn data_type(&self) -> DataType {
        self.precision.storage_data_type()
    }

    pub fn is_batch_supported(&self) -> bool {
        self.src_tensors
            .iter()
            .chain(&self.dst_tensors)
            .any(|t| t.layout.has_batch())
    }

    pub(crate) fn src(&self, index: usize) -> CompileResult<&TensorDescriptor> {
        self.src_tensors.get(index).ok_or_else(|| CompileError::InvalidNode {
            node: "operation definition".into(),
            reason: format!("missing source tensor #{index}"),
        })
    }

    pub(crate) fn dst(&self, index: usize) -> CompileResult<&TensorDescriptor> {
        self.dst_tensors.get(index).ok_or_else(|| CompileError::InvalidNode {
            node: "operation definition".into(),
            reason: format!("missing destination tensor #{index}"),
        })
    }
}

/// How the dispatch grid derives from the first destination tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridOrigin {
    /// `(width * batch, height, slices)`
    WidthHeightSlices,
    /// `(width * batch, height, 1)`
    WidthHeight,
    /// One work item.
    Single,
}

#[derive(Debug)]
struct CompiledKernel {
    handle: KernelHandle,
    source: String,
}

/// One kernel with everything needed to compile, bind and dispatch it.
#[derive(Debug, Serialize, Deserialize)]
pub struct GpuOperation {
    definition: OperationDef,
    args: Arguments,
    code: String,
    kernel_name: String,
    elementwise: bool,
    linkable: bool,
    check_src_channels_size: bool,
    linkable_count: usize,
    elementwise_code: String,
    src_tensor_names: Vec<String>,
    dst_tensor_names: Vec<String>,
    grid_origin: GridOrigin,
    work_group_size: Dim3,
    assembled: bool,

    #[serde(skip)]
    src: Vec<Option<BoundTensor>>,
    #[serde(skip)]
    dst: Vec<Option<BoundTensor>>,
    #[serde(skip)]
    compiled: Option<CompiledKernel>,
    #[serde(skip)]
    grid_size: Dim3,
}

impl GpuOperation {
    /// Operation with a full kernel template (`code` must contain `$0`).
    pub fn new(definition: OperationDef, kernel_name: &str, code: String) -> Self {
        Self {
            definition,
            args: Arguments::new(),
            code,
            kernel_name: kernel_name.to_string(),
            elementwise: false,
            linkable: false,
            check_src_channels_size: false,
            linkable_count: 0,
            elementwise_code: String::new(),
            src_tensor_names: Vec::new(),
            dst_tensor_names: Vec::new(),
            grid_origin: GridOrigin::WidthHeightSlices,
            work_group_size: Dim3::new(8, 4, 1),
            assembled: false,
            src: Vec::new(),
            dst: Vec::new(),
            compiled: None,
            grid_size: Dim3::default(),
        }
    }

    /// Element-wise operation whose `snippet` transforms `in_out_value` at
    /// `(X_COORD, Y_COORD, S_COORD)`. The first source and the destination are
    /// implicit; further sources are added with [`GpuOperation::add_src_tensor`].
    pub fn elementwise(definition: OperationDef, kernel_name: &str, snippet: String) -> Self {
        Self {
            elementwise: true,
            linkable: true,
            ..Self::new(definition, kernel_name, snippet)
        }
    }

    // ── Accessors ──

    pub fn definition(&self) -> &OperationDef {
        &self.definition
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Arguments {
        &mut self.args
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn is_linkable(&self) -> bool {
        self.linkable
    }

    pub fn is_elementwise(&self) -> bool {
        self.elementwise
    }

    /// Number of operations linked into this one.
    pub fn linked_count(&self) -> usize {
        self.linkable_count
    }

    pub fn set_linkable(&mut self, linkable: bool) {
        self.linkable = linkable;
    }

    pub fn set_check_src_channels_size(&mut self, check: bool) {
        self.check_src_channels_size = check;
    }

    pub fn set_grid_origin(&mut self, origin: GridOrigin) {
        self.grid_origin = origin;
    }

    pub fn set_work_group_size(&mut self, size: Dim3) {
        self.work_group_size = size;
    }

    pub fn work_group_size(&self) -> Dim3 {
        self.work_group_size
    }

    pub fn grid_size(&self) -> Dim3 {
        self.grid_size
    }

    pub fn kernel(&self) -> Option<KernelHandle> {
        self.compiled.as_ref().map(|k| k.handle)
    }

    /// Final source, available after [`GpuOperation::compile`].
    pub fn source(&self) -> Option<&str> {
        self.compiled.as_ref().map(|k| k.source.as_str())
    }

    pub fn src_tensor_names(&self) -> &[String] {
        &self.src_tensor_names
    }

    // ── Tensors ──

    pub fn add_src_tensor(&mut self, name: &str, desc: TensorDescriptor) {
        self.src_tensor_names.push(name.to_string());
        self.args
            .add_object_ref(name, AccessType::Read, ObjectDescriptor::Tensor(desc));
    }

    pub fn add_dst_tensor(&mut self, name: &str, desc: TensorDescriptor) {
        self.dst_tensor_names.push(name.to_string());
        self.args
            .add_object_ref(name, AccessType::Write, ObjectDescriptor::Tensor(desc));
    }

    pub fn set_src(&mut self, tensor: BoundTensor, index: usize) {
        if self.src.len() <= index {
            self.src.resize(index + 1, None);
        }
        self.src[index] = Some(tensor);
    }

    pub fn set_dst(&mut self, tensor: BoundTensor, index: usize) {
        if self.dst.len() <= index {
            self.dst.resize(index + 1, None);
        }
        self.dst[index] = Some(tensor);
    }

    // ── Linking ──

    /// Absorb a linkable operation that consumes this operation's output.
    ///
    /// The absorbed operation's names get a `_linkN` postfix; its sources
    /// beyond the first (which is this operation's output) are appended.
    pub fn add_operation(&mut self, mut other: GpuOperation) -> CompileResult<()> {
        if !other.linkable || !other.elementwise {
            return Err(CompileError::InvalidNode {
                node: other.kernel_name.clone(),
                reason: "only linkable element-wise operations can be absorbed".into(),
            });
        }
        self.linkable_count += 1;
        let postfix = format!("_link{}", self.linkable_count);

        let mut code = other.code.clone();
        if !other.elementwise_code.is_empty() {
            code.push('\n');
            code.push_str(&other.elementwise_code);
        }
        let code = rename_args(&code, &postfix);
        self.elementwise_code.push_str(&format!("{{\n{code}\n}}\n"));

        let other_args = std::mem::take(&mut other.args);
        self.args.merge(other_args, &postfix)?;
        for (i, name) in other.src_tensor_names.iter().enumerate() {
            let desc = other.definition.src(i + 1)?.clone();
            self.definition.src_tensors.push(desc);
            self.src_tensor_names.push(format!("{name}{postfix}"));
        }
        for name in &other.dst_tensor_names {
            self.dst_tensor_names.push(format!("{name}{postfix}"));
        }
        self.kernel_name = format!("{}+{}", self.kernel_name, other.kernel_name);
        Ok(())
    }

    /// Wrap an element-wise snippet into a full kernel (runs once).
    pub fn assemble_code(&mut self) -> CompileResult<()> {
        if self.assembled {
            return Ok(());
        }
        self.assembled = true;
        if !self.elementwise {
            return Ok(());
        }
        let src = self.definition.src(0)?.clone();
        let dst = self.definition.dst(0)?.clone();
        self.src_tensor_names.insert(0, "src_tensor".into());
        self.args
            .add_object_ref("src_tensor", AccessType::Read, ObjectDescriptor::Tensor(src));
        self.dst_tensor_names.insert(0, "dst_tensor".into());
        self.args
            .add_object_ref("dst_tensor", AccessType::Write, ObjectDescriptor::Tensor(dst));
        self.elementwise_code = format!("{{\n{}\n}}\n{}", self.code, self.elementwise_code);
        self.code = elementwise_template(self.check_src_channels_size);
        Ok(())
    }

    // ── Device ──

    /// Assemble, resolve and compile the kernel on `device`.
    pub fn compile(&mut self, device: &mut dyn ComputeDevice) -> CompileResult<()> {
        self.assemble_code()?;
        self.args.allocate_objects(device)?;

        let mut linkables = BTreeMap::new();
        if !self.elementwise_code.is_empty() {
            if !self.code.contains("args.dst_tensor.Write(") {
                return Err(CompileError::InvalidTemplate(format!(
                    "kernel '{}' has linked code but never writes dst_tensor",
                    self.kernel_name
                )));
            }
            linkables.insert("dst_tensor".to_string(), self.elementwise_code.clone());
        }
        let body = self
            .args
            .transform_to_code(device.info(), &linkables, &self.code)?;
        let source = format!("{}{}", self.definition.precision.common_defines(), body);
        let handle = device.compile_kernel(&source, KERNEL_ENTRY_POINT)?;
        log::debug!(
            "compiled kernel '{}' ({} bytes of source)",
            self.kernel_name,
            source.len()
        );
        self.compiled = Some(CompiledKernel { handle, source });
        Ok(())
    }

    /// Push bound tensors into the argument table and bind every kernel
    /// argument on the device.
    pub fn update_params(&mut self, device: &mut dyn ComputeDevice) -> CompileResult<()> {
        let handle = self.kernel().ok_or_else(|| CompileError::InvalidNode {
            node: self.kernel_name.clone(),
            reason: "kernel is not compiled".into(),
        })?;
        for (names, tensors) in [
            (&self.src_tensor_names, &self.src),
            (&self.dst_tensor_names, &self.dst),
        ] {
            for (i, name) in names.iter().enumerate() {
                let tensor = tensors.get(i).and_then(Option::as_ref).ok_or_else(|| {
                    CompileError::InvalidNode {
                        node: self.kernel_name.clone(),
                        reason: format!("tensor '{name}' is not bound"),
                    }
                })?;
                self.args
                    .set_object_ref(name, &BoundObject::Tensor(tensor.clone()))?;
            }
        }

        let dst = self
            .dst
            .first()
            .and_then(Option::as_ref)
            .ok_or_else(|| CompileError::InvalidNode {
                node: self.kernel_name.clone(),
                reason: "no destination tensor bound".into(),
            })?;
        let width = u32::try_from(dst.shape.w * dst.shape.b).unwrap_or(u32::MAX);
        let height = u32::try_from(dst.shape.h).unwrap_or(u32::MAX);
        let slices = u32::try_from(dst.shape.slices()).unwrap_or(u32::MAX);
        self.grid_size = match self.grid_origin {
            GridOrigin::WidthHeightSlices => Dim3::new(width, height, slices),
            GridOrigin::WidthHeight => Dim3::new(width, height, 1),
            GridOrigin::Single => Dim3::new(1, 1, 1),
        };

        device.set_kernel_args(handle, &self.args.kernel_args()?)?;
        Ok(())
    }

    pub fn add_to_queue(&self, queue: &mut dyn CommandQueue) -> CompileResult<EventHandle> {
        let handle = self.kernel().ok_or_else(|| CompileError::InvalidNode {
            node: self.kernel_name.clone(),
            reason: "kernel is not compiled".into(),
        })?;
        let groups = self.work_group_size.groups_to_cover(self.grid_size);
        Ok(queue.dispatch(handle, groups, self.work_group_size)?)
    }
}

fn elementwise_template(check_src_channels_size: bool) -> String {
    let mut c = String::new();
    c.push_str("__kernel void main_function(\n$0) {\n");
    c.push_str("  int X = get_global_id(0);\n");
    c.push_str("  int Y = get_global_id(1);\n");
    c.push_str("  int Z = get_global_id(2);\n");
    c.push_str(
        "  if (X >= args.dst_tensor.Width() || Y >= args.dst_tensor.Height() || Z >= args.dst_tensor.Slices()) return;\n",
    );
    if check_src_channels_size {
        c.push_str("  FLT4 src = (FLT4)(0.0f);\n");
        c.push_str("  if (Z < args.src_tensor.Slices()) {\n");
        c.push_str("    src = args.src_tensor.Read(X, Y, Z);\n");
        c.push_str("  }\n");
    } else {
        c.push_str("  FLT4 src = args.src_tensor.Read(X, Y, Z);\n");
    }
    c.push_str("  args.dst_tensor.Write(src, X, Y, Z);\n");
    c.push_str("}\n");
    c
}
