//! Kernel argument table and the template resolver.
//!
//! An [`Arguments`] table holds every name a kernel template may reference
//! through `args.`:
//!
//! - scalars (`int`, `float`, `half`), packed on demand into shared 4-wide
//!   pools (`shared_int4_0.x`, `shared_float4_1.z`, ...);
//! - plain buffers and images, passed as kernel parameters;
//! - object references (tensors bound per dispatch) and owned objects
//!   (constant buffers uploaded with the kernel).
//!
//! [`Arguments::transform_to_code`] turns a template into final source:
//!
//! ```text
//! template ──▶ expand objects ──▶ selector pass ──▶ args pass ──▶ `$0` ──▶ source
//!              (object_member)    (Read/Write/..)   (pool slots)  (params)
//! ```
//!
//! Both passes are cursor-based and build a fresh buffer. The selector pass is
//! idempotent on its own output: it only leaves bare `args.name` markers
//! behind, which it copies through untouched.

use std::collections::BTreeMap;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::device::{ComputeDevice, DeviceInfo, KernelArg, MemoryHandle};
use crate::error::{CompileError, CompileResult};
use crate::kernel::object::{
    BoundObject, GpuBufferDescriptor, GpuImageDescriptor, GpuResources, GpuResourcesWithValue,
    ObjectDescriptor,
};
use crate::kernel::selector::{
    parse_marker, replace_all_words, starts_token, Marker, SelectorCall, ARGS_PREFIX,
};
use crate::types::AccessType;

/// Placeholder in a kernel template replaced by the parameter list.
pub const PARAMETERS_PLACEHOLDER: &str = "$0";

const COMPONENTS: [char; 4] = ['x', 'y', 'z', 'w'];

fn slot_name(pool: &str, offset: usize) -> String {
    format!("{pool}_{}.{}", offset / 4, COMPONENTS[offset % 4])
}

// ── Table entries ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScalarValue<T> {
    value: T,
    #[serde(skip)]
    active: bool,
    #[serde(skip)]
    offset: usize,
}

impl<T> ScalarValue<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            active: false,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HalfValue {
    value: f16,
    #[serde(skip)]
    active: bool,
    /// Hosted in the float pool on devices without half-vector arguments.
    #[serde(skip)]
    store_as_f32: bool,
    #[serde(skip)]
    offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BufferArg {
    desc: GpuBufferDescriptor,
    #[serde(skip)]
    memory: Option<MemoryHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageArg {
    desc: GpuImageDescriptor,
    #[serde(skip)]
    memory: Option<MemoryHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectRefArg {
    access: AccessType,
    descriptor: ObjectDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnedObjectArg {
    descriptor: ObjectDescriptor,
    #[serde(skip)]
    object: Option<BoundObject>,
}

/// Symbol table of one kernel.
///
/// All maps are ordered, so the parameter list and the binding order are
/// identical on every rebuild from the same template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Arguments {
    int_values: BTreeMap<String, ScalarValue<i32>>,
    float_values: BTreeMap<String, ScalarValue<f32>>,
    half_values: BTreeMap<String, HalfValue>,
    #[serde(skip)]
    shared_int4s: Vec<i32>,
    #[serde(skip)]
    shared_float4s: Vec<f32>,
    #[serde(skip)]
    shared_half4s: Vec<f16>,

    buffers: BTreeMap<String, BufferArg>,
    image_buffers: BTreeMap<String, ImageArg>,
    images2d: BTreeMap<String, ImageArg>,

    object_refs: BTreeMap<String, ObjectRefArg>,
    objects: BTreeMap<String, OwnedObjectArg>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Declaration ──

    pub fn add_int(&mut self, name: &str, value: i32) {
        self.int_values.insert(name.to_string(), ScalarValue::new(value));
    }

    pub fn add_float(&mut self, name: &str, value: f32) {
        self.float_values.insert(name.to_string(), ScalarValue::new(value));
    }

    pub fn add_half(&mut self, name: &str, value: f16) {
        self.half_values.insert(
            name.to_string(),
            HalfValue {
                value,
                active: false,
                store_as_f32: false,
                offset: 0,
            },
        );
    }

    pub fn add_buffer(&mut self, name: &str, desc: GpuBufferDescriptor) {
        self.buffers
            .insert(name.to_string(), BufferArg { desc, memory: None });
    }

    pub fn add_image_buffer(&mut self, name: &str, desc: GpuImageDescriptor) {
        self.image_buffers
            .insert(name.to_string(), ImageArg { desc, memory: None });
    }

    pub fn add_image2d(&mut self, name: &str, desc: GpuImageDescriptor) {
        self.images2d
            .insert(name.to_string(), ImageArg { desc, memory: None });
    }

    /// Object bound later, per dispatch (source and destination tensors).
    pub fn add_object_ref(&mut self, name: &str, access: AccessType, descriptor: ObjectDescriptor) {
        self.object_refs
            .insert(name.to_string(), ObjectRefArg { access, descriptor });
    }

    /// Object owned by the kernel and created on the device at compile time.
    pub fn add_object(&mut self, name: &str, descriptor: ObjectDescriptor) {
        self.objects.insert(
            name.to_string(),
            OwnedObjectArg {
                descriptor,
                object: None,
            },
        );
    }

    fn contains_name(&self, name: &str) -> bool {
        self.int_values.contains_key(name)
            || self.float_values.contains_key(name)
            || self.half_values.contains_key(name)
            || self.buffers.contains_key(name)
            || self.image_buffers.contains_key(name)
            || self.images2d.contains_key(name)
            || self.object_refs.contains_key(name)
            || self.objects.contains_key(name)
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.object_refs.contains_key(name) || self.objects.contains_key(name)
    }

    // ── Values ──

    pub fn set_int(&mut self, name: &str, value: i32) -> CompileResult<()> {
        let entry = self
            .int_values
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownArgument(name.to_string()))?;
        entry.value = value;
        if entry.active {
            self.shared_int4s[entry.offset] = value;
        }
        Ok(())
    }

    pub fn set_float(&mut self, name: &str, value: f32) -> CompileResult<()> {
        let entry = self
            .float_values
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownArgument(name.to_string()))?;
        entry.value = value;
        if entry.active {
            self.shared_float4s[entry.offset] = value;
        }
        Ok(())
    }

    pub fn set_half(&mut self, name: &str, value: f16) -> CompileResult<()> {
        let entry = self
            .half_values
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownArgument(name.to_string()))?;
        entry.value = value;
        if entry.active {
            if entry.store_as_f32 {
                self.shared_float4s[entry.offset] = value.to_f32();
            } else {
                self.shared_half4s[entry.offset] = value;
            }
        }
        Ok(())
    }

    pub fn set_buffer(&mut self, name: &str, memory: MemoryHandle) -> CompileResult<()> {
        let entry = self
            .buffers
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownArgument(name.to_string()))?;
        entry.memory = Some(memory);
        Ok(())
    }

    pub fn set_image_buffer(&mut self, name: &str, memory: MemoryHandle) -> CompileResult<()> {
        let entry = self
            .image_buffers
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownArgument(name.to_string()))?;
        entry.memory = Some(memory);
        Ok(())
    }

    pub fn set_image2d(&mut self, name: &str, memory: MemoryHandle) -> CompileResult<()> {
        let entry = self
            .images2d
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownArgument(name.to_string()))?;
        entry.memory = Some(memory);
        Ok(())
    }

    /// Bind a device object to the object reference `name`.
    pub fn set_object_ref(&mut self, name: &str, object: &BoundObject) -> CompileResult<()> {
        let entry = self
            .object_refs
            .get(name)
            .ok_or_else(|| CompileError::UnknownObject(name.to_string()))?;
        let values = object.resource_values(name, &entry.descriptor)?;
        self.set_gpu_resources(name, &values)
    }

    /// Declare `<object>_<member>` entries. Members declared by an earlier
    /// expansion keep their values and bound memory.
    fn add_gpu_resources(&mut self, name: &str, resources: &GpuResources) {
        for member in &resources.ints {
            self.int_values
                .entry(format!("{name}_{member}"))
                .or_insert_with(|| ScalarValue::new(0));
        }
        for member in &resources.floats {
            self.float_values
                .entry(format!("{name}_{member}"))
                .or_insert_with(|| ScalarValue::new(0.0));
        }
        for (member, desc) in &resources.buffers {
            self.buffers
                .entry(format!("{name}_{member}"))
                .or_insert_with(|| BufferArg {
                    desc: desc.clone(),
                    memory: None,
                });
        }
        for (member, desc) in &resources.image_buffers {
            self.image_buffers
                .entry(format!("{name}_{member}"))
                .or_insert_with(|| ImageArg {
                    desc: desc.clone(),
                    memory: None,
                });
        }
        for (member, desc) in &resources.images2d {
            self.images2d
                .entry(format!("{name}_{member}"))
                .or_insert_with(|| ImageArg {
                    desc: desc.clone(),
                    memory: None,
                });
        }
    }

    /// Empty the scalar pools so the next args pass assigns slots from zero.
    fn reset_pools(&mut self) {
        self.shared_int4s.clear();
        self.shared_float4s.clear();
        self.shared_half4s.clear();
        for entry in self.int_values.values_mut() {
            entry.active = false;
        }
        for entry in self.float_values.values_mut() {
            entry.active = false;
        }
        for entry in self.half_values.values_mut() {
            entry.active = false;
            entry.store_as_f32 = false;
        }
    }

    fn set_gpu_resources(&mut self, name: &str, values: &GpuResourcesWithValue) -> CompileResult<()> {
        for (member, value) in &values.ints {
            self.set_int(&format!("{name}_{member}"), *value)?;
        }
        for (member, value) in &values.floats {
            self.set_float(&format!("{name}_{member}"), *value)?;
        }
        for (member, memory) in &values.buffers {
            self.set_buffer(&format!("{name}_{member}"), *memory)?;
        }
        for (member, memory) in &values.image_buffers {
            self.set_image_buffer(&format!("{name}_{member}"), *memory)?;
        }
        for (member, memory) in &values.images2d {
            self.set_image2d(&format!("{name}_{member}"), *memory)?;
        }
        Ok(())
    }

    /// Create every owned object on the device (idempotent).
    pub fn allocate_objects(&mut self, device: &mut dyn ComputeDevice) -> CompileResult<()> {
        for (name, entry) in self.objects.iter_mut() {
            if entry.object.is_some() {
                continue;
            }
            match &entry.descriptor {
                ObjectDescriptor::Buffer(buffer) => {
                    let memory = device.create_buffer_with_data(&buffer.data)?;
                    entry.object = Some(BoundObject::Buffer {
                        memory,
                        elements: buffer.elements,
                    });
                }
                ObjectDescriptor::Tensor(_) => {
                    return Err(CompileError::Unsupported(format!(
                        "owned tensor object '{name}'"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Expand every object into `<object>_<member>` resources.
    ///
    /// Owned objects must already exist on the device; their values are
    /// filled in immediately. Object references get placeholder values until
    /// [`Arguments::set_object_ref`] binds them.
    fn add_object_args(&mut self) -> CompileResult<()> {
        let owned: Vec<(String, ObjectDescriptor, Option<BoundObject>)> = self
            .objects
            .iter()
            .map(|(n, o)| (n.clone(), o.descriptor.clone(), o.object.clone()))
            .collect();
        for (name, descriptor, object) in owned {
            self.add_gpu_resources(&name, &descriptor.resources(AccessType::Read));
            let object = object.ok_or_else(|| CompileError::ObjectMismatch {
                object: name.clone(),
                reason: "owned object was not created on the device".into(),
            })?;
            let values = object.resource_values(&name, &descriptor)?;
            self.set_gpu_resources(&name, &values)?;
        }

        let refs: Vec<(String, GpuResources)> = self
            .object_refs
            .iter()
            .map(|(n, r)| (n.clone(), r.descriptor.resources(r.access)))
            .collect();
        for (name, resources) in refs {
            self.add_gpu_resources(&name, &resources);
        }
        Ok(())
    }

    // ── Resolution ──

    /// Expand `args.object.Selector(...)` calls.
    ///
    /// `linkables` maps an object name to element-wise code that must run
    /// right before every `Write` into that object.
    pub fn resolve_selectors(
        &self,
        code: &str,
        linkables: &BTreeMap<String, String>,
    ) -> CompileResult<String> {
        let mut out = String::with_capacity(code.len());
        let mut pos = 0;
        while let Some(found) = code[pos..].find(ARGS_PREFIX).map(|p| p + pos) {
            out.push_str(&code[pos..found]);
            if !starts_token(code, found) {
                out.push_str(ARGS_PREFIX);
                pos = found + ARGS_PREFIX.len();
                continue;
            }
            match parse_marker(code, found)? {
                Marker::Bare { end, .. } => {
                    out.push_str(&code[found..end]);
                    pos = end;
                }
                Marker::Call(mut call) => {
                    let no_links = BTreeMap::new();
                    for arg in call.args.iter_mut() {
                        *arg = self.resolve_selectors(arg, &no_links)?;
                    }
                    out.push_str(&self.resolve_selector(linkables, &call)?);
                    pos = call.end;
                }
            }
        }
        out.push_str(&code[pos..]);
        Ok(out)
    }

    fn object_descriptor(&self, name: &str) -> CompileResult<(&ObjectDescriptor, AccessType)> {
        if let Some(r) = self.object_refs.get(name) {
            Ok((&r.descriptor, r.access))
        } else if let Some(o) = self.objects.get(name) {
            Ok((&o.descriptor, AccessType::Read))
        } else {
            Err(CompileError::UnknownObject(name.to_string()))
        }
    }

    fn resolve_selector(
        &self,
        linkables: &BTreeMap<String, String>,
        call: &SelectorCall,
    ) -> CompileResult<String> {
        let (descriptor, access) = self.object_descriptor(&call.object)?;
        let resources = descriptor.resources(access);
        let names = resources.names();

        let mut result = String::new();
        let linked = linkables
            .get(&call.object)
            .filter(|code| call.selector == "Write" && !code.is_empty());
        if let Some(linked_code) = linked {
            if !access.can_write() {
                return Err(CompileError::InvalidTemplate(format!(
                    "linked write into read-only object '{}'",
                    call.object
                )));
            }
            let tensor = descriptor
                .as_tensor()
                .ok_or_else(|| CompileError::UnsupportedSelector {
                    object: call.object.clone(),
                    selector: call.selector.clone(),
                })?;
            let ctx = tensor.write_linking_context(&call.args)?;
            let x_coord = resolve_object_names(&call.object, &names, &ctx.x_coord);
            let mut code = replace_all_words(linked_code, "in_out_value", &ctx.var_name);
            code = replace_all_words(&code, "X_COORD", &x_coord);
            code = replace_all_words(&code, "Y_COORD", &ctx.y_coord);
            code = replace_all_words(&code, "S_COORD", &ctx.s_coord);
            result = self.resolve_selectors(&code, &BTreeMap::new())?;
        }

        let patch = descriptor.perform_selector(&call.selector, &call.args, &call.template_args)?;
        result.push_str(&resolve_object_names(&call.object, &names, &patch));
        Ok(result)
    }

    /// Activate a scalar into its pool slot and return the expression that
    /// reads it. Activating the same name again returns the same slot.
    pub fn activate(&mut self, name: &str, device_info: &DeviceInfo) -> CompileResult<String> {
        if let Some(entry) = self.int_values.get_mut(name) {
            if !entry.active {
                entry.active = true;
                entry.offset = self.shared_int4s.len();
                self.shared_int4s.push(entry.value);
            }
            return Ok(slot_name("shared_int4", entry.offset));
        }
        if let Some(entry) = self.float_values.get_mut(name) {
            if !entry.active {
                entry.active = true;
                entry.offset = self.shared_float4s.len();
                self.shared_float4s.push(entry.value);
            }
            return Ok(slot_name("shared_float4", entry.offset));
        }
        if let Some(entry) = self.half_values.get_mut(name) {
            if !entry.active {
                entry.active = true;
                if device_info.rehost_half_args_to_float() {
                    entry.store_as_f32 = true;
                    entry.offset = self.shared_float4s.len();
                    self.shared_float4s.push(entry.value.to_f32());
                } else {
                    entry.offset = self.shared_half4s.len();
                    self.shared_half4s.push(entry.value);
                }
            }
            return Ok(if entry.store_as_f32 {
                format!("(half)({})", slot_name("shared_float4", entry.offset))
            } else {
                slot_name("shared_half4", entry.offset)
            });
        }
        if self.buffers.contains_key(name)
            || self.image_buffers.contains_key(name)
            || self.images2d.contains_key(name)
        {
            return Ok(name.to_string());
        }
        Err(CompileError::UnknownArgument(name.to_string()))
    }

    /// Replace every bare `args.name` with its parameter or pool slot.
    pub fn resolve_args(&mut self, code: &str, device_info: &DeviceInfo) -> CompileResult<String> {
        let mut out = String::with_capacity(code.len());
        let mut pos = 0;
        while let Some(found) = code[pos..].find(ARGS_PREFIX).map(|p| p + pos) {
            out.push_str(&code[pos..found]);
            if !starts_token(code, found) {
                out.push_str(ARGS_PREFIX);
                pos = found + ARGS_PREFIX.len();
                continue;
            }
            match parse_marker(code, found)? {
                Marker::Bare { name, end } => {
                    out.push_str(&self.activate(&name, device_info)?);
                    pos = end;
                }
                Marker::Call(call) => {
                    return Err(CompileError::MalformedSelector {
                        position: found,
                        reason: format!(
                            "unresolved selector '{}.{}'",
                            call.object, call.selector
                        ),
                    })
                }
            }
        }
        out.push_str(&code[pos..]);
        pad_to_vec4(&mut self.shared_int4s, 0);
        pad_to_vec4(&mut self.shared_float4s, 0.0);
        pad_to_vec4(&mut self.shared_half4s, f16::ZERO);
        Ok(out)
    }

    /// Final kernel source for `template`.
    pub fn transform_to_code(
        &mut self,
        device_info: &DeviceInfo,
        linkables: &BTreeMap<String, String>,
        template: &str,
    ) -> CompileResult<String> {
        if !template.contains(PARAMETERS_PLACEHOLDER) {
            return Err(CompileError::InvalidTemplate(format!(
                "missing parameter placeholder '{PARAMETERS_PLACEHOLDER}'"
            )));
        }
        self.reset_pools();
        self.add_object_args()?;
        let code = self.resolve_selectors(template, linkables)?;
        let code = self.resolve_args(&code, device_info)?;
        let code = code.replacen(PARAMETERS_PLACEHOLDER, &self.parameter_list(), 1);
        Ok(default_samplers(device_info) + &code)
    }

    /// Kernel parameter declarations in binding order.
    pub fn parameter_list(&self) -> String {
        let mut params: Vec<String> = Vec::new();
        for (name, arg) in &self.buffers {
            params.push(arg.desc.declaration(name));
        }
        for (name, arg) in &self.image_buffers {
            params.push(format!(
                "{} image1d_buffer_t {name}",
                arg.desc.access.image_qualifier()
            ));
        }
        for (name, arg) in &self.images2d {
            params.push(format!(
                "{} image2d_t {name}",
                arg.desc.access.image_qualifier()
            ));
        }
        for i in 0..self.shared_int4s.len() / 4 {
            params.push(format!("int4 shared_int4_{i}"));
        }
        for i in 0..self.shared_float4s.len() / 4 {
            params.push(format!("float4 shared_float4_{i}"));
        }
        for i in 0..self.shared_half4s.len() / 4 {
            params.push(format!("half4 shared_half4_{i}"));
        }
        params
            .iter()
            .map(|p| format!("  {p}"))
            .collect::<Vec<_>>()
            .join(",\n")
    }

    /// Values for every declared parameter, in declaration order.
    pub fn kernel_args(&self) -> CompileResult<Vec<KernelArg>> {
        let mut args = Vec::new();
        let memories = self
            .buffers
            .iter()
            .map(|(n, a)| (n, a.memory))
            .chain(self.image_buffers.iter().map(|(n, a)| (n, a.memory)))
            .chain(self.images2d.iter().map(|(n, a)| (n, a.memory)));
        for (name, memory) in memories {
            let memory = memory.ok_or_else(|| CompileError::UnboundArgument(name.clone()))?;
            args.push(KernelArg::Memory(memory));
        }
        for chunk in self.shared_int4s.chunks_exact(4) {
            args.push(KernelArg::Int4([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        for chunk in self.shared_float4s.chunks_exact(4) {
            args.push(KernelArg::Float4([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        for chunk in self.shared_half4s.chunks_exact(4) {
            args.push(KernelArg::Half4([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(args)
    }

    /// Number of scalar slots activated so far, over all pools.
    pub fn active_scalar_count(&self) -> usize {
        self.int_values.values().filter(|v| v.active).count()
            + self.float_values.values().filter(|v| v.active).count()
            + self.half_values.values().filter(|v| v.active).count()
    }

    // ── Linking ──

    /// Move every entry of `other` into `self`, suffixing names with
    /// `postfix`. Fails on the first name already present.
    pub fn merge(&mut self, other: Arguments, postfix: &str) -> CompileResult<()> {
        let renamed = |name: String| format!("{name}{postfix}");
        let check = |this: &Self, name: &str| -> CompileResult<()> {
            if this.contains_name(name) {
                Err(CompileError::DuplicateArgument(name.to_string()))
            } else {
                Ok(())
            }
        };

        for (name, value) in other.int_values {
            let name = renamed(name);
            check(self, &name)?;
            self.add_int(&name, value.value);
        }
        for (name, value) in other.float_values {
            let name = renamed(name);
            check(self, &name)?;
            self.add_float(&name, value.value);
        }
        for (name, value) in other.half_values {
            let name = renamed(name);
            check(self, &name)?;
            self.add_half(&name, value.value);
        }
        for (name, arg) in other.buffers {
            let name = renamed(name);
            check(self, &name)?;
            self.buffers.insert(name, arg);
        }
        for (name, arg) in other.image_buffers {
            let name = renamed(name);
            check(self, &name)?;
            self.image_buffers.insert(name, arg);
        }
        for (name, arg) in other.images2d {
            let name = renamed(name);
            check(self, &name)?;
            self.images2d.insert(name, arg);
        }
        for (name, arg) in other.object_refs {
            let name = renamed(name);
            check(self, &name)?;
            self.object_refs.insert(name, arg);
        }
        for (name, arg) in other.objects {
            let name = renamed(name);
            check(self, &name)?;
            self.objects.insert(name, arg);
        }
        Ok(())
    }
}

/// Rewrite member names in selector output to `args.<object>_<member>`.
fn resolve_object_names(object: &str, members: &[&str], code: &str) -> String {
    members.iter().fold(code.to_string(), |acc, member| {
        replace_all_words(&acc, member, &format!("{ARGS_PREFIX}{object}_{member}"))
    })
}

fn pad_to_vec4<T: Copy>(pool: &mut Vec<T>, zero: T) {
    let padded = pool.len().div_ceil(4) * 4;
    pool.resize(padded, zero);
}

/// Sampler declarations every kernel source starts with.
pub fn default_samplers(device_info: &DeviceInfo) -> String {
    let mut samplers = String::from(
        "__constant sampler_t smp_none = CLK_NORMALIZED_COORDS_FALSE | CLK_ADDRESS_NONE | CLK_FILTER_NEAREST;\n",
    );
    let address = if device_info.is_adreno3xx() {
        "CLK_ADDRESS_NONE"
    } else {
        "CLK_ADDRESS_CLAMP"
    };
    samplers.push_str(&format!(
        "__constant sampler_t smp_zero = CLK_NORMALIZED_COORDS_FALSE | {address} | CLK_FILTER_NEAREST;\n"
    ));
    samplers
}
