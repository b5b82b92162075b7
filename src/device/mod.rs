//! Compute-device abstraction.
//!
//! The compiler never talks to a driver directly. Allocation, kernel
//! compilation and argument binding go through [`ComputeDevice`]; dispatch and
//! synchronization go through [`CommandQueue`]. Handles are opaque ids owned
//! by the implementation.
//!
//! [`dry_run::DryRunDevice`] implements both traits without hardware.

pub mod dry_run;

use std::time::Duration;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::DeviceResult;
use crate::kernel::tensor_desc::TensorDescriptor;
use crate::types::{Bhwc, Dim3, TensorStorageType};

// ── Handles ────────────────────────────────────────────────────────

/// Device memory object (buffer, sub-buffer, image or image view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryHandle(pub u64);

/// Compiled kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelHandle(pub u64);

/// Queue event (dispatch completion or marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventHandle(pub u64);

/// One positional kernel argument, in binding order.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Memory(MemoryHandle),
    Int4([i32; 4]),
    Float4([f32; 4]),
    Half4([f16; 4]),
}

impl KernelArg {
    /// Raw little-endian payload for scalar vectors; `None` for memory objects.
    pub fn scalar_bytes(&self) -> Option<&[u8]> {
        match self {
            KernelArg::Memory(_) => None,
            KernelArg::Int4(v) => Some(bytemuck::cast_slice(&v[..])),
            KernelArg::Float4(v) => Some(bytemuck::cast_slice(&v[..])),
            KernelArg::Half4(v) => Some(bytemuck::cast_slice(&v[..])),
        }
    }
}

// ── Device capabilities ────────────────────────────────────────────

/// GPU vendor, used for vendor-specific kernel and queue decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuVendor {
    Adreno,
    Mali,
    PowerVr,
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

/// Static capabilities of the target device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: GpuVendor,
    /// Adreno generation (e.g. 3 for Adreno 3xx); 0 when unknown.
    #[serde(default)]
    pub adreno_generation: u32,
    pub supports_fp16: bool,
    pub supports_image_buffer: bool,
    pub supports_images: bool,
    pub max_image2d_width: usize,
    pub max_image2d_height: usize,
    pub max_work_group_size: Dim3,
}

impl DeviceInfo {
    /// Generic desktop-class device with images and fp16.
    pub fn generic(name: &str, vendor: GpuVendor) -> Self {
        Self {
            name: name.to_string(),
            vendor,
            adreno_generation: 0,
            supports_fp16: true,
            supports_image_buffer: true,
            supports_images: true,
            max_image2d_width: 16384,
            max_image2d_height: 16384,
            max_work_group_size: Dim3::new(1024, 1024, 64),
        }
    }

    pub fn adreno(generation: u32) -> Self {
        Self {
            adreno_generation: generation,
            max_work_group_size: Dim3::new(1024, 1024, 1024),
            ..Self::generic(&format!("Adreno {generation}xx"), GpuVendor::Adreno)
        }
    }

    pub fn is_adreno(&self) -> bool {
        self.vendor == GpuVendor::Adreno
    }

    pub fn is_adreno3xx(&self) -> bool {
        self.is_adreno() && self.adreno_generation == 3
    }

    pub fn is_mali(&self) -> bool {
        self.vendor == GpuVendor::Mali
    }

    pub fn is_powervr(&self) -> bool {
        self.vendor == GpuVendor::PowerVr
    }

    /// PowerVR drivers cannot address components of `half4` kernel
    /// arguments; half scalars are passed through the float pool instead.
    pub fn rehost_half_args_to_float(&self) -> bool {
        self.is_powervr()
    }

    /// Default storage type for intermediate tensors on this device.
    pub fn fastest_storage_type(&self) -> TensorStorageType {
        if !self.supports_images {
            return TensorStorageType::Buffer;
        }
        match self.vendor {
            GpuVendor::Adreno | GpuVendor::PowerVr | GpuVendor::Apple => {
                TensorStorageType::Texture2D
            }
            GpuVendor::Mali if self.supports_image_buffer => TensorStorageType::ImageBuffer,
            _ => TensorStorageType::Buffer,
        }
    }

    /// Whether a tensor of `shape` fits into a 2D image on this device.
    pub fn fits_texture2d(&self, shape: &Bhwc) -> bool {
        shape.w * shape.b * shape.d <= self.max_image2d_width
            && shape.h * shape.slices() <= self.max_image2d_height
    }
}

// ── Device traits ──────────────────────────────────────────────────

/// Allocation, kernel compilation and argument binding.
pub trait ComputeDevice {
    fn info(&self) -> &DeviceInfo;

    /// Uninitialized linear buffer.
    fn create_buffer(&mut self, size_bytes: usize) -> DeviceResult<MemoryHandle>;

    /// Read-only buffer initialized with `data`.
    fn create_buffer_with_data(&mut self, data: &[u8]) -> DeviceResult<MemoryHandle>;

    /// Dedicated tensor storage of `descriptor`'s storage type.
    fn create_tensor(
        &mut self,
        descriptor: &TensorDescriptor,
        shape: &Bhwc,
    ) -> DeviceResult<MemoryHandle>;

    /// Tensor view over `parent` starting at `offset_bytes`.
    fn create_tensor_view(
        &mut self,
        parent: MemoryHandle,
        offset_bytes: usize,
        descriptor: &TensorDescriptor,
        shape: &Bhwc,
    ) -> DeviceResult<MemoryHandle>;

    fn compile_kernel(&mut self, source: &str, entry_point: &str) -> DeviceResult<KernelHandle>;

    /// Bind all positional arguments of `kernel`.
    fn set_kernel_args(&mut self, kernel: KernelHandle, args: &[KernelArg]) -> DeviceResult<()>;
}

/// In-order command queue.
pub trait CommandQueue {
    fn dispatch(
        &mut self,
        kernel: KernelHandle,
        work_groups_count: Dim3,
        work_group_size: Dim3,
    ) -> DeviceResult<EventHandle>;

    /// Marker event that completes when all previously enqueued work starts.
    fn enqueue_marker(&mut self) -> DeviceResult<EventHandle>;

    fn wait_event(&mut self, event: EventHandle) -> DeviceResult<()>;

    fn flush(&mut self) -> DeviceResult<()>;

    /// Block until all enqueued work finished, or `timeout` elapsed.
    fn wait_for_completion(&mut self, timeout: Option<Duration>) -> DeviceResult<()>;
}
