//! Core value types shared by the compiler, the kernel resolver and devices.

use serde::{Deserialize, Serialize};

// ── Element types ──────────────────────────────────────────────────

/// Element type of a device tensor or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float16,
    Int32,
}

impl DataType {
    /// Size of one scalar element in bytes.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float16 => 2,
        }
    }

    /// Kernel-language type name for a vector of `width` elements.
    ///
    /// `width == 1` yields the scalar name (`float`, `half`, `int`).
    pub fn kernel_type(self, width: usize) -> String {
        let base = match self {
            Self::Float32 => "float",
            Self::Float16 => "half",
            Self::Int32 => "int",
        };
        if width == 1 {
            base.to_string()
        } else {
            format!("{base}{width}")
        }
    }

    /// Suffix of the image read/write builtins (`read_imagef`, `read_imageh`).
    pub const fn image_suffix(self) -> char {
        match self {
            Self::Float32 => 'f',
            Self::Float16 => 'h',
            Self::Int32 => 'i',
        }
    }
}

/// Arithmetic precision of a whole compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CalculationsPrecision {
    /// F32 storage and accumulation.
    #[default]
    F32,
    /// F16 storage with F32 accumulation.
    F32F16,
    /// F16 storage and accumulation.
    F16,
}

impl CalculationsPrecision {
    /// Storage type of tensors compiled at this precision.
    pub const fn storage_data_type(self) -> DataType {
        match self {
            Self::F32 => DataType::Float32,
            Self::F32F16 | Self::F16 => DataType::Float16,
        }
    }

    /// Preprocessor defines prepended to every kernel source.
    pub fn common_defines(self) -> String {
        let mut defines = String::new();
        if self != Self::F32 {
            defines.push_str("#pragma OPENCL EXTENSION cl_khr_fp16 : enable\n");
        }
        let (flt, accum) = match self {
            Self::F32 => ("float", "float"),
            Self::F32F16 => ("half", "float"),
            Self::F16 => ("half", "half"),
        };
        defines.push_str(&format!("#define ACCUM_FLT4 {accum}4\n"));
        defines.push_str(&format!("#define ACCUM_FLT {accum}\n"));
        defines.push_str(&format!("#define FLT {flt}\n"));
        defines.push_str(&format!("#define FLT4 {flt}4\n"));
        defines.push_str(&format!("#define TO_FLT4 convert_{flt}4\n"));
        defines.push_str(&format!("#define TO_ACCUM_TYPE convert_{accum}4\n"));
        defines.push_str(&format!("#define TO_ACCUM_FLT convert_{accum}\n"));
        defines
    }
}

// ── Storage ────────────────────────────────────────────────────────

/// Physical representation of a tensor on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorStorageType {
    /// Linear global-memory buffer.
    Buffer,
    /// 1D image view over a linear buffer.
    ImageBuffer,
    /// 2D image, slices stacked along the height.
    Texture2D,
}

impl TensorStorageType {
    /// Buffer-backed storage can be packed into shared byte-sized buffers.
    pub const fn is_buffer_based(self) -> bool {
        matches!(self, Self::Buffer | Self::ImageBuffer)
    }
}

/// Dimension order of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    Hwc,
    Bhwc,
}

impl Layout {
    pub const fn has_batch(self) -> bool {
        matches!(self, Self::Bhwc)
    }
}

/// How a kernel accesses an object it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    Read,
    Write,
    ReadWrite,
}

impl AccessType {
    pub const fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// Image access qualifier in a kernel parameter list.
    pub const fn image_qualifier(self) -> &'static str {
        match self {
            Self::Read => "__read_only",
            Self::Write => "__write_only",
            Self::ReadWrite => "__read_write",
        }
    }
}

// ── Shapes ─────────────────────────────────────────────────────────

/// Logical tensor shape: batch, height, width, channels, plus depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bhwc {
    pub b: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
    /// Depth for volumetric tensors; 1 otherwise.
    #[serde(default = "one")]
    pub d: usize,
}

fn one() -> usize {
    1
}

impl Bhwc {
    pub const fn new(b: usize, h: usize, w: usize, c: usize) -> Self {
        Self { b, h, w, c, d: 1 }
    }

    pub const fn with_depth(self, d: usize) -> Self {
        Self { d, ..self }
    }

    /// Number of 4-channel slices.
    pub const fn slices(&self) -> usize {
        self.c.div_ceil(4)
    }

    /// Number of logical elements.
    pub const fn elements(&self) -> usize {
        self.b * self.h * self.w * self.d * self.c
    }

    /// Number of elements once channels are padded to whole slices.
    pub const fn padded_elements(&self) -> usize {
        self.b * self.h * self.w * self.d * self.slices() * 4
    }
}

/// Three-component size used for grids and work groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Per-component ceiling division, the number of work groups of `self`
    /// needed to cover `grid`.
    pub fn groups_to_cover(self, grid: Dim3) -> Dim3 {
        Dim3 {
            x: grid.x.div_ceil(self.x.max(1)),
            y: grid.y.div_ceil(self.y.max(1)),
            z: grid.z.div_ceil(self.z.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices_round_up() {
        assert_eq!(Bhwc::new(1, 2, 2, 1).slices(), 1);
        assert_eq!(Bhwc::new(1, 2, 2, 4).slices(), 1);
        assert_eq!(Bhwc::new(1, 2, 2, 5).slices(), 2);
        assert_eq!(Bhwc::new(2, 2, 2, 5).padded_elements(), 2 * 2 * 2 * 8);
    }

    #[test]
    fn test_kernel_type_names() {
        assert_eq!(DataType::Float32.kernel_type(4), "float4");
        assert_eq!(DataType::Float16.kernel_type(1), "half");
        assert_eq!(DataType::Int32.kernel_type(4), "int4");
    }

    #[test]
    fn test_defines_per_precision() {
        let f32_defs = CalculationsPrecision::F32.common_defines();
        assert!(f32_defs.contains("#define FLT4 float4"));
        assert!(!f32_defs.contains("cl_khr_fp16"));
        let mixed = CalculationsPrecision::F32F16.common_defines();
        assert!(mixed.contains("#define FLT4 half4"));
        assert!(mixed.contains("#define ACCUM_FLT4 float4"));
    }

    #[test]
    fn test_groups_to_cover() {
        let wg = Dim3::new(8, 4, 1);
        assert_eq!(wg.groups_to_cover(Dim3::new(17, 4, 3)), Dim3::new(3, 1, 3));
    }
}
