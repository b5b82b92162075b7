//! Compilation options.
//!
//! Options come from code, JSON (`CompileOptions::from_json`) or `GLLM_GPU_*`
//! environment variables (`CompileOptions::with_env_overrides`). Every field
//! has a default, so partial JSON documents are accepted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compiler::memory::MemoryStrategy;
use crate::device::DeviceInfo;
use crate::error::{CompileError, CompileResult};
use crate::types::{CalculationsPrecision, TensorStorageType};

pub const ENV_PRECISION: &str = "GLLM_GPU_PRECISION";
pub const ENV_MEMORY_STRATEGY: &str = "GLLM_GPU_MEMORY_STRATEGY";
pub const ENV_BUFFER_LAYOUT: &str = "GLLM_GPU_BUFFER_LAYOUT";
pub const ENV_STORAGE: &str = "GLLM_GPU_STORAGE";

/// How shared buffer-backed tensors are laid out in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferLayout {
    /// One device buffer per shared object.
    #[default]
    Objects,
    /// One device buffer for all shared tensors, each a view at its offset.
    Arena,
}

impl FromStr for BufferLayout {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "objects" => Ok(BufferLayout::Objects),
            "arena" | "offsets" => Ok(BufferLayout::Arena),
            _ => Err(CompileError::Unsupported(format!("buffer layout '{s}'"))),
        }
    }
}

impl fmt::Display for BufferLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferLayout::Objects => f.write_str("objects"),
            BufferLayout::Arena => f.write_str("arena"),
        }
    }
}

/// What to do with operations the generator cannot build yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnimplementedPolicy {
    /// Fail the compilation with the capability error.
    #[default]
    Abort,
    /// Drop single-input, single-output ops whose output reservation equals
    /// the input's; consumers read the input instead.
    PassThrough,
}

/// Hints about the model that tune queue behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelHints {
    /// The model was prepared with few, large kernels; periodic flushing is
    /// not needed.
    pub reduce_kernels_count: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub precision: CalculationsPrecision,
    /// Force a storage type instead of the device's fastest one.
    pub storage_type: Option<TensorStorageType>,
    pub memory_strategy: MemoryStrategy,
    pub buffer_layout: BufferLayout,
    pub unimplemented_policy: UnimplementedPolicy,
    pub hints: ModelHints,
    /// Flush the queue every this many dispatches on Adreno.
    pub flush_period: usize,
    pub dispatch_timeout_ms: Option<u64>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            precision: CalculationsPrecision::F32,
            storage_type: None,
            memory_strategy: MemoryStrategy::GreedyInOrder,
            buffer_layout: BufferLayout::Objects,
            unimplemented_policy: UnimplementedPolicy::Abort,
            hints: ModelHints::default(),
            flush_period: 16,
            dispatch_timeout_ms: None,
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> CompileResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `GLLM_GPU_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; unparsable values are ignored with a
    /// warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(ENV_PRECISION) {
            match parse_precision(&value) {
                Some(precision) => self.precision = precision,
                None => log::warn!("ignoring {ENV_PRECISION}={value}"),
            }
        }
        if let Some(value) = lookup(ENV_MEMORY_STRATEGY) {
            match value.parse() {
                Ok(strategy) => self.memory_strategy = strategy,
                Err(e) => log::warn!("ignoring {ENV_MEMORY_STRATEGY}={value}: {e}"),
            }
        }
        if let Some(value) = lookup(ENV_BUFFER_LAYOUT) {
            match value.parse() {
                Ok(layout) => self.buffer_layout = layout,
                Err(e) => log::warn!("ignoring {ENV_BUFFER_LAYOUT}={value}: {e}"),
            }
        }
        if let Some(value) = lookup(ENV_STORAGE) {
            match parse_storage(&value) {
                Some(storage) => self.storage_type = storage,
                None => log::warn!("ignoring {ENV_STORAGE}={value}"),
            }
        }
        self
    }

    /// Precision actually used on `device`: half precision falls back to F32
    /// when the device has no fp16 support.
    pub fn effective_precision(&self, device: &DeviceInfo) -> CalculationsPrecision {
        match self.precision {
            CalculationsPrecision::F16 | CalculationsPrecision::F32F16
                if !device.supports_fp16 =>
            {
                log::warn!(
                    "{} has no fp16 support, compiling {:?} as F32",
                    device.name,
                    self.precision
                );
                CalculationsPrecision::F32
            }
            precision => precision,
        }
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_precision(value: &str) -> Option<CalculationsPrecision> {
    match value.trim().to_ascii_lowercase().as_str() {
        "f32" | "fp32" => Some(CalculationsPrecision::F32),
        "f32_f16" | "mixed" => Some(CalculationsPrecision::F32F16),
        "f16" | "fp16" => Some(CalculationsPrecision::F16),
        _ => None,
    }
}

/// `auto` clears a forced storage type.
fn parse_storage(value: &str) -> Option<Option<TensorStorageType>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(None),
        "buffer" => Some(Some(TensorStorageType::Buffer)),
        "image_buffer" => Some(Some(TensorStorageType::ImageBuffer)),
        "texture_2d" | "texture2d" => Some(Some(TensorStorageType::Texture2D)),
        _ => None,
    }
}
