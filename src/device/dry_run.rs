//! Host-only device that records every call instead of executing it.
//!
//! Used for plan-only compilation (memory reports, kernel source dumps) and
//! by the test suite. Failures can be injected to exercise error paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::device::{
    CommandQueue, ComputeDevice, DeviceInfo, EventHandle, KernelArg, KernelHandle, MemoryHandle,
};
use crate::error::{DeviceError, DeviceResult};
use crate::kernel::tensor_desc::TensorDescriptor;
use crate::types::{Bhwc, Dim3};

/// What a [`MemoryHandle`] of the dry-run device refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum DryRunMemory {
    Buffer { size_bytes: usize },
    ConstantBuffer { size_bytes: usize },
    Tensor { descriptor: TensorDescriptor, shape: Bhwc },
    View { parent: MemoryHandle, offset_bytes: usize, shape: Bhwc },
}

/// One recorded dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub kernel: KernelHandle,
    pub work_groups_count: Dim3,
    pub work_group_size: Dim3,
}

/// One recorded queue call, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueCall {
    Dispatch(DispatchRecord),
    Marker(EventHandle),
    Wait(EventHandle),
    Flush,
    Finish,
}

/// Recording implementation of [`ComputeDevice`] and [`CommandQueue`].
#[derive(Debug)]
pub struct DryRunDevice {
    info: DeviceInfo,
    next_handle: u64,
    memory: BTreeMap<MemoryHandle, DryRunMemory>,
    kernels: BTreeMap<u64, String>,
    kernel_args: HashMap<u64, Vec<KernelArg>>,
    events: HashSet<u64>,
    queue_calls: Vec<QueueCall>,
    /// Reject kernel compilation whose source contains this text.
    pub fail_compilation_on: Option<String>,
    /// Reject allocations larger than this many bytes.
    pub max_allocation_bytes: Option<usize>,
}

impl DryRunDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            next_handle: 1,
            memory: BTreeMap::new(),
            kernels: BTreeMap::new(),
            kernel_args: HashMap::new(),
            events: HashSet::new(),
            queue_calls: Vec::new(),
            fail_compilation_on: None,
            max_allocation_bytes: None,
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn check_allocation(&self, size: usize) -> DeviceResult<()> {
        match self.max_allocation_bytes {
            Some(limit) if size > limit => Err(DeviceError::Allocation {
                size,
                reason: format!("exceeds the {limit}-byte limit"),
            }),
            _ => Ok(()),
        }
    }

    fn insert_memory(&mut self, memory: DryRunMemory) -> MemoryHandle {
        let handle = MemoryHandle(self.next());
        self.memory.insert(handle, memory);
        handle
    }

    pub fn memory(&self, handle: MemoryHandle) -> Option<&DryRunMemory> {
        self.memory.get(&handle)
    }

    /// Every live memory object in creation order.
    pub fn memory_objects(&self) -> impl Iterator<Item = (&MemoryHandle, &DryRunMemory)> {
        self.memory.iter()
    }

    /// Number of plain (non-constant) buffers created.
    pub fn buffer_count(&self) -> usize {
        self.memory
            .values()
            .filter(|m| matches!(m, DryRunMemory::Buffer { .. }))
            .count()
    }

    /// Number of dedicated tensors created.
    pub fn tensor_count(&self) -> usize {
        self.memory
            .values()
            .filter(|m| matches!(m, DryRunMemory::Tensor { .. }))
            .count()
    }

    pub fn kernel_source(&self, kernel: KernelHandle) -> Option<&str> {
        self.kernels.get(&kernel.0).map(String::as_str)
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn kernel_args(&self, kernel: KernelHandle) -> Option<&[KernelArg]> {
        self.kernel_args.get(&kernel.0).map(Vec::as_slice)
    }

    pub fn queue_calls(&self) -> &[QueueCall] {
        &self.queue_calls
    }

    pub fn dispatches(&self) -> impl Iterator<Item = &DispatchRecord> {
        self.queue_calls.iter().filter_map(|c| match c {
            QueueCall::Dispatch(d) => Some(d),
            _ => None,
        })
    }

    pub fn clear_queue_calls(&mut self) {
        self.queue_calls.clear();
    }
}

impl ComputeDevice for DryRunDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&mut self, size_bytes: usize) -> DeviceResult<MemoryHandle> {
        self.check_allocation(size_bytes)?;
        Ok(self.insert_memory(DryRunMemory::Buffer { size_bytes }))
    }

    fn create_buffer_with_data(&mut self, data: &[u8]) -> DeviceResult<MemoryHandle> {
        self.check_allocation(data.len())?;
        Ok(self.insert_memory(DryRunMemory::ConstantBuffer {
            size_bytes: data.len(),
        }))
    }

    fn create_tensor(
        &mut self,
        descriptor: &TensorDescriptor,
        shape: &Bhwc,
    ) -> DeviceResult<MemoryHandle> {
        self.check_allocation(descriptor.size_in_bytes(shape))?;
        Ok(self.insert_memory(DryRunMemory::Tensor {
            descriptor: descriptor.clone(),
            shape: *shape,
        }))
    }

    fn create_tensor_view(
        &mut self,
        parent: MemoryHandle,
        offset_bytes: usize,
        descriptor: &TensorDescriptor,
        shape: &Bhwc,
    ) -> DeviceResult<MemoryHandle> {
        let parent_size = match self.memory.get(&parent) {
            Some(DryRunMemory::Buffer { size_bytes }) => *size_bytes,
            _ => return Err(DeviceError::InvalidHandle(parent.0)),
        };
        let needed = offset_bytes + descriptor.size_in_bytes(shape);
        if needed > parent_size {
            return Err(DeviceError::Allocation {
                size: needed,
                reason: format!("view exceeds parent buffer of {parent_size} bytes"),
            });
        }
        Ok(self.insert_memory(DryRunMemory::View {
            parent,
            offset_bytes,
            shape: *shape,
        }))
    }

    fn compile_kernel(&mut self, source: &str, entry_point: &str) -> DeviceResult<KernelHandle> {
        if let Some(marker) = &self.fail_compilation_on {
            if source.contains(marker.as_str()) {
                return Err(DeviceError::Compilation(format!(
                    "rejected source containing '{marker}'"
                )));
            }
        }
        if !source.contains(entry_point) {
            return Err(DeviceError::Compilation(format!(
                "entry point '{entry_point}' not found"
            )));
        }
        let id = self.next();
        self.kernels.insert(id, source.to_string());
        Ok(KernelHandle(id))
    }

    fn set_kernel_args(&mut self, kernel: KernelHandle, args: &[KernelArg]) -> DeviceResult<()> {
        if !self.kernels.contains_key(&kernel.0) {
            return Err(DeviceError::InvalidHandle(kernel.0));
        }
        for arg in args {
            if let KernelArg::Memory(handle) = arg {
                if !self.memory.contains_key(handle) {
                    return Err(DeviceError::Binding(format!(
                        "memory handle {} is not alive",
                        handle.0
                    )));
                }
            }
        }
        self.kernel_args.insert(kernel.0, args.to_vec());
        Ok(())
    }
}

impl CommandQueue for DryRunDevice {
    fn dispatch(
        &mut self,
        kernel: KernelHandle,
        work_groups_count: Dim3,
        work_group_size: Dim3,
    ) -> DeviceResult<EventHandle> {
        if !self.kernel_args.contains_key(&kernel.0) {
            return Err(DeviceError::Dispatch(format!(
                "kernel {} has no bound arguments",
                kernel.0
            )));
        }
        self.queue_calls.push(QueueCall::Dispatch(DispatchRecord {
            kernel,
            work_groups_count,
            work_group_size,
        }));
        let event = self.next();
        self.events.insert(event);
        Ok(EventHandle(event))
    }

    fn enqueue_marker(&mut self) -> DeviceResult<EventHandle> {
        let event = EventHandle(self.next());
        self.events.insert(event.0);
        self.queue_calls.push(QueueCall::Marker(event));
        Ok(event)
    }

    fn wait_event(&mut self, event: EventHandle) -> DeviceResult<()> {
        if !self.events.contains(&event.0) {
            return Err(DeviceError::InvalidHandle(event.0));
        }
        self.queue_calls.push(QueueCall::Wait(event));
        Ok(())
    }

    fn flush(&mut self) -> DeviceResult<()> {
        self.queue_calls.push(QueueCall::Flush);
        Ok(())
    }

    fn wait_for_completion(&mut self, _timeout: Option<Duration>) -> DeviceResult<()> {
        self.queue_calls.push(QueueCall::Finish);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GpuVendor;
    use crate::types::{DataType, Layout, TensorStorageType};

    fn device() -> DryRunDevice {
        DryRunDevice::new(DeviceInfo::generic("dry", GpuVendor::Nvidia))
    }

    #[test]
    fn test_view_must_fit_parent() {
        let mut dev = device();
        let desc = TensorDescriptor::new(DataType::Float32, TensorStorageType::Buffer, Layout::Hwc);
        let parent = dev.create_buffer(64).unwrap();
        assert!(dev
            .create_tensor_view(parent, 0, &desc, &Bhwc::new(1, 1, 4, 4))
            .is_ok());
        assert!(dev
            .create_tensor_view(parent, 16, &desc, &Bhwc::new(1, 1, 4, 4))
            .is_err());
    }

    #[test]
    fn test_compilation_failure_injection() {
        let mut dev = device();
        dev.fail_compilation_on = Some("bad_op".into());
        assert!(dev.compile_kernel("main_function bad_op", "main_function").is_err());
        assert!(dev.compile_kernel("main_function ok", "main_function").is_ok());
    }

    #[test]
    fn test_dispatch_requires_bound_args() {
        let mut dev = device();
        let k = dev.compile_kernel("main_function", "main_function").unwrap();
        let wg = Dim3::new(8, 4, 1);
        assert!(dev.dispatch(k, Dim3::new(1, 1, 1), wg).is_err());
        dev.set_kernel_args(k, &[KernelArg::Int4([0; 4])]).unwrap();
        assert!(dev.dispatch(k, Dim3::new(1, 1, 1), wg).is_ok());
        assert_eq!(dev.dispatches().count(), 1);
    }
}
