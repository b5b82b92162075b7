//! Tensor reservation table: `TensorId → DummyTensor` before memory exists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compiler::graph::{Graph, TensorId};
use crate::device::DeviceInfo;
use crate::error::{CompileError, CompileResult};
use crate::kernel::tensor_desc::TensorDescriptor;
use crate::types::{Bhwc, CalculationsPrecision, Layout, TensorStorageType};

/// Shape and descriptor of a tensor that has no device memory yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyTensor {
    pub shape: Bhwc,
    pub descriptor: TensorDescriptor,
}

impl DummyTensor {
    pub fn size_in_bytes(&self) -> usize {
        self.descriptor.size_in_bytes(&self.shape)
    }
}

/// Reservations of one compilation.
#[derive(Debug, Clone, Default)]
pub struct TensorReserver {
    reservations: BTreeMap<TensorId, DummyTensor>,
    next: u32,
}

impl TensorReserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve under a fresh id.
    pub fn add(&mut self, dummy: DummyTensor) -> TensorId {
        let id = TensorId(self.next);
        self.next += 1;
        self.reservations.insert(id, dummy);
        id
    }

    /// Set or overwrite the reservation of `id`.
    pub fn add_with_id(&mut self, id: TensorId, dummy: DummyTensor) {
        self.reservations.insert(id, dummy);
    }

    pub fn get(&self, id: TensorId) -> CompileResult<&DummyTensor> {
        self.reservations
            .get(&id)
            .ok_or(CompileError::MissingTensor(id))
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.reservations.contains_key(&id)
    }

    /// Rebase the id generator; the next [`TensorReserver::add`] returns `id`.
    pub fn set_next(&mut self, id: TensorId) {
        self.next = id.0;
    }

    pub fn next_id(&self) -> TensorId {
        TensorId(self.next)
    }

    /// Every reservation, sorted by id.
    pub fn tensor_descs(&self) -> Vec<(TensorId, DummyTensor)> {
        self.reservations
            .iter()
            .map(|(id, dummy)| (*id, dummy.clone()))
            .collect()
    }

    pub fn add_descs(&mut self, descs: Vec<(TensorId, DummyTensor)>) {
        self.reservations.extend(descs);
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}

/// Reserve every runtime tensor of `graph` under its graph id.
///
/// Storage is `storage` when forced, otherwise the device's fastest type;
/// 2D images fall back to buffers when the tensor exceeds the image limits.
pub fn reserve_graph(
    graph: &Graph,
    device: &DeviceInfo,
    precision: CalculationsPrecision,
    storage: Option<TensorStorageType>,
) -> TensorReserver {
    let preferred = storage.unwrap_or_else(|| device.fastest_storage_type());
    let data_type = precision.storage_data_type();
    let mut reserver = TensorReserver::new();
    for tensor in graph.tensors().iter().filter(|t| !t.is_constant()) {
        let storage_type = match preferred {
            TensorStorageType::Texture2D if !device.fits_texture2d(&tensor.shape) => {
                log::warn!(
                    "tensor '{}' {:?} exceeds 2D image limits, using a buffer",
                    tensor.name,
                    tensor.shape
                );
                TensorStorageType::Buffer
            }
            other => other,
        };
        let layout = if tensor.shape.b > 1 {
            Layout::Bhwc
        } else {
            Layout::Hwc
        };
        reserver.add_with_id(
            tensor.id,
            DummyTensor {
                shape: tensor.shape,
                descriptor: TensorDescriptor::new(data_type, storage_type, layout),
            },
        );
    }
    // constants are not reserved but their ids stay taken
    let next = graph.tensors().iter().map(|t| t.id.0 + 1).max().unwrap_or(0);
    reserver.set_next(TensorId(next));
    log::debug!(
        "reserved {} tensors as {:?}/{:?}",
        reserver.len(),
        data_type,
        preferred
    );
    reserver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GpuVendor;
    use crate::types::DataType;

    fn dummy(c: usize) -> DummyTensor {
        DummyTensor {
            shape: Bhwc::new(1, 2, 2, c),
            descriptor: TensorDescriptor::new(
                DataType::Float32,
                TensorStorageType::Buffer,
                Layout::Hwc,
            ),
        }
    }

    #[test]
    fn test_add_get_and_rebase() {
        let mut reserver = TensorReserver::new();
        let a = reserver.add(dummy(4));
        assert_eq!(a, TensorId(0));
        reserver.add_with_id(TensorId(10), dummy(8));
        reserver.set_next(TensorId(11));
        assert_eq!(reserver.add(dummy(1)), TensorId(11));
        assert_eq!(reserver.get(TensorId(10)).unwrap(), &dummy(8));
        assert!(matches!(
            reserver.get(TensorId(5)),
            Err(CompileError::MissingTensor(TensorId(5)))
        ));
    }

    #[test]
    fn test_fresh_id_never_reuses_constant() {
        let mut graph = Graph::new();
        let x = graph.add_input(Bhwc::new(1, 2, 2, 4), "x");
        let c = graph
            .add_constant(Bhwc::new(1, 1, 1, 4), vec![0.5; 4], "c")
            .unwrap();
        let info = DeviceInfo::generic("gpu", GpuVendor::Nvidia);
        let mut reserver = reserve_graph(&graph, &info, CalculationsPrecision::F32, None);
        let fresh = reserver.add(dummy(4));
        assert_ne!(fresh, c);
        assert_ne!(fresh, x);
        assert_eq!(fresh, TensorId(2));
    }

    #[test]
    fn test_descs_round_trip() {
        let mut reserver = TensorReserver::new();
        reserver.add(dummy(4));
        reserver.add(dummy(8));
        let mut restored = TensorReserver::new();
        restored.add_descs(reserver.tensor_descs());
        assert_eq!(restored.tensor_descs(), reserver.tensor_descs());
    }

    #[test]
    fn test_reserve_graph_skips_constants_and_falls_back() {
        let mut graph = Graph::new();
        let x = graph.add_input(Bhwc::new(1, 4, 4, 4), "x");
        let big = graph.add_tensor(Bhwc::new(1, 4096, 4, 64), "big");
        let c = graph
            .add_constant(Bhwc::new(1, 1, 1, 1), vec![1.0], "c")
            .unwrap();
        let mut info = DeviceInfo::adreno(6);
        info.max_image2d_height = 1024;

        let reserver = reserve_graph(&graph, &info, CalculationsPrecision::F16, None);
        assert_eq!(reserver.len(), 2);
        assert!(!reserver.contains(c));
        let x_desc = &reserver.get(x).unwrap().descriptor;
        assert_eq!(x_desc.storage_type, TensorStorageType::Texture2D);
        assert_eq!(x_desc.data_type, DataType::Float16);
        assert_eq!(
            reserver.get(big).unwrap().descriptor.storage_type,
            TensorStorageType::Buffer
        );
        assert_eq!(reserver.next_id(), TensorId(3));

        let generic = DeviceInfo::generic("gpu", GpuVendor::Nvidia);
        let forced = reserve_graph(
            &graph,
            &generic,
            CalculationsPrecision::F32,
            Some(TensorStorageType::ImageBuffer),
        );
        assert_eq!(
            forced.get(x).unwrap().descriptor.storage_type,
            TensorStorageType::ImageBuffer
        );
    }
}
