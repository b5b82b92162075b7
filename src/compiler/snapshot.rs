//! Versioned JSON snapshot of a compilation before device work.
//!
//! A snapshot captures the reservation table, the fused node list (kernel
//! templates, arguments and owned constant objects), the graph interface and
//! tensor aliases. Restoring skips generation and fusion but still plans,
//! allocates and compiles against the target device.

use serde::{Deserialize, Serialize};

use crate::compiler::graph::TensorId;
use crate::compiler::node::ComputeNode;
use crate::compiler::reservation::DummyTensor;
use crate::error::{CompileError, CompileResult};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Borrowed view used for encoding.
#[derive(Debug, Serialize)]
pub(crate) struct SnapshotView<'a> {
    pub version: u32,
    pub tensors: Vec<(TensorId, DummyTensor)>,
    pub next_id: TensorId,
    pub nodes: &'a [ComputeNode],
    pub inputs: &'a [TensorId],
    pub outputs: &'a [TensorId],
    pub variables: Vec<(TensorId, u32)>,
    pub aliases: Vec<(TensorId, TensorId)>,
}

impl SnapshotView<'_> {
    pub fn encode(&self) -> CompileResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Decoded snapshot.
#[derive(Debug, Deserialize)]
pub struct GraphSnapshot {
    pub version: u32,
    pub tensors: Vec<(TensorId, DummyTensor)>,
    pub next_id: TensorId,
    pub nodes: Vec<ComputeNode>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub variables: Vec<(TensorId, u32)>,
    pub aliases: Vec<(TensorId, TensorId)>,
}

impl GraphSnapshot {
    pub fn decode(bytes: &[u8]) -> CompileResult<Self> {
        let snapshot: GraphSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CompileError::SnapshotMismatch(format!(
                "version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tensor_desc::TensorDescriptor;
    use crate::types::{Bhwc, DataType, Layout, TensorStorageType};

    #[test]
    fn test_encode_decode() {
        let dummy = DummyTensor {
            shape: Bhwc::new(1, 2, 2, 4),
            descriptor: TensorDescriptor::new(
                DataType::Float32,
                TensorStorageType::Buffer,
                Layout::Hwc,
            ),
        };
        let view = SnapshotView {
            version: SNAPSHOT_VERSION,
            tensors: vec![(TensorId(0), dummy.clone())],
            next_id: TensorId(1),
            nodes: &[],
            inputs: &[TensorId(0)],
            outputs: &[TensorId(0)],
            variables: Vec::new(),
            aliases: vec![(TensorId(3), TensorId(0))],
        };
        let decoded = GraphSnapshot::decode(&view.encode().unwrap()).unwrap();
        assert_eq!(decoded.tensors, vec![(TensorId(0), dummy)]);
        assert_eq!(decoded.next_id, TensorId(1));
        assert_eq!(decoded.aliases, vec![(TensorId(3), TensorId(0))]);
    }

    #[test]
    fn test_version_checked() {
        let json = br#"{"version":99,"tensors":[],"next_id":0,"nodes":[],"inputs":[],"outputs":[],"variables":[],"aliases":[]}"#;
        assert!(matches!(
            GraphSnapshot::decode(json),
            Err(CompileError::SnapshotMismatch(_))
        ));
        assert!(matches!(
            GraphSnapshot::decode(b"{"),
            Err(CompileError::Snapshot(_))
        ));
    }
}
