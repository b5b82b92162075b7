//! Compute node: one dispatched kernel plus the tensor ids it touches.

use serde::{Deserialize, Serialize};

use crate::compiler::graph::TensorId;
use crate::error::{CompileError, CompileResult};
use crate::kernel::operation::GpuOperation;

/// One unit of work. Move-only: the kernel configuration is never duplicated.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComputeNode {
    pub operation: GpuOperation,
    /// Runtime inputs, in kernel source order.
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub name: String,
}

impl ComputeNode {
    /// Wrap `operation`, checking the id lists against its tensor counts.
    pub fn new(
        operation: GpuOperation,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        name: String,
    ) -> CompileResult<Self> {
        let def = operation.definition();
        if def.dst_tensors.len() != outputs.len() {
            return Err(CompileError::InvalidNode {
                node: name,
                reason: format!(
                    "operation writes {} tensors but node has {} outputs",
                    def.dst_tensors.len(),
                    outputs.len()
                ),
            });
        }
        if def.src_tensors.len() != inputs.len() {
            return Err(CompileError::InvalidNode {
                node: name,
                reason: format!(
                    "operation reads {} tensors but node has {} inputs",
                    def.src_tensors.len(),
                    inputs.len()
                ),
            });
        }
        Ok(Self {
            operation,
            inputs,
            outputs,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::operation::OperationDef;
    use crate::kernel::tensor_desc::TensorDescriptor;
    use crate::types::{CalculationsPrecision, DataType, Layout, TensorStorageType};

    #[test]
    fn test_arity_checked() {
        let desc = TensorDescriptor::new(DataType::Float32, TensorStorageType::Buffer, Layout::Hwc);
        let def = OperationDef {
            precision: CalculationsPrecision::F32,
            src_tensors: vec![desc.clone()],
            dst_tensors: vec![desc],
        };
        let op = || GpuOperation::elementwise(def.clone(), "abs", "in_out_value = fabs(in_out_value);".into());
        assert!(ComputeNode::new(op(), vec![TensorId(0)], vec![TensorId(1)], "abs".into()).is_ok());
        assert!(ComputeNode::new(op(), vec![TensorId(0)], vec![], "abs".into()).is_err());
        assert!(ComputeNode::new(op(), vec![], vec![TensorId(1)], "abs".into()).is_err());
    }
}
