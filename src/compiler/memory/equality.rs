//! Reuse only between tensors of equal size.
//!
//! Works for any comparable size type, including full tensor shapes, so it
//! also serves strongly shaped (image) tensors.

use crate::compiler::memory::{order_by_first_task, ObjectsAssignment, TensorUsageRecord};

pub fn equality_assignment<T: Clone + PartialEq>(
    records: &[TensorUsageRecord<T>],
) -> ObjectsAssignment<T> {
    let mut object_ids = vec![0; records.len()];
    let mut object_sizes: Vec<T> = Vec::new();
    // last task of the most recent tensor held by each object
    let mut object_last: Vec<usize> = Vec::new();

    for t in order_by_first_task(records) {
        let record = &records[t];
        let reusable = object_sizes
            .iter()
            .zip(&object_last)
            .position(|(size, last)| *size == record.tensor_size && *last < record.first_task);
        let object = match reusable {
            Some(object) => object,
            None => {
                object_sizes.push(record.tensor_size.clone());
                object_last.push(0);
                object_sizes.len() - 1
            }
        };
        object_last[object] = record.last_task;
        object_ids[t] = object;
    }

    ObjectsAssignment {
        object_ids,
        object_sizes,
    }
}
