//! Greedy by size: largest tensors first, each into the smallest free object
//! that fits.

use crate::compiler::memory::{
    best_fit, into_assignment, ObjectsAssignment, SharedObject, TensorUsageRecord,
};

pub fn greedy_by_size_assignment(records: &[TensorUsageRecord<usize>]) -> ObjectsAssignment<usize> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by_key(|&i| (std::cmp::Reverse(records[i].tensor_size), records[i].first_task, i));

    let mut object_ids = vec![0; records.len()];
    let mut objects: Vec<SharedObject> = Vec::new();
    for t in order {
        let record = &records[t];
        let object = match best_fit(&objects, record.tensor_size, record.first_task, record.last_task) {
            Some(object) => object,
            None => {
                objects.push(SharedObject::default());
                objects.len() - 1
            }
        };
        let shared = &mut objects[object];
        shared.size = shared.size.max(record.tensor_size);
        shared.intervals.push((record.first_task, record.last_task));
        object_ids[t] = object;
    }
    into_assignment(object_ids, objects)
}
