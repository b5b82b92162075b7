//! Greedy by breadth.
//!
//! The breadth of a task is the total size of the tensors live during it.
//! Tasks are visited from the widest down; within a task, unassigned tensors
//! go largest first into the best-fitting free object.

use std::cmp::Reverse;

use crate::compiler::memory::{
    best_fit, into_assignment, ObjectsAssignment, SharedObject, TensorUsageRecord,
};

pub fn greedy_by_breadth_assignment(
    records: &[TensorUsageRecord<usize>],
) -> ObjectsAssignment<usize> {
    let num_tasks = records.iter().map(|r| r.last_task + 1).max().unwrap_or(0);
    let mut live: Vec<Vec<usize>> = vec![Vec::new(); num_tasks];
    let mut breadth = vec![0usize; num_tasks];
    for (t, record) in records.iter().enumerate() {
        for task in record.first_task..=record.last_task {
            live[task].push(t);
            breadth[task] += record.tensor_size;
        }
    }
    let mut tasks: Vec<usize> = (0..num_tasks).collect();
    tasks.sort_by_key(|&task| (Reverse(breadth[task]), task));

    let mut assigned: Vec<Option<usize>> = vec![None; records.len()];
    let mut objects: Vec<SharedObject> = Vec::new();
    for task in tasks {
        let mut tensors = live[task].clone();
        tensors.sort_by_key(|&t| (Reverse(records[t].tensor_size), t));
        for t in tensors {
            if assigned[t].is_some() {
                continue;
            }
            let record = &records[t];
            let object =
                match best_fit(&objects, record.tensor_size, record.first_task, record.last_task) {
                    Some(object) => object,
                    None => {
                        objects.push(SharedObject::default());
                        objects.len() - 1
                    }
                };
            let shared = &mut objects[object];
            shared.size = shared.size.max(record.tensor_size);
            shared.intervals.push((record.first_task, record.last_task));
            assigned[t] = Some(object);
        }
    }

    let object_ids = assigned.into_iter().map(|o| o.unwrap_or_default()).collect();
    into_assignment(object_ids, objects)
}
