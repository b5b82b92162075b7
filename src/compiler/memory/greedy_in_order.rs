//! Greedy in execution order.
//!
//! Tensors are visited by first use. Objects whose last tensor has died are
//! returned to a size-ordered pool; each tensor takes the pooled object
//! closest in size (growing it if needed) or a new one when the pool is
//! empty.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use crate::compiler::memory::{order_by_first_task, ObjectsAssignment, TensorUsageRecord};

pub fn greedy_in_order_assignment(records: &[TensorUsageRecord<usize>]) -> ObjectsAssignment<usize> {
    let mut object_ids = vec![0; records.len()];
    let mut object_sizes: Vec<usize> = Vec::new();
    let mut pool: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut in_use: BinaryHeap<Reverse<(usize, usize)>> = BinaryHeap::new();

    for t in order_by_first_task(records) {
        let record = &records[t];
        while let Some(&Reverse((last, object))) = in_use.peek() {
            if last >= record.first_task {
                break;
            }
            in_use.pop();
            pool.insert((object_sizes[object], object));
        }

        let size = record.tensor_size;
        let above = pool.range((size, 0)..).next().copied();
        let below = pool.range(..(size, 0)).next_back().copied();
        let chosen = match (above, below) {
            (Some(a), Some(b)) => Some(if a.0 - size <= size - b.0 { a } else { b }),
            (a, b) => a.or(b),
        };

        let object = match chosen {
            Some(entry) => {
                pool.remove(&entry);
                let object = entry.1;
                object_sizes[object] = object_sizes[object].max(size);
                object
            }
            None => {
                object_sizes.push(size);
                object_sizes.len() - 1
            }
        };
        object_ids[t] = object;
        in_use.push(Reverse((record.last_task, object)));
    }

    ObjectsAssignment {
        object_ids,
        object_sizes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::memory::test_util::{assert_valid, chain};

    #[test]
    fn test_chain_ping_pongs() {
        let records = chain();
        let a = greedy_in_order_assignment(&records);
        assert_valid(&records, &a);
        // two live tensors at a time are enough for a chain
        assert_eq!(a.object_sizes.len(), 2);
        assert_eq!(a.object_ids, vec![0, 1, 0, 1, 0]);
        assert_eq!(a.object_sizes, vec![32, 64]);
    }

    #[test]
    fn test_picks_closest_size() {
        let records = vec![
            TensorUsageRecord::new(100, 0, 0),
            TensorUsageRecord::new(10, 0, 0),
            TensorUsageRecord::new(12, 1, 1),
        ];
        let a = greedy_in_order_assignment(&records);
        assert_valid(&records, &a);
        assert_eq!(a.object_ids[2], 1);
        assert_eq!(a.object_sizes, vec![100, 12]);
    }

    #[test]
    fn test_disjoint_branches_share_overlapping_do_not() {
        let disjoint = vec![
            TensorUsageRecord::new(64, 1, 2),
            TensorUsageRecord::new(64, 3, 4),
        ];
        let a = greedy_in_order_assignment(&disjoint);
        assert_eq!(a.object_ids[0], a.object_ids[1]);

        let overlapping = vec![
            TensorUsageRecord::new(64, 1, 3),
            TensorUsageRecord::new(64, 2, 4),
        ];
        let a = greedy_in_order_assignment(&overlapping);
        assert_ne!(a.object_ids[0], a.object_ids[1]);
    }
}
