//! Memory planning strategies over tensor usage intervals.
//!
//! A [`TensorUsageRecord`] gives a tensor's size and its live interval
//! `[first_task, last_task]` in node order. A strategy maps every record to a
//! shared object so that tensors sharing an object never overlap in time and
//! every object is at least as large as each tensor it holds.
//!
//! | strategy          | reuse rule                                          |
//! |-------------------|-----------------------------------------------------|
//! | `Naive`           | none, one object per tensor                         |
//! | `Equality`        | only between tensors of equal size (any `T: Eq`)    |
//! | `GreedyInOrder`   | closest-size free object at each tensor's start     |
//! | `GreedyBySize`    | largest tensors first, best-fit object              |
//! | `GreedyByBreadth` | busiest tasks first, best-fit object                |
//! | `GreedyBest`      | smallest total of the three greedy strategies       |
//! | `MinCostFlow`     | reuse chains from a min-cost bipartite flow         |

pub mod equality;
pub mod greedy_by_breadth;
pub mod greedy_by_size;
pub mod greedy_in_order;
pub mod min_cost_flow;
pub mod naive;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// Size and live interval of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorUsageRecord<T> {
    pub tensor_size: T,
    pub first_task: usize,
    pub last_task: usize,
}

impl<T> TensorUsageRecord<T> {
    pub fn new(tensor_size: T, first_task: usize, last_task: usize) -> Self {
        Self {
            tensor_size,
            first_task,
            last_task,
        }
    }

    pub fn overlaps(&self, first: usize, last: usize) -> bool {
        self.first_task <= last && first <= self.last_task
    }
}

/// Tensor → object mapping plus the capacity of each object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectsAssignment<T> {
    pub object_ids: Vec<usize>,
    pub object_sizes: Vec<T>,
}

impl ObjectsAssignment<usize> {
    pub fn total_size(&self) -> usize {
        self.object_sizes.iter().sum()
    }
}

/// Tensor → byte offset inside one arena of `total_size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OffsetsAssignment {
    pub offsets: Vec<usize>,
    pub total_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    Naive,
    Equality,
    #[default]
    GreedyInOrder,
    GreedyBySize,
    GreedyByBreadth,
    GreedyBest,
    MinCostFlow,
}

impl MemoryStrategy {
    pub const ALL: [MemoryStrategy; 7] = [
        MemoryStrategy::Naive,
        MemoryStrategy::Equality,
        MemoryStrategy::GreedyInOrder,
        MemoryStrategy::GreedyBySize,
        MemoryStrategy::GreedyByBreadth,
        MemoryStrategy::GreedyBest,
        MemoryStrategy::MinCostFlow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryStrategy::Naive => "naive",
            MemoryStrategy::Equality => "equality",
            MemoryStrategy::GreedyInOrder => "greedy_in_order",
            MemoryStrategy::GreedyBySize => "greedy_by_size",
            MemoryStrategy::GreedyByBreadth => "greedy_by_breadth",
            MemoryStrategy::GreedyBest => "greedy_best",
            MemoryStrategy::MinCostFlow => "min_cost_flow",
        }
    }
}

impl fmt::Display for MemoryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryStrategy {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| CompileError::Unsupported(format!("memory strategy '{s}'")))
    }
}

/// Reject records whose interval is reversed.
pub fn validate_records<T>(records: &[TensorUsageRecord<T>]) -> CompileResult<()> {
    match records
        .iter()
        .enumerate()
        .find(|(_, r)| r.first_task > r.last_task)
    {
        Some((index, r)) => Err(CompileError::InvalidUsageRecord {
            index,
            first: r.first_task,
            last: r.last_task,
        }),
        None => Ok(()),
    }
}

/// Assign byte-sized records with `strategy`.
pub fn assign_objects_to_tensors(
    records: &[TensorUsageRecord<usize>],
    strategy: MemoryStrategy,
) -> CompileResult<ObjectsAssignment<usize>> {
    validate_records(records)?;
    let assignment = match strategy {
        MemoryStrategy::Naive => naive::naive_assignment(records),
        MemoryStrategy::Equality => equality::equality_assignment(records),
        MemoryStrategy::GreedyInOrder => greedy_in_order::greedy_in_order_assignment(records),
        MemoryStrategy::GreedyBySize => greedy_by_size::greedy_by_size_assignment(records),
        MemoryStrategy::GreedyByBreadth => {
            greedy_by_breadth::greedy_by_breadth_assignment(records)
        }
        MemoryStrategy::GreedyBest => greedy_best_assignment(records),
        MemoryStrategy::MinCostFlow => min_cost_flow::min_cost_flow_assignment(records),
    };
    log::debug!(
        "{strategy}: {} tensors -> {} objects, {} bytes",
        records.len(),
        assignment.object_sizes.len(),
        assignment.total_size()
    );
    Ok(assignment)
}

/// Assign records whose size is an opaque shape. Only strategies that never
/// compare sizes by magnitude apply.
pub fn assign_objects_to_shaped_tensors<T: Clone + PartialEq>(
    records: &[TensorUsageRecord<T>],
    strategy: MemoryStrategy,
) -> CompileResult<ObjectsAssignment<T>> {
    validate_records(records)?;
    match strategy {
        MemoryStrategy::Naive => Ok(naive::naive_assignment(records)),
        MemoryStrategy::Equality => Ok(equality::equality_assignment(records)),
        other => Err(CompileError::Unsupported(format!(
            "{other} needs byte-sized usage records"
        ))),
    }
}

fn greedy_best_assignment(records: &[TensorUsageRecord<usize>]) -> ObjectsAssignment<usize> {
    [
        greedy_in_order::greedy_in_order_assignment(records),
        greedy_by_size::greedy_by_size_assignment(records),
        greedy_by_breadth::greedy_by_breadth_assignment(records),
    ]
    .into_iter()
    .min_by_key(ObjectsAssignment::total_size)
    .unwrap_or_default()
}

/// Lay objects out back to back in id order; each tensor gets its object's
/// start offset.
pub fn objects_to_offsets(assignment: &ObjectsAssignment<usize>) -> OffsetsAssignment {
    let mut object_offsets = Vec::with_capacity(assignment.object_sizes.len());
    let mut total_size = 0;
    for size in &assignment.object_sizes {
        object_offsets.push(total_size);
        total_size += size;
    }
    OffsetsAssignment {
        offsets: assignment
            .object_ids
            .iter()
            .map(|id| object_offsets[*id])
            .collect(),
        total_size,
    }
}

/// Tensor indices ordered by `(first_task, index)`.
pub(crate) fn order_by_first_task<T>(records: &[TensorUsageRecord<T>]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by_key(|&i| (records[i].first_task, i));
    order
}

/// Intervals held by one shared object, used by the best-fit strategies.
#[derive(Debug, Default)]
pub(crate) struct SharedObject {
    pub size: usize,
    pub intervals: Vec<(usize, usize)>,
}

impl SharedObject {
    pub fn is_free_during(&self, first: usize, last: usize) -> bool {
        self.intervals
            .iter()
            .all(|&(f, l)| l < first || last < f)
    }
}

/// Pick among free objects: the smallest one that fits, else the largest
/// one (to be grown). `None` when no object is free.
pub(crate) fn best_fit(objects: &[SharedObject], size: usize, first: usize, last: usize) -> Option<usize> {
    let free = || {
        objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_free_during(first, last))
    };
    free()
        .filter(|(_, o)| o.size >= size)
        .min_by_key(|(i, o)| (o.size, *i))
        .or_else(|| free().max_by_key(|(i, o)| (o.size, std::cmp::Reverse(*i))))
        .map(|(i, _)| i)
}

pub(crate) fn into_assignment(
    object_ids: Vec<usize>,
    objects: Vec<SharedObject>,
) -> ObjectsAssignment<usize> {
    ObjectsAssignment {
        object_ids,
        object_sizes: objects.into_iter().map(|o| o.size).collect(),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Checks the two assignment invariants: capacity and non-overlap.
    pub fn assert_valid(records: &[TensorUsageRecord<usize>], a: &ObjectsAssignment<usize>) {
        assert_eq!(a.object_ids.len(), records.len());
        for (t, record) in records.iter().enumerate() {
            let object = a.object_ids[t];
            assert!(
                a.object_sizes[object] >= record.tensor_size,
                "object {object} too small for tensor {t}"
            );
            for (u, other) in records.iter().enumerate().skip(t + 1) {
                if a.object_ids[u] == object {
                    assert!(
                        !record.overlaps(other.first_task, other.last_task),
                        "tensors {t} and {u} overlap in object {object}"
                    );
                }
            }
        }
    }

    pub fn chain() -> Vec<TensorUsageRecord<usize>> {
        vec![
            TensorUsageRecord::new(32, 0, 1),
            TensorUsageRecord::new(32, 1, 2),
            TensorUsageRecord::new(8, 2, 3),
            TensorUsageRecord::new(64, 3, 4),
            TensorUsageRecord::new(16, 4, 5),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_every_strategy_is_valid() {
        let records = chain();
        for strategy in MemoryStrategy::ALL {
            let a = assign_objects_to_tensors(&records, strategy).unwrap();
            assert_valid(&records, &a);
        }
    }

    #[test]
    fn test_naive_is_sum_of_sizes() {
        let records = chain();
        let a = assign_objects_to_tensors(&records, MemoryStrategy::Naive).unwrap();
        assert_eq!(a.total_size(), 152);
    }

    #[test]
    fn test_greedy_best_not_worse_than_components() {
        let records = chain();
        let best = assign_objects_to_tensors(&records, MemoryStrategy::GreedyBest)
            .unwrap()
            .total_size();
        for strategy in [
            MemoryStrategy::GreedyInOrder,
            MemoryStrategy::GreedyBySize,
            MemoryStrategy::GreedyByBreadth,
        ] {
            let total = assign_objects_to_tensors(&records, strategy)
                .unwrap()
                .total_size();
            assert!(best <= total);
        }
    }

    #[test]
    fn test_invalid_record_rejected() {
        let records = vec![
            TensorUsageRecord::new(4, 0, 1),
            TensorUsageRecord::new(4, 3, 2),
        ];
        let err = assign_objects_to_tensors(&records, MemoryStrategy::GreedyBySize).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InvalidUsageRecord {
                index: 1,
                first: 3,
                last: 2
            }
        ));
    }

    #[test]
    fn test_offsets_are_prefix_sums() {
        let a = ObjectsAssignment {
            object_ids: vec![1, 0, 1, 2],
            object_sizes: vec![16, 32, 8],
        };
        let offsets = objects_to_offsets(&a);
        assert_eq!(offsets.offsets, vec![16, 0, 16, 48]);
        assert_eq!(offsets.total_size, 56);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "greedy-by-size".parse::<MemoryStrategy>().unwrap(),
            MemoryStrategy::GreedyBySize
        );
        assert_eq!(
            " MIN_COST_FLOW ".parse::<MemoryStrategy>().unwrap(),
            MemoryStrategy::MinCostFlow
        );
        assert!("fastest".parse::<MemoryStrategy>().is_err());
        assert_eq!(MemoryStrategy::default().to_string(), "greedy_in_order");
    }

    #[test]
    fn test_shaped_records_only_equality_or_naive() {
        let records = vec![
            TensorUsageRecord::new("a", 0, 1),
            TensorUsageRecord::new("a", 2, 3),
        ];
        let a = assign_objects_to_shaped_tensors(&records, MemoryStrategy::Equality).unwrap();
        assert_eq!(a.object_sizes, vec!["a"]);
        assert!(assign_objects_to_shaped_tensors(&records, MemoryStrategy::MinCostFlow).is_err());
    }
}
