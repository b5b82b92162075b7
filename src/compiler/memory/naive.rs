//! Baseline strategy: every tensor gets its own object.

use crate::compiler::memory::{ObjectsAssignment, TensorUsageRecord};

pub fn naive_assignment<T: Clone>(records: &[TensorUsageRecord<T>]) -> ObjectsAssignment<T> {
    ObjectsAssignment {
        object_ids: (0..records.len()).collect(),
        object_sizes: records.iter().map(|r| r.tensor_size.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::memory::test_util::{assert_valid, chain};

    #[test]
    fn test_one_object_per_tensor() {
        let records = chain();
        let a = naive_assignment(&records);
        assert_valid(&records, &a);
        assert_eq!(a.object_ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(a.object_sizes, vec![32, 32, 8, 64, 16]);
    }
}
