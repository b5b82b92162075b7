//! Min-cost-flow assignment.
//!
//! Bipartite network with a left and a right copy of every tensor:
//!
//! ```text
//! source ─(1, 0)──────────────▶ left_i
//! left_i ─(1, max(0, s_j - s_i))▶ right_j    when last_i < first_j
//! source ─(1, s_j)────────────▶ right_j      (fresh object)
//! right_j ─(1, 0)─────────────▶ sink
//! ```
//!
//! Pushing one unit per tensor at minimum cost pairs each tensor either with
//! a fresh object or with a dead predecessor whose object it inherits; the
//! cost is the number of bytes the objects grow by.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::compiler::memory::{order_by_first_task, ObjectsAssignment, TensorUsageRecord};

#[derive(Debug, Clone)]
struct Edge {
    to: usize,
    rev: usize,
    cap: i64,
    cost: i64,
    forward: bool,
}

/// Successive shortest paths with Johnson potentials.
#[derive(Debug)]
struct FlowNetwork {
    adj: Vec<Vec<Edge>>,
}

impl FlowNetwork {
    fn new(nodes: usize) -> Self {
        Self {
            adj: vec![Vec::new(); nodes],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, cap: i64, cost: i64) {
        let rev_from = self.adj[to].len();
        let rev_to = self.adj[from].len();
        self.adj[from].push(Edge {
            to,
            rev: rev_from,
            cap,
            cost,
            forward: true,
        });
        self.adj[to].push(Edge {
            to: from,
            rev: rev_to,
            cap: 0,
            cost: -cost,
            forward: false,
        });
    }

    /// Push up to `need` units from `source` to `sink`; returns the flow sent.
    fn min_cost_flow(&mut self, source: usize, sink: usize, need: i64) -> i64 {
        let n = self.adj.len();
        let mut potential = vec![0i64; n];
        let mut flow = 0;
        while flow < need {
            let mut dist = vec![i64::MAX; n];
            let mut prev: Vec<Option<(usize, usize)>> = vec![None; n];
            let mut heap = BinaryHeap::new();
            dist[source] = 0;
            heap.push(Reverse((0i64, source)));
            while let Some(Reverse((d, v))) = heap.pop() {
                if d > dist[v] {
                    continue;
                }
                for (e, edge) in self.adj[v].iter().enumerate() {
                    if edge.cap <= 0 {
                        continue;
                    }
                    let next = d + edge.cost + potential[v] - potential[edge.to];
                    if next < dist[edge.to] {
                        dist[edge.to] = next;
                        prev[edge.to] = Some((v, e));
                        heap.push(Reverse((next, edge.to)));
                    }
                }
            }
            if dist[sink] == i64::MAX {
                break;
            }
            for (p, d) in potential.iter_mut().zip(&dist) {
                if *d != i64::MAX {
                    *p += d;
                }
            }

            let mut push = need - flow;
            let mut v = sink;
            while let Some((u, e)) = prev[v] {
                push = push.min(self.adj[u][e].cap);
                v = u;
            }
            let mut v = sink;
            while let Some((u, e)) = prev[v] {
                self.adj[u][e].cap -= push;
                let rev = self.adj[u][e].rev;
                self.adj[v][rev].cap += push;
                v = u;
            }
            flow += push;
        }
        flow
    }
}

pub fn min_cost_flow_assignment(records: &[TensorUsageRecord<usize>]) -> ObjectsAssignment<usize> {
    let n = records.len();
    let source = 0;
    let sink = 1;
    let left = |i: usize| 2 + i;
    let right = |j: usize| 2 + n + j;

    let mut network = FlowNetwork::new(2 + 2 * n);
    for (i, a) in records.iter().enumerate() {
        network.add_edge(source, left(i), 1, 0);
        network.add_edge(source, right(i), 1, to_cost(a.tensor_size));
        network.add_edge(right(i), sink, 1, 0);
        for (j, b) in records.iter().enumerate() {
            if a.last_task < b.first_task {
                let growth = b.tensor_size.saturating_sub(a.tensor_size);
                network.add_edge(left(i), right(j), 1, to_cost(growth));
            }
        }
    }
    let flow = network.min_cost_flow(source, sink, n as i64);
    debug_assert_eq!(flow, n as i64);

    // predecessor[j] = i when tensor j inherits tensor i's object
    let mut predecessor: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        for edge in &network.adj[left(i)] {
            if edge.forward && edge.cap == 0 && edge.to >= right(0) {
                predecessor[edge.to - right(0)] = Some(i);
            }
        }
    }

    let mut object_ids = vec![0; n];
    let mut object_sizes: Vec<usize> = Vec::new();
    for j in order_by_first_task(records) {
        let size = records[j].tensor_size;
        let object = match predecessor[j] {
            Some(i) => {
                let object = object_ids[i];
                object_sizes[object] = object_sizes[object].max(size);
                object
            }
            None => {
                object_sizes.push(size);
                object_sizes.len() - 1
            }
        };
        object_ids[j] = object;
    }

    ObjectsAssignment {
        object_ids,
        object_sizes,
    }
}

fn to_cost(bytes: usize) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX / 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::memory::test_util::{assert_valid, chain};

    #[test]
    fn test_chain_reuses_objects() {
        let records = chain();
        let a = min_cost_flow_assignment(&records);
        assert_valid(&records, &a);
        // both optimal flows cost 104; one of them packs into 96 bytes
        assert!(a.total_size() <= 104);
        assert!(a.object_sizes.len() <= 3);
    }

    #[test]
    fn test_disjoint_tensors_share() {
        let records = vec![
            TensorUsageRecord::new(64, 0, 1),
            TensorUsageRecord::new(64, 2, 3),
            TensorUsageRecord::new(64, 4, 5),
        ];
        let a = min_cost_flow_assignment(&records);
        assert_valid(&records, &a);
        assert_eq!(a.object_sizes, vec![64]);
        assert_eq!(a.object_ids, vec![0, 0, 0]);
    }

    #[test]
    fn test_overlapping_tensors_separate() {
        let records = vec![
            TensorUsageRecord::new(16, 0, 2),
            TensorUsageRecord::new(16, 1, 3),
        ];
        let a = min_cost_flow_assignment(&records);
        assert_valid(&records, &a);
        assert_eq!(a.object_sizes.len(), 2);
    }

    #[test]
    fn test_empty() {
        let a = min_cost_flow_assignment(&[]);
        assert!(a.object_ids.is_empty());
        assert!(a.object_sizes.is_empty());
    }
}
