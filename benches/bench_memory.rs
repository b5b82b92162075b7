//! Memory strategy benchmarks.
//!
//! Compares assignment time of every strategy on synthetic usage records
//! shaped like real networks:
//!   - Chain: each tensor lives for two tasks (plain sequential model)
//!   - Residual: every fourth tensor stays alive for a whole block
//!   - Full compile: a softmax/unary chain through the dry-run device

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gllm_gpu_graph::compiler::graph::{Graph, OpKind, UnaryOp};
use gllm_gpu_graph::compiler::memory::{assign_objects_to_tensors, MemoryStrategy, TensorUsageRecord};
use gllm_gpu_graph::{
    Bhwc, CompileOptions, CompiledGraph, DeviceInfo, DryRunDevice, GpuVendor, TensorStorageType,
};

// ─── Record generators ───

fn chain_records(n: usize) -> Vec<TensorUsageRecord<usize>> {
    (0..n)
        .map(|i| TensorUsageRecord::new(1024 * (1 + i % 7), i, i + 1))
        .collect()
}

fn residual_records(n: usize) -> Vec<TensorUsageRecord<usize>> {
    (0..n)
        .map(|i| {
            let last = if i % 4 == 0 { (i + 8).min(n) } else { i + 1 };
            TensorUsageRecord::new(4096 * (1 + i % 3), i, last)
        })
        .collect()
}

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign_objects");
    for n in [64, 256] {
        for (name, records) in [("chain", chain_records(n)), ("residual", residual_records(n))] {
            group.throughput(Throughput::Elements(n as u64));
            for strategy in MemoryStrategy::ALL {
                group.bench_with_input(
                    BenchmarkId::new(format!("{name}/{strategy}"), n),
                    &records,
                    |b, records| {
                        b.iter(|| assign_objects_to_tensors(black_box(records), strategy))
                    },
                );
            }
        }
    }
    group.finish();
}

// ─── Full pipeline ───

fn chain_graph(len: usize) -> Graph {
    let shape = Bhwc::new(1, 32, 32, 16);
    let mut g = Graph::new();
    let mut t = g.add_input(shape, "x");
    for i in 0..len {
        let next = g.add_tensor(shape, &format!("t{i}"));
        let kind = if i % 3 == 0 {
            OpKind::Softmax
        } else {
            OpKind::ElementwiseUnary(UnaryOp::Sigmoid)
        };
        g.add_op(kind, &[t], &[next]).expect("chain op");
        t = next;
    }
    g.mark_output(t).expect("chain output");
    g
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let options = CompileOptions {
        storage_type: Some(TensorStorageType::Buffer),
        ..CompileOptions::default()
    };
    for len in [16, 64] {
        let graph = chain_graph(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &graph, |b, graph| {
            b.iter(|| {
                let mut device = DryRunDevice::new(DeviceInfo::generic("bench", GpuVendor::Nvidia));
                CompiledGraph::compile(black_box(graph), &options, &mut device)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_strategies, bench_compile);
criterion_main!(benches);
