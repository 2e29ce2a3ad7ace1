//! Benchmarks for output repair and graph ordering.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pasture::json::{parse, repair_json};
use pasture::pipeline::DependencyGraph;

fn repair_benchmark(c: &mut Criterion) {
    let broken = "Here is the result:\n```json\n{'name': 'widget', tags: ['a', 'b',], \"nested\": {\"count\": 3,\n```";
    c.bench_function("repair_json", |b| b.iter(|| repair_json(black_box(broken))));
    c.bench_function("parse_prose", |b| {
        b.iter(|| parse(black_box("The answer is four, with no structure at all.")))
    });
}

fn graph_benchmark(c: &mut Criterion) {
    let mut graph = DependencyGraph::new();
    for layer in 0..10 {
        for index in 0..10 {
            let deps: Vec<String> = if layer == 0 {
                Vec::new()
            } else {
                (0..10).map(|dep| format!("s{}_{dep}", layer - 1)).collect()
            };
            if graph.add(format!("s{layer}_{index}"), deps).is_err() {
                return;
            }
        }
    }

    c.bench_function("validate_100_steps", |b| b.iter(|| black_box(&graph).validate()));
    c.bench_function("topological_order_100_steps", |b| {
        b.iter(|| black_box(&graph).topological_order())
    });
}

criterion_group!(benches, repair_benchmark, graph_benchmark);
criterion_main!(benches);
