//! Runner fan-out benchmarks.
//!
//! Measures one event through a model runner for the in-process
//! mechanisms, with growing numbers of models and selector-scoped events.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use flowserve::dispatch::Dispatcher;
use flowserve::event::Event;
use flowserve::models::{ExecutionMechanism, FieldSelector, IncrementModel};
use flowserve::runner::ModelRunnerStep;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn runner(rt: &tokio::runtime::Runtime, models: usize, mechanism: ExecutionMechanism) -> ModelRunnerStep {
    let mut runner =
        ModelRunnerStep::new("bench", Arc::new(Dispatcher::default())).with_selector(FieldSelector::default());
    for i in 0..models {
        runner
            .add_model(IncrementModel::new(format!("m{i}"), 1).with_mechanism(mechanism))
            .expect("unique model names");
    }
    rt.block_on(runner.init()).expect("models load");
    runner
}

fn bench_fanout_width(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("runner_fanout");

    for mechanism in [ExecutionMechanism::Naive, ExecutionMechanism::Asyncio, ExecutionMechanism::ThreadPool] {
        for models in [1usize, 4, 16] {
            let runner = runner(&rt, models, mechanism);
            group.throughput(Throughput::Elements(models as u64));
            group.bench_function(BenchmarkId::new(mechanism.as_str(), models), |b| {
                b.iter(|| {
                    let event = Event::new(json!({"n": 1}));
                    black_box(rt.block_on(runner.run(&event)).expect("run"))
                })
            });
        }
    }

    group.finish();
}

fn bench_selected_subset(c: &mut Criterion) {
    let rt = runtime();
    let runner = runner(&rt, 16, ExecutionMechanism::Naive);
    let mut group = c.benchmark_group("runner_selection");

    for (name, selected) in [("one_of_16", vec!["m3"]), ("four_of_16", vec!["m0", "m5", "m10", "m15"])] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let event = Event::new(json!({"n": 1, "models": selected}));
                black_box(rt.block_on(runner.run(&event)).expect("run"))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout_width, bench_selected_subset);
criterion_main!(benches);
