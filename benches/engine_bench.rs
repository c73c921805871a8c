//! Benchmarks for the business physics engine.
//!
//! Run with: cargo bench

use business_physics::{
    ActionParams, CausalGraph, ExternalParams, LearnerConfig, NodeId, OnlineLearner,
    PressureClassifier, PressureConfig, PressureInput, Role, Snapshot, StateVector,
    TransitionModel,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

fn academy_state() -> StateVector {
    StateVector::new()
        .with_role(Role::Cash, 23_000_000.0)
        .with_role(Role::Income, 52_000_000.0)
        .with_role(Role::Expense, 41_000_000.0)
        .with_role(Role::Customers, 127.0)
        .with_role(Role::Loyalty, 0.78)
}

fn dense_state(seed: u64) -> StateVector {
    // Simple deterministic pseudo-random for reproducibility
    let mut x = seed;
    NodeId::all()
        .map(|id| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            (id, id.law().bound((x >> 11) as f64 / (1u64 << 53) as f64))
        })
        .collect()
}

fn bench_next_state(c: &mut Criterion) {
    let model = TransitionModel::default();
    let graph = CausalGraph::seeded();
    let action = ActionParams {
        marketing_spend: 1_000_000.0,
        retention_effort: 0.3,
        ..Default::default()
    };
    let external = ExternalParams::default();

    let mut group = c.benchmark_group("next_state");
    for (name, state) in [("sparse", academy_state()), ("dense", dense_state(42))] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &state, |b, s| {
            b.iter(|| model.next_state(black_box(&graph), black_box(s), &action, &external))
        });
    }
    group.finish();
}

fn bench_simulate(c: &mut Criterion) {
    let model = TransitionModel::default();
    let graph = CausalGraph::seeded();
    let state = academy_state();

    let mut group = c.benchmark_group("simulate");
    for steps in [12usize, 60, 240] {
        let inputs = vec![(ActionParams::default(), ExternalParams::default()); steps];
        group.throughput(Throughput::Elements(steps as u64));
        group.bench_with_input(BenchmarkId::from_parameter(steps), &inputs, |b, inputs| {
            b.iter(|| model.simulate(&graph, black_box(&state), inputs))
        });
    }
    group.finish();
}

fn bench_propagate(c: &mut Criterion) {
    let graph = CausalGraph::seeded();
    let state = dense_state(7);
    // warm the dense projection
    let _ = graph.to_dense_matrix();

    c.bench_function("propagate", |b| b.iter(|| graph.propagate(black_box(&state))));
}

fn bench_learn_step(c: &mut Criterion) {
    let previous = Snapshot::new(202401, dense_state(1));
    let actual = Snapshot::new(202402, dense_state(2));

    c.bench_function("learn_step", |b| {
        b.iter_batched(
            || {
                OnlineLearner::new(
                    CausalGraph::seeded(),
                    TransitionModel::default(),
                    LearnerConfig::default(),
                )
            },
            |mut learner| learner.learn_step(black_box(&previous), black_box(&actual)),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_pressure(c: &mut Criterion) {
    let classifier = PressureClassifier::new(PressureConfig::default().with_baseline(50_000_000.0));
    let inputs: Vec<PressureInput> = [
        (Role::Cash, 4_000_000.0, Some(12)),
        (Role::Loyalty, 0.66, Some(40)),
        (Role::ChurnRate, 0.09, None),
        (Role::StaffRetention, 0.7, Some(3)),
        (Role::Dependency, 0.55, None),
        (Role::AcquisitionFriction, 0.8, Some(0)),
    ]
    .iter()
    .map(|&(role, value, deadline_days)| PressureInput {
        node: role.node(),
        value,
        trend: Some(-0.01),
        deadline_days,
    })
    .collect();

    c.bench_function("pressure_report", |b| {
        b.iter(|| classifier.report(black_box(&inputs)))
    });
}

criterion_group!(
    benches,
    bench_next_state,
    bench_simulate,
    bench_propagate,
    bench_learn_step,
    bench_pressure,
);

criterion_main!(benches);
