//! End-to-end properties of the engine: transition ranges, learning bounds,
//! threshold direction and pressure deadlines.

use business_physics::numeric::safe_div;
use business_physics::{
    ActionParams, BusinessEngine, CausalGraph, CausalLink, Confidence, Direction, EngineConfig,
    ExternalParams, Law, LearnerConfig, LearningStatus, LinkSource, NodeId, OnlineLearner,
    PressureClassifier, PressureConfig, PressureState, PriorRange, Role, Snapshot, StateVector,
    Threshold, ThresholdStatus, TransitionModel,
};

fn academy() -> StateVector {
    StateVector::new()
        .with_role(Role::Cash, 23_000_000.0)
        .with_role(Role::Income, 52_000_000.0)
        .with_role(Role::Expense, 41_000_000.0)
        .with_role(Role::Customers, 127.0)
        .with_role(Role::Loyalty, 0.78)
}

/// Monthly snapshots with drifting ratios and noisy money.
fn drifting_series(months: i64) -> Vec<Snapshot> {
    (0..months)
        .map(|m| {
            let t = m as f64;
            let wobble = if m % 2 == 0 { 0.03 } else { -0.02 };
            let state = academy()
                .with_role(Role::Cash, 23_000_000.0 - 400_000.0 * t)
                .with_role(Role::Customers, 127.0 + (m % 3) as f64)
                .with_role(Role::Quality, 0.72 - 0.01 * t + wobble)
                .with_role(Role::Loyalty, 0.78 - 0.012 * t - wobble)
                .with_role(Role::ChurnRate, 0.04 + 0.004 * t)
                .with_role(Role::StaffRetention, 0.85 + wobble);
            let period = 202400 + 100 * (m / 12) + (m % 12) + 1;
            Snapshot::new(period, state)
        })
        .collect()
}

fn assert_in_law_range(state: &StateVector) {
    for (id, value) in state.iter() {
        assert!(value.is_finite(), "{id} is not finite");
        assert_eq!(id.law().bound(value), value, "{id} out of range: {value}");
    }
}

#[test]
fn test_loyalty_erodes_into_cascade_without_effort() {
    let model = TransitionModel::default();
    let graph = CausalGraph::seeded();
    let steps = vec![(ActionParams::default(), ExternalParams::default()); 12];

    let outcomes = model.simulate(&graph, &academy(), &steps);
    assert_eq!(outcomes.len(), 12);

    let mut previous = 0.78;
    for outcome in &outcomes {
        let loyalty = outcome.state.role(Role::Loyalty).unwrap();
        assert!(loyalty < previous, "loyalty rose to {loyalty}");
        previous = loyalty;
    }
    assert!(previous < 0.65);

    let cascades: Vec<_> = outcomes.iter().filter(|o| o.cascade_churn() > 0.0).collect();
    assert_eq!(cascades.len(), 1);
    assert_eq!(cascades[0].cascades[0].monitored, Role::Loyalty.node());
}

#[test]
fn test_simulated_states_stay_in_range() {
    let model = TransitionModel::default();
    let graph = CausalGraph::seeded();
    let steps: Vec<_> = (0..24)
        .map(|m| {
            let action = ActionParams {
                marketing_spend: if m % 4 == 0 { 0.0 } else { 2_000_000.0 * m as f64 },
                retention_effort: (m % 5) as f64 * 0.3,
                salary_adjustment: if m % 6 == 0 { -5_000_000.0 } else { 500_000.0 },
                hiring_count: (m % 3) as f64,
            };
            let external = ExternalParams {
                market_growth: 0.1 - 0.02 * m as f64,
                competitive_pressure: (m % 7) as f64 * 0.2,
                seasonal_factor: if m % 12 < 2 { 0.3 } else { -0.1 },
            };
            (action, external)
        })
        .collect();

    for outcome in model.simulate(&graph, &academy(), &steps) {
        assert_in_law_range(&outcome.state);
        let customers = outcome.state.role(Role::Customers).unwrap();
        assert!(customers >= 0.0);
        assert_eq!(customers, customers.round());
        assert!(outcome.acquisition_cost.is_finite());
    }
}

#[test]
fn test_learning_respects_bounds_and_freezes() {
    let graph = CausalGraph::seeded();
    let frozen: Vec<(NodeId, NodeId, f64)> = graph
        .links()
        .iter()
        .filter(|l| l.is_frozen())
        .map(|l| (l.from, l.to, l.coefficient))
        .collect();
    assert!(!frozen.is_empty());

    let config = LearnerConfig {
        learning_rate: 0.5,
        ..Default::default()
    };
    let mut learner = OnlineLearner::new(graph, TransitionModel::default(), config);
    let series = drifting_series(18);

    let mut tiers: Vec<Confidence> = learner.graph().links().iter().map(|l| l.confidence).collect();
    for pair in series.windows(2) {
        learner.learn_step(&pair[0], &pair[1]).unwrap();

        for (link, before) in learner.graph().links().iter().zip(tiers.iter_mut()) {
            assert!(
                link.bounds().contains(link.coefficient),
                "{} left its range: {}",
                link.key(),
                link.coefficient
            );
            assert!(link.confidence >= *before, "{} lost confidence", link.key());
            *before = link.confidence;
        }
    }

    for (from, to, coefficient) in frozen {
        assert_eq!(learner.graph().get(from, to), coefficient);
        assert_eq!(learner.graph().link(from, to).unwrap().updates, 0);
    }
}

#[test]
fn test_frozen_accounting_link_over_twenty_steps() {
    let link = CausalLink::new(
        Role::Income.node(),
        Role::Cash.node(),
        0.9,
        Some(PriorRange::new(0.85, 0.95).unwrap()),
        Confidence::High,
        LinkSource::Accounting,
        Law::Conservation,
        "bank deposits",
    );
    let config = LearnerConfig {
        learning_rate: 1.0,
        min_confidence_to_adjust: Confidence::Low,
        ..Default::default()
    };
    let graph = CausalGraph::from_links(vec![link]).unwrap();
    let mut learner = OnlineLearner::new(graph, TransitionModel::default(), config);

    let a = Snapshot::new(202401, academy());
    let b = Snapshot::new(202402, academy().with_role(Role::Cash, 60_000_000.0));
    for _ in 0..20 {
        let step = learner.learn_step(&a, &b).unwrap();
        assert!(step.adjustments.is_empty());
    }
    assert_eq!(learner.graph().get(Role::Income.node(), Role::Cash.node()), 0.9);
}

#[test]
fn test_dense_matrix_is_stable() {
    let graph = CausalGraph::seeded();
    let first = graph.to_dense_matrix().clone();
    let second = graph.to_dense_matrix();
    assert_eq!(&first, second);
    assert_eq!(first.nrows(), 72);
    assert_eq!(first.ncols(), 72);

    let income = Role::Income.node().index();
    let cash = Role::Cash.node().index();
    assert_eq!(first[(income, cash)], graph.get(Role::Income.node(), Role::Cash.node()));
}

#[test]
fn test_threshold_direction() {
    let loyalty = Threshold::new("loyalty", Role::Loyalty.node(), 0.7, 0.6, Direction::Below);
    assert_eq!(loyalty.static_status(0.8), ThresholdStatus::Stable);
    assert_eq!(loyalty.static_status(0.65), ThresholdStatus::Warning);
    assert_eq!(loyalty.static_status(0.55), ThresholdStatus::Critical);

    let dependency = Threshold::new("dependency", Role::Dependency.node(), 0.4, 0.6, Direction::Above);
    assert_eq!(dependency.static_status(0.2), ThresholdStatus::Stable);
    assert_eq!(dependency.static_status(0.5), ThresholdStatus::Warning);
    assert_eq!(dependency.static_status(0.7), ThresholdStatus::Critical);
}

#[test]
fn test_safe_div_fallback() {
    assert_eq!(safe_div(100.0, 0.0, 0.0), 0.0);
    assert_eq!(safe_div(100.0, 4.0, 0.0), 25.0);
}

#[test]
fn test_expired_deadline_is_irreversible() {
    let classifier = PressureClassifier::new(PressureConfig::default());
    let healthy = 0.95;
    assert_eq!(
        classifier.classify(Role::Loyalty.node(), healthy, None, None),
        PressureState::Ignorable
    );
    assert_eq!(
        classifier.classify(Role::Loyalty.node(), healthy, None, Some(0)),
        PressureState::Irreversible
    );
}

#[test]
fn test_engine_learns_then_reports() {
    let mut engine = BusinessEngine::new(EngineConfig::for_entity("tutoring_academy"));

    let short = engine.learn_series(&drifting_series(1)).unwrap();
    assert_eq!(
        short.status,
        LearningStatus::InsufficientData {
            required: 3,
            available: 1
        }
    );
    assert_eq!(engine.learner().steps_taken(), 0);

    let series = drifting_series(13);
    let report = engine.learn_series(&series).unwrap();
    assert!(report.is_completed());
    assert_eq!(report.steps.len(), 12);
    assert!(report.final_mse.is_some());

    let evolved = engine.evolution().get("loyalty").unwrap();
    assert_eq!(evolved.data_points, 13);
    assert_eq!(evolved.evolution_level, 3);

    let last = &series[12].state;
    let outcome = engine.next_state(last, &ActionParams::default(), &ExternalParams::default());
    assert_in_law_range(&outcome.state);
}
