//! Per-entity engine.
//!
//! [`BusinessEngine`] bundles everything one business needs: the node space,
//! its resolved priors, the learner (which owns the causal graph) and the
//! pressure classifier. There is no shared default instance; build one per
//! entity and serialize it between sessions.

use crate::error::{EngineError, Result};
use crate::graph::CausalGraph;
use crate::learner::{month_of, LearnerConfig, LearningReport, LearningStep, OnlineLearner};
use crate::node::{NodeId, NodeSpace};
use crate::pressure::{PressureClassifier, PressureConfig, PressureInput, PressureReport};
use crate::prior::{
    EvolutionState, ForecastPoint, PriorHierarchy, ThresholdContext, ThresholdEvaluation,
};
use crate::state::{ActionParams, ExternalParams, Snapshot, StateVector};
use crate::transition::{TransitionModel, TransitionOutcome, TransitionParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Industry key, e.g. `tutoring_academy`; empty for universal priors only
    pub entity_type: String,
    pub segment: Option<String>,
    pub learner: LearnerConfig,
    /// Overrides the profiles derived from the hierarchy
    pub pressure: Option<PressureConfig>,
}

impl EngineConfig {
    pub fn for_entity(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_learner(mut self, learner: LearnerConfig) -> Self {
        self.learner = learner;
        self
    }
}

/// Owned engine for one business entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessEngine {
    config: EngineConfig,
    #[serde(skip)]
    space: NodeSpace,
    hierarchy: PriorHierarchy,
    learner: OnlineLearner,
    pressure: PressureClassifier,
}

impl BusinessEngine {
    /// Engine with the built-in hierarchy and seed graph.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(config, PriorHierarchy::standard(), CausalGraph::seeded())
    }

    /// Engine over a custom hierarchy and graph.
    pub fn with_parts(config: EngineConfig, hierarchy: PriorHierarchy, graph: CausalGraph) -> Self {
        let segment = config.segment.as_deref();
        let priors = hierarchy.merged_prior(&config.entity_type, segment);
        let transition = TransitionModel::new(TransitionParams::from_priors(&priors));
        let pressure = config
            .pressure
            .clone()
            .unwrap_or_else(|| PressureConfig::from_hierarchy(&hierarchy, &config.entity_type, segment));
        let learner = OnlineLearner::new(graph, transition, config.learner.clone());

        Self {
            pressure: PressureClassifier::new(pressure),
            space: NodeSpace::new(),
            hierarchy,
            learner,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn space(&self) -> &NodeSpace {
        &self.space
    }

    pub fn hierarchy(&self) -> &PriorHierarchy {
        &self.hierarchy
    }

    /// Read-only coefficients; only learning writes them.
    pub fn graph(&self) -> &CausalGraph {
        self.learner.graph()
    }

    pub fn learner(&self) -> &OnlineLearner {
        &self.learner
    }

    pub fn transition(&self) -> &TransitionModel {
        self.learner.transition()
    }

    pub fn evolution(&self) -> &EvolutionState {
        self.learner.evolution()
    }

    pub fn classifier(&self) -> &PressureClassifier {
        &self.pressure
    }

    /// Merged priors with this entity's learned values layered on top.
    pub fn resolved_priors(&self) -> BTreeMap<String, f64> {
        self.hierarchy.resolve(
            &self.config.entity_type,
            self.config.segment.as_deref(),
            self.learner.evolution(),
        )
    }

    /// Build a state from role names or symbolic ids.
    pub fn state_from(&self, pairs: &[(&str, f64)]) -> Result<StateVector> {
        StateVector::from_named(&self.space, pairs)
    }

    /// Predict the next period.
    pub fn next_state(
        &self,
        state: &StateVector,
        action: &ActionParams,
        external: &ExternalParams,
    ) -> TransitionOutcome {
        self.transition()
            .next_state(self.graph(), state, action, external)
    }

    pub fn simulate(
        &self,
        state: &StateVector,
        steps: &[(ActionParams, ExternalParams)],
    ) -> Vec<TransitionOutcome> {
        self.transition().simulate(self.graph(), state, steps)
    }

    /// One-step linear propagation. A sensitivity diagnostic, not a forecast.
    pub fn propagate(&self, state: &StateVector) -> StateVector {
        self.graph().propagate(state)
    }

    /// One-hop sensitivity of a change at `node`.
    pub fn impact_of(&self, node: NodeId, delta: f64) -> BTreeMap<NodeId, f64> {
        self.graph().impact_of(node, delta)
    }

    /// Learn from one observed transition.
    ///
    /// Recalibrated link coefficients reach the next forecast through the
    /// graph; learned prior values through the rebuilt transition constants.
    pub fn learn_step(&mut self, previous: &Snapshot, actual: &Snapshot) -> Result<LearningStep> {
        let step = self.learner.learn_step(previous, actual)?;
        self.record_metrics(actual);
        self.refresh_transition();
        Ok(step)
    }

    /// Learn from a series and record its metrics.
    pub fn learn_series(&mut self, series: &[Snapshot]) -> Result<LearningReport> {
        let report = self.learner.learn_series(series)?;
        if report.is_completed() {
            for snapshot in series {
                self.record_metrics(snapshot);
            }
            self.refresh_transition();
        }
        Ok(report)
    }

    /// Record an observed value of a prior key, e.g. `inertia.loyalty`.
    ///
    /// The learned value overrides the shared layers in every later forecast.
    pub fn observe_prior(&mut self, key: &str, value: f64, month: Option<u8>) {
        let prior = self
            .hierarchy
            .merged_prior(&self.config.entity_type, self.config.segment.as_deref())
            .get(key)
            .copied()
            .unwrap_or(value);
        self.learner.observe_metric(key, prior, value, month);
        self.refresh_transition();
    }

    /// Rebuild the transition constants from the resolved priors.
    fn refresh_transition(&mut self) {
        let params = TransitionParams::from_priors(&self.resolved_priors());
        if &params != self.transition().params() {
            tracing::debug!("transition constants recalibrated");
            self.learner.set_transition(TransitionModel::new(params));
        }
    }

    /// Record threshold metrics from a snapshot into the evolution state.
    pub fn observe(&mut self, snapshot: &Snapshot) {
        self.record_metrics(snapshot);
        self.refresh_transition();
    }

    fn record_metrics(&mut self, snapshot: &Snapshot) {
        let priors = self
            .hierarchy
            .merged_prior(&self.config.entity_type, self.config.segment.as_deref());
        let month = month_of(snapshot.period);

        let observed: Vec<(String, f64, f64)> = self
            .hierarchy
            .thresholds(&self.config.entity_type, self.config.segment.as_deref())
            .into_iter()
            .filter_map(|t| {
                let value = snapshot.state.get(t.node)?;
                let prior = priors
                    .get(&format!("baseline.{}", t.key))
                    .copied()
                    .unwrap_or(value);
                Some((t.key, prior, value))
            })
            .collect();

        for (key, prior, value) in observed {
            self.learner.observe_metric(&key, prior, value, month);
        }
    }

    /// Evaluate a threshold with this entity's evolution record.
    pub fn evaluate_threshold(
        &self,
        key: &str,
        value: f64,
        history: &[f64],
        predictions: &[ForecastPoint],
        state: Option<&StateVector>,
    ) -> Result<ThresholdEvaluation> {
        let mut ctx = ThresholdContext::new(&self.config.entity_type, self.config.segment.as_deref())
            .with_history(history)
            .with_predictions(predictions);
        if let Some(evolution) = self.learner.evolution().get(key) {
            ctx = ctx.with_evolution(evolution);
        }
        if let Some(state) = state {
            ctx = ctx.with_state(state);
        }
        self.hierarchy.evaluate_threshold(key, value, &ctx)
    }

    /// Pressure over every profiled node in a state.
    pub fn classify_pressure(
        &self,
        state: &StateVector,
        trends: &BTreeMap<NodeId, f64>,
        deadlines: &BTreeMap<NodeId, i64>,
    ) -> PressureReport {
        self.pressure.report_state(state, trends, deadlines)
    }

    pub fn pressure_report(&self, inputs: &[PressureInput]) -> PressureReport {
        self.pressure.report(inputs)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::SerializationError(e.to_string()))
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let engine: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::SerializationError(e.to_string()))?;
        // rebuild the profile index
        let pressure = PressureClassifier::new(engine.pressure.config().clone());
        Ok(Self { pressure, ..engine })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Role;
    use crate::prior::ThresholdStatus;

    fn academy() -> BusinessEngine {
        BusinessEngine::new(EngineConfig::for_entity("tutoring_academy"))
    }

    #[test]
    fn test_industry_priors_reach_transition() {
        let engine = academy();
        assert_eq!(engine.transition().params().loyalty_inertia, 0.85);
        assert_eq!(engine.transition().params().quality_decay, 0.04);

        let universal = BusinessEngine::new(EngineConfig::default());
        assert_eq!(universal.transition().params().loyalty_inertia, 0.8);
    }

    #[test]
    fn test_state_from_names() {
        let engine = academy();
        let state = engine
            .state_from(&[("cash", 23_000_000.0), ("inertia.customer", 0.78)])
            .unwrap();
        assert_eq!(state.role(Role::Loyalty), Some(0.78));
        assert!(engine.state_from(&[("nonsense", 1.0)]).is_err());
    }

    #[test]
    fn test_observe_builds_evolution() {
        let mut engine = academy();
        for m in 1..=3 {
            let snap = Snapshot::new(
                202400 + m,
                StateVector::new().with_role(Role::Loyalty, 0.72),
            );
            engine.observe(&snap);
        }
        let evolved = engine.evolution().get("loyalty").unwrap();
        assert_eq!(evolved.data_points, 3);
        assert_eq!(evolved.evolution_level, 1);
        assert_eq!(evolved.prior_value, 0.75);
    }

    #[test]
    fn test_evaluate_threshold_static() {
        let engine = academy();
        let eval = engine
            .evaluate_threshold("loyalty", 0.55, &[], &[], None)
            .unwrap();
        assert_eq!(eval.status, ThresholdStatus::Critical);
        assert!(engine
            .evaluate_threshold("no_such_metric", 0.5, &[], &[], None)
            .is_err());
    }

    #[test]
    fn test_classify_pressure() {
        let engine = academy();
        let state = StateVector::new()
            .with_role(Role::Income, 52_000_000.0)
            .with_role(Role::Cash, 2_000_000.0)
            .with_role(Role::Loyalty, 0.9);
        let mut deadlines = BTreeMap::new();
        deadlines.insert(Role::Cash.node(), 7);

        let report = engine.classify_pressure(&state, &BTreeMap::new(), &deadlines);
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.urgent.len(), 1);
        assert_eq!(report.items[0].node, Role::Cash.node());
    }

    #[test]
    fn test_learning_changes_the_forecast() {
        let config = EngineConfig::for_entity("tutoring_academy").with_learner(LearnerConfig {
            learning_rate: 0.5,
            ..Default::default()
        });
        let mut engine = BusinessEngine::new(config);
        let state = StateVector::new()
            .with_role(Role::Customers, 127.0)
            .with_role(Role::Quality, 0.7)
            .with_role(Role::Loyalty, 0.8)
            .with_role(Role::ChurnRate, 0.04);
        let idle = (ActionParams::default(), ExternalParams::default());
        let before = engine.next_state(&state, &idle.0, &idle.1);

        let series: Vec<Snapshot> = (1..=6)
            .map(|m| {
                Snapshot::new(
                    202400 + m,
                    StateVector::new()
                        .with_role(Role::Quality, 0.7)
                        .with_role(Role::Loyalty, 0.78)
                        .with_role(Role::ChurnRate, 0.04),
                )
            })
            .collect();
        let report = engine.learn_series(&series).unwrap();
        assert!(report.adjustments().count() > 0);

        // propagation under-predicts loyalty, so quality -> loyalty strengthens
        let quality_link = engine.graph().link(Role::Quality.node(), Role::Loyalty.node()).unwrap();
        assert!(quality_link.coefficient > quality_link.prior);

        let after = engine.next_state(&state, &idle.0, &idle.1);
        let loyalty = |o: &TransitionOutcome| o.state.role(Role::Loyalty).unwrap();
        let churn = |o: &TransitionOutcome| o.state.role(Role::ChurnRate).unwrap();
        assert!(loyalty(&after) > loyalty(&before));
        assert!(churn(&after) < churn(&before));
    }

    #[test]
    fn test_observed_prior_recalibrates_transition() {
        let mut engine = academy();
        assert_eq!(engine.transition().params().loyalty_inertia, 0.85);

        for m in 1..=3 {
            engine.observe_prior("inertia.loyalty", 0.95, Some(m));
        }
        let learned = engine.evolution().get("inertia.loyalty").unwrap();
        assert_eq!(learned.prior_value, 0.85);
        assert!(learned.current_value > 0.85);
        assert_eq!(engine.transition().params().loyalty_inertia, learned.current_value);
        assert_eq!(engine.resolved_priors()["inertia.loyalty"], learned.current_value);
    }

    #[test]
    fn test_json_roundtrip_keeps_learning() {
        let mut engine = academy();
        let series: Vec<Snapshot> = (1..=4)
            .map(|m| {
                Snapshot::new(
                    202400 + m,
                    StateVector::new()
                        .with_role(Role::Quality, 0.7)
                        .with_role(Role::Loyalty, 0.75 - 0.01 * m as f64),
                )
            })
            .collect();
        let report = engine.learn_series(&series).unwrap();
        assert!(report.is_completed());

        let json = engine.to_json().unwrap();
        let restored = BusinessEngine::from_json(&json).unwrap();
        assert_eq!(restored.graph().len(), engine.graph().len());
        for (a, b) in restored.graph().links().iter().zip(engine.graph().links()) {
            assert!((a.coefficient - b.coefficient).abs() < 1e-12);
            assert_eq!(a.updates, b.updates);
        }
        assert_eq!(restored.evolution().len(), engine.evolution().len());
        assert_eq!(
            restored.evolution().get("loyalty").map(|c| c.data_points),
            Some(4)
        );
        assert!(restored.classifier().profile(Role::Cash.node()).is_some());
        assert_eq!(restored.space().len(), 72);
    }
}
