//! Online Learner - gradient recalibration of causal coefficients.
//!
//! For every observed `(previous, actual)` pair:
//!
//! ```text
//! error[n]  = actual[n] - predicted[n]
//! g         = -error[to] · state[from]
//! m         = β·m_prev + (1 - β)·g
//! delta     = clamp(lr · (m + λ·coef), ±max_adjustment)
//! coef'     = clamp(coef - delta, prior range)      if |delta| > min_delta
//! ```
//!
//! The learner owns the only writable handle to its graph; predictors borrow
//! it read-only through [`OnlineLearner::graph`].

use crate::error::{EngineError, Result};
use crate::graph::{CausalGraph, Confidence};
use crate::node::NodeId;
use crate::numeric::mean;
use crate::prior::EvolutionState;
use crate::state::{validate_period_order, Snapshot, StateVector};
use crate::transition::TransitionModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which model produces the prediction being corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    /// One-step linear propagation through the graph
    #[default]
    Causal,
    /// Full nonlinear transition with the snapshot's actions
    Nonlinear,
}

/// Learner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub learning_rate: f64,
    /// Momentum decay β
    pub momentum_beta: f64,
    /// L2 pull toward zero
    pub l2_lambda: f64,
    pub max_adjustment_per_step: f64,
    /// Smallest delta that is applied
    pub min_delta: f64,
    /// Links below this tier are left alone
    pub min_confidence_to_adjust: Confidence,
    pub medium_after_updates: u32,
    pub high_after_updates: u32,
    /// Shortest series `learn_series` accepts
    pub min_periods: usize,
    pub epochs: usize,
    /// Stop once an epoch's average MSE falls below this
    pub early_stop_mse: f64,
    pub predictor: PredictorKind,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum_beta: 0.3,
            l2_lambda: 0.001,
            max_adjustment_per_step: 0.05,
            min_delta: 0.001,
            min_confidence_to_adjust: Confidence::Low,
            medium_after_updates: 5,
            high_after_updates: 10,
            min_periods: 3,
            epochs: 1,
            early_stop_mse: 0.001,
            predictor: PredictorKind::Causal,
        }
    }
}

impl LearnerConfig {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::SerializationError(e.to_string()))
    }
}

/// A coefficient change applied during one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientAdjustment {
    pub from: NodeId,
    pub to: NodeId,
    pub key: String,
    pub old_value: f64,
    pub new_value: f64,
    pub gradient: f64,
    pub momentum: f64,
}

/// Record of one learning step, handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStep {
    pub step: usize,
    pub period_from: i64,
    pub period_to: i64,
    pub predicted: StateVector,
    pub actual: StateVector,
    /// `actual - predicted` for nodes observed in both
    pub errors: BTreeMap<NodeId, f64>,
    pub mse: f64,
    pub mae: f64,
    pub adjustments: Vec<CoefficientAdjustment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearningStatus {
    Completed,
    /// Series too short; nothing was learned
    InsufficientData { required: usize, available: usize },
}

/// Outcome of a batch learning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub status: LearningStatus,
    pub steps: Vec<LearningStep>,
    pub epochs_run: usize,
    /// Average MSE of the last epoch run
    pub final_mse: Option<f64>,
    pub early_stopped: bool,
}

impl LearningReport {
    fn insufficient(required: usize, available: usize) -> Self {
        Self {
            status: LearningStatus::InsufficientData { required, available },
            steps: Vec::new(),
            epochs_run: 0,
            final_mse: None,
            early_stopped: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == LearningStatus::Completed
    }

    /// Every adjustment across all steps.
    pub fn adjustments(&self) -> impl Iterator<Item = &CoefficientAdjustment> {
        self.steps.iter().flat_map(|s| s.adjustments.iter())
    }
}

/// Calendar month of a `YYYYMM` period, if it looks like one.
pub fn month_of(period: i64) -> Option<u8> {
    let month = period.rem_euclid(100);
    (1..=12).contains(&month).then_some(month as u8)
}

/// Online coefficient learner for one business entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineLearner {
    config: LearnerConfig,
    graph: CausalGraph,
    transition: TransitionModel,
    /// Parallel to `graph.links()`
    momentum: Vec<f64>,
    evolution: EvolutionState,
    steps_taken: usize,
}

impl OnlineLearner {
    pub fn new(graph: CausalGraph, transition: TransitionModel, config: LearnerConfig) -> Self {
        let momentum = vec![0.0; graph.len()];
        Self {
            config,
            graph,
            transition,
            momentum,
            evolution: EvolutionState::new(),
            steps_taken: 0,
        }
    }

    /// Continue from previously learned evolution state.
    pub fn with_evolution(mut self, evolution: EvolutionState) -> Self {
        self.evolution = evolution;
        self
    }

    /// Read-only view of the coefficients.
    pub fn graph(&self) -> &CausalGraph {
        &self.graph
    }

    pub fn into_graph(self) -> CausalGraph {
        self.graph
    }

    pub fn transition(&self) -> &TransitionModel {
        &self.transition
    }

    /// Swap in a transition model rebuilt from recalibrated priors.
    pub fn set_transition(&mut self, transition: TransitionModel) {
        self.transition = transition;
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn evolution(&self) -> &EvolutionState {
        &self.evolution
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Record an observed metric value (e.g. a threshold key) into the
    /// evolution state.
    pub fn observe_metric(&mut self, key: &str, prior: f64, value: f64, month: Option<u8>) {
        self.evolution.observe(key, prior, value, month);
    }

    /// Current momentum of a link, 0 if the link does not exist.
    pub fn momentum_of(&self, from: NodeId, to: NodeId) -> f64 {
        self.graph
            .link_index(from, to)
            .and_then(|idx| self.momentum.get(idx).copied())
            .unwrap_or(0.0)
    }

    /// Predict the state following `previous` with the configured predictor.
    pub fn predict(&self, previous: &Snapshot) -> StateVector {
        match self.config.predictor {
            PredictorKind::Causal => self.graph.propagate(&previous.state),
            PredictorKind::Nonlinear => {
                self.transition
                    .next_state(&self.graph, &previous.state, &previous.action, &previous.external)
                    .state
            }
        }
    }

    /// Learn from a single observed transition.
    pub fn learn_step(&mut self, previous: &Snapshot, actual: &Snapshot) -> Result<LearningStep> {
        if actual.period <= previous.period {
            return Err(EngineError::PeriodOrder {
                previous: previous.period,
                next: actual.period,
            });
        }
        Ok(self.step(previous, actual))
    }

    /// Replay an ordered series for the configured number of epochs.
    ///
    /// Too-short series are reported, not raised; out-of-order periods are
    /// an error.
    pub fn learn_series(&mut self, series: &[Snapshot]) -> Result<LearningReport> {
        validate_period_order(series)?;

        let required = self.config.min_periods.max(2);
        if series.len() < required {
            tracing::warn!(
                required,
                available = series.len(),
                "series too short to learn from"
            );
            return Ok(LearningReport::insufficient(required, series.len()));
        }

        let mut report = LearningReport {
            status: LearningStatus::Completed,
            steps: Vec::new(),
            epochs_run: 0,
            final_mse: None,
            early_stopped: false,
        };

        for epoch in 0..self.config.epochs.max(1) {
            let mut epoch_mse = Vec::with_capacity(series.len() - 1);
            for pair in series.windows(2) {
                let step = self.step(&pair[0], &pair[1]);
                epoch_mse.push(step.mse);
                report.steps.push(step);
            }

            let avg = mean(&epoch_mse).unwrap_or(0.0);
            report.epochs_run = epoch + 1;
            report.final_mse = Some(avg);
            tracing::info!(epoch, mse = avg, "epoch complete");

            if avg < self.config.early_stop_mse {
                tracing::info!(epoch, mse = avg, "early stop");
                report.early_stopped = true;
                break;
            }
        }

        Ok(report)
    }

    fn step(&mut self, previous: &Snapshot, actual: &Snapshot) -> LearningStep {
        if self.momentum.len() != self.graph.len() {
            self.momentum.resize(self.graph.len(), 0.0);
        }

        let predicted = self.predict(previous);

        let mut errors = BTreeMap::new();
        for (id, observed) in actual.state.iter() {
            let Some(expected) = predicted.get(id) else {
                continue;
            };
            let err = observed - expected;
            if err.is_finite() {
                errors.insert(id, err);
            }
        }
        let squared: Vec<f64> = errors.values().map(|e| e * e).collect();
        let absolute: Vec<f64> = errors.values().map(|e| e.abs()).collect();
        let mse = mean(&squared).unwrap_or(0.0);
        let mae = mean(&absolute).unwrap_or(0.0);

        let adjustments = self.adjust(&previous.state, &errors, month_of(actual.period));

        let step = self.steps_taken;
        self.steps_taken += 1;
        tracing::debug!(
            step,
            mse,
            mae,
            adjustments = adjustments.len(),
            "learning step"
        );

        LearningStep {
            step,
            period_from: previous.period,
            period_to: actual.period,
            predicted,
            actual: actual.state.clone(),
            errors,
            mse,
            mae,
            adjustments,
        }
    }

    fn adjust(
        &mut self,
        state: &StateVector,
        errors: &BTreeMap<NodeId, f64>,
        month: Option<u8>,
    ) -> Vec<CoefficientAdjustment> {
        let cfg = &self.config;
        let mut adjustments = Vec::new();

        for idx in 0..self.graph.len() {
            let link = &self.graph.links()[idx];
            if link.is_frozen() {
                tracing::trace!(from = %link.from, to = %link.to, "frozen link skipped");
                continue;
            }
            if link.confidence < cfg.min_confidence_to_adjust {
                continue;
            }
            let Some(&err) = errors.get(&link.to) else {
                continue;
            };
            let source = state.value_or(link.from, 0.0);
            if source == 0.0 || !source.is_finite() {
                continue;
            }

            let gradient = -err * source;
            let momentum =
                cfg.momentum_beta * self.momentum[idx] + (1.0 - cfg.momentum_beta) * gradient;
            self.momentum[idx] = momentum;

            let old_value = link.coefficient;
            let limit = cfg.max_adjustment_per_step.abs();
            let delta = (cfg.learning_rate * (momentum + cfg.l2_lambda * old_value)).clamp(-limit, limit);
            if !delta.is_finite() || delta.abs() <= cfg.min_delta {
                continue;
            }

            let target = link.bounds().clamp(old_value - delta);
            if target == old_value {
                continue;
            }

            let (from, to, prior) = (link.from, link.to, link.prior);
            let new_value = self.graph.set_coefficient(idx, target);
            self.graph
                .record_update(idx, cfg.medium_after_updates, cfg.high_after_updates);

            let key = crate::graph::link_key(from, to);
            self.evolution.observe(&key, prior, new_value, month);
            adjustments.push(CoefficientAdjustment {
                from,
                to,
                key,
                old_value,
                new_value,
                gradient,
                momentum,
            });
        }

        adjustments
    }
}
