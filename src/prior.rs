//! Prior Hierarchy - layered defaults and threshold evaluation.
//!
//! Layers, later overriding earlier:
//!
//! ```text
//! universal law constants → industry defaults → segment refinements → individual (learned)
//! ```
//!
//! The first three are static tables held here. The individual layer comes
//! from an [`EvolutionState`] built up at runtime by the learner.
//!
//! Threshold evaluation grows more sophisticated with the evolution level of
//! the metric:
//!
//! | level | rule                                               |
//! |-------|----------------------------------------------------|
//! | 0     | static warning/critical bounds                     |
//! | 1     | bounds nudged toward observed deviation from prior |
//! | 2     | compound conditions over two nodes                 |
//! | 3     | trend rules (consecutive declines, acceleration)   |
//! | 4     | forecasts against the threshold                    |

use crate::error::{EngineError, Result};
use crate::node::{NodeId, Role};
use crate::numeric::{mean, safe_div0};
use crate::state::StateVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Data points needed to reach evolution levels 1..=4.
pub const LEVEL_DATA_POINTS: [u32; 4] = [3, 6, 12, 24];

/// Highest evolution level.
pub const MAX_EVOLUTION_LEVEL: u8 = 4;

/// Observations kept per evolved coefficient.
pub const HISTORY_LIMIT: usize = 60;

/// Fraction of the observed deviation applied to the warning bound at level 1.
pub const REFINEMENT_RATE: f64 = 0.5;

/// Relative distance to a bound below which confidence is reduced.
pub const BOUNDARY_MARGIN: f64 = 0.1;

/// Curvature smaller than this is treated as a straight line.
const CURVATURE_EPSILON: f64 = 1e-9;

/// `1 - 1/(1 + sqrt(n))`: 0 with no data, approaching 1.
pub fn confidence_for(data_points: u32) -> f64 {
    1.0 - 1.0 / (1.0 + (data_points as f64).sqrt())
}

/// Evolution level earned by a data-point count.
pub fn level_for(data_points: u32) -> u8 {
    LEVEL_DATA_POINTS
        .iter()
        .filter(|&&needed| data_points >= needed)
        .count() as u8
}

/// Which side of a threshold is dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Danger when the value falls below the bound
    Below,
    /// Danger when the value rises above the bound (e.g. dependency)
    Above,
}

impl Direction {
    /// Whether `value` is on the dangerous side of `bound`.
    #[inline]
    pub fn breaches(&self, value: f64, bound: f64) -> bool {
        match self {
            Direction::Below => value < bound,
            Direction::Above => value > bound,
        }
    }

    /// Whether moving from `from` to `to` is a move toward danger.
    #[inline]
    pub fn worsens(&self, from: f64, to: f64) -> bool {
        match self {
            Direction::Below => to < from,
            Direction::Above => to > from,
        }
    }

    /// `+1` when danger lies upward, `-1` when downward.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Below => -1.0,
            Direction::Above => 1.0,
        }
    }
}

/// Outcome of evaluating a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThresholdStatus {
    Stable,
    Warning,
    Critical,
}

impl ThresholdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdStatus::Stable => "STABLE",
            ThresholdStatus::Warning => "WARNING",
            ThresholdStatus::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ThresholdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Warning and critical bounds for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub key: String,
    pub node: NodeId,
    pub warning: f64,
    pub critical: f64,
    pub direction: Direction,
    #[serde(default)]
    pub deadline_warning_days: Option<u32>,
}

impl Threshold {
    /// Build a threshold, pulling the warning bound back to the critical bound
    /// if the two are out of order.
    pub fn new(
        key: impl Into<String>,
        node: NodeId,
        warning: f64,
        critical: f64,
        direction: Direction,
    ) -> Self {
        let warning = match direction {
            Direction::Below => warning.max(critical),
            Direction::Above => warning.min(critical),
        };
        Self {
            key: key.into(),
            node,
            warning,
            critical,
            direction,
            deadline_warning_days: None,
        }
    }

    pub fn with_deadline_warning(mut self, days: u32) -> Self {
        self.deadline_warning_days = Some(days);
        self
    }

    /// Level-0 classification.
    pub fn static_status(&self, value: f64) -> ThresholdStatus {
        if self.direction.breaches(value, self.critical) {
            ThresholdStatus::Critical
        } else if self.direction.breaches(value, self.warning) {
            ThresholdStatus::Warning
        } else {
            ThresholdStatus::Stable
        }
    }

    /// Where `value` sits between warning (0) and critical (1).
    pub fn severity(&self, value: f64) -> f64 {
        if self.direction.breaches(value, self.critical) {
            return 1.0;
        }
        if !self.direction.breaches(value, self.warning) {
            return 0.0;
        }
        let span = (self.warning - self.critical).abs();
        if span <= 0.0 {
            return 1.0;
        }
        ((self.warning - value).abs() / span).clamp(0.0, 1.0)
    }

    /// Move the warning bound, never past the critical bound.
    pub fn refine_warning(&mut self, warning: f64) {
        if !warning.is_finite() {
            return;
        }
        self.warning = match self.direction {
            Direction::Below => warning.max(self.critical),
            Direction::Above => warning.min(self.critical),
        };
    }
}

/// Refinements gated by evolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refinement {
    Seasonal,
    Compound,
    Trend,
    Predictive,
}

impl Refinement {
    pub fn required_level(&self) -> u8 {
        match self {
            Refinement::Seasonal => 1,
            Refinement::Compound => 2,
            Refinement::Trend => 3,
            Refinement::Predictive => 4,
        }
    }
}

/// A coefficient or metric that learns from observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolvedCoefficient {
    pub key: String,
    pub prior_value: f64,
    pub current_value: f64,
    pub confidence: f64,
    pub data_points: u32,
    pub evolution_level: u8,
    pub history: Vec<f64>,
    seasonal_sums: Vec<f64>,
    seasonal_counts: Vec<u32>,
}

impl EvolvedCoefficient {
    pub fn new(key: impl Into<String>, prior_value: f64) -> Self {
        Self {
            key: key.into(),
            prior_value,
            current_value: prior_value,
            confidence: confidence_for(0),
            data_points: 0,
            evolution_level: 0,
            history: Vec::new(),
            seasonal_sums: vec![0.0; 12],
            seasonal_counts: vec![0; 12],
        }
    }

    /// Record an observation, optionally tagged with a calendar month (1..=12).
    ///
    /// The current value moves from the prior toward the observed mean in
    /// proportion to confidence.
    pub fn observe(&mut self, value: f64, month: Option<u8>) {
        if !value.is_finite() {
            return;
        }
        self.data_points = self.data_points.saturating_add(1);
        self.history.push(value);
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.confidence = confidence_for(self.data_points);
        self.evolution_level = self.evolution_level.max(level_for(self.data_points));

        let observed = mean(&self.history).unwrap_or(self.prior_value);
        self.current_value = self.prior_value + (observed - self.prior_value) * self.confidence;

        if let Some(m) = month.filter(|m| (1..=12).contains(m)) {
            let slot = (m - 1) as usize;
            let ratio = safe_div0(value, self.current_value);
            if ratio > 0.0 {
                self.seasonal_sums[slot] += ratio;
                self.seasonal_counts[slot] += 1;
            }
        }
    }

    pub fn allows(&self, refinement: Refinement) -> bool {
        self.evolution_level >= refinement.required_level()
    }

    /// Seasonal multiplier for a month, 1.0 until seasonality is unlocked.
    pub fn seasonal_multiplier(&self, month: u8) -> f64 {
        if !self.allows(Refinement::Seasonal) || !(1..=12).contains(&month) {
            return 1.0;
        }
        let slot = (month - 1) as usize;
        match self.seasonal_counts[slot] {
            0 => 1.0,
            n => self.seasonal_sums[slot] / n as f64,
        }
    }

    /// Current value adjusted for the month when seasonality is active.
    pub fn value_for_month(&self, month: u8) -> f64 {
        self.current_value * self.seasonal_multiplier(month)
    }

    /// Signed gap between what has been observed and the prior.
    pub fn deviation(&self) -> f64 {
        self.current_value - self.prior_value
    }
}

/// Per-entity individual layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionState {
    coefficients: BTreeMap<String, EvolvedCoefficient>,
}

impl EvolutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation, creating the entry from `prior` on first sight.
    pub fn observe(&mut self, key: &str, prior: f64, value: f64, month: Option<u8>) {
        self.coefficients
            .entry(key.to_string())
            .or_insert_with(|| EvolvedCoefficient::new(key, prior))
            .observe(value, month);
    }

    pub fn get(&self, key: &str) -> Option<&EvolvedCoefficient> {
        self.coefficients.get(key)
    }

    pub fn level(&self, key: &str) -> u8 {
        self.get(key).map(|c| c.evolution_level).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvolvedCoefficient> {
        self.coefficients.values()
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::SerializationError(e.to_string()))
    }
}

/// Static part of a threshold definition; bounds come from the merged prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub node: NodeId,
    pub direction: Direction,
    #[serde(default)]
    pub deadline_warning_days: Option<u32>,
}

/// Level-2 rule: escalate when a companion node is also in trouble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundCondition {
    /// Threshold key this condition refines
    pub key: String,
    /// Minimum status of the primary threshold for the rule to apply
    pub requires: ThresholdStatus,
    pub companion: NodeId,
    pub companion_direction: Direction,
    pub companion_bound: f64,
    pub escalate_to: ThresholdStatus,
    pub description: String,
}

impl CompoundCondition {
    fn applies(&self, primary: ThresholdStatus, state: &StateVector) -> bool {
        primary >= self.requires
            && state
                .get(self.companion)
                .map(|v| self.companion_direction.breaches(v, self.companion_bound))
                .unwrap_or(false)
    }
}

/// Forecast of a metric at a future horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// Periods ahead
    pub horizon: u32,
    pub value: f64,
    /// Probability the forecast materializes, 0..=1
    pub probability: f64,
}

/// Settings for trend and forecast rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Consecutive worsening steps that raise a warning
    pub trend_window: usize,
    /// Furthest forecast horizon considered
    pub forecast_horizon: u32,
    pub forecast_warning_probability: f64,
    pub forecast_critical_probability: f64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            trend_window: 3,
            forecast_horizon: 3,
            forecast_warning_probability: 0.5,
            forecast_critical_probability: 0.7,
        }
    }
}

/// Rule families that can contribute to an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    Static,
    Refined,
    Compound,
    Trend,
    Acceleration,
    Predictive,
}

/// Inputs to [`PriorHierarchy::evaluate_threshold`] beyond the value itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdContext<'a> {
    pub entity_type: &'a str,
    pub segment: Option<&'a str>,
    /// Evolution record of this metric, if any
    pub evolution: Option<&'a EvolvedCoefficient>,
    /// Previous values, oldest first
    pub history: &'a [f64],
    pub predictions: &'a [ForecastPoint],
    /// Companion values for compound conditions
    pub state: Option<&'a StateVector>,
}

impl<'a> ThresholdContext<'a> {
    pub fn new(entity_type: &'a str, segment: Option<&'a str>) -> Self {
        Self {
            entity_type,
            segment,
            ..Default::default()
        }
    }

    pub fn with_evolution(mut self, evolution: &'a EvolvedCoefficient) -> Self {
        self.evolution = Some(evolution);
        self
    }

    pub fn with_history(mut self, history: &'a [f64]) -> Self {
        self.history = history;
        self
    }

    pub fn with_predictions(mut self, predictions: &'a [ForecastPoint]) -> Self {
        self.predictions = predictions;
        self
    }

    pub fn with_state(mut self, state: &'a StateVector) -> Self {
        self.state = Some(state);
        self
    }

    fn level(&self) -> u8 {
        self.evolution.map(|e| e.evolution_level).unwrap_or(0)
    }
}

/// Result of a threshold evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEvaluation {
    pub key: String,
    pub status: ThresholdStatus,
    /// Trust in the status, reduced near a boundary
    pub confidence: f64,
    pub evolution_level: u8,
    /// Bounds actually applied after refinement
    pub threshold: Threshold,
    pub triggered: Vec<RuleKind>,
}

type Layer = BTreeMap<String, f64>;

fn layer(entries: &[(&str, f64)]) -> Layer {
    entries.iter().map(|&(k, v)| (k.to_string(), v)).collect()
}

/// Layered priors and threshold definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorHierarchy {
    universal: Layer,
    industries: BTreeMap<String, Layer>,
    segments: BTreeMap<String, Layer>,
    thresholds: BTreeMap<String, ThresholdSpec>,
    compound: Vec<CompoundCondition>,
    pub rules: RuleConfig,
}

impl Default for PriorHierarchy {
    fn default() -> Self {
        Self::standard()
    }
}

impl PriorHierarchy {
    /// Built-in tables.
    pub fn standard() -> Self {
        let universal = layer(&[
            ("conservation.cash_conversion", 0.9),
            ("entropy.quality_decay", 0.05),
            ("entropy.effort_gain", 1.5),
            ("inertia.income", 0.6),
            ("inertia.loyalty", 0.8),
            ("inertia.staff_retention", 0.9),
            ("inertia.growth", 0.5),
            ("inertia.dependency", 0.7),
            ("inertia.market_share", 0.8),
            ("friction.cac_penalty", 1.1),
            ("friction.cac_reference", 300_000.0),
            ("friction.saturation_spend", 5_000_000.0),
            ("flow.referral_rate", 0.01),
            ("flow.churn_sensitivity", 0.15),
            ("cascade.loyalty_boundary", 0.65),
            ("cascade.gain", 2.0),
            ("cascade.max_fraction", 0.3),
            ("gravity.concentration_gain", 3.0),
            ("staff.monthly_cost", 3_000_000.0),
            ("staff.base_morale", 0.85),
            ("staff.salary_sensitivity", 2.0),
            ("baseline.quality", 0.7),
            ("baseline.loyalty", 0.75),
            ("baseline.churn_rate", 0.04),
            ("baseline.staff_retention", 0.85),
            ("baseline.acquisition_friction", 0.5),
            ("baseline.dependency", 0.3),
            ("baseline.market_share", 0.05),
            ("threshold.cash.warning", 10_000_000.0),
            ("threshold.cash.critical", 3_000_000.0),
            ("threshold.loyalty.warning", 0.7),
            ("threshold.loyalty.critical", 0.6),
            ("threshold.churn_rate.warning", 0.06),
            ("threshold.churn_rate.critical", 0.12),
            ("threshold.staff_retention.warning", 0.8),
            ("threshold.staff_retention.critical", 0.65),
            ("threshold.dependency.warning", 0.4),
            ("threshold.dependency.critical", 0.6),
            ("threshold.acquisition_friction.warning", 0.6),
            ("threshold.acquisition_friction.critical", 0.75),
            ("threshold.quality.warning", 0.6),
            ("threshold.quality.critical", 0.45),
            ("threshold.income_growth.warning", -0.02),
            ("threshold.income_growth.critical", -0.1),
        ]);

        let mut industries = BTreeMap::new();
        industries.insert(
            "tutoring_academy".to_string(),
            layer(&[
                ("inertia.loyalty", 0.85),
                ("entropy.quality_decay", 0.04),
                ("friction.cac_reference", 250_000.0),
                ("flow.referral_rate", 0.015),
                ("staff.monthly_cost", 2_800_000.0),
                ("threshold.churn_rate.warning", 0.05),
                ("threshold.churn_rate.critical", 0.1),
            ]),
        );
        industries.insert(
            "cafe".to_string(),
            layer(&[
                ("inertia.loyalty", 0.7),
                ("entropy.quality_decay", 0.06),
                ("friction.cac_reference", 20_000.0),
                ("flow.churn_sensitivity", 0.25),
                ("staff.monthly_cost", 2_200_000.0),
                ("threshold.churn_rate.warning", 0.1),
                ("threshold.churn_rate.critical", 0.2),
            ]),
        );
        industries.insert(
            "retail".to_string(),
            layer(&[
                ("inertia.loyalty", 0.75),
                ("friction.cac_reference", 50_000.0),
                ("inertia.income", 0.5),
                ("threshold.dependency.warning", 0.35),
            ]),
        );
        industries.insert(
            "saas".to_string(),
            layer(&[
                ("inertia.income", 0.8),
                ("inertia.loyalty", 0.9),
                ("entropy.quality_decay", 0.03),
                ("friction.cac_reference", 1_000_000.0),
                ("threshold.churn_rate.warning", 0.03),
                ("threshold.churn_rate.critical", 0.07),
            ]),
        );

        let mut segments = BTreeMap::new();
        segments.insert(
            "premium".to_string(),
            layer(&[
                ("friction.cac_reference", 500_000.0),
                ("threshold.loyalty.warning", 0.75),
                ("threshold.quality.warning", 0.7),
            ]),
        );
        segments.insert(
            "budget".to_string(),
            layer(&[
                ("inertia.loyalty", 0.7),
                ("flow.churn_sensitivity", 0.2),
                ("threshold.loyalty.warning", 0.65),
            ]),
        );
        segments.insert(
            "early_stage".to_string(),
            layer(&[
                ("threshold.cash.warning", 5_000_000.0),
                ("threshold.cash.critical", 1_000_000.0),
                ("threshold.dependency.warning", 0.5),
                ("threshold.dependency.critical", 0.7),
            ]),
        );

        let mut thresholds = BTreeMap::new();
        let mut spec = |role: Role, direction: Direction, days: Option<u32>| {
            thresholds.insert(
                role.as_str().to_string(),
                ThresholdSpec {
                    node: role.node(),
                    direction,
                    deadline_warning_days: days,
                },
            );
        };
        spec(Role::Cash, Direction::Below, Some(30));
        spec(Role::Loyalty, Direction::Below, Some(60));
        spec(Role::ChurnRate, Direction::Above, Some(30));
        spec(Role::StaffRetention, Direction::Below, Some(45));
        spec(Role::Dependency, Direction::Above, Some(90));
        spec(Role::AcquisitionFriction, Direction::Above, None);
        spec(Role::Quality, Direction::Below, Some(60));
        spec(Role::IncomeGrowth, Direction::Below, None);

        let compound = vec![
            CompoundCondition {
                key: Role::Cash.as_str().to_string(),
                requires: ThresholdStatus::Warning,
                companion: Role::IncomeGrowth.node(),
                companion_direction: Direction::Below,
                companion_bound: 0.0,
                escalate_to: ThresholdStatus::Critical,
                description: "cash is thin while income shrinks".to_string(),
            },
            CompoundCondition {
                key: Role::Loyalty.as_str().to_string(),
                requires: ThresholdStatus::Stable,
                companion: Role::ChurnRate.node(),
                companion_direction: Direction::Above,
                companion_bound: 0.08,
                escalate_to: ThresholdStatus::Warning,
                description: "loyalty looks fine but customers are leaving".to_string(),
            },
            CompoundCondition {
                key: Role::StaffRetention.as_str().to_string(),
                requires: ThresholdStatus::Warning,
                companion: Role::Quality.node(),
                companion_direction: Direction::Below,
                companion_bound: 0.6,
                escalate_to: ThresholdStatus::Critical,
                description: "staff leaving and lesson quality already slipping".to_string(),
            },
        ];

        Self {
            universal,
            industries,
            segments,
            thresholds,
            compound,
            rules: RuleConfig::default(),
        }
    }

    /// Known industry keys.
    pub fn industries(&self) -> impl Iterator<Item = &str> {
        self.industries.keys().map(|k| k.as_str())
    }

    /// Known segment keys.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.keys().map(|k| k.as_str())
    }

    /// Override or add an industry layer entry.
    pub fn set_industry_value(&mut self, industry: &str, key: &str, value: f64) {
        self.industries
            .entry(industry.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Override or add a segment layer entry.
    pub fn set_segment_value(&mut self, segment: &str, key: &str, value: f64) {
        self.segments
            .entry(segment.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Merge universal, industry and segment layers.
    ///
    /// Unknown industry or segment keys contribute nothing. An empty entity
    /// type asks for the universal layer alone.
    pub fn merged_prior(&self, entity_type: &str, segment: Option<&str>) -> BTreeMap<String, f64> {
        let mut merged = self.universal.clone();

        match self.industries.get(entity_type) {
            Some(industry) => merged.extend(industry.iter().map(|(k, &v)| (k.clone(), v))),
            None if entity_type.is_empty() => {}
            None => tracing::warn!(
                entity_type,
                "unknown industry, using universal priors"
            ),
        }

        if let Some(segment) = segment {
            match self.segments.get(segment) {
                Some(refinement) => {
                    merged.extend(refinement.iter().map(|(k, &v)| (k.clone(), v)))
                }
                None => tracing::warn!(segment, "unknown segment, ignoring refinement"),
            }
        }

        merged
    }

    /// Merged prior with the entity's learned values on top.
    ///
    /// Every evolved key is layered in, including keys no shared layer
    /// declares (link keys such as `inertia.customer->flow.customer`, observed
    /// metrics such as `loyalty`).
    pub fn resolve(
        &self,
        entity_type: &str,
        segment: Option<&str>,
        evolution: &EvolutionState,
    ) -> BTreeMap<String, f64> {
        let mut merged = self.merged_prior(entity_type, segment);
        merged.extend(evolution.iter().map(|c| (c.key.clone(), c.current_value)));
        merged
    }

    /// All configured threshold keys.
    pub fn threshold_keys(&self) -> impl Iterator<Item = &str> {
        self.thresholds.keys().map(|k| k.as_str())
    }

    /// Resolve one threshold for an entity.
    pub fn threshold(
        &self,
        key: &str,
        entity_type: &str,
        segment: Option<&str>,
    ) -> Result<Threshold> {
        let merged = self.merged_prior(entity_type, segment);
        self.build_threshold(key, &merged)
    }

    /// Resolve every threshold for an entity.
    pub fn thresholds(&self, entity_type: &str, segment: Option<&str>) -> Vec<Threshold> {
        let merged = self.merged_prior(entity_type, segment);
        self.thresholds
            .keys()
            .filter_map(|key| self.build_threshold(key, &merged).ok())
            .collect()
    }

    fn build_threshold(&self, key: &str, merged: &BTreeMap<String, f64>) -> Result<Threshold> {
        let spec = self
            .thresholds
            .get(key)
            .ok_or_else(|| EngineError::UnknownThreshold(key.to_string()))?;
        let bound = |name: &str| {
            merged
                .get(&format!("threshold.{key}.{name}"))
                .copied()
                .ok_or_else(|| EngineError::UnknownThreshold(format!("{key}.{name}")))
        };
        let mut threshold = Threshold::new(
            key,
            spec.node,
            bound("warning")?,
            bound("critical")?,
            spec.direction,
        );
        threshold.deadline_warning_days = spec.deadline_warning_days;
        Ok(threshold)
    }

    /// Compound conditions attached to a threshold key.
    pub fn compound_conditions(&self, key: &str) -> impl Iterator<Item = &CompoundCondition> {
        let key = key.to_string();
        self.compound.iter().filter(move |c| c.key == key)
    }

    pub fn add_compound_condition(&mut self, condition: CompoundCondition) {
        self.compound.push(condition);
    }

    /// Classify a value against a threshold, using every rule its evolution
    /// level unlocks.
    pub fn evaluate_threshold(
        &self,
        key: &str,
        value: f64,
        ctx: &ThresholdContext<'_>,
    ) -> Result<ThresholdEvaluation> {
        let mut threshold = self.threshold(key, ctx.entity_type, ctx.segment)?;
        let level = ctx.level();
        let mut triggered = Vec::new();

        // Level 1: adapt the warning bound to what this business normally shows
        if level >= 1 {
            if let Some(evolution) = ctx.evolution {
                let shift = evolution.deviation() * evolution.confidence * REFINEMENT_RATE;
                if shift != 0.0 {
                    threshold.refine_warning(threshold.warning + shift);
                }
            }
        }

        let mut status = ThresholdStatus::Stable;
        if value.is_finite() {
            status = threshold.static_status(value);
            if status > ThresholdStatus::Stable {
                triggered.push(if level >= 1 {
                    RuleKind::Refined
                } else {
                    RuleKind::Static
                });
            }
        }

        if level >= Refinement::Compound.required_level() {
            if let Some(state) = ctx.state {
                for condition in self.compound_conditions(key) {
                    if condition.applies(status, state) && condition.escalate_to > status {
                        status = condition.escalate_to;
                        triggered.push(RuleKind::Compound);
                    }
                }
            }
        }

        if level >= Refinement::Trend.required_level() {
            let mut series: Vec<f64> = ctx
                .history
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            if value.is_finite() {
                series.push(value);
            }
            let (trend_status, kinds) =
                trend_status(&series, threshold.direction, self.rules.trend_window);
            if trend_status > status {
                status = trend_status;
            }
            triggered.extend(kinds);
        }

        if level >= Refinement::Predictive.required_level() {
            let forecast = forecast_status(&threshold, ctx.predictions, &self.rules);
            if forecast > ThresholdStatus::Stable {
                triggered.push(RuleKind::Predictive);
            }
            status = status.max(forecast);
        }

        let base = 0.5 + 0.5 * ctx.evolution.map(|e| e.confidence).unwrap_or(0.0);
        let confidence = base * boundary_factor(&threshold, value);

        Ok(ThresholdEvaluation {
            key: key.to_string(),
            status,
            confidence,
            evolution_level: level,
            threshold,
            triggered,
        })
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::SerializationError(e.to_string()))
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::SerializationError(e.to_string()))
    }
}

/// Trend rules over a series ending in the current value.
///
/// `window` consecutive worsening steps give a warning; if the latest step
/// is also worse than the one before it (accelerating), critical.
fn trend_status(
    series: &[f64],
    direction: Direction,
    window: usize,
) -> (ThresholdStatus, Vec<RuleKind>) {
    let window = window.max(1);
    if series.len() < window + 1 {
        return (ThresholdStatus::Stable, Vec::new());
    }

    let worsening_run = series
        .windows(2)
        .rev()
        .take_while(|w| direction.worsens(w[0], w[1]))
        .count();
    if worsening_run < window {
        return (ThresholdStatus::Stable, Vec::new());
    }

    let n = series.len();
    let second_difference = series[n - 1] - 2.0 * series[n - 2] + series[n - 3];
    // Below: negative curvature accelerates the decline
    if second_difference * direction.sign() > CURVATURE_EPSILON {
        (
            ThresholdStatus::Critical,
            vec![RuleKind::Trend, RuleKind::Acceleration],
        )
    } else {
        (ThresholdStatus::Warning, vec![RuleKind::Trend])
    }
}

fn forecast_status(
    threshold: &Threshold,
    predictions: &[ForecastPoint],
    rules: &RuleConfig,
) -> ThresholdStatus {
    predictions
        .iter()
        .filter(|p| p.horizon <= rules.forecast_horizon && p.value.is_finite())
        .map(|p| {
            if threshold.direction.breaches(p.value, threshold.critical)
                && p.probability >= rules.forecast_critical_probability
            {
                ThresholdStatus::Critical
            } else if threshold.direction.breaches(p.value, threshold.warning)
                && p.probability >= rules.forecast_warning_probability
            {
                ThresholdStatus::Warning
            } else {
                ThresholdStatus::Stable
            }
        })
        .max()
        .unwrap_or(ThresholdStatus::Stable)
}

/// 1.0 away from both bounds, down to 0.5 right at a bound.
fn boundary_factor(threshold: &Threshold, value: f64) -> f64 {
    if !value.is_finite() {
        return 0.5;
    }
    let span = (threshold.warning - threshold.critical)
        .abs()
        .max(threshold.critical.abs() * BOUNDARY_MARGIN)
        .max(f64::EPSILON);
    let nearest = (value - threshold.warning)
        .abs()
        .min((value - threshold.critical).abs());
    let proximity = nearest / span;
    if proximity >= BOUNDARY_MARGIN {
        1.0
    } else {
        0.5 + 0.5 * proximity / BOUNDARY_MARGIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evolved(level_points: u32, prior: f64, observed: f64) -> EvolvedCoefficient {
        let mut coef = EvolvedCoefficient::new("loyalty", prior);
        for _ in 0..level_points {
            coef.observe(observed, None);
        }
        coef
    }

    #[test]
    fn test_confidence_curve() {
        assert_eq!(confidence_for(0), 0.0);
        assert!((confidence_for(1) - 0.5).abs() < 1e-12);
        assert!((confidence_for(4) - (1.0 - 1.0 / 3.0)).abs() < 1e-12);
        let mut last = 0.0;
        for n in 1..100 {
            let c = confidence_for(n);
            assert!(c > last && c < 1.0);
            last = c;
        }
    }

    #[test]
    fn test_levels() {
        assert_eq!(level_for(0), 0);
        assert_eq!(level_for(3), 1);
        assert_eq!(level_for(11), 2);
        assert_eq!(level_for(12), 3);
        assert_eq!(level_for(500), MAX_EVOLUTION_LEVEL);
    }

    #[test]
    fn test_merge_precedence() {
        let priors = PriorHierarchy::standard();
        let universal = priors.merged_prior("unknown_business", None);
        assert_eq!(universal["inertia.loyalty"], 0.8);

        let academy = priors.merged_prior("tutoring_academy", None);
        assert_eq!(academy["inertia.loyalty"], 0.85);
        assert_eq!(academy["cascade.loyalty_boundary"], 0.65);

        let budget = priors.merged_prior("tutoring_academy", Some("budget"));
        assert_eq!(budget["inertia.loyalty"], 0.7);
        assert_eq!(budget["entropy.quality_decay"], 0.04);
    }

    #[test]
    fn test_resolve_layers_individual_values() {
        let priors = PriorHierarchy::standard();
        let mut evolution = EvolutionState::new();
        evolution.observe("inertia.loyalty", 0.85, 0.9, None);
        evolution.observe("loyalty", 0.75, 0.62, None);

        let resolved = priors.resolve("tutoring_academy", None, &evolution);
        let learned = evolution.get("inertia.loyalty").unwrap().current_value;
        assert_eq!(resolved["inertia.loyalty"], learned);
        assert_eq!(resolved["loyalty"], evolution.get("loyalty").unwrap().current_value);
        assert_eq!(resolved["entropy.quality_decay"], priors.merged_prior("tutoring_academy", None)["entropy.quality_decay"]);
    }

    #[test]
    fn test_static_direction_handling() {
        let priors = PriorHierarchy::standard();
        let ctx = ThresholdContext::new("tutoring_academy", None);

        let low = priors.evaluate_threshold("loyalty", 0.55, &ctx).unwrap();
        assert_eq!(low.status, ThresholdStatus::Critical);
        let ok = priors.evaluate_threshold("loyalty", 0.9, &ctx).unwrap();
        assert_eq!(ok.status, ThresholdStatus::Stable);

        // dependency is higher-is-worse
        let dep = priors.evaluate_threshold("dependency", 0.65, &ctx).unwrap();
        assert_eq!(dep.status, ThresholdStatus::Critical);
        let dep_ok = priors.evaluate_threshold("dependency", 0.1, &ctx).unwrap();
        assert_eq!(dep_ok.status, ThresholdStatus::Stable);
    }

    #[test]
    fn test_unknown_threshold() {
        let priors = PriorHierarchy::standard();
        let ctx = ThresholdContext::new("cafe", None);
        assert!(matches!(
            priors.evaluate_threshold("moon_phase", 1.0, &ctx),
            Err(EngineError::UnknownThreshold(_))
        ));
    }

    #[test]
    fn test_refinement_never_passes_critical() {
        let priors = PriorHierarchy::standard();
        // This business runs far below its loyalty prior
        let coef = evolved(5, 0.75, 0.3);
        let ctx = ThresholdContext::new("tutoring_academy", None).with_evolution(&coef);
        let eval = priors.evaluate_threshold("loyalty", 0.62, &ctx).unwrap();

        assert_eq!(eval.evolution_level, 1);
        assert!(eval.threshold.warning < 0.7);
        assert!(eval.threshold.warning >= eval.threshold.critical);
        assert_eq!(eval.status, ThresholdStatus::Stable);
    }

    #[test]
    fn test_compound_condition_escalates() {
        let priors = PriorHierarchy::standard();
        let coef = evolved(6, 10_000_000.0, 10_000_000.0);
        let state = StateVector::new().with_role(Role::IncomeGrowth, -0.05);
        let ctx = ThresholdContext::new("tutoring_academy", None)
            .with_evolution(&coef)
            .with_state(&state);

        let eval = priors.evaluate_threshold("cash", 8_000_000.0, &ctx).unwrap();
        assert_eq!(eval.status, ThresholdStatus::Critical);
        assert!(eval.triggered.contains(&RuleKind::Compound));

        // Same value below level 2 stays a warning
        let young = evolved(3, 10_000_000.0, 10_000_000.0);
        let ctx = ThresholdContext::new("tutoring_academy", None)
            .with_evolution(&young)
            .with_state(&state);
        let eval = priors.evaluate_threshold("cash", 8_000_000.0, &ctx).unwrap();
        assert_eq!(eval.status, ThresholdStatus::Warning);
    }

    #[test]
    fn test_trend_rules() {
        let priors = PriorHierarchy::standard();
        let coef = evolved(12, 0.8, 0.8);

        // Steady decline, constant step: warning
        let history = [0.90, 0.88, 0.86];
        let ctx = ThresholdContext::new("tutoring_academy", None)
            .with_evolution(&coef)
            .with_history(&history);
        let eval = priors.evaluate_threshold("loyalty", 0.84, &ctx).unwrap();
        assert_eq!(eval.status, ThresholdStatus::Warning);
        assert!(eval.triggered.contains(&RuleKind::Trend));

        // Accelerating decline: critical
        let history = [0.95, 0.94, 0.92];
        let ctx = ThresholdContext::new("tutoring_academy", None)
            .with_evolution(&coef)
            .with_history(&history);
        let eval = priors.evaluate_threshold("loyalty", 0.88, &ctx).unwrap();
        assert_eq!(eval.status, ThresholdStatus::Critical);
        assert!(eval.triggered.contains(&RuleKind::Acceleration));

        // Recovering: stable
        let history = [0.80, 0.82, 0.83];
        let ctx = ThresholdContext::new("tutoring_academy", None)
            .with_evolution(&coef)
            .with_history(&history);
        let eval = priors.evaluate_threshold("loyalty", 0.85, &ctx).unwrap();
        assert_eq!(eval.status, ThresholdStatus::Stable);
    }

    #[test]
    fn test_predictive_rules() {
        let priors = PriorHierarchy::standard();
        let coef = evolved(24, 0.8, 0.8);
        let forecasts = [
            ForecastPoint {
                horizon: 2,
                value: 0.55,
                probability: 0.8,
            },
            ForecastPoint {
                horizon: 12,
                value: 0.1,
                probability: 1.0,
            },
        ];
        let ctx = ThresholdContext::new("tutoring_academy", None)
            .with_evolution(&coef)
            .with_predictions(&forecasts);
        let eval = priors.evaluate_threshold("loyalty", 0.85, &ctx).unwrap();
        assert_eq!(eval.status, ThresholdStatus::Critical);
        assert!(eval.triggered.contains(&RuleKind::Predictive));

        let unlikely = [ForecastPoint {
            horizon: 1,
            value: 0.55,
            probability: 0.3,
        }];
        let ctx = ThresholdContext::new("tutoring_academy", None)
            .with_evolution(&coef)
            .with_predictions(&unlikely);
        let eval = priors.evaluate_threshold("loyalty", 0.85, &ctx).unwrap();
        assert_eq!(eval.status, ThresholdStatus::Stable);
    }

    #[test]
    fn test_confidence_drops_near_boundary() {
        let priors = PriorHierarchy::standard();
        let ctx = ThresholdContext::new("tutoring_academy", None);
        let far = priors.evaluate_threshold("loyalty", 0.9, &ctx).unwrap();
        let near = priors.evaluate_threshold("loyalty", 0.701, &ctx).unwrap();
        assert!(near.confidence < far.confidence);
        assert!(near.confidence >= 0.25);
    }

    #[test]
    fn test_evolution_level_monotonic_and_seasonal() {
        let mut coef = EvolvedCoefficient::new("income", 100.0);
        assert_eq!(coef.seasonal_multiplier(12), 1.0);

        let mut levels = Vec::new();
        for i in 0..30u32 {
            let month = (i % 12 + 1) as u8;
            let value = if month == 12 { 150.0 } else { 100.0 };
            coef.observe(value, Some(month));
            levels.push(coef.evolution_level);
        }
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(coef.evolution_level, MAX_EVOLUTION_LEVEL);
        assert!(coef.seasonal_multiplier(12) > coef.seasonal_multiplier(6));
        assert!(coef.confidence > 0.8);
    }

    #[test]
    fn test_threshold_severity() {
        let t = Threshold::new("loyalty", Role::Loyalty.node(), 0.7, 0.6, Direction::Below);
        assert_eq!(t.severity(0.8), 0.0);
        assert!((t.severity(0.65) - 0.5).abs() < 1e-9);
        assert_eq!(t.severity(0.5), 1.0);

        let inverted = Threshold::new("x", Role::Dependency.node(), 0.9, 0.6, Direction::Above);
        assert_eq!(inverted.warning, 0.6);
    }
}
