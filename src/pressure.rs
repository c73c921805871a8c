//! Pressure Classifier - rule-based alerting over node values.
//!
//! Stateless: every call classifies from scratch and never touches the model.
//!
//! ```text
//! pressure      = urgency(deadline) · exposure · recovery_difficulty
//! urgency       = 30 / days          (30 when days <= 0, 1 with no deadline)
//! estimatedLoss = monthly_revenue · impact_rate · severity
//! ```

use crate::error::{EngineError, Result};
use crate::node::{NodeId, Role};
use crate::prior::{PriorHierarchy, Threshold, ThresholdStatus};
use crate::state::StateVector;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Urgency numerator: a deadline 30 days out scores 1.
pub const URGENCY_SCALE: f64 = 30.0;

/// Discrete pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PressureState {
    /// Nothing to act on
    Ignorable,
    /// Deteriorating but recoverable
    Pressuring,
    /// Past the point of cheap recovery
    Irreversible,
}

impl PressureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureState::Ignorable => "IGNORABLE",
            PressureState::Pressuring => "PRESSURING",
            PressureState::Irreversible => "IRREVERSIBLE",
        }
    }
}

/// Coarse time-to-irreversibility bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Immediate,
    Days,
    Weeks,
    Months,
    Permanent,
}

impl Horizon {
    pub fn from_deadline(state: PressureState, deadline_days: Option<i64>) -> Self {
        if state == PressureState::Irreversible {
            return Horizon::Permanent;
        }
        match deadline_days {
            Some(d) if d <= 3 => Horizon::Immediate,
            Some(d) if d <= 14 => Horizon::Days,
            Some(d) if d <= 60 => Horizon::Weeks,
            _ => Horizon::Months,
        }
    }
}

/// Kind of damage a node's deterioration causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostType {
    Financial,
    Customer,
    Reputation,
    Operational,
    Strategic,
}

/// Per-node classification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureProfile {
    pub threshold: Threshold,
    /// How much of the business is exposed, 0..=1
    pub exposure_weight: f64,
    /// How hard the damage is to undo, 0..=1
    pub recovery_difficulty: f64,
    /// Share of monthly revenue at stake at full severity
    pub impact_rate: f64,
    pub cost_types: Vec<CostType>,
}

/// Classifier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Revenue base for loss estimates; 0 means use the state's income
    pub monthly_revenue_baseline: f64,
    /// Deadlines at or inside this many days are urgent
    pub urgent_within_days: i64,
    pub profiles: Vec<PressureProfile>,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self::from_hierarchy(&PriorHierarchy::standard(), "", None)
    }
}

struct ProfileDefaults {
    role: Role,
    exposure: f64,
    recovery: f64,
    impact: f64,
    costs: &'static [CostType],
}

const PROFILE_DEFAULTS: &[ProfileDefaults] = &[
    ProfileDefaults {
        role: Role::Cash,
        exposure: 1.0,
        recovery: 0.8,
        impact: 1.0,
        costs: &[CostType::Financial],
    },
    ProfileDefaults {
        role: Role::Loyalty,
        exposure: 0.8,
        recovery: 0.9,
        impact: 0.3,
        costs: &[CostType::Customer, CostType::Reputation],
    },
    ProfileDefaults {
        role: Role::ChurnRate,
        exposure: 0.9,
        recovery: 0.7,
        impact: 0.4,
        costs: &[CostType::Customer, CostType::Financial],
    },
    ProfileDefaults {
        role: Role::StaffRetention,
        exposure: 0.6,
        recovery: 0.8,
        impact: 0.2,
        costs: &[CostType::Operational],
    },
    ProfileDefaults {
        role: Role::Dependency,
        exposure: 0.7,
        recovery: 0.6,
        impact: 0.5,
        costs: &[CostType::Strategic, CostType::Financial],
    },
    ProfileDefaults {
        role: Role::AcquisitionFriction,
        exposure: 0.5,
        recovery: 0.4,
        impact: 0.15,
        costs: &[CostType::Financial],
    },
];

impl PressureConfig {
    /// Default profiles with bounds resolved for an entity.
    pub fn from_hierarchy(hierarchy: &PriorHierarchy, entity_type: &str, segment: Option<&str>) -> Self {
        let profiles = PROFILE_DEFAULTS
            .iter()
            .filter_map(|d| {
                let threshold = hierarchy.threshold(d.role.as_str(), entity_type, segment).ok()?;
                Some(PressureProfile {
                    threshold,
                    exposure_weight: d.exposure,
                    recovery_difficulty: d.recovery,
                    impact_rate: d.impact,
                    cost_types: d.costs.to_vec(),
                })
            })
            .collect();

        Self {
            monthly_revenue_baseline: 0.0,
            urgent_within_days: 14,
            profiles,
        }
    }

    pub fn with_baseline(mut self, monthly_revenue: f64) -> Self {
        self.monthly_revenue_baseline = monthly_revenue;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::SerializationError(e.to_string()))
    }
}

/// One node's observation to classify.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureInput {
    pub node: NodeId,
    pub value: f64,
    /// Expected change per period
    #[serde(default)]
    pub trend: Option<f64>,
    /// Days until the situation must be resolved
    #[serde(default)]
    pub deadline_days: Option<i64>,
}

/// Classified pressure on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureItem {
    pub node: NodeId,
    pub key: String,
    pub value: f64,
    pub state: PressureState,
    pub pressure: f64,
    pub severity: f64,
    pub cost_types: Vec<CostType>,
    pub horizon: Horizon,
    pub deadline_days: Option<i64>,
    pub estimated_loss: f64,
}

/// Pressured items, most pressing first, plus the urgent subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureReport {
    /// Sorted by descending pressure
    pub items: Vec<PressureItem>,
    /// Deadline within the urgent window, soonest first, whatever the state
    pub urgent: Vec<PressureItem>,
}

impl PressureReport {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn irreversible(&self) -> impl Iterator<Item = &PressureItem> {
        self.items.iter().filter(|i| i.state == PressureState::Irreversible)
    }

    pub fn total_estimated_loss(&self) -> f64 {
        self.items.iter().map(|i| i.estimated_loss).sum()
    }
}

/// `30 / days`, saturating at 30 for overdue deadlines and 1 without one.
pub fn urgency_factor(deadline_days: Option<i64>) -> f64 {
    match deadline_days {
        None => 1.0,
        Some(d) if d <= 0 => URGENCY_SCALE,
        Some(d) => URGENCY_SCALE / d as f64,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureClassifier {
    config: PressureConfig,
    #[serde(skip)]
    by_node: BTreeMap<NodeId, usize>,
}

impl PressureClassifier {
    pub fn new(config: PressureConfig) -> Self {
        let by_node = config
            .profiles
            .iter()
            .enumerate()
            .map(|(i, p)| (p.threshold.node, i))
            .collect();
        Self { config, by_node }
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    pub fn profile(&self, node: NodeId) -> Option<&PressureProfile> {
        match self.by_node.get(&node) {
            Some(&i) => self.config.profiles.get(i),
            // deserialized without the index
            None => self.config.profiles.iter().find(|p| p.threshold.node == node),
        }
    }

    /// Classify one value.
    ///
    /// An expired deadline is irreversible whatever the value. Otherwise the
    /// critical bound maps to irreversible, the warning bound to pressuring,
    /// and a stable value still pressures when its trend crosses the warning
    /// bound next period or its deadline is inside the profile's warning
    /// window.
    pub fn classify(
        &self,
        node: NodeId,
        value: f64,
        trend: Option<f64>,
        deadline_days: Option<i64>,
    ) -> PressureState {
        if matches!(deadline_days, Some(d) if d <= 0) {
            return PressureState::Irreversible;
        }
        let Some(profile) = self.profile(node) else {
            tracing::warn!(node = %node, "no pressure profile for node");
            return PressureState::Ignorable;
        };
        classify_against(&profile.threshold, value, trend, deadline_days)
    }

    /// Full item for one input, `None` without a profile.
    pub fn assess(&self, input: &PressureInput) -> Option<PressureItem> {
        self.assess_with_baseline(input, self.config.monthly_revenue_baseline)
    }

    fn assess_with_baseline(&self, input: &PressureInput, baseline: f64) -> Option<PressureItem> {
        let Some(profile) = self.profile(input.node) else {
            tracing::warn!(node = %input.node, "no pressure profile for node");
            return None;
        };
        let threshold = &profile.threshold;
        let expired = matches!(input.deadline_days, Some(d) if d <= 0);
        let state = if expired {
            PressureState::Irreversible
        } else {
            classify_against(threshold, input.value, input.trend, input.deadline_days)
        };

        let severity = if expired {
            1.0
        } else {
            threshold.severity(input.value)
        };
        let pressure = urgency_factor(input.deadline_days)
            * profile.exposure_weight
            * profile.recovery_difficulty;

        Some(PressureItem {
            node: input.node,
            key: threshold.key.clone(),
            value: input.value,
            state,
            pressure,
            severity,
            cost_types: profile.cost_types.clone(),
            horizon: Horizon::from_deadline(state, input.deadline_days),
            deadline_days: input.deadline_days,
            estimated_loss: baseline.max(0.0) * profile.impact_rate * severity,
        })
    }

    /// Classify a batch.
    ///
    /// Ignorable items are left out of `items` but still appear in `urgent`
    /// when their deadline falls inside the urgent window.
    pub fn report(&self, inputs: &[PressureInput]) -> PressureReport {
        self.build_report(inputs, self.config.monthly_revenue_baseline)
    }

    /// Classify every profiled node present in a state.
    ///
    /// Uses the state's income as the revenue base when none is configured.
    pub fn report_state(
        &self,
        state: &StateVector,
        trends: &BTreeMap<NodeId, f64>,
        deadlines: &BTreeMap<NodeId, i64>,
    ) -> PressureReport {
        let inputs: Vec<PressureInput> = self
            .config
            .profiles
            .iter()
            .filter_map(|p| {
                let node = p.threshold.node;
                state.get(node).map(|value| PressureInput {
                    node,
                    value,
                    trend: trends.get(&node).copied(),
                    deadline_days: deadlines.get(&node).copied(),
                })
            })
            .collect();

        let baseline = if self.config.monthly_revenue_baseline > 0.0 {
            self.config.monthly_revenue_baseline
        } else {
            state.role(Role::Income).unwrap_or(0.0)
        };
        self.build_report(&inputs, baseline)
    }

    fn build_report(&self, inputs: &[PressureInput], baseline: f64) -> PressureReport {
        let assessed: Vec<PressureItem> = inputs
            .iter()
            .filter(|i| i.value.is_finite())
            .filter_map(|i| self.assess_with_baseline(i, baseline))
            .collect();

        // A near deadline is urgent even when the value itself looks fine.
        let window = self.config.urgent_within_days;
        let mut urgent: Vec<PressureItem> = assessed
            .iter()
            .filter(|i| matches!(i.deadline_days, Some(d) if d <= window))
            .cloned()
            .collect();
        urgent.sort_by_key(|i| i.deadline_days);

        let mut items: Vec<PressureItem> = assessed
            .into_iter()
            .filter(|item| item.state != PressureState::Ignorable)
            .collect();
        items.sort_by(|a, b| b.pressure.partial_cmp(&a.pressure).unwrap_or(Ordering::Equal));

        PressureReport { items, urgent }
    }
}

fn classify_against(
    threshold: &Threshold,
    value: f64,
    trend: Option<f64>,
    deadline_days: Option<i64>,
) -> PressureState {
    match threshold.static_status(value) {
        ThresholdStatus::Critical => PressureState::Irreversible,
        ThresholdStatus::Warning => PressureState::Pressuring,
        ThresholdStatus::Stable => {
            let trending_in = trend
                .filter(|t| t.is_finite())
                .map(|t| threshold.direction.breaches(value + t, threshold.warning))
                .unwrap_or(false);
            let deadline_near = match (deadline_days, threshold.deadline_warning_days) {
                (Some(d), Some(window)) => d <= i64::from(window),
                _ => false,
            };
            if trending_in || deadline_near {
                PressureState::Pressuring
            } else {
                PressureState::Ignorable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> PressureClassifier {
        PressureClassifier::new(PressureConfig::default().with_baseline(50_000_000.0))
    }

    #[test]
    fn test_urgency_factor() {
        assert_eq!(urgency_factor(None), 1.0);
        assert_eq!(urgency_factor(Some(0)), 30.0);
        assert_eq!(urgency_factor(Some(-4)), 30.0);
        assert_eq!(urgency_factor(Some(15)), 2.0);
        assert_eq!(urgency_factor(Some(30)), 1.0);
    }

    #[test]
    fn test_default_profiles() {
        let config = PressureConfig::default();
        assert_eq!(config.profiles.len(), 6);
        assert_eq!(config.urgent_within_days, 14);
        let c = PressureClassifier::new(config);
        assert!(c.profile(Role::Cash.node()).is_some());
        assert!(c.profile(Role::Quality.node()).is_none());
    }

    #[test]
    fn test_direction_correctness() {
        let c = classifier();
        // loyalty: below is bad, critical 0.6
        assert_eq!(c.classify(Role::Loyalty.node(), 0.5, None, None), PressureState::Irreversible);
        assert_eq!(c.classify(Role::Loyalty.node(), 0.65, None, None), PressureState::Pressuring);
        assert_eq!(c.classify(Role::Loyalty.node(), 0.9, None, None), PressureState::Ignorable);
        // dependency: above is bad, critical 0.6
        assert_eq!(c.classify(Role::Dependency.node(), 0.7, None, None), PressureState::Irreversible);
        assert_eq!(c.classify(Role::Dependency.node(), 0.1, None, None), PressureState::Ignorable);
    }

    #[test]
    fn test_expired_deadline_is_irreversible() {
        let c = classifier();
        for value in [0.0, 0.5, 0.99] {
            assert_eq!(
                c.classify(Role::Loyalty.node(), value, None, Some(0)),
                PressureState::Irreversible
            );
        }
        let item = c
            .assess(&PressureInput {
                node: Role::Loyalty.node(),
                value: 0.95,
                trend: None,
                deadline_days: Some(0),
            })
            .unwrap();
        assert_eq!(item.horizon, Horizon::Permanent);
        assert_eq!(item.severity, 1.0);
        assert!((item.estimated_loss - 50_000_000.0 * 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_trend_and_deadline_window() {
        let c = classifier();
        let loyalty = Role::Loyalty.node();
        assert_eq!(c.classify(loyalty, 0.72, Some(-0.05), None), PressureState::Pressuring);
        assert_eq!(c.classify(loyalty, 0.72, Some(0.05), None), PressureState::Ignorable);
        // loyalty warning window is 60 days
        assert_eq!(c.classify(loyalty, 0.9, None, Some(45)), PressureState::Pressuring);
        assert_eq!(c.classify(loyalty, 0.9, None, Some(90)), PressureState::Ignorable);
    }

    #[test]
    fn test_unprofiled_node() {
        let c = classifier();
        let quality = Role::Quality.node();
        assert_eq!(c.classify(quality, 0.1, None, None), PressureState::Ignorable);
        assert_eq!(c.classify(quality, 0.1, None, Some(0)), PressureState::Irreversible);
        assert!(c
            .assess(&PressureInput {
                node: quality,
                value: 0.1,
                trend: None,
                deadline_days: None
            })
            .is_none());
    }

    #[test]
    fn test_report_sorting() {
        let c = classifier();
        let inputs = [
            PressureInput {
                node: Role::Loyalty.node(),
                value: 0.62,
                trend: None,
                deadline_days: Some(40),
            },
            PressureInput {
                node: Role::Cash.node(),
                value: 2_000_000.0,
                trend: None,
                deadline_days: Some(5),
            },
            PressureInput {
                node: Role::ChurnRate.node(),
                value: 0.09,
                trend: None,
                deadline_days: Some(10),
            },
            PressureInput {
                node: Role::Dependency.node(),
                value: 0.1,
                trend: None,
                deadline_days: None,
            },
        ];
        let report = c.report(&inputs);

        assert_eq!(report.items.len(), 3);
        assert!(report
            .items
            .windows(2)
            .all(|w| w[0].pressure >= w[1].pressure));
        assert_eq!(report.items[0].node, Role::Cash.node());

        let urgent: Vec<_> = report.urgent.iter().map(|i| i.deadline_days).collect();
        assert_eq!(urgent, vec![Some(5), Some(10)]);
        assert_eq!(report.irreversible().count(), 1);
    }

    #[test]
    fn test_stable_node_with_near_deadline_is_urgent() {
        let c = classifier();
        // acquisition friction has no deadline warning window, so 0.3 stays ignorable
        let inputs = [
            PressureInput {
                node: Role::AcquisitionFriction.node(),
                value: 0.3,
                trend: None,
                deadline_days: Some(7),
            },
            PressureInput {
                node: Role::Loyalty.node(),
                value: 0.65,
                trend: None,
                deadline_days: Some(20),
            },
        ];
        let report = c.report(&inputs);

        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].node, Role::Loyalty.node());
        assert_eq!(report.urgent.len(), 1);
        assert_eq!(report.urgent[0].node, Role::AcquisitionFriction.node());
        assert_eq!(report.urgent[0].state, PressureState::Ignorable);
        assert_eq!(report.urgent[0].horizon, Horizon::Days);
    }

    #[test]
    fn test_estimated_loss_scales_with_severity() {
        let c = classifier();
        let item = c
            .assess(&PressureInput {
                node: Role::Loyalty.node(),
                value: 0.65,
                trend: None,
                deadline_days: None,
            })
            .unwrap();
        // halfway between warning 0.7 and critical 0.6
        assert!((item.severity - 0.5).abs() < 1e-9);
        assert!((item.estimated_loss - 50_000_000.0 * 0.3 * 0.5).abs() < 1e-3);
        assert_eq!(item.horizon, Horizon::Months);
    }

    #[test]
    fn test_report_state_uses_income_baseline() {
        let c = PressureClassifier::new(PressureConfig::default());
        let state = StateVector::new()
            .with_role(Role::Income, 10_000_000.0)
            .with_role(Role::Cash, 1_000_000.0);
        let report = c.report_state(&state, &BTreeMap::new(), &BTreeMap::new());

        assert_eq!(report.items.len(), 1);
        assert!((report.items[0].estimated_loss - 10_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_horizon_buckets() {
        let p = PressureState::Pressuring;
        assert_eq!(Horizon::from_deadline(p, Some(2)), Horizon::Immediate);
        assert_eq!(Horizon::from_deadline(p, Some(14)), Horizon::Days);
        assert_eq!(Horizon::from_deadline(p, Some(30)), Horizon::Weeks);
        assert_eq!(Horizon::from_deadline(p, Some(61)), Horizon::Months);
        assert_eq!(Horizon::from_deadline(p, None), Horizon::Months);
        assert_eq!(
            Horizon::from_deadline(PressureState::Irreversible, Some(30)),
            Horizon::Permanent
        );
    }
}
