//! State vectors and per-step inputs.
//!
//! A [`StateVector`] is one observation period's picture of the business. It
//! is sparse: nodes that were not observed are simply absent, and absence is
//! never an error.

use crate::error::{EngineError, Result};
use crate::node::{NodeId, NodeSpace, Role};
use crate::numeric::{clamp_signed, clamp_unit, finite_or, round_count};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sparse mapping from node id to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector {
    values: BTreeMap<NodeId, f64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, value)` pairs where each name is a role name or
    /// symbolic node id.
    pub fn from_named(space: &NodeSpace, pairs: &[(&str, f64)]) -> Result<Self> {
        let mut state = Self::new();
        for &(name, value) in pairs {
            state.set(space.resolve(name)?, value);
        }
        Ok(state)
    }

    /// Build from raw `(index, value)` pairs, rejecting invalid indices.
    pub fn from_indexed(pairs: &[(usize, f64)]) -> Result<Self> {
        let mut state = Self::new();
        for &(index, value) in pairs {
            state.set(NodeId::new(index)?, value);
        }
        Ok(state)
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<f64> {
        self.values.get(&id).copied()
    }

    #[inline]
    pub fn value_or(&self, id: NodeId, fallback: f64) -> f64 {
        self.get(id).unwrap_or(fallback)
    }

    pub fn set(&mut self, id: NodeId, value: f64) {
        self.values.insert(id, value);
    }

    pub fn remove(&mut self, id: NodeId) -> Option<f64> {
        self.values.remove(&id)
    }

    #[inline]
    pub fn role(&self, role: Role) -> Option<f64> {
        self.get(role.node())
    }

    pub fn set_role(&mut self, role: Role, value: f64) {
        self.set(role.node(), value);
    }

    /// Builder form of [`set_role`](Self::set_role).
    pub fn with_role(mut self, role: Role, value: f64) -> Self {
        self.set_role(role, value);
        self
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, f64)> + '_ {
        self.values.iter().map(|(&id, &v)| (id, v))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.values.keys().copied()
    }

    /// Apply each node's law clamp in place.
    pub fn clamp_by_law(&mut self) {
        for (id, value) in self.values.iter_mut() {
            *value = id.law().bound(*value);
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::SerializationError(e.to_string()))
    }
}

impl FromIterator<(NodeId, f64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (NodeId, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Operator decisions for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionParams {
    /// Marketing outlay this period (currency units)
    pub marketing_spend: f64,
    /// Effort spent on service quality, 0..=1
    pub retention_effort: f64,
    /// Change to the monthly payroll (currency units, any sign)
    pub salary_adjustment: f64,
    /// New staff hired this period
    pub hiring_count: f64,
}

impl ActionParams {
    /// Bound every field to its valid range.
    pub fn sanitized(&self) -> Self {
        Self {
            marketing_spend: finite_or(self.marketing_spend, 0.0).max(0.0),
            retention_effort: clamp_unit(self.retention_effort),
            salary_adjustment: finite_or(self.salary_adjustment, 0.0),
            hiring_count: round_count(self.hiring_count),
        }
    }
}

/// Environment outside the operator's control for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalParams {
    /// Market growth rate per period, -1..=1
    pub market_growth: f64,
    /// Competitive pressure, 0..=1
    pub competitive_pressure: f64,
    /// Seasonal adjustment; demand is scaled by `1 + seasonal_factor`
    pub seasonal_factor: f64,
}

impl ExternalParams {
    pub fn sanitized(&self) -> Self {
        Self {
            market_growth: clamp_signed(self.market_growth),
            competitive_pressure: clamp_unit(self.competitive_pressure),
            seasonal_factor: clamp_signed(self.seasonal_factor),
        }
    }
}

/// One observation period for a business entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Period identifier; must strictly increase across a series
    pub period: i64,
    pub state: StateVector,
    /// Actions taken during this period
    #[serde(default)]
    pub action: ActionParams,
    #[serde(default)]
    pub external: ExternalParams,
}

impl Snapshot {
    pub fn new(period: i64, state: StateVector) -> Self {
        Self {
            period,
            state,
            action: ActionParams::default(),
            external: ExternalParams::default(),
        }
    }

    pub fn with_action(mut self, action: ActionParams) -> Self {
        self.action = action;
        self
    }

    pub fn with_external(mut self, external: ExternalParams) -> Self {
        self.external = external;
        self
    }
}

/// Check that periods strictly increase.
pub fn validate_period_order(series: &[Snapshot]) -> Result<()> {
    for pair in series.windows(2) {
        if pair[1].period <= pair[0].period {
            return Err(EngineError::PeriodOrder {
                previous: pair[0].period,
                next: pair[1].period,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_named() {
        let space = NodeSpace::new();
        let state =
            StateVector::from_named(&space, &[("cash", 23_000_000.0), ("loyalty", 0.78)]).unwrap();

        assert_eq!(state.role(Role::Cash), Some(23_000_000.0));
        assert_eq!(state.role(Role::Loyalty), Some(0.78));
        assert_eq!(state.role(Role::Income), None);
        assert!(StateVector::from_named(&space, &[("nope", 1.0)]).is_err());
    }

    #[test]
    fn test_from_indexed_rejects_bad_index() {
        assert!(StateVector::from_indexed(&[(3, 1.0), (71, 0.5)]).is_ok());
        assert!(matches!(
            StateVector::from_indexed(&[(72, 1.0)]),
            Err(EngineError::NodeOutOfRange { index: 72 })
        ));
    }

    #[test]
    fn test_clamp_by_law() {
        let mut state = StateVector::new()
            .with_role(Role::Loyalty, 1.4)
            .with_role(Role::IncomeGrowth, -3.0)
            .with_role(Role::Cash, -100.0);
        state.clamp_by_law();

        assert_eq!(state.role(Role::Loyalty), Some(1.0));
        assert_eq!(state.role(Role::IncomeGrowth), Some(-1.0));
        assert_eq!(state.role(Role::Cash), Some(-100.0));
    }

    #[test]
    fn test_sanitized_inputs() {
        let action = ActionParams {
            marketing_spend: -10.0,
            retention_effort: 2.0,
            salary_adjustment: f64::INFINITY,
            hiring_count: 1.6,
        }
        .sanitized();
        assert_eq!(action.marketing_spend, 0.0);
        assert_eq!(action.retention_effort, 1.0);
        assert_eq!(action.salary_adjustment, 0.0);
        assert_eq!(action.hiring_count, 2.0);
    }

    #[test]
    fn test_period_order() {
        let a = Snapshot::new(202401, StateVector::new());
        let b = Snapshot::new(202402, StateVector::new());
        assert!(validate_period_order(&[a.clone(), b.clone()]).is_ok());
        assert_eq!(
            validate_period_order(&[b, a]).unwrap_err(),
            EngineError::PeriodOrder {
                previous: 202402,
                next: 202401
            }
        );
    }

    #[test]
    fn test_json_shape() {
        let state = StateVector::new().with_role(Role::Loyalty, 0.5);
        let json = state.to_json().unwrap();
        assert_eq!(json, r#"{"28":0.5}"#);
        let back: StateVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
