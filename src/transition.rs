//! Nonlinear Transition Model - the per-node update equations.
//!
//! Each node with a business role is updated by exactly one equation kind:
//!
//! ```text
//! Conservation        next = current + Σ inflow - Σ outflow
//! EntropyDecay        next = current - current·λ + effort·λ·gain
//! InertiaBlend        next = current·r + fresh·(1 - r)
//! DiminishingReturns  cost = spend / yield   (cost·penalty when yield <= 0)
//! ThresholdCascade    next = base + min(severity·gain, cap) on the crossing step
//! ```
//!
//! Equations run in dependency order and later equations read the values
//! earlier ones produced in the same step. A [`Term`] routed through a causal
//! link is scaled by that link's learned gain (`coefficient / prior`), so an
//! untrained graph reproduces the configured table and recalibrated links
//! move the forecast. Nodes without an equation move by one hop of causal
//! coupling from this step's changes.

use crate::graph::CausalGraph;
use crate::node::{Law, NodeId, Role, NODE_COUNT};
use crate::numeric::{clamp_unit, finite_or, round_count, safe_div0, saturate, unsaturate};
use crate::prior::Direction;
use crate::state::{ActionParams, ExternalParams, StateVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constants for the standard equation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionParams {
    /// Share of income that reaches the cash balance
    pub cash_conversion: f64,
    /// Entropy decay rate λ of service quality
    pub quality_decay: f64,
    /// Effort multiplier in the decay equation
    pub effort_gain: f64,
    pub income_inertia: f64,
    pub loyalty_inertia: f64,
    pub staff_retention_inertia: f64,
    pub growth_inertia: f64,
    pub dependency_inertia: f64,
    pub market_share_inertia: f64,
    /// Multiplier on acquisition cost when spend yields nobody
    pub cac_penalty: f64,
    /// Acquisition cost at which friction reads 0.5
    pub cac_reference: f64,
    /// Spend at which paid acquisition yield halves
    pub saturation_spend: f64,
    pub referral_rate: f64,
    pub churn_sensitivity: f64,
    pub cascade_boundary: f64,
    pub cascade_gain: f64,
    pub cascade_max_fraction: f64,
    pub concentration_gain: f64,
    pub staff_monthly_cost: f64,
    pub base_morale: f64,
    pub salary_sensitivity: f64,
    /// Values assumed for role nodes missing from the input
    pub baselines: BTreeMap<Role, f64>,
}

impl Default for TransitionParams {
    fn default() -> Self {
        let baselines = [
            (Role::Quality, 0.7),
            (Role::Loyalty, 0.75),
            (Role::ChurnRate, 0.04),
            (Role::StaffRetention, 0.85),
            (Role::AcquisitionFriction, 0.5),
            (Role::Dependency, 0.3),
            (Role::MarketShare, 0.05),
        ]
        .into_iter()
        .collect();

        Self {
            cash_conversion: 0.9,
            quality_decay: 0.05,
            effort_gain: 1.5,
            income_inertia: 0.6,
            loyalty_inertia: 0.8,
            staff_retention_inertia: 0.9,
            growth_inertia: 0.5,
            dependency_inertia: 0.7,
            market_share_inertia: 0.8,
            cac_penalty: 1.1,
            cac_reference: 300_000.0,
            saturation_spend: 5_000_000.0,
            referral_rate: 0.01,
            churn_sensitivity: 0.15,
            cascade_boundary: 0.65,
            cascade_gain: 2.0,
            cascade_max_fraction: 0.3,
            concentration_gain: 3.0,
            staff_monthly_cost: 3_000_000.0,
            base_morale: 0.85,
            salary_sensitivity: 2.0,
            baselines,
        }
    }
}

impl TransitionParams {
    /// Read constants from a merged prior map, keeping defaults for absent keys.
    pub fn from_priors(priors: &BTreeMap<String, f64>) -> Self {
        let mut params = Self::default();
        let read = |key: &str, slot: &mut f64| {
            if let Some(&v) = priors.get(key) {
                if v.is_finite() {
                    *slot = v;
                }
            }
        };

        read("conservation.cash_conversion", &mut params.cash_conversion);
        read("entropy.quality_decay", &mut params.quality_decay);
        read("entropy.effort_gain", &mut params.effort_gain);
        read("inertia.income", &mut params.income_inertia);
        read("inertia.loyalty", &mut params.loyalty_inertia);
        read("inertia.staff_retention", &mut params.staff_retention_inertia);
        read("inertia.growth", &mut params.growth_inertia);
        read("inertia.dependency", &mut params.dependency_inertia);
        read("inertia.market_share", &mut params.market_share_inertia);
        read("friction.cac_penalty", &mut params.cac_penalty);
        read("friction.cac_reference", &mut params.cac_reference);
        read("friction.saturation_spend", &mut params.saturation_spend);
        read("flow.referral_rate", &mut params.referral_rate);
        read("flow.churn_sensitivity", &mut params.churn_sensitivity);
        read("cascade.loyalty_boundary", &mut params.cascade_boundary);
        read("cascade.gain", &mut params.cascade_gain);
        read("cascade.max_fraction", &mut params.cascade_max_fraction);
        read("gravity.concentration_gain", &mut params.concentration_gain);
        read("staff.monthly_cost", &mut params.staff_monthly_cost);
        read("staff.base_morale", &mut params.base_morale);
        read("staff.salary_sensitivity", &mut params.salary_sensitivity);

        for role in Role::ALL {
            if let Some(&v) = priors.get(&format!("baseline.{}", role.as_str())) {
                params.baselines.insert(role, v);
            }
        }
        params
    }
}

/// Action input a signal can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionField {
    MarketingSpend,
    RetentionEffort,
    SalaryAdjustment,
    HiringCount,
}

/// External input a signal can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalField {
    MarketGrowth,
    CompetitivePressure,
    SeasonalFactor,
}

/// Business quantities computed from the step's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Derived {
    /// Customers bought with marketing spend, with diminishing returns
    PaidAcquisitions,
    /// Paid plus referral acquisitions, scaled by demand
    NewCustomers,
    ChurnedCustomers,
    /// Updated customer count times revenue per customer, scaled by demand
    RecurringRevenue,
    HiringCost,
    Departures,
    DepartureSavings,
    /// Churn rate implied by updated loyalty and competition
    BaseChurn,
    PerceivedQuality,
    StaffMorale,
    RevenueConcentration,
    MarketPull,
    /// Relative change of a node within this step
    GrowthOf(NodeId),
}

/// Input to an equation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    /// Value as of this point in the step
    Node(NodeId),
    /// Value at the start of the step
    Start(NodeId),
    Action(ActionField),
    External(ExternalField),
    Derived(Derived),
    Const(f64),
}

/// Scaled signal, optionally weighted by a causal link's learned gain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub signal: Signal,
    pub scale: f64,
    /// `(from, to)` of the link whose gain multiplies this term
    #[serde(default)]
    pub via: Option<(NodeId, NodeId)>,
}

impl Term {
    pub fn of(signal: Signal) -> Self {
        Self::scaled(signal, 1.0)
    }

    pub fn scaled(signal: Signal, scale: f64) -> Self {
        Self {
            signal,
            scale,
            via: None,
        }
    }

    /// Route this term through the `from -> to` link.
    pub fn via(mut self, from: Role, to: Role) -> Self {
        self.via = Some((from.node(), to.node()));
        self
    }
}

/// The equation families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EquationKind {
    Conservation {
        inflows: Vec<Term>,
        outflows: Vec<Term>,
    },
    EntropyDecay {
        rate: f64,
        effort: Signal,
        gain: f64,
    },
    InertiaBlend {
        retention: f64,
        fresh: Term,
    },
    /// Node stores the cost as `cost / (cost + reference)`
    DiminishingReturns {
        spend: Signal,
        yield_signal: Signal,
        penalty: f64,
        reference: f64,
    },
    ThresholdCascade {
        base: Term,
        monitored: NodeId,
        boundary: f64,
        direction: Direction,
        gain: f64,
        max_fraction: f64,
    },
}

/// One node's update rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEquation {
    pub node: NodeId,
    pub kind: EquationKind,
    /// Round to a whole count, floored at zero
    #[serde(default)]
    pub count: bool,
}

/// `current + inflow - outflow`
#[inline]
pub fn conservation(current: f64, inflow: f64, outflow: f64) -> f64 {
    current + inflow - outflow
}

/// `current - current·λ + effort·λ·gain`, clamped to [0, 1]
#[inline]
pub fn entropy_decay(current: f64, rate: f64, effort: f64, gain: f64) -> f64 {
    clamp_unit(current - current * rate + effort * rate * gain)
}

/// `current·r + fresh·(1 - r)`
#[inline]
pub fn inertia_blend(current: f64, retention: f64, fresh: f64) -> f64 {
    let r = clamp_unit(retention);
    current * r + fresh * (1.0 - r)
}

/// Next unit cost given spend and yield.
///
/// With no spend the cost is unobservable and unchanged. Spend that yields
/// nobody multiplies the previous cost by `penalty` instead of dividing by
/// zero.
#[inline]
pub fn diminishing_returns(current_cost: f64, spend: f64, yielded: f64, penalty: f64) -> f64 {
    if spend <= 0.0 {
        current_cost
    } else if yielded <= 0.0 {
        current_cost * penalty
    } else {
        safe_div0(spend, yielded)
    }
}

/// Cascade fraction for a value past its boundary: `min(severity·gain, cap)`.
#[inline]
pub fn cascade_fraction(value: f64, boundary: f64, gain: f64, max_fraction: f64) -> f64 {
    let severity = safe_div0((boundary - value).abs(), boundary.abs());
    (severity * gain).clamp(0.0, max_fraction.max(0.0))
}

/// A threshold cascade that fired during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeEvent {
    /// Node receiving the cascade
    pub node: NodeId,
    pub monitored: NodeId,
    pub boundary: f64,
    /// Monitored value after crossing
    pub value: f64,
    pub severity: f64,
    /// Additional fraction injected into the target
    pub fraction: f64,
}

/// Everything produced by one transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub state: StateVector,
    pub cascades: Vec<CascadeEvent>,
    pub new_customers: f64,
    pub churned_customers: f64,
    /// Acquisition cost in currency units after the step
    pub acquisition_cost: f64,
}

impl TransitionOutcome {
    /// Total cascade churn injected this step.
    pub fn cascade_churn(&self) -> f64 {
        self.cascades
            .iter()
            .filter(|c| c.node == Role::ChurnRate.node())
            .map(|c| c.fraction)
            .sum()
    }
}

struct StepContext<'a> {
    graph: &'a CausalGraph,
    start: &'a StateVector,
    working: StateVector,
    action: ActionParams,
    external: ExternalParams,
    params: &'a TransitionParams,
}

impl StepContext<'_> {
    fn start(&self, role: Role) -> f64 {
        self.start.value_or(role.node(), 0.0)
    }

    fn now(&self, role: Role) -> f64 {
        self.working.value_or(role.node(), 0.0)
    }

    fn demand(&self) -> f64 {
        (1.0 + self.external.seasonal_factor)
            * (1.0 + self.external.market_growth)
            * (1.0 - 0.5 * self.external.competitive_pressure)
    }

    fn acquisition_cost(&self) -> f64 {
        unsaturate(self.start(Role::AcquisitionFriction), self.params.cac_reference)
    }

    fn term(&self, term: &Term) -> f64 {
        let gain = term
            .via
            .map(|(from, to)| self.graph.gain(from, to))
            .unwrap_or(1.0);
        finite_or(self.signal(term.signal) * term.scale * gain, 0.0)
    }

    fn signal(&self, signal: Signal) -> f64 {
        let value = match signal {
            Signal::Node(id) => self.working.value_or(id, 0.0),
            Signal::Start(id) => self.start.value_or(id, 0.0),
            Signal::Action(field) => match field {
                ActionField::MarketingSpend => self.action.marketing_spend,
                ActionField::RetentionEffort => self.action.retention_effort,
                ActionField::SalaryAdjustment => self.action.salary_adjustment,
                ActionField::HiringCount => self.action.hiring_count,
            },
            Signal::External(field) => match field {
                ExternalField::MarketGrowth => self.external.market_growth,
                ExternalField::CompetitivePressure => self.external.competitive_pressure,
                ExternalField::SeasonalFactor => self.external.seasonal_factor,
            },
            Signal::Derived(derived) => self.derived(derived),
            Signal::Const(v) => v,
        };
        finite_or(value, 0.0)
    }

    fn derived(&self, derived: Derived) -> f64 {
        let p = self.params;
        let cp = self.external.competitive_pressure;
        match derived {
            Derived::PaidAcquisitions => {
                let spend = self.action.marketing_spend;
                let raw = safe_div0(spend, self.acquisition_cost());
                raw / (1.0 + safe_div0(spend, p.saturation_spend))
            }
            Derived::NewCustomers => {
                let referrals = self.start(Role::Customers) * self.start(Role::Loyalty) * p.referral_rate;
                let paid = self.derived(Derived::PaidAcquisitions);
                ((paid + referrals) * self.demand()).max(0.0)
            }
            Derived::ChurnedCustomers => {
                self.start(Role::Customers) * clamp_unit(self.start(Role::ChurnRate))
            }
            Derived::RecurringRevenue => {
                let per_customer = safe_div0(self.start(Role::Income), self.start(Role::Customers));
                self.now(Role::Customers)
                    * per_customer
                    * (1.0 + self.external.seasonal_factor)
                    * (1.0 + self.external.market_growth)
            }
            Derived::HiringCost => self.action.hiring_count * p.staff_monthly_cost,
            Derived::Departures => {
                self.start(Role::Headcount) * (1.0 - clamp_unit(self.start(Role::StaffRetention)))
            }
            Derived::DepartureSavings => self.derived(Derived::Departures) * p.staff_monthly_cost,
            Derived::BaseChurn => {
                (1.0 - clamp_unit(self.now(Role::Loyalty))) * p.churn_sensitivity * (1.0 + 0.5 * cp)
            }
            Derived::PerceivedQuality => self.now(Role::Quality) * (1.0 - 0.2 * cp),
            Derived::StaffMorale => {
                let raise = safe_div0(self.action.salary_adjustment, self.start(Role::Expense));
                clamp_unit(p.base_morale + raise * p.salary_sensitivity)
            }
            Derived::RevenueConcentration => {
                let customers = self.now(Role::Customers).max(1.0);
                clamp_unit(safe_div0(p.concentration_gain, customers.sqrt()))
            }
            Derived::MarketPull => {
                self.start(Role::MarketShare) * (1.0 + self.external.market_growth - 0.1 * cp)
            }
            Derived::GrowthOf(id) => {
                let before = self.start.value_or(id, 0.0);
                let after = self.working.value_or(id, 0.0);
                safe_div0(after - before, before.abs())
            }
        }
    }
}

/// Deterministic nonlinear state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionModel {
    params: TransitionParams,
    equations: Vec<NodeEquation>,
}

impl Default for TransitionModel {
    fn default() -> Self {
        Self::new(TransitionParams::default())
    }
}

impl TransitionModel {
    /// Standard equation table for the given constants.
    pub fn new(params: TransitionParams) -> Self {
        let equations = standard_equations(&params);
        Self { params, equations }
    }

    /// Custom equation table. Later duplicates of a node are ignored.
    pub fn with_equations(params: TransitionParams, equations: Vec<NodeEquation>) -> Self {
        let mut seen = [false; NODE_COUNT];
        let equations = equations
            .into_iter()
            .filter(|eq| !std::mem::replace(&mut seen[eq.node.index()], true))
            .collect();
        Self { params, equations }
    }

    pub fn params(&self) -> &TransitionParams {
        &self.params
    }

    pub fn equations(&self) -> &[NodeEquation] {
        &self.equations
    }

    /// Nodes in the order they are updated.
    pub fn update_order(&self) -> Vec<NodeId> {
        self.equations.iter().map(|eq| eq.node).collect()
    }

    /// Advance one step.
    ///
    /// The graph is only read: its learned gains weight the routed terms and
    /// its coefficients drive coupling. Learning happens elsewhere.
    pub fn next_state(
        &self,
        graph: &CausalGraph,
        state: &StateVector,
        action: &ActionParams,
        external: &ExternalParams,
    ) -> TransitionOutcome {
        let start = self.seed(state);
        let mut ctx = StepContext {
            graph,
            start: &start,
            working: start.clone(),
            action: action.sanitized(),
            external: external.sanitized(),
            params: &self.params,
        };

        let new_customers = ctx.derived(Derived::NewCustomers);
        let churned_customers = ctx.derived(Derived::ChurnedCustomers);
        let mut cascades = Vec::new();
        let mut acquisition_cost = ctx.acquisition_cost();
        let mut has_equation = [false; NODE_COUNT];

        for eq in &self.equations {
            has_equation[eq.node.index()] = true;
            let current = ctx.working.value_or(eq.node, 0.0);

            let raw = match &eq.kind {
                EquationKind::Conservation { inflows, outflows } => {
                    let sum = |terms: &[Term]| -> f64 { terms.iter().map(|t| ctx.term(t)).sum() };
                    conservation(current, sum(&inflows[..]), sum(&outflows[..]))
                }
                EquationKind::EntropyDecay { rate, effort, gain } => {
                    entropy_decay(current, *rate, ctx.signal(*effort), *gain)
                }
                EquationKind::InertiaBlend { retention, fresh } => {
                    inertia_blend(current, *retention, ctx.term(fresh))
                }
                EquationKind::DiminishingReturns {
                    spend,
                    yield_signal,
                    penalty,
                    reference,
                } => {
                    let cost = unsaturate(current, *reference);
                    let next_cost =
                        diminishing_returns(cost, ctx.signal(*spend), ctx.signal(*yield_signal), *penalty);
                    if eq.node == Role::AcquisitionFriction.node() {
                        acquisition_cost = next_cost;
                    }
                    saturate(next_cost, *reference)
                }
                EquationKind::ThresholdCascade {
                    base,
                    monitored,
                    boundary,
                    direction,
                    gain,
                    max_fraction,
                } => {
                    let before = ctx.start.value_or(*monitored, 0.0);
                    let after = ctx.working.value_or(*monitored, 0.0);
                    let mut next = ctx.term(base);
                    if !direction.breaches(before, *boundary) && direction.breaches(after, *boundary) {
                        let fraction = cascade_fraction(after, *boundary, *gain, *max_fraction);
                        tracing::debug!(
                            node = %eq.node,
                            monitored = %monitored,
                            value = after,
                            fraction,
                            "threshold cascade"
                        );
                        cascades.push(CascadeEvent {
                            node: eq.node,
                            monitored: *monitored,
                            boundary: *boundary,
                            value: after,
                            severity: safe_div0((boundary - after).abs(), boundary.abs()),
                            fraction,
                        });
                        next += fraction;
                    }
                    next
                }
            };

            let mut value = eq.node.law().bound(finite_or(raw, current));
            if eq.count {
                value = round_count(value);
            }
            ctx.working.set(eq.node, value);
        }

        let mut next = ctx.working;
        couple(graph, &start, &mut next, &has_equation);
        next.clamp_by_law();

        TransitionOutcome {
            state: next,
            cascades,
            new_customers,
            churned_customers,
            acquisition_cost,
        }
    }

    /// Run a sequence of steps, feeding each output into the next.
    pub fn simulate(
        &self,
        graph: &CausalGraph,
        initial: &StateVector,
        steps: &[(ActionParams, ExternalParams)],
    ) -> Vec<TransitionOutcome> {
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut state = initial.clone();
        for (action, external) in steps {
            let outcome = self.next_state(graph, &state, action, external);
            state = outcome.state.clone();
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Input state with baselines filled in for missing role nodes.
    fn seed(&self, state: &StateVector) -> StateVector {
        let mut seeded = state.clone();
        for eq in &self.equations {
            if seeded.contains(eq.node) {
                continue;
            }
            let baseline = Role::for_node(eq.node)
                .and_then(|role| self.params.baselines.get(&role).copied())
                .unwrap_or(0.0);
            seeded.set(eq.node, baseline);
        }
        seeded.clamp_by_law();
        seeded
    }
}

/// One hop of causal coupling into nodes no equation owns.
///
/// Conservation sources contribute relative change so that currency-scale
/// values do not swamp ratio nodes.
fn couple(graph: &CausalGraph, start: &StateVector, next: &mut StateVector, has_equation: &[bool]) {
    let mut deltas = [0.0; NODE_COUNT];
    for (id, after) in next.iter() {
        let before = start.value_or(id, 0.0);
        deltas[id.index()] = match id.law() {
            Law::Conservation => safe_div0(after - before, before.abs()),
            _ => after - before,
        };
    }

    let mut shifts: BTreeMap<NodeId, f64> = BTreeMap::new();
    for link in graph.links() {
        if has_equation[link.to.index()] {
            continue;
        }
        let delta = deltas[link.from.index()];
        if delta != 0.0 {
            *shifts.entry(link.to).or_insert(0.0) += link.coefficient * delta;
        }
    }

    for (id, shift) in shifts {
        let base = start.value_or(id, 0.0);
        next.set(id, finite_or(base + shift, base));
    }
}

fn standard_equations(p: &TransitionParams) -> Vec<NodeEquation> {
    let node = |role: Role| Signal::Node(role.node());
    let derived = Signal::Derived;
    let eq = |role: Role, kind: EquationKind| NodeEquation {
        node: role.node(),
        kind,
        count: role.is_count(),
    };

    vec![
        eq(
            Role::Customers,
            EquationKind::Conservation {
                inflows: vec![Term::of(derived(Derived::NewCustomers))],
                outflows: vec![Term::of(derived(Derived::ChurnedCustomers))],
            },
        ),
        eq(
            Role::Headcount,
            EquationKind::Conservation {
                inflows: vec![Term::of(Signal::Action(ActionField::HiringCount))],
                outflows: vec![Term::of(derived(Derived::Departures))],
            },
        ),
        eq(
            Role::Income,
            EquationKind::InertiaBlend {
                retention: p.income_inertia,
                fresh: Term::of(derived(Derived::RecurringRevenue)),
            },
        ),
        eq(
            Role::Expense,
            EquationKind::Conservation {
                inflows: vec![
                    Term::of(derived(Derived::HiringCost)),
                    Term::of(Signal::Action(ActionField::SalaryAdjustment)),
                ],
                outflows: vec![Term::of(derived(Derived::DepartureSavings))],
            },
        ),
        eq(
            Role::Cash,
            EquationKind::Conservation {
                inflows: vec![
                    Term::scaled(node(Role::Income), p.cash_conversion).via(Role::Income, Role::Cash)
                ],
                outflows: vec![
                    Term::of(node(Role::Expense)).via(Role::Expense, Role::Cash),
                    Term::of(Signal::Action(ActionField::MarketingSpend)),
                ],
            },
        ),
        eq(
            Role::Quality,
            EquationKind::EntropyDecay {
                rate: p.quality_decay,
                effort: Signal::Action(ActionField::RetentionEffort),
                gain: p.effort_gain,
            },
        ),
        eq(
            Role::IncomeGrowth,
            EquationKind::InertiaBlend {
                retention: p.growth_inertia,
                fresh: Term::of(derived(Derived::GrowthOf(Role::Income.node()))),
            },
        ),
        eq(
            Role::CustomerGrowth,
            EquationKind::InertiaBlend {
                retention: p.growth_inertia,
                fresh: Term::of(derived(Derived::GrowthOf(Role::Customers.node()))),
            },
        ),
        eq(
            Role::Loyalty,
            EquationKind::InertiaBlend {
                retention: p.loyalty_inertia,
                fresh: Term::of(derived(Derived::PerceivedQuality)).via(Role::Quality, Role::Loyalty),
            },
        ),
        eq(
            Role::StaffRetention,
            EquationKind::InertiaBlend {
                retention: p.staff_retention_inertia,
                fresh: Term::of(derived(Derived::StaffMorale)),
            },
        ),
        eq(
            Role::ChurnRate,
            EquationKind::ThresholdCascade {
                base: Term::of(derived(Derived::BaseChurn)).via(Role::Loyalty, Role::ChurnRate),
                monitored: Role::Loyalty.node(),
                boundary: p.cascade_boundary,
                direction: Direction::Below,
                gain: p.cascade_gain,
                max_fraction: p.cascade_max_fraction,
            },
        ),
        eq(
            Role::AcquisitionFriction,
            EquationKind::DiminishingReturns {
                spend: Signal::Action(ActionField::MarketingSpend),
                yield_signal: derived(Derived::PaidAcquisitions),
                penalty: p.cac_penalty,
                reference: p.cac_reference,
            },
        ),
        eq(
            Role::Dependency,
            EquationKind::InertiaBlend {
                retention: p.dependency_inertia,
                fresh: Term::of(derived(Derived::RevenueConcentration)),
            },
        ),
        eq(
            Role::MarketShare,
            EquationKind::InertiaBlend {
                retention: p.market_share_inertia,
                fresh: Term::of(derived(Derived::MarketPull)),
            },
        ),
    ]
}
