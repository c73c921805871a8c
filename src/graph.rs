//! Causal Graph - sparse, directed, weighted influence between nodes.
//!
//! Links live in an arena indexed by `(from, to)`. Absence of influence is
//! represented by omission, never by a zero-valued link, and links are never
//! deleted.
//!
//! Linear propagation:
//!
//! ```text
//! next[i] = 0.3 * Σ_j A[j][i] * state[j] + 0.7 * state[i]
//! ```
//!
//! This is a cheap sensitivity tool; production predictions come from
//! [`TransitionModel`](crate::transition::TransitionModel).

use crate::error::{EngineError, Result};
use crate::node::{Law, NodeId, NodeSpace, Property, Role, NODE_COUNT};
use crate::numeric::finite_or;
use crate::state::StateVector;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

/// Safety bound on every coefficient, independent of prior ranges.
pub const COEFFICIENT_BOUND: f64 = 1.0;

/// Weight of the propagated signal in [`CausalGraph::propagate`].
pub const PROPAGATION_MIX: f64 = 0.3;

/// Default hop limit for [`CausalGraph::find_paths`].
pub const DEFAULT_PATH_DEPTH: usize = 3;

/// Trust tier of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "LOW",
            Confidence::Medium => "MEDIUM",
            Confidence::High => "HIGH",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provenance of a link's prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkSource {
    /// Bookkeeping identity
    Accounting,
    /// Structural relationship (e.g. turnover = 1 - retention)
    Physics,
    /// Published studies
    Research,
    /// Industry benchmarks
    Benchmark,
    /// Fitted from this business's own data
    Empirical,
    /// Educated guess
    Estimated,
}

/// Valid coefficient interval declared with the prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorRange {
    pub min: f64,
    pub max: f64,
}

impl PriorRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if min > max || !min.is_finite() || !max.is_finite() {
            return Err(EngineError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// The safety bound used when no range was declared.
    pub fn unbounded() -> Self {
        Self {
            min: -COEFFICIENT_BOUND,
            max: COEFFICIENT_BOUND,
        }
    }

    #[inline]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Directed, weighted influence of one node on another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    pub from: NodeId,
    pub to: NodeId,
    /// Current (posterior) coefficient
    pub coefficient: f64,
    /// Seed value before any learning
    pub prior: f64,
    /// `None` means the [-1, 1] safety bound applies
    #[serde(default)]
    pub range: Option<PriorRange>,
    pub confidence: Confidence,
    pub source: LinkSource,
    pub rationale: String,
    pub law: Law,
    /// Number of applied learning updates
    #[serde(default)]
    pub updates: u32,
}

impl CausalLink {
    pub fn new(
        from: NodeId,
        to: NodeId,
        coefficient: f64,
        range: Option<PriorRange>,
        confidence: Confidence,
        source: LinkSource,
        law: Law,
        rationale: impl Into<String>,
    ) -> Self {
        let coefficient = range
            .unwrap_or_else(PriorRange::unbounded)
            .clamp(coefficient);
        Self {
            from,
            to,
            coefficient,
            prior: coefficient,
            range,
            confidence,
            source,
            rationale: rationale.into(),
            law,
            updates: 0,
        }
    }

    /// Accounting identities at HIGH confidence never learn.
    pub fn is_frozen(&self) -> bool {
        self.confidence == Confidence::High && self.source == LinkSource::Accounting
    }

    /// Learned strength relative to the prior, `coefficient / prior`.
    ///
    /// 1 until the link learns; never negative. A zero prior has no scale to
    /// compare against and reports 1.
    pub fn gain(&self) -> f64 {
        if self.prior == 0.0 {
            1.0
        } else {
            finite_or(self.coefficient / self.prior, 1.0).max(0.0)
        }
    }

    /// Effective clamp range.
    pub fn bounds(&self) -> PriorRange {
        self.range.unwrap_or_else(PriorRange::unbounded)
    }

    /// Coefficient key, e.g. `inertia.customer->flow.customer`.
    pub fn key(&self) -> String {
        link_key(self.from, self.to)
    }
}

/// Format a coefficient key.
pub fn link_key(from: NodeId, to: NodeId) -> String {
    format!("{}->{}", from, to)
}

/// Parse a coefficient key of the form `<node>-><node>`.
///
/// Either side may be a symbolic id or a role name.
pub fn parse_link_key(space: &NodeSpace, key: &str) -> Result<(NodeId, NodeId)> {
    let (from, to) = key
        .split_once("->")
        .ok_or_else(|| EngineError::MalformedKey(key.to_string()))?;
    let from = space
        .resolve(from.trim())
        .map_err(|_| EngineError::MalformedKey(key.to_string()))?;
    let to = space
        .resolve(to.trim())
        .map_err(|_| EngineError::MalformedKey(key.to_string()))?;
    Ok((from, to))
}

/// Sparse causal graph over the node space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<CausalLink>", into = "Vec<CausalLink>")]
pub struct CausalGraph {
    links: Vec<CausalLink>,
    index: HashMap<(NodeId, NodeId), usize>,
    outgoing: Vec<Vec<usize>>,
    dense: OnceLock<DMatrix<f64>>,
}

impl Default for CausalGraph {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            index: HashMap::new(),
            outgoing: vec![Vec::new(); NODE_COUNT],
            dense: OnceLock::new(),
        }
    }
}

impl TryFrom<Vec<CausalLink>> for CausalGraph {
    type Error = EngineError;

    fn try_from(links: Vec<CausalLink>) -> Result<Self> {
        Self::from_links(links)
    }
}

impl From<CausalGraph> for Vec<CausalLink> {
    fn from(graph: CausalGraph) -> Self {
        graph.links
    }
}

impl CausalGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph seeded from the built-in prior link table.
    pub fn seeded() -> Self {
        let mut graph = Self::new();
        for link in seed_links() {
            graph.insert(link).expect("seed links are unique");
        }
        graph
    }

    /// Build from a list of links, rejecting duplicates and bad ranges.
    pub fn from_links(links: Vec<CausalLink>) -> Result<Self> {
        let mut graph = Self::new();
        for link in links {
            graph.insert(link)?;
        }
        Ok(graph)
    }

    /// Add a link. Fails if `(from, to)` already exists.
    pub fn insert(&mut self, link: CausalLink) -> Result<usize> {
        if let Some(range) = link.range {
            PriorRange::new(range.min, range.max)?;
        }
        let key = (link.from, link.to);
        if self.index.contains_key(&key) {
            return Err(EngineError::ConfigError(format!(
                "duplicate causal link {}",
                link.key()
            )));
        }
        let idx = self.links.len();
        self.outgoing[link.from.index()].push(idx);
        self.index.insert(key, idx);
        self.links.push(link);
        self.dense = OnceLock::new();
        Ok(idx)
    }

    /// Coefficient of `from -> to`, 0 if absent.
    pub fn get(&self, from: NodeId, to: NodeId) -> f64 {
        self.link(from, to).map(|l| l.coefficient).unwrap_or(0.0)
    }

    /// Learned gain of `from -> to`, 1 if absent.
    pub fn gain(&self, from: NodeId, to: NodeId) -> f64 {
        self.link(from, to).map(CausalLink::gain).unwrap_or(1.0)
    }

    pub fn link(&self, from: NodeId, to: NodeId) -> Option<&CausalLink> {
        self.index.get(&(from, to)).map(|&i| &self.links[i])
    }

    pub fn link_index(&self, from: NodeId, to: NodeId) -> Option<usize> {
        self.index.get(&(from, to)).copied()
    }

    pub fn links(&self) -> &[CausalLink] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Outgoing links of a node.
    pub fn outgoing(&self, from: NodeId) -> impl Iterator<Item = &CausalLink> + '_ {
        self.outgoing[from.index()].iter().map(|&i| &self.links[i])
    }

    /// Set a coefficient, clamped to the safety bound. Returns the stored value.
    pub fn update(&mut self, from: NodeId, to: NodeId, value: f64) -> Result<f64> {
        let idx = self
            .link_index(from, to)
            .ok_or_else(|| EngineError::UnknownLink {
                from: from.to_string(),
                to: to.to_string(),
            })?;
        Ok(self.set_coefficient(idx, value))
    }

    pub(crate) fn set_coefficient(&mut self, idx: usize, value: f64) -> f64 {
        let stored = if value.is_finite() {
            value.clamp(-COEFFICIENT_BOUND, COEFFICIENT_BOUND)
        } else {
            self.links[idx].coefficient
        };
        self.links[idx].coefficient = stored;
        self.dense = OnceLock::new();
        stored
    }

    /// Count an applied learning update and promote the confidence tier.
    ///
    /// Tiers only ever move up.
    pub(crate) fn record_update(&mut self, idx: usize, medium_after: u32, high_after: u32) {
        let link = &mut self.links[idx];
        link.updates = link.updates.saturating_add(1);
        let earned = if link.updates >= high_after {
            Confidence::High
        } else if link.updates >= medium_after {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        link.confidence = link.confidence.max(earned);
    }

    /// Dense 72x72 projection, rows = source, columns = target.
    ///
    /// Rebuilt lazily after any coefficient change.
    pub fn to_dense_matrix(&self) -> &DMatrix<f64> {
        self.dense.get_or_init(|| {
            let mut m = DMatrix::zeros(NODE_COUNT, NODE_COUNT);
            for link in &self.links {
                m[(link.from.index(), link.to.index())] = link.coefficient;
            }
            m
        })
    }

    /// One step of damped linear propagation.
    ///
    /// Missing inputs count as zero. The result covers every node that was
    /// present or received influence, clamped by law.
    pub fn propagate(&self, state: &StateVector) -> StateVector {
        let a = self.to_dense_matrix();
        let mut current = vec![0.0; NODE_COUNT];
        let mut present = vec![false; NODE_COUNT];
        for (id, value) in state.iter() {
            current[id.index()] = value;
            present[id.index()] = true;
        }

        let mut next = StateVector::new();
        for id in NodeId::all() {
            let i = id.index();
            let mut sum = 0.0;
            let mut influenced = false;
            for (j, &value) in current.iter().enumerate() {
                let coef = a[(j, i)];
                if coef != 0.0 && present[j] {
                    sum += coef * value;
                    influenced = true;
                }
            }
            if present[i] || influenced {
                let blended = PROPAGATION_MIX * sum + (1.0 - PROPAGATION_MIX) * current[i];
                next.set(id, id.law().bound(blended));
            }
        }
        next
    }

    /// One-hop sensitivity: `delta * coefficient` for every outgoing link.
    pub fn impact_of(&self, node: NodeId, delta: f64) -> BTreeMap<NodeId, f64> {
        self.outgoing(node)
            .map(|link| (link.to, delta * link.coefficient))
            .collect()
    }

    /// All simple paths from `from` to `to` with at most `max_depth` hops.
    ///
    /// Exponential in the worst case; keep `max_depth` small.
    pub fn find_paths(&self, from: NodeId, to: NodeId, max_depth: usize) -> Vec<Vec<NodeId>> {
        let mut paths = Vec::new();
        let mut path = vec![from];
        let mut visited = vec![false; NODE_COUNT];
        visited[from.index()] = true;
        self.walk(to, max_depth, &mut path, &mut visited, &mut paths);
        paths
    }

    fn walk(
        &self,
        target: NodeId,
        max_depth: usize,
        path: &mut Vec<NodeId>,
        visited: &mut [bool],
        paths: &mut Vec<Vec<NodeId>>,
    ) {
        if path.len() > max_depth {
            return;
        }
        let Some(&last) = path.last() else {
            return;
        };
        for link in self.outgoing(last) {
            let next = link.to;
            if visited[next.index()] {
                continue;
            }
            path.push(next);
            if next == target {
                paths.push(path.clone());
            } else {
                visited[next.index()] = true;
                self.walk(target, max_depth, path, visited, paths);
                visited[next.index()] = false;
            }
            path.pop();
        }
    }

    /// Product of coefficients along a path.
    pub fn path_strength(&self, path: &[NodeId]) -> f64 {
        path.windows(2)
            .map(|w| self.get(w[0], w[1]))
            .product()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::SerializationError(e.to_string()))
    }

    /// Deserialize from JSON, rebuilding the index
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::SerializationError(e.to_string()))
    }
}

struct Seed {
    from: NodeId,
    to: NodeId,
    coefficient: f64,
    min: f64,
    max: f64,
    confidence: Confidence,
    source: LinkSource,
    law: Law,
    rationale: &'static str,
}

const fn n(law: Law, property: Property) -> NodeId {
    NodeId::of(law, property)
}

const SEEDS: &[Seed] = &[
    Seed {
        from: Role::Income.node(),
        to: Role::Cash.node(),
        coefficient: 0.9,
        min: 0.85,
        max: 0.95,
        confidence: Confidence::High,
        source: LinkSource::Accounting,
        law: Law::Conservation,
        rationale: "income reaches the bank net of card fees and withholding",
    },
    Seed {
        from: Role::Expense.node(),
        to: Role::Cash.node(),
        coefficient: -1.0,
        min: -1.0,
        max: -1.0,
        confidence: Confidence::High,
        source: LinkSource::Accounting,
        law: Law::Conservation,
        rationale: "every expense leaves the cash balance",
    },
    Seed {
        from: Role::Loyalty.node(),
        to: Role::ChurnRate.node(),
        coefficient: -0.6,
        min: -0.9,
        max: -0.3,
        confidence: Confidence::Medium,
        source: LinkSource::Research,
        law: Law::Inertia,
        rationale: "loyal customers renew",
    },
    Seed {
        from: Role::Quality.node(),
        to: Role::Loyalty.node(),
        coefficient: 0.4,
        min: 0.1,
        max: 0.7,
        confidence: Confidence::Medium,
        source: LinkSource::Research,
        law: Law::Inertia,
        rationale: "perceived quality feeds satisfaction and loyalty",
    },
    Seed {
        from: Role::ChurnRate.node(),
        to: Role::CustomerGrowth.node(),
        coefficient: -0.8,
        min: -1.0,
        max: -0.4,
        confidence: Confidence::High,
        source: LinkSource::Physics,
        law: Law::Flow,
        rationale: "churn is a direct outflow of the customer stock",
    },
    Seed {
        from: Role::ChurnRate.node(),
        to: Role::IncomeGrowth.node(),
        coefficient: -0.5,
        min: -0.8,
        max: -0.2,
        confidence: Confidence::Medium,
        source: LinkSource::Physics,
        law: Law::Flow,
        rationale: "lost customers take their recurring fees with them",
    },
    Seed {
        from: Role::CustomerGrowth.node(),
        to: Role::IncomeGrowth.node(),
        coefficient: 0.7,
        min: 0.4,
        max: 0.9,
        confidence: Confidence::Medium,
        source: LinkSource::Benchmark,
        law: Law::Acceleration,
        rationale: "revenue tracks enrolment with a pricing lag",
    },
    Seed {
        from: Role::AcquisitionFriction.node(),
        to: Role::CustomerGrowth.node(),
        coefficient: -0.3,
        min: -0.6,
        max: -0.1,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Friction,
        rationale: "expensive acquisition slows growth at fixed budget",
    },
    Seed {
        from: Role::StaffRetention.node(),
        to: Role::Quality.node(),
        coefficient: 0.5,
        min: 0.2,
        max: 0.8,
        confidence: Confidence::Medium,
        source: LinkSource::Research,
        law: Law::Inertia,
        rationale: "stable teachers deliver consistent lessons",
    },
    Seed {
        from: Role::StaffRetention.node(),
        to: n(Law::Flow, Property::Staff),
        coefficient: -0.7,
        min: -0.9,
        max: -0.4,
        confidence: Confidence::High,
        source: LinkSource::Physics,
        law: Law::Flow,
        rationale: "turnover is the complement of retention",
    },
    Seed {
        from: n(Law::Flow, Property::Staff),
        to: Role::Quality.node(),
        coefficient: -0.4,
        min: -0.7,
        max: -0.1,
        confidence: Confidence::Medium,
        source: LinkSource::Research,
        law: Law::Flow,
        rationale: "turnover disrupts continuity of instruction",
    },
    Seed {
        from: Role::Dependency.node(),
        to: Role::IncomeGrowth.node(),
        coefficient: -0.2,
        min: -0.5,
        max: 0.0,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Gravity,
        rationale: "concentrated revenue is fragile",
    },
    Seed {
        from: Role::MarketShare.node(),
        to: Role::CustomerGrowth.node(),
        coefficient: 0.3,
        min: 0.1,
        max: 0.5,
        confidence: Confidence::Low,
        source: LinkSource::Benchmark,
        law: Law::Gravity,
        rationale: "visible players attract word of mouth",
    },
    Seed {
        from: Role::Loyalty.node(),
        to: n(Law::Inertia, Property::Brand),
        coefficient: 0.5,
        min: 0.2,
        max: 0.8,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Inertia,
        rationale: "loyal customers sustain reputation",
    },
    Seed {
        from: n(Law::Inertia, Property::Brand),
        to: Role::Loyalty.node(),
        coefficient: 0.2,
        min: 0.0,
        max: 0.4,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Inertia,
        rationale: "reputation reinforces commitment",
    },
    Seed {
        from: Role::Quality.node(),
        to: n(Law::Gravity, Property::Brand),
        coefficient: 0.3,
        min: 0.1,
        max: 0.6,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Gravity,
        rationale: "quality builds brand pull",
    },
    Seed {
        from: n(Law::Gravity, Property::Brand),
        to: Role::MarketShare.node(),
        coefficient: 0.2,
        min: 0.0,
        max: 0.4,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Gravity,
        rationale: "brand pull converts to share",
    },
    Seed {
        from: n(Law::Gravity, Property::Competitor),
        to: Role::ChurnRate.node(),
        coefficient: 0.3,
        min: 0.1,
        max: 0.5,
        confidence: Confidence::Low,
        source: LinkSource::Benchmark,
        law: Law::Gravity,
        rationale: "strong competitors poach customers",
    },
    Seed {
        from: n(Law::Gravity, Property::Competitor),
        to: Role::AcquisitionFriction.node(),
        coefficient: 0.4,
        min: 0.1,
        max: 0.6,
        confidence: Confidence::Low,
        source: LinkSource::Benchmark,
        law: Law::Friction,
        rationale: "contested markets cost more per lead",
    },
    Seed {
        from: n(Law::Acceleration, Property::Market),
        to: Role::CustomerGrowth.node(),
        coefficient: 0.4,
        min: 0.1,
        max: 0.7,
        confidence: Confidence::Medium,
        source: LinkSource::Benchmark,
        law: Law::Acceleration,
        rationale: "a growing market lifts every participant",
    },
    Seed {
        from: n(Law::Friction, Property::Capacity),
        to: Role::Quality.node(),
        coefficient: -0.3,
        min: -0.6,
        max: -0.1,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Friction,
        rationale: "overfull classrooms dilute attention",
    },
    Seed {
        from: n(Law::Friction, Property::Product),
        to: Role::Loyalty.node(),
        coefficient: -0.2,
        min: -0.5,
        max: 0.0,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Friction,
        rationale: "hard-to-use offerings erode goodwill",
    },
    Seed {
        from: Role::IncomeGrowth.node(),
        to: n(Law::Flow, Property::Cash),
        coefficient: 0.5,
        min: 0.2,
        max: 0.8,
        confidence: Confidence::Medium,
        source: LinkSource::Empirical,
        law: Law::Flow,
        rationale: "growing income improves operating cash flow",
    },
    Seed {
        from: n(Law::Acceleration, Property::Expense),
        to: n(Law::Flow, Property::Cash),
        coefficient: -0.5,
        min: -0.8,
        max: -0.2,
        confidence: Confidence::Medium,
        source: LinkSource::Empirical,
        law: Law::Flow,
        rationale: "accelerating costs drain operating cash flow",
    },
    Seed {
        from: n(Law::Gravity, Property::Partner),
        to: Role::Dependency.node(),
        coefficient: 0.4,
        min: 0.1,
        max: 0.7,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Gravity,
        rationale: "revenue routed through one partner concentrates risk",
    },
    Seed {
        from: Role::Dependency.node(),
        to: n(Law::Inertia, Property::Partner),
        coefficient: 0.3,
        min: 0.0,
        max: 0.6,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Inertia,
        rationale: "dependence locks in partner relationships",
    },
    Seed {
        from: Role::CustomerGrowth.node(),
        to: n(Law::Friction, Property::Capacity),
        coefficient: 0.4,
        min: 0.1,
        max: 0.7,
        confidence: Confidence::Low,
        source: LinkSource::Estimated,
        law: Law::Friction,
        rationale: "enrolment growth strains fixed capacity",
    },
];

/// The built-in prior link table.
pub fn seed_links() -> Vec<CausalLink> {
    SEEDS
        .iter()
        .map(|s| {
            CausalLink::new(
                s.from,
                s.to,
                s.coefficient,
                Some(PriorRange {
                    min: s.min,
                    max: s.max,
                }),
                s.confidence,
                s.source,
                s.law,
                s.rationale,
            )
        })
        .collect()
}
