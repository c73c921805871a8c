//! NodeSpace - the fixed 72-dimensional state space.
//!
//! Every state variable is the cross product of a behavioral [`Law`] and a
//! business [`Property`]:
//!
//! ```text
//! id = law_index * 12 + property_index
//! ```
//!
//! The table is generated once when a [`NodeSpace`] is constructed and never
//! resized. Named business variables (cash, loyalty, ...) are bound to fixed
//! nodes through [`Role`].

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of laws.
pub const LAW_COUNT: usize = 6;
/// Number of entity properties.
pub const PROPERTY_COUNT: usize = 12;
/// Total node count.
pub const NODE_COUNT: usize = LAW_COUNT * PROPERTY_COUNT;

/// Behavioral category governing how a node's value evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Law {
    /// Bookkeeping quantities: stocks move only by inflow and outflow
    Conservation,
    /// Rates of movement between stocks
    Flow,
    /// Resistance to change (loyalty, retention)
    Inertia,
    /// Signed rates of change
    Acceleration,
    /// Diminishing returns and cost of effort
    Friction,
    /// Concentration and attraction effects
    Gravity,
}

impl Law {
    pub const ALL: [Law; LAW_COUNT] = [
        Law::Conservation,
        Law::Flow,
        Law::Inertia,
        Law::Acceleration,
        Law::Friction,
        Law::Gravity,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Law::Conservation => "conservation",
            Law::Flow => "flow",
            Law::Inertia => "inertia",
            Law::Acceleration => "acceleration",
            Law::Friction => "friction",
            Law::Gravity => "gravity",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Law::Conservation => "Balance",
            Law::Flow => "Flow Rate",
            Law::Inertia => "Retention",
            Law::Acceleration => "Growth Rate",
            Law::Friction => "Friction",
            Law::Gravity => "Concentration",
        }
    }

    /// Apply this law's value policy.
    ///
    /// Conservation values are raw (any sign); acceleration values are signed
    /// rates in [-1, 1]; every other law holds a ratio in [0, 1].
    pub fn bound(&self, value: f64) -> f64 {
        match self {
            Law::Conservation => crate::numeric::finite_or(value, 0.0),
            Law::Acceleration => crate::numeric::clamp_signed(value),
            Law::Flow | Law::Inertia | Law::Friction | Law::Gravity => {
                crate::numeric::clamp_unit(value)
            }
        }
    }

    /// Whether values of this law are ratios bounded to [0, 1].
    pub fn is_ratio(&self) -> bool {
        matches!(self, Law::Flow | Law::Inertia | Law::Friction | Law::Gravity)
    }
}

impl fmt::Display for Law {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stock, flow, or relation grouping of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Stock,
    Flow,
    Relation,
}

/// Business-entity category a node measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Property {
    Cash,
    Income,
    Expense,
    Asset,
    Customer,
    Staff,
    Product,
    Brand,
    Partner,
    Competitor,
    Market,
    Capacity,
}

impl Property {
    pub const ALL: [Property; PROPERTY_COUNT] = [
        Property::Cash,
        Property::Income,
        Property::Expense,
        Property::Asset,
        Property::Customer,
        Property::Staff,
        Property::Product,
        Property::Brand,
        Property::Partner,
        Property::Competitor,
        Property::Market,
        Property::Capacity,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Cash => "cash",
            Property::Income => "income",
            Property::Expense => "expense",
            Property::Asset => "asset",
            Property::Customer => "customer",
            Property::Staff => "staff",
            Property::Product => "product",
            Property::Brand => "brand",
            Property::Partner => "partner",
            Property::Competitor => "competitor",
            Property::Market => "market",
            Property::Capacity => "capacity",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Property::Cash => "Cash",
            Property::Income => "Income",
            Property::Expense => "Expense",
            Property::Asset => "Asset",
            Property::Customer => "Customer",
            Property::Staff => "Staff",
            Property::Product => "Product",
            Property::Brand => "Brand",
            Property::Partner => "Partner",
            Property::Competitor => "Competitor",
            Property::Market => "Market",
            Property::Capacity => "Capacity",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Property::Cash
            | Property::Asset
            | Property::Customer
            | Property::Staff
            | Property::Product
            | Property::Capacity => Category::Stock,
            Property::Income | Property::Expense => Category::Flow,
            Property::Brand | Property::Partner | Property::Competitor | Property::Market => {
                Category::Relation
            }
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a node's observed value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// Ledger and bank data
    Accounting,
    /// Customer and staff records
    Crm,
    /// Surveys and satisfaction scores
    Survey,
    /// Market research and public data
    Market,
    /// Computed from other nodes
    Derived,
}

/// Validated index into the node space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NodeId(u8);

impl NodeId {
    /// Validate a raw index.
    pub fn new(index: usize) -> Result<Self> {
        if index < NODE_COUNT {
            Ok(Self(index as u8))
        } else {
            Err(EngineError::NodeOutOfRange { index })
        }
    }

    /// Compose from a (law, property) pair. Always valid.
    pub const fn of(law: Law, property: Property) -> Self {
        Self((law as u8) * PROPERTY_COUNT as u8 + property as u8)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn law(self) -> Law {
        Law::ALL[self.index() / PROPERTY_COUNT]
    }

    pub fn property(self) -> Property {
        Property::ALL[self.index() % PROPERTY_COUNT]
    }

    /// Symbolic id, e.g. `inertia.customer`.
    pub fn symbol(self) -> String {
        format!("{}.{}", self.law().as_str(), self.property().as_str())
    }

    /// Iterate over all 72 ids in index order.
    pub fn all() -> impl Iterator<Item = NodeId> {
        (0..NODE_COUNT as u8).map(NodeId)
    }
}

impl TryFrom<u8> for NodeId {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self> {
        NodeId::new(value as usize)
    }
}

impl From<NodeId> for u8 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.law().as_str(), self.property().as_str())
    }
}

/// Named business variable bound to a fixed node.
///
/// The transition equations are written against roles; every other node
/// evolves through causal coupling only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Cash,
    Income,
    Expense,
    Customers,
    Headcount,
    Quality,
    ChurnRate,
    IncomeGrowth,
    CustomerGrowth,
    Loyalty,
    StaffRetention,
    AcquisitionFriction,
    Dependency,
    MarketShare,
}

impl Role {
    pub const ALL: [Role; 14] = [
        Role::Cash,
        Role::Income,
        Role::Expense,
        Role::Customers,
        Role::Headcount,
        Role::Quality,
        Role::ChurnRate,
        Role::IncomeGrowth,
        Role::CustomerGrowth,
        Role::Loyalty,
        Role::StaffRetention,
        Role::AcquisitionFriction,
        Role::Dependency,
        Role::MarketShare,
    ];

    pub const fn node(self) -> NodeId {
        match self {
            Role::Cash => NodeId::of(Law::Conservation, Property::Cash),
            Role::Income => NodeId::of(Law::Conservation, Property::Income),
            Role::Expense => NodeId::of(Law::Conservation, Property::Expense),
            Role::Customers => NodeId::of(Law::Conservation, Property::Customer),
            Role::Headcount => NodeId::of(Law::Conservation, Property::Staff),
            Role::Quality => NodeId::of(Law::Flow, Property::Product),
            Role::ChurnRate => NodeId::of(Law::Flow, Property::Customer),
            Role::IncomeGrowth => NodeId::of(Law::Acceleration, Property::Income),
            Role::CustomerGrowth => NodeId::of(Law::Acceleration, Property::Customer),
            Role::Loyalty => NodeId::of(Law::Inertia, Property::Customer),
            Role::StaffRetention => NodeId::of(Law::Inertia, Property::Staff),
            Role::AcquisitionFriction => NodeId::of(Law::Friction, Property::Customer),
            Role::Dependency => NodeId::of(Law::Gravity, Property::Income),
            Role::MarketShare => NodeId::of(Law::Gravity, Property::Market),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Cash => "cash",
            Role::Income => "income",
            Role::Expense => "expense",
            Role::Customers => "customers",
            Role::Headcount => "headcount",
            Role::Quality => "quality",
            Role::ChurnRate => "churn_rate",
            Role::IncomeGrowth => "income_growth",
            Role::CustomerGrowth => "customer_growth",
            Role::Loyalty => "loyalty",
            Role::StaffRetention => "staff_retention",
            Role::AcquisitionFriction => "acquisition_friction",
            Role::Dependency => "dependency",
            Role::MarketShare => "market_share",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.as_str() == name)
    }

    /// Roles holding whole counts.
    pub fn is_count(&self) -> bool {
        matches!(self, Role::Customers | Role::Headcount)
    }

    pub fn for_node(id: NodeId) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.node() == id)
    }

    fn describe(&self) -> (&'static str, &'static str, DataSource) {
        match self {
            Role::Cash => (
                "Cash Balance",
                "cash(t+1) = cash(t) + 0.9*income - expense - marketing_spend",
                DataSource::Accounting,
            ),
            Role::Income => (
                "Monthly Income",
                "income(t+1) = r*income(t) + (1-r)*customers*arpu*season*(1+market_growth)",
                DataSource::Accounting,
            ),
            Role::Expense => (
                "Monthly Expense",
                "expense(t+1) = expense(t) + hires*cost_per_staff + salary_adj - departures*cost_per_staff",
                DataSource::Accounting,
            ),
            Role::Customers => (
                "Active Customers",
                "customers(t+1) = customers(t) + new - customers(t)*churn_rate",
                DataSource::Crm,
            ),
            Role::Headcount => (
                "Headcount",
                "headcount(t+1) = headcount(t) + hires - headcount(t)*(1-staff_retention)",
                DataSource::Crm,
            ),
            Role::Quality => (
                "Service Quality",
                "q(t+1) = q(t) - q(t)*lambda + effort*lambda*1.5",
                DataSource::Survey,
            ),
            Role::ChurnRate => (
                "Churn Rate",
                "churn = (1-loyalty)*sensitivity + cascade(loyalty crossing boundary)",
                DataSource::Crm,
            ),
            Role::IncomeGrowth => (
                "Income Growth",
                "g(t+1) = r*g(t) + (1-r)*(income(t+1)-income(t))/income(t)",
                DataSource::Derived,
            ),
            Role::CustomerGrowth => (
                "Customer Growth",
                "g(t+1) = r*g(t) + (1-r)*(customers(t+1)-customers(t))/customers(t)",
                DataSource::Derived,
            ),
            Role::Loyalty => (
                "Customer Loyalty",
                "loyalty(t+1) = r*loyalty(t) + (1-r)*perceived_quality",
                DataSource::Survey,
            ),
            Role::StaffRetention => (
                "Staff Retention",
                "retention(t+1) = r*retention(t) + (1-r)*morale",
                DataSource::Crm,
            ),
            Role::AcquisitionFriction => (
                "Acquisition Cost",
                "cac = spend/new_paid (cac*1.1 when new_paid <= 0), stored as cac/(cac+reference)",
                DataSource::Derived,
            ),
            Role::Dependency => (
                "Revenue Dependency",
                "dependency(t+1) = r*dependency(t) + (1-r)*k/sqrt(customers)",
                DataSource::Derived,
            ),
            Role::MarketShare => (
                "Market Share",
                "share(t+1) = r*share(t) + (1-r)*share(t)*(1+market_growth-0.1*competition)",
                DataSource::Market,
            ),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One of the 72 fixed state variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub law: Law,
    pub property: Property,
    /// Symbolic id (`law.property`)
    pub symbol: String,
    /// Human readable name
    pub name: String,
    /// Update formula in plain text
    pub formula: String,
    pub data_source: DataSource,
    pub category: Category,
}

impl Node {
    fn generate(id: NodeId) -> Self {
        let law = id.law();
        let property = id.property();

        let (name, formula, data_source) = match Role::for_node(id) {
            Some(role) => {
                let (name, formula, source) = role.describe();
                (name.to_string(), formula.to_string(), source)
            }
            None => {
                let p = property.as_str();
                let formula = match law {
                    Law::Conservation => format!("{p}(t+1) = {p}(t) + inflow - outflow"),
                    Law::Flow => format!("{p}_flow = moved / {p}_stock"),
                    Law::Inertia => format!("{p}_retained = r*previous + (1-r)*signal"),
                    Law::Acceleration => format!("d{p}/dt = ({p}(t+1) - {p}(t)) / {p}(t)"),
                    Law::Friction => format!("{p}_friction = effort / (effort + yield)"),
                    Law::Gravity => format!("{p}_pull = mass_share * proximity"),
                };
                let source = match law {
                    Law::Conservation => match property {
                        Property::Customer | Property::Staff => DataSource::Crm,
                        _ => DataSource::Accounting,
                    },
                    Law::Inertia => DataSource::Survey,
                    Law::Gravity => DataSource::Market,
                    Law::Flow | Law::Acceleration | Law::Friction => DataSource::Derived,
                };
                (
                    format!("{} {}", property.label(), law.label()),
                    formula,
                    source,
                )
            }
        };

        Self {
            id,
            law,
            property,
            symbol: id.symbol(),
            name,
            formula,
            data_source,
            category: property.category(),
        }
    }
}

/// The fixed table of all nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpace {
    nodes: Vec<Node>,
}

impl Default for NodeSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSpace {
    /// Generate the 6x12 cross product.
    pub fn new() -> Self {
        Self {
            nodes: NodeId::all().map(Node::generate).collect(),
        }
    }

    /// Number of nodes (always 72).
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by numeric index.
    pub fn node_at(&self, index: usize) -> Result<&Node> {
        self.nodes
            .get(index)
            .ok_or(EngineError::NodeOutOfRange { index })
    }

    /// Node by symbolic id (`law.property`) or role name (`loyalty`).
    pub fn node_by_id(&self, symbol: &str) -> Result<&Node> {
        let id = self.resolve(symbol)?;
        Ok(&self.nodes[id.index()])
    }

    /// Resolve a symbolic id or role name to a [`NodeId`].
    pub fn resolve(&self, symbol: &str) -> Result<NodeId> {
        if let Some(role) = Role::from_name(symbol) {
            return Ok(role.node());
        }
        self.nodes
            .iter()
            .find(|n| n.symbol == symbol)
            .map(|n| n.id)
            .ok_or_else(|| EngineError::UnknownNode(symbol.to_string()))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Node backing a business role.
    pub fn role(&self, role: Role) -> &Node {
        self.node(role.node())
    }

    pub fn nodes_by_law(&self, law: Law) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.law == law).collect()
    }

    pub fn nodes_by_property(&self, property: Property) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.property == property).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }
}
