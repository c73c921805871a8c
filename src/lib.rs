//! # Business Physics
//!
//! Deterministic causal transition and online recalibration engine for
//! small-business state.
//!
//! ## Theory
//!
//! A business is a 72-node state vector: six laws (Conservation, Flow,
//! Inertia, Acceleration, Friction, Gravity) crossed with twelve properties
//! (Cash, Income, Customer, Competitor, ...). Each period the state advances
//! through nonlinear, law-specific equations, and the causal coefficients are
//! corrected from what actually happened:
//!
//! ```text
//! x(t+1)  = F(x(t), action, external; A)
//! A[j][i] ← A[j][i] - lr · (β·m + (1-β)·(-e[i]·x[j]) + λ·A[j][i])
//! ```
//!
//! ## Features
//!
//! - `std` (default): Standard library support
//! - `wasm`: WebAssembly bindings via wasm-bindgen
//! - `streaming`: Async snapshot pipeline with per-entity learning
//!
//! ## Example
//!
//! ```rust
//! use business_physics::{ActionParams, BusinessEngine, EngineConfig, ExternalParams};
//!
//! let engine = BusinessEngine::new(EngineConfig::for_entity("tutoring_academy"));
//!
//! let state = engine
//!     .state_from(&[
//!         ("cash", 23_000_000.0),
//!         ("income", 52_000_000.0),
//!         ("expense", 41_000_000.0),
//!         ("customers", 127.0),
//!         ("loyalty", 0.78),
//!     ])
//!     .unwrap();
//!
//! let outcome = engine.next_state(&state, &ActionParams::default(), &ExternalParams::default());
//! println!("cash next month: {:?}", outcome.state.get(business_physics::Role::Cash.node()));
//! ```
//!
//! Author: Ryan J Cardwell (Archer Phoenix)

pub mod engine;
pub mod error;
pub mod graph;
pub mod learner;
pub mod node;
pub mod numeric;
pub mod pressure;
pub mod prior;
pub mod state;
pub mod transition;

#[cfg(feature = "streaming")]
pub mod streaming;

#[cfg(feature = "wasm")]
pub mod wasm;

// Re-exports
pub use engine::*;
pub use error::*;
pub use graph::*;
pub use learner::*;
pub use node::*;
pub use pressure::*;
pub use prior::*;
pub use state::*;
pub use transition::*;

#[cfg(feature = "streaming")]
pub use streaming::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine (call once, especially important for WASM)
#[cfg(feature = "wasm")]
pub fn init() {
    console_error_panic_hook::set_once();
}
