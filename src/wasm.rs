//! WebAssembly bindings for the business physics engine.
//!
//! Every method takes and returns JSON strings so dashboards can pass plain
//! objects through `JSON.stringify` / `JSON.parse`.
//!
//! ## Usage (JavaScript/TypeScript)
//!
//! ```javascript
//! import init, { WasmBusinessEngine } from 'business-physics';
//!
//! await init();
//!
//! const engine = WasmBusinessEngine.forEntity('tutoring_academy', null);
//! const state = engine.stateFrom(JSON.stringify({ cash: 23000000, loyalty: 0.78 }));
//!
//! const next = JSON.parse(engine.nextState(state, '{"retention_effort":0.2}', '{}'));
//! console.log(next.cascades.length);
//! ```

use crate::engine::{BusinessEngine, EngineConfig};
use crate::node::NodeId;
use crate::pressure::PressureInput;
use crate::prior::ForecastPoint;
use crate::state::{ActionParams, ExternalParams, Snapshot, StateVector};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use wasm_bindgen::prelude::*;

/// Initialize the WASM module (call once at startup)
#[wasm_bindgen(start)]
pub fn wasm_init() {
    console_error_panic_hook::set_once();
}

fn parse<T: DeserializeOwned>(json: &str, what: &str) -> Result<T, JsValue> {
    serde_json::from_str(json).map_err(|e| JsValue::from_str(&format!("Invalid {}: {}", what, e)))
}

fn parse_or_default<T: DeserializeOwned + Default>(json: &str, what: &str) -> Result<T, JsValue> {
    if json.trim().is_empty() {
        Ok(T::default())
    } else {
        parse(json, what)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, JsValue> {
    serde_json::to_string(value)
        .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

/// WASM-compatible per-entity engine
#[wasm_bindgen]
pub struct WasmBusinessEngine {
    engine: BusinessEngine,
}

#[wasm_bindgen]
impl WasmBusinessEngine {
    /// Engine with universal priors only
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        Self {
            engine: BusinessEngine::new(EngineConfig::default()),
        }
    }

    /// Engine for an industry and optional segment
    #[wasm_bindgen(js_name = "forEntity")]
    pub fn for_entity(entity_type: &str, segment: Option<String>) -> Self {
        let mut config = EngineConfig::for_entity(entity_type);
        config.segment = segment;
        Self {
            engine: BusinessEngine::new(config),
        }
    }

    /// Create with custom configuration (JSON)
    #[wasm_bindgen(js_name = "withConfig")]
    pub fn with_config(config_json: &str) -> Result<WasmBusinessEngine, JsValue> {
        let config: EngineConfig = parse(config_json, "config")?;
        Ok(Self {
            engine: BusinessEngine::new(config),
        })
    }

    /// Convert `{ "cash": 1, "inertia.customer": 0.7 }` into a state vector (JSON)
    #[wasm_bindgen(js_name = "stateFrom")]
    pub fn state_from(&self, named_json: &str) -> Result<String, JsValue> {
        let named: HashMap<String, f64> = parse(named_json, "state")?;
        let pairs: Vec<(&str, f64)> = named.iter().map(|(k, &v)| (k.as_str(), v)).collect();
        let state = self.engine.state_from(&pairs)?;
        to_json(&state)
    }

    /// Predict the next period; returns a transition outcome (JSON)
    #[wasm_bindgen(js_name = "nextState")]
    pub fn next_state(
        &self,
        state_json: &str,
        action_json: &str,
        external_json: &str,
    ) -> Result<String, JsValue> {
        let state: StateVector = parse(state_json, "state")?;
        let action: ActionParams = parse_or_default(action_json, "action")?;
        let external: ExternalParams = parse_or_default(external_json, "external")?;
        to_json(&self.engine.next_state(&state, &action, &external))
    }

    /// Learn from an ordered snapshot series; returns a learning report (JSON)
    #[wasm_bindgen(js_name = "learnSeries")]
    pub fn learn_series(&mut self, series_json: &str) -> Result<String, JsValue> {
        let series: Vec<Snapshot> = parse(series_json, "series")?;
        let report = self.engine.learn_series(&series)?;
        to_json(&report)
    }

    /// Classify pressure inputs; returns a pressure report (JSON)
    #[wasm_bindgen(js_name = "classifyPressure")]
    pub fn classify_pressure(&self, inputs_json: &str) -> Result<String, JsValue> {
        let inputs: Vec<PressureInput> = parse(inputs_json, "pressure inputs")?;
        to_json(&self.engine.pressure_report(&inputs))
    }

    /// Classify every profiled node of a state, with optional deadlines
    /// keyed by node index (JSON)
    #[wasm_bindgen(js_name = "classifyState")]
    pub fn classify_state(&self, state_json: &str, deadlines_json: &str) -> Result<String, JsValue> {
        let state: StateVector = parse(state_json, "state")?;
        let deadlines: BTreeMap<NodeId, i64> = parse_or_default(deadlines_json, "deadlines")?;
        to_json(
            &self
                .engine
                .classify_pressure(&state, &BTreeMap::new(), &deadlines),
        )
    }

    /// Evaluate a threshold; history and predictions may be empty strings
    #[wasm_bindgen(js_name = "evaluateThreshold")]
    pub fn evaluate_threshold(
        &self,
        key: &str,
        value: f64,
        history_json: &str,
        predictions_json: &str,
    ) -> Result<String, JsValue> {
        let history: Vec<f64> = parse_or_default(history_json, "history")?;
        let predictions: Vec<ForecastPoint> = parse_or_default(predictions_json, "predictions")?;
        let evaluation = self
            .engine
            .evaluate_threshold(key, value, &history, &predictions, None)?;
        to_json(&evaluation)
    }

    /// Causal links with their current coefficients (JSON)
    #[wasm_bindgen(js_name = "getGraph")]
    pub fn get_graph(&self) -> Result<String, JsValue> {
        Ok(self.engine.graph().to_json()?)
    }

    /// Node table (JSON)
    #[wasm_bindgen(js_name = "getNodes")]
    pub fn get_nodes(&self) -> Result<String, JsValue> {
        let nodes: Vec<_> = self.engine.space().iter().collect();
        to_json(&nodes)
    }

    /// Export engine state as JSON
    #[wasm_bindgen(js_name = "exportState")]
    pub fn export_state(&self) -> Result<String, JsValue> {
        Ok(self.engine.to_json()?)
    }

    /// Import engine state from JSON
    #[wasm_bindgen(js_name = "importState")]
    pub fn import_state(json: &str) -> Result<WasmBusinessEngine, JsValue> {
        Ok(Self {
            engine: BusinessEngine::from_json(json)?,
        })
    }

    /// Get engine version
    #[wasm_bindgen(js_name = "version")]
    pub fn version() -> String {
        crate::VERSION.to_string()
    }
}

impl Default for WasmBusinessEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Standalone safe division (no engine state needed)
#[wasm_bindgen(js_name = "safeDiv")]
pub fn safe_div(a: f64, b: f64, fallback: f64) -> f64 {
    crate::numeric::safe_div(a, b, fallback)
}
