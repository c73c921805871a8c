//! Streaming interface for continuously arriving business snapshots.
//!
//! ## Architecture
//!
//! ```text
//! [Snapshot Source] → [Stream Processor] → [Learning Sink]
//!                            ↓
//!                  [per-entity BusinessEngine] → [Alert Sink]
//! ```
//!
//! Each entity's engine sits behind its own `RwLock`. Learning takes the write
//! lock, so learning passes for one entity never overlap, while predictions
//! for that entity share the read lock.

use crate::engine::{BusinessEngine, EngineConfig};
use crate::error::{EngineError, Result};
use crate::learner::LearningStep;
use crate::node::NodeId;
use crate::pressure::{PressureReport, PressureState};
use crate::state::{ActionParams, ExternalParams, Snapshot, StateVector};
use crate::transition::TransitionOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Incoming snapshot for one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    /// Unique per event; repeated IDs are dropped
    pub event_id: String,

    pub entity_id: String,

    pub snapshot: Snapshot,

    /// Known deadlines per node, in days
    #[serde(default)]
    pub deadlines: BTreeMap<NodeId, i64>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Learning step tagged with its entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub entity_id: String,
    pub step: LearningStep,
}

/// Pressure report worth notifying about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureAlert {
    pub alert_id: String,
    pub entity_id: String,
    pub period: i64,
    /// Worst state in the report
    pub state: PressureState,
    pub report: PressureReport,
}

/// Stream processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Engine settings for entities seen for the first time
    pub engine: EngineConfig,

    /// Lowest pressure state that produces an alert
    pub min_alert_state: PressureState,

    /// Skip events whose ID was already seen
    pub deduplicate: bool,

    /// Event IDs remembered for deduplication
    pub dedupe_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            min_alert_state: PressureState::Pressuring,
            deduplicate: true,
            dedupe_capacity: 10_000,
        }
    }
}

/// Where snapshot events come from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Receive next batch of events; empty once the source is drained
    async fn receive(&mut self) -> Result<Vec<SnapshotEvent>>;

    /// Mark events as handled
    async fn acknowledge(&mut self, event_ids: &[String]) -> Result<()>;

    /// False once the source can produce nothing more
    async fn health_check(&self) -> bool;
}

/// Trait for learning-step persistence
#[async_trait]
pub trait LearningSink: Send + Sync {
    async fn record(&mut self, record: LearningRecord) -> Result<()>;

    async fn record_batch(&mut self, records: Vec<LearningRecord>) -> Result<()> {
        for record in records {
            self.record(record).await?;
        }
        Ok(())
    }
}

/// Destination for pressure alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert
    async fn send(&mut self, alert: PressureAlert) -> Result<()>;

    /// Send several alerts in order
    async fn send_batch(&mut self, alerts: Vec<PressureAlert>) -> Result<()> {
        for alert in alerts {
            self.send(alert).await?;
        }
        Ok(())
    }
}

/// What processing one or more events produced
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub learning: Vec<LearningRecord>,
    pub alerts: Vec<PressureAlert>,
}

impl ProcessOutcome {
    fn extend(&mut self, other: ProcessOutcome) {
        self.learning.extend(other.learning);
        self.alerts.extend(other.alerts);
    }
}

/// Per-entity engines fed by a snapshot stream
pub struct StreamProcessor {
    engines: HashMap<String, Arc<RwLock<BusinessEngine>>>,
    last_snapshot: HashMap<String, Snapshot>,
    config: StreamConfig,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl StreamProcessor {
    /// Processor with no registered entities
    pub fn new(config: StreamConfig) -> Self {
        Self {
            engines: HashMap::new(),
            last_snapshot: HashMap::new(),
            config,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Register an existing engine (e.g. restored from storage).
    pub fn insert_engine(&mut self, entity_id: impl Into<String>, engine: BusinessEngine) {
        self.engines
            .insert(entity_id.into(), Arc::new(RwLock::new(engine)));
    }

    /// Shared handle to an entity's engine.
    pub fn engine(&self, entity_id: &str) -> Option<Arc<RwLock<BusinessEngine>>> {
        self.engines.get(entity_id).map(Arc::clone)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(|k| k.as_str())
    }

    /// Predict under the read lock; runs alongside other predictions.
    pub async fn predict(
        &self,
        entity_id: &str,
        state: &StateVector,
        action: &ActionParams,
        external: &ExternalParams,
    ) -> Result<TransitionOutcome> {
        let engine = self
            .engine(entity_id)
            .ok_or_else(|| EngineError::ConfigError(format!("unknown entity: {}", entity_id)))?;
        let engine = engine.read().await;
        Ok(engine.next_state(state, action, external))
    }

    /// Predict for several entities concurrently, in request order.
    pub async fn predict_many(
        &self,
        requests: &[(String, StateVector, ActionParams, ExternalParams)],
    ) -> Result<Vec<TransitionOutcome>> {
        futures::future::try_join_all(
            requests
                .iter()
                .map(|(entity_id, state, action, external)| {
                    self.predict(entity_id, state, action, external)
                }),
        )
        .await
    }

    /// Learn from and classify one snapshot event
    pub async fn process_event(&mut self, event: SnapshotEvent) -> Result<ProcessOutcome> {
        if self.config.deduplicate && !self.remember(&event.event_id) {
            return Ok(ProcessOutcome::default());
        }

        let previous = self.last_snapshot.get(&event.entity_id).cloned();
        if let Some(prev) = &previous {
            if event.snapshot.period <= prev.period {
                tracing::warn!(
                    entity = %event.entity_id,
                    period = event.snapshot.period,
                    last = prev.period,
                    "stale snapshot skipped"
                );
                return Ok(ProcessOutcome::default());
            }
        }

        let template = &self.config.engine;
        let engine = Arc::clone(
            self.engines
                .entry(event.entity_id.clone())
                .or_insert_with(|| Arc::new(RwLock::new(BusinessEngine::new(template.clone())))),
        );

        let mut outcome = ProcessOutcome::default();
        {
            let mut engine = engine.write().await;
            match &previous {
                Some(prev) => {
                    let step = engine.learn_step(prev, &event.snapshot)?;
                    outcome.learning.push(LearningRecord {
                        entity_id: event.entity_id.clone(),
                        step,
                    });
                }
                None => engine.observe(&event.snapshot),
            }
        }

        let report = {
            let engine = engine.read().await;
            let trends = previous
                .as_ref()
                .map(|prev| trends_between(&prev.state, &event.snapshot.state))
                .unwrap_or_default();
            engine.classify_pressure(&event.snapshot.state, &trends, &event.deadlines)
        };

        if let Some(worst) = report.items.iter().map(|i| i.state).max() {
            if worst >= self.config.min_alert_state {
                outcome.alerts.push(PressureAlert {
                    alert_id: format!("{}-{}", event.entity_id, event.snapshot.period),
                    entity_id: event.entity_id.clone(),
                    period: event.snapshot.period,
                    state: worst,
                    report,
                });
            }
        }

        self.last_snapshot
            .insert(event.entity_id, event.snapshot);
        Ok(outcome)
    }

    /// Process batch of events in arrival order
    pub async fn process_batch(&mut self, events: Vec<SnapshotEvent>) -> Result<ProcessOutcome> {
        let mut outcome = ProcessOutcome::default();
        for event in events {
            outcome.extend(self.process_event(event).await?);
        }
        Ok(outcome)
    }

    /// Serialized engine state for one entity
    pub async fn engine_state(&self, entity_id: &str) -> Result<String> {
        let engine = self
            .engine(entity_id)
            .ok_or_else(|| EngineError::ConfigError(format!("unknown entity: {}", entity_id)))?;
        let engine = engine.read().await;
        engine.to_json()
    }

    /// Returns false if the event ID was already seen.
    fn remember(&mut self, event_id: &str) -> bool {
        if !self.seen.insert(event_id.to_string()) {
            return false;
        }
        self.seen_order.push_back(event_id.to_string());
        while self.seen_order.len() > self.config.dedupe_capacity {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Per-node change between consecutive snapshots.
fn trends_between(previous: &StateVector, current: &StateVector) -> BTreeMap<NodeId, f64> {
    current
        .iter()
        .filter_map(|(id, value)| previous.get(id).map(|before| (id, value - before)))
        .collect()
}

/// Snapshot source over a tokio channel, drained in batches
pub struct ChannelSnapshotSource {
    receiver: mpsc::Receiver<SnapshotEvent>,
    batch_size: usize,
}

impl ChannelSnapshotSource {
    pub fn new(receiver: mpsc::Receiver<SnapshotEvent>, batch_size: usize) -> Self {
        Self {
            receiver,
            batch_size,
        }
    }

    pub fn create_pair(buffer_size: usize, batch_size: usize) -> (mpsc::Sender<SnapshotEvent>, Self) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (sender, Self::new(receiver, batch_size))
    }
}

#[async_trait]
impl SnapshotSource for ChannelSnapshotSource {
    async fn receive(&mut self) -> Result<Vec<SnapshotEvent>> {
        let mut events = Vec::with_capacity(self.batch_size);

        for _ in 0..self.batch_size {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        // Nothing buffered: wait for one, or for the senders to go away
        if events.is_empty() {
            if let Some(event) = self.receiver.recv().await {
                events.push(event);
            }
        }

        Ok(events)
    }

    async fn acknowledge(&mut self, _event_ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        !self.receiver.is_closed()
    }
}

/// Learning sink over a tokio channel
pub struct ChannelLearningSink {
    sender: mpsc::Sender<LearningRecord>,
}

impl ChannelLearningSink {
    pub fn create_pair(buffer_size: usize) -> (Self, mpsc::Receiver<LearningRecord>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl LearningSink for ChannelLearningSink {
    async fn record(&mut self, record: LearningRecord) -> Result<()> {
        self.sender
            .send(record)
            .await
            .map_err(|e| EngineError::ConfigError(format!("Failed to send learning record: {}", e)))
    }
}

/// Alert sink over a tokio channel
pub struct ChannelAlertSink {
    sender: mpsc::Sender<PressureAlert>,
}

impl ChannelAlertSink {
    pub fn new(sender: mpsc::Sender<PressureAlert>) -> Self {
        Self { sender }
    }

    pub fn create_pair(buffer_size: usize) -> (Self, mpsc::Receiver<PressureAlert>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn send(&mut self, alert: PressureAlert) -> Result<()> {
        self.sender
            .send(alert)
            .await
            .map_err(|e| EngineError::ConfigError(format!("Failed to send alert: {}", e)))
    }
}

/// Run the streaming pipeline until the source is drained.
pub async fn run_pipeline<S, L, A>(
    mut source: S,
    mut learning: L,
    mut alerts: A,
    processor: &mut StreamProcessor,
) -> Result<()>
where
    S: SnapshotSource,
    L: LearningSink,
    A: AlertSink,
{
    loop {
        let events = source.receive().await?;

        if events.is_empty() {
            if source.health_check().await {
                continue;
            }
            return Ok(());
        }

        let event_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();

        let outcome = processor.process_batch(events).await?;

        if !outcome.learning.is_empty() {
            learning.record_batch(outcome.learning).await?;
        }
        if !outcome.alerts.is_empty() {
            alerts.send_batch(outcome.alerts).await?;
        }

        source.acknowledge(&event_ids).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Role;

    fn event(id: &str, entity: &str, period: i64, cash: f64) -> SnapshotEvent {
        SnapshotEvent {
            event_id: id.to_string(),
            entity_id: entity.to_string(),
            snapshot: Snapshot::new(
                period,
                StateVector::new()
                    .with_role(Role::Cash, cash)
                    .with_role(Role::Income, 52_000_000.0)
                    .with_role(Role::Loyalty, 0.8),
            ),
            deadlines: BTreeMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_stream_processor_learns_on_second_snapshot() {
        let mut processor = StreamProcessor::new(StreamConfig::default());

        let first = processor
            .process_event(event("e1", "academy", 202401, 23_000_000.0))
            .await
            .unwrap();
        assert!(first.learning.is_empty());

        let second = processor
            .process_event(event("e2", "academy", 202402, 22_000_000.0))
            .await
            .unwrap();
        assert_eq!(second.learning.len(), 1);
        assert_eq!(second.learning[0].step.period_to, 202402);

        let engine = processor.engine("academy").unwrap();
        assert_eq!(engine.read().await.learner().steps_taken(), 1);
    }

    #[tokio::test]
    async fn test_low_cash_alerts() {
        let mut processor = StreamProcessor::new(StreamConfig::default());
        let outcome = processor
            .process_event(event("e1", "academy", 202401, 1_000_000.0))
            .await
            .unwrap();

        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.alerts[0].state, PressureState::Irreversible);
        assert_eq!(outcome.alerts[0].alert_id, "academy-202401");
    }

    #[tokio::test]
    async fn test_dedupe_and_stale_periods() {
        let mut processor = StreamProcessor::new(StreamConfig::default());
        processor
            .process_event(event("e1", "academy", 202402, 23_000_000.0))
            .await
            .unwrap();

        let dup = processor
            .process_event(event("e1", "academy", 202403, 23_000_000.0))
            .await
            .unwrap();
        assert!(dup.learning.is_empty());

        let stale = processor
            .process_event(event("e2", "academy", 202401, 23_000_000.0))
            .await
            .unwrap();
        assert!(stale.learning.is_empty());

        let engine = processor.engine("academy").unwrap();
        assert_eq!(engine.read().await.learner().steps_taken(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_predictions() {
        let mut processor = StreamProcessor::new(StreamConfig::default());
        processor.insert_engine("a", BusinessEngine::new(EngineConfig::default()));
        let state = StateVector::new().with_role(Role::Quality, 0.7);

        let (x, y) = tokio::join!(
            processor.predict("a", &state, &ActionParams::default(), &ExternalParams::default()),
            processor.predict("a", &state, &ActionParams::default(), &ExternalParams::default()),
        );
        assert_eq!(x.unwrap(), y.unwrap());
        assert!(processor
            .predict("missing", &state, &ActionParams::default(), &ExternalParams::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_predict_many_keeps_order() {
        let mut processor = StreamProcessor::new(StreamConfig::default());
        processor.insert_engine("a", BusinessEngine::new(EngineConfig::default()));
        processor.insert_engine(
            "b",
            BusinessEngine::new(EngineConfig::for_entity("tutoring_academy")),
        );
        let state = StateVector::new().with_role(Role::Loyalty, 0.78);
        let request = |id: &str| {
            (
                id.to_string(),
                state.clone(),
                ActionParams::default(),
                ExternalParams::default(),
            )
        };

        let outcomes = processor
            .predict_many(&[request("a"), request("b")])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        let single = processor
            .predict("b", &state, &ActionParams::default(), &ExternalParams::default())
            .await
            .unwrap();
        assert_eq!(outcomes[1], single);

        assert!(processor
            .predict_many(&[request("a"), request("missing")])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pipeline_with_channels() {
        let (sender, source) = ChannelSnapshotSource::create_pair(10, 5);
        let (learning_sink, mut learning_rx) = ChannelLearningSink::create_pair(10);
        let (alert_sink, mut alert_rx) = ChannelAlertSink::create_pair(10);
        let mut processor = StreamProcessor::new(StreamConfig::default());

        for (i, cash) in [23_000_000.0, 12_000_000.0, 2_000_000.0].iter().enumerate() {
            sender
                .send(event(&format!("e{i}"), "academy", 202401 + i as i64, *cash))
                .await
                .unwrap();
        }
        drop(sender);

        run_pipeline(source, learning_sink, alert_sink, &mut processor)
            .await
            .unwrap();

        let mut steps = 0;
        while learning_rx.try_recv().is_ok() {
            steps += 1;
        }
        assert_eq!(steps, 2);

        // falling cash is projected through the warning bound a period early
        let trending = alert_rx.try_recv().unwrap();
        assert_eq!(trending.period, 202402);
        assert_eq!(trending.state, PressureState::Pressuring);

        let critical = alert_rx.try_recv().unwrap();
        assert_eq!(critical.period, 202403);
        assert_eq!(critical.state, PressureState::Irreversible);
        assert!(alert_rx.try_recv().is_err());
    }
}
