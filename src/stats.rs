//! Statistics manager
//!
//! Collects raw per-part metrics off the event surface, correlates DCP
//! receipt times with XMEM acknowledgment times into a replication lag
//! histogram, derives rates over the publish interval, and publishes a
//! point-in-time snapshot to an observable map an external reporter reads.
//!
//! All registries are owned by the statistics task; parts only ever touch
//! the event channel.

use crate::pipeline::part::{ComponentEvent, EventKind, EventListener, EventPublisher};
use crate::pipeline::PipelineConfig;
use crate::service::McConnectionFactory;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Documents acknowledged by the target
pub const DOCS_WRITTEN_METRIC: &str = "docs_written";
/// Bytes replicated to the target
pub const DATA_REPLICATED_METRIC: &str = "data_replicated";
/// Documents dropped by the filter
pub const DOCS_FILTERED_METRIC: &str = "docs_filtered";
/// Documents dropped because they could not be filtered
pub const DOCS_FAILED_FILTER_METRIC: &str = "docs_failed_filter";
/// Byte depth of a target queue (histogram)
pub const SIZE_REP_QUEUE_METRIC: &str = "size_rep_queue";
/// Document depth of a target queue (histogram)
pub const DOCS_REP_QUEUE_METRIC: &str = "docs_rep_queue";
/// Mutations on the source not yet replicated
pub const CHANGES_LEFT_METRIC: &str = "changes_left";
/// Documents per second over the last interval
pub const RATE_REPLICATED_METRIC: &str = "rate_replicated";
/// Bytes per second over the last interval
pub const BANDWIDTH_USAGE_METRIC: &str = "bandwidth_usage";
/// Replication lag histogram mean, in milliseconds
pub const DOCS_LATENCY_METRIC: &str = "wtavg_docs_latency";
/// Registry key of the pipeline-wide aggregate
pub const OVERVIEW_METRICS_KEY: &str = "Overview";

/// Stats group queried for per-vBucket high seqnos
pub const VBUCKET_SEQNO_STAT_NAME: &str = "vbucket-seqno";

/// Agent name for the stats connections
const STATS_USER_AGENT: &str = "replistream/stats";

fn high_seqno_stat_key(vbno: u16) -> String {
    format!("vb_{}:high_seqno", vbno)
}

/// Bounded uniform reservoir sample
#[derive(Debug, Clone)]
pub struct UniformSample {
    size: usize,
    count: u64,
    values: Vec<i64>,
}

impl UniformSample {
    /// Sample bounded at `size` values
    pub fn new(size: usize) -> Self {
        UniformSample {
            size: size.max(1),
            count: 0,
            values: Vec::new(),
        }
    }

    /// Offer a value to the reservoir
    pub fn update(&mut self, value: i64) {
        self.count += 1;
        if self.values.len() < self.size {
            self.values.push(value);
        } else {
            let index = (rand::random::<u64>() % self.count) as usize;
            if index < self.size {
                self.values[index] = value;
            }
        }
    }

    /// Values offered so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of the sampled values
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<i64>() as f64 / self.values.len() as f64
    }

    /// Minimum sampled value
    pub fn min(&self) -> i64 {
        self.values.iter().copied().min().unwrap_or(0)
    }

    /// Maximum sampled value
    pub fn max(&self) -> i64 {
        self.values.iter().copied().max().unwrap_or(0)
    }

    /// Reset the sample
    pub fn clear(&mut self) {
        self.count = 0;
        self.values.clear();
    }
}

/// One metric in a registry
#[derive(Debug, Clone)]
pub enum Metric {
    /// Monotonically non-decreasing counter
    Counter(u64),
    /// Sampled distribution
    Histogram(UniformSample),
}

/// Metrics of one component
#[derive(Debug, Clone, Default)]
pub struct Registry {
    metrics: HashMap<&'static str, Metric>,
}

impl Registry {
    /// Register a counter at zero
    pub fn register_counter(&mut self, name: &'static str) {
        self.metrics.insert(name, Metric::Counter(0));
    }

    /// Register a histogram with a bounded sample
    pub fn register_histogram(&mut self, name: &'static str, sample_size: usize) {
        self.metrics
            .insert(name, Metric::Histogram(UniformSample::new(sample_size)));
    }

    /// Increment a counter
    pub fn inc(&mut self, name: &'static str, delta: u64) {
        if let Some(Metric::Counter(value)) = self.metrics.get_mut(name) {
            *value += delta;
        }
    }

    /// Offer a histogram value
    pub fn observe(&mut self, name: &'static str, value: i64) {
        if let Some(Metric::Histogram(sample)) = self.metrics.get_mut(name) {
            sample.update(value);
        }
    }

    /// Counter value, zero when absent
    pub fn counter(&self, name: &str) -> u64 {
        match self.metrics.get(name) {
            Some(Metric::Counter(value)) => *value,
            _ => 0,
        }
    }

    fn to_value(&self, detailed: bool) -> Value {
        let mut map = serde_json::Map::new();
        for (name, metric) in &self.metrics {
            let rendered = match metric {
                Metric::Counter(value) => Value::from(*value),
                Metric::Histogram(sample) => {
                    if detailed {
                        json!({
                            "mean": sample.mean(),
                            "min": sample.min(),
                            "max": sample.max(),
                            "count": sample.count(),
                        })
                    } else {
                        Value::from(sample.mean())
                    }
                }
            };
            map.insert((*name).to_string(), rendered);
        }
        Value::Object(map)
    }
}

/// Forwards component events into the statistics task
struct Collector {
    tx: mpsc::UnboundedSender<ComponentEvent>,
}

impl EventListener for Collector {
    fn on_event(&self, event: &ComponentEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Replication context the derived stats need
#[derive(Debug, Clone, Default)]
pub struct StatsContext {
    /// source server → vBuckets it owns
    pub active_vbs: HashMap<String, Vec<u16>>,
    /// vBucket → seqno replication started from
    pub start_seqnos: HashMap<u16, u64>,
    /// Source bucket name
    pub bucket: String,
}

/// Statistics manager for one pipeline
pub struct StatisticsManager {
    topic: String,
    publisher: Arc<EventPublisher>,
    event_tx: mpsc::UnboundedSender<ComponentEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ComponentEvent>>>,
    core: Mutex<Option<StatsCore>>,
    context: Mutex<StatsContext>,
    published: Arc<RwLock<HashMap<String, Value>>>,
    factory: Arc<dyn McConnectionFactory>,
    finish_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct StatsCore {
    topic: String,
    registries: HashMap<String, Registry>,
    dcp_parts: HashSet<String>,
    xmem_parts: HashSet<String>,
    router_parts: HashSet<String>,
    start_times: HashMap<u64, Instant>,
    end_times: HashMap<u64, Instant>,
    prev_overview: HashMap<&'static str, u64>,
    sample_size: usize,
    publisher: Arc<EventPublisher>,
}

impl StatisticsManager {
    /// Manager for one pipeline topic
    pub fn new(topic: impl Into<String>, factory: Arc<dyn McConnectionFactory>) -> Self {
        let topic = topic.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        StatisticsManager {
            publisher: Arc::new(EventPublisher::new(format!("stats/{}", topic))),
            topic,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            core: Mutex::new(None),
            context: Mutex::new(StatsContext::default()),
            published: Arc::new(RwLock::new(HashMap::new())),
            factory,
            finish_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Event surface (invariant violations raise `ErrorRaised` here)
    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Mount collectors onto the pipeline parts and build their registries
    pub fn attach(
        &self,
        sources: &[Arc<crate::parts::DcpNozzle>],
        routers: &[Arc<crate::parts::Router>],
        targets: &[Arc<crate::parts::XmemNozzle>],
        sample_size: usize,
    ) {
        use crate::pipeline::part::{Connector, Part};

        let mut core = StatsCore {
            topic: self.topic.clone(),
            registries: HashMap::new(),
            dcp_parts: HashSet::new(),
            xmem_parts: HashSet::new(),
            router_parts: HashSet::new(),
            start_times: HashMap::new(),
            end_times: HashMap::new(),
            prev_overview: zero_overview(),
            sample_size,
            publisher: Arc::clone(&self.publisher),
        };

        let collector: Arc<dyn EventListener> = Arc::new(Collector {
            tx: self.event_tx.clone(),
        });

        for source in sources {
            core.dcp_parts.insert(source.id().to_string());
            core.registries
                .insert(source.id().to_string(), Registry::default());
            source
                .publisher()
                .register_listener(EventKind::DataReceived, Arc::clone(&collector));
        }

        for router in routers {
            core.router_parts.insert(router.id().to_string());
            let mut registry = Registry::default();
            registry.register_counter(DOCS_FILTERED_METRIC);
            registry.register_counter(DOCS_FAILED_FILTER_METRIC);
            core.registries.insert(router.id().to_string(), registry);
            router
                .publisher()
                .register_listener(EventKind::DataFiltered, Arc::clone(&collector));
        }

        for target in targets {
            core.xmem_parts.insert(target.id().to_string());
            let mut registry = Registry::default();
            registry.register_counter(DOCS_WRITTEN_METRIC);
            registry.register_counter(DATA_REPLICATED_METRIC);
            registry.register_histogram(DOCS_REP_QUEUE_METRIC, sample_size);
            registry.register_histogram(SIZE_REP_QUEUE_METRIC, sample_size);
            core.registries.insert(target.id().to_string(), registry);
            target
                .publisher()
                .register_listener(EventKind::DataReceived, Arc::clone(&collector));
            target
                .publisher()
                .register_listener(EventKind::DataSent, Arc::clone(&collector));
        }

        *self.core.lock() = Some(core);
    }

    /// Install the replication context (topology and start seqnos)
    pub fn set_context(&self, context: StatsContext) {
        *self.context.lock() = context;
    }

    /// Published snapshot of all registries
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.published.read().clone()
    }

    /// Published pipeline-wide aggregate
    pub fn overview(&self) -> Option<Value> {
        self.published.read().get(OVERVIEW_METRICS_KEY).cloned()
    }

    /// Start the publish ticker
    pub fn start(&self, config: Arc<PipelineConfig>) -> Result<()> {
        let core = self
            .core
            .lock()
            .take()
            .ok_or_else(|| Error::pipeline(format!("stats for {} not attached", self.topic)))?;
        let event_rx = self
            .event_rx
            .lock()
            .take()
            .ok_or_else(|| Error::pipeline(format!("stats for {} already started", self.topic)))?;
        let (finish_tx, finish_rx) = oneshot::channel();
        *self.finish_tx.lock() = Some(finish_tx);

        let worker = StatsWorker {
            core,
            context: self.context.lock().clone(),
            published: Arc::clone(&self.published),
            factory: Arc::clone(&self.factory),
            event_rx,
            finish_rx,
            interval: config.publish_interval,
        };
        *self.task.lock() = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Stop the ticker after a final publish
    pub async fn stop(&self) {
        if let Some(finish) = self.finish_tx.lock().take() {
            let _ = finish.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!(topic = %self.topic, "statistics manager stopped");
    }
}

struct StatsWorker {
    core: StatsCore,
    context: StatsContext,
    published: Arc<RwLock<HashMap<String, Value>>>,
    factory: Arc<dyn McConnectionFactory>,
    event_rx: mpsc::UnboundedReceiver<ComponentEvent>,
    finish_rx: oneshot::Receiver<()>,
    interval: std::time::Duration,
}

impl StatsWorker {
    async fn run(mut self) {
        let mut stats_conns: HashMap<String, Box<dyn crate::service::McConnection>> =
            HashMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut self.finish_rx => break,
                event = self.event_rx.recv() => match event {
                    Some(event) => self.core.process_event(&event),
                    None => break,
                },
                _ = ticker.tick() => {
                    // drain whatever arrived before correlating
                    while let Ok(event) = self.event_rx.try_recv() {
                        self.core.process_event(&event);
                    }
                    self.publish(&mut stats_conns).await;
                }
            }
        }

        while let Ok(event) = self.event_rx.try_recv() {
            self.core.process_event(&event);
        }
        self.publish(&mut stats_conns).await;
        for (_, mut conn) in stats_conns {
            conn.close().await;
        }
    }

    async fn publish(
        &mut self,
        stats_conns: &mut HashMap<String, Box<dyn crate::service::McConnection>>,
    ) {
        let mut published = HashMap::new();
        let overview = self.core.aggregate(&mut published);

        let docs_written = overview.counter(DOCS_WRITTEN_METRIC);
        let data_replicated = overview.counter(DATA_REPLICATED_METRIC);
        let mut overview_value = overview.to_value(false);

        // replication lag over this interval
        let latency = self.core.correlate_latency();
        overview_value[DOCS_LATENCY_METRIC] = Value::from(latency.mean());

        // rates against the previous interval's sample
        let interval_secs = self.interval.as_secs_f64();
        let prev_docs = self.core.prev_overview[DOCS_WRITTEN_METRIC];
        let prev_bytes = self.core.prev_overview[DATA_REPLICATED_METRIC];
        overview_value[RATE_REPLICATED_METRIC] =
            Value::from(docs_written.saturating_sub(prev_docs) as f64 / interval_secs);
        overview_value[BANDWIDTH_USAGE_METRIC] =
            Value::from(data_replicated.saturating_sub(prev_bytes) as f64 / interval_secs);

        match self.changes_left(docs_written, stats_conns).await {
            Ok(changes_left) => {
                overview_value[CHANGES_LEFT_METRIC] = Value::from(changes_left);
            }
            Err(err) => {
                tracing::warn!(topic = %self.core.topic, error = %err, "changes_left unavailable this interval");
            }
        }

        self.core.prev_overview.insert(DOCS_WRITTEN_METRIC, docs_written);
        self.core
            .prev_overview
            .insert(DATA_REPLICATED_METRIC, data_replicated);

        published.insert(OVERVIEW_METRICS_KEY.to_string(), overview_value);
        *self.published.write() = published;
    }

    /// Mutations still waiting on the source, clamped at zero
    async fn changes_left(
        &mut self,
        docs_written: u64,
        stats_conns: &mut HashMap<String, Box<dyn crate::service::McConnection>>,
    ) -> Result<u64> {
        let mut total: u64 = 0;
        for (server, vbnos) in &self.context.active_vbs {
            if !stats_conns.contains_key(server) {
                let mut conn = self.factory.connect(server, &self.context.bucket).await?;
                conn.helo(STATS_USER_AGENT, Default::default()).await?;
                stats_conns.insert(server.clone(), conn);
            }
            let conn = stats_conns
                .get_mut(server)
                .expect("connection inserted above");
            let stats_map = conn.stats(VBUCKET_SEQNO_STAT_NAME).await?;

            for vbno in vbnos {
                let key = high_seqno_stat_key(*vbno);
                let Some(raw) = stats_map.get(&key) else {
                    // the vBucket moved since the last refresh
                    tracing::warn!(
                        topic = %self.core.topic,
                        vbno,
                        server = %server,
                        "high seqno missing from stats, topology may have changed"
                    );
                    continue;
                };
                let high_seqno: u64 = raw.parse().map_err(|_| {
                    Error::invalid_input(format!("high seqno for vb {} is not numeric: {}", vbno, raw))
                })?;
                let start = self.context.start_seqnos.get(vbno).copied().unwrap_or(0);
                total += high_seqno.saturating_sub(start);
            }
        }
        Ok(total.saturating_sub(docs_written))
    }
}

impl StatsCore {
    fn process_event(&mut self, event: &ComponentEvent) {
        match event.kind {
            EventKind::DataReceived if self.dcp_parts.contains(&event.part) => {
                let at = event.aux.at.unwrap_or_else(Instant::now);
                self.start_times.insert(event.aux.seqno, at);
            }
            EventKind::DataReceived if self.xmem_parts.contains(&event.part) => {
                if let Some(registry) = self.registries.get_mut(&event.part) {
                    registry.observe(DOCS_REP_QUEUE_METRIC, event.aux.queue_len as i64);
                    registry.observe(SIZE_REP_QUEUE_METRIC, event.aux.queue_bytes as i64);
                }
            }
            EventKind::DataSent => {
                let at = event.aux.at.unwrap_or_else(Instant::now);
                self.end_times.insert(event.aux.seqno, at);
                if let Some(registry) = self.registries.get_mut(&event.part) {
                    registry.inc(DOCS_WRITTEN_METRIC, 1);
                    registry.inc(DATA_REPLICATED_METRIC, event.aux.size as u64);
                }
            }
            EventKind::DataFiltered if self.router_parts.contains(&event.part) => {
                if let Some(registry) = self.registries.get_mut(&event.part) {
                    if event.aux.error.is_some() {
                        registry.inc(DOCS_FAILED_FILTER_METRIC, 1);
                    } else {
                        registry.inc(DOCS_FILTERED_METRIC, 1);
                    }
                }
            }
            _ => {}
        }
    }

    /// Sum part registries into a fresh overview, enforcing monotonicity
    fn aggregate(&mut self, published: &mut HashMap<String, Value>) -> Registry {
        let mut overview = Registry::default();
        overview.register_counter(DOCS_WRITTEN_METRIC);
        overview.register_counter(DATA_REPLICATED_METRIC);
        overview.register_counter(DOCS_FILTERED_METRIC);
        overview.register_counter(DOCS_FAILED_FILTER_METRIC);

        for (part, registry) in &self.registries {
            for name in [
                DOCS_WRITTEN_METRIC,
                DATA_REPLICATED_METRIC,
                DOCS_FILTERED_METRIC,
                DOCS_FAILED_FILTER_METRIC,
            ] {
                overview.inc(name, registry.counter(name));
            }
            published.insert(part.clone(), registry.to_value(true));
        }

        for name in [DOCS_WRITTEN_METRIC, DATA_REPLICATED_METRIC] {
            let current = overview.counter(name);
            let previous = self.prev_overview.get(name).copied().unwrap_or(0);
            if current < previous {
                let err = Error::fatal(format!(
                    "counter {} went backward: {} -> {}",
                    name, previous, current
                ));
                self.publisher.raise_error(&err);
            }
        }
        overview
    }

    /// Pair start and end times collected this interval into the lag sample
    fn correlate_latency(&mut self) -> UniformSample {
        let mut sample = UniformSample::new(self.sample_size);
        for (seqno, start) in &self.start_times {
            if let Some(end) = self.end_times.get(seqno) {
                let lag_ms = end.saturating_duration_since(*start).as_millis() as i64;
                sample.update(lag_ms);
            }
        }
        // unpaired entries would otherwise accumulate without bound
        self.start_times.clear();
        self.end_times.clear();
        sample
    }
}

fn zero_overview() -> HashMap<&'static str, u64> {
    let mut map = HashMap::new();
    map.insert(DOCS_WRITTEN_METRIC, 0);
    map.insert(DATA_REPLICATED_METRIC, 0);
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::part::EventAux;
    use std::time::Duration;

    fn event(kind: EventKind, part: &str, aux: EventAux) -> ComponentEvent {
        ComponentEvent {
            kind,
            part: part.to_string(),
            mutation: None,
            aux,
        }
    }

    fn test_core() -> StatsCore {
        let mut registries = HashMap::new();
        let mut xmem = Registry::default();
        xmem.register_counter(DOCS_WRITTEN_METRIC);
        xmem.register_counter(DATA_REPLICATED_METRIC);
        xmem.register_histogram(DOCS_REP_QUEUE_METRIC, 100);
        xmem.register_histogram(SIZE_REP_QUEUE_METRIC, 100);
        registries.insert("xmem_0".to_string(), xmem);
        let mut router = Registry::default();
        router.register_counter(DOCS_FILTERED_METRIC);
        router.register_counter(DOCS_FAILED_FILTER_METRIC);
        registries.insert("router_0".to_string(), router);
        registries.insert("dcp_0".to_string(), Registry::default());

        StatsCore {
            topic: "t".to_string(),
            registries,
            dcp_parts: HashSet::from(["dcp_0".to_string()]),
            xmem_parts: HashSet::from(["xmem_0".to_string()]),
            router_parts: HashSet::from(["router_0".to_string()]),
            start_times: HashMap::new(),
            end_times: HashMap::new(),
            prev_overview: zero_overview(),
            sample_size: 100,
            publisher: Arc::new(EventPublisher::new("stats/t")),
        }
    }

    #[test]
    fn test_uniform_sample_bounded() {
        let mut sample = UniformSample::new(10);
        for i in 0..1000 {
            sample.update(i);
        }
        assert_eq!(sample.count(), 1000);
        assert_eq!(sample.values.len(), 10);
    }

    #[test]
    fn test_uniform_sample_stats() {
        let mut sample = UniformSample::new(10);
        for v in [1, 2, 3] {
            sample.update(v);
        }
        assert_eq!(sample.mean(), 2.0);
        assert_eq!(sample.min(), 1);
        assert_eq!(sample.max(), 3);
    }

    #[test]
    fn test_data_sent_counts_docs_and_bytes() {
        let mut core = test_core();
        core.process_event(&event(
            EventKind::DataSent,
            "xmem_0",
            EventAux {
                seqno: 1,
                size: 120,
                at: Some(Instant::now()),
                ..Default::default()
            },
        ));
        let registry = core.registries.get("xmem_0").unwrap();
        assert_eq!(registry.counter(DOCS_WRITTEN_METRIC), 1);
        assert_eq!(registry.counter(DATA_REPLICATED_METRIC), 120);
    }

    #[test]
    fn test_filtered_and_failed_counted_separately() {
        let mut core = test_core();
        core.process_event(&event(EventKind::DataFiltered, "router_0", EventAux::default()));
        core.process_event(&event(
            EventKind::DataFiltered,
            "router_0",
            EventAux {
                error: Some("bad json".to_string()),
                ..Default::default()
            },
        ));
        let registry = core.registries.get("router_0").unwrap();
        assert_eq!(registry.counter(DOCS_FILTERED_METRIC), 1);
        assert_eq!(registry.counter(DOCS_FAILED_FILTER_METRIC), 1);
    }

    #[test]
    fn test_latency_correlation_pairs_and_clears() {
        let mut core = test_core();
        let start = Instant::now();
        let end = start + Duration::from_millis(40);
        core.process_event(&event(
            EventKind::DataReceived,
            "dcp_0",
            EventAux {
                seqno: 7,
                at: Some(start),
                ..Default::default()
            },
        ));
        core.process_event(&event(
            EventKind::DataSent,
            "xmem_0",
            EventAux {
                seqno: 7,
                at: Some(end),
                ..Default::default()
            },
        ));
        // unpaired entry
        core.process_event(&event(
            EventKind::DataReceived,
            "dcp_0",
            EventAux {
                seqno: 8,
                at: Some(start),
                ..Default::default()
            },
        ));

        let sample = core.correlate_latency();
        assert_eq!(sample.count(), 1);
        assert_eq!(sample.max(), 40);
        assert!(core.start_times.is_empty());
        assert!(core.end_times.is_empty());
    }

    #[test]
    fn test_overview_aggregates_parts() {
        let mut core = test_core();
        for seqno in 0..3 {
            core.process_event(&event(
                EventKind::DataSent,
                "xmem_0",
                EventAux {
                    seqno,
                    size: 10,
                    at: Some(Instant::now()),
                    ..Default::default()
                },
            ));
        }
        core.process_event(&event(EventKind::DataFiltered, "router_0", EventAux::default()));

        let mut published = HashMap::new();
        let overview = core.aggregate(&mut published);
        assert_eq!(overview.counter(DOCS_WRITTEN_METRIC), 3);
        assert_eq!(overview.counter(DATA_REPLICATED_METRIC), 30);
        assert_eq!(overview.counter(DOCS_FILTERED_METRIC), 1);
        assert!(published.contains_key("xmem_0"));
    }

    #[test]
    fn test_counter_regression_raises_fatal() {
        use crate::pipeline::part::EventListener;
        use parking_lot::Mutex as PlMutex;

        struct Trap {
            hit: PlMutex<bool>,
        }
        impl EventListener for Trap {
            fn on_event(&self, event: &ComponentEvent) {
                assert_eq!(event.kind, EventKind::ErrorRaised);
                *self.hit.lock() = true;
            }
        }

        let mut core = test_core();
        let trap = Arc::new(Trap {
            hit: PlMutex::new(false),
        });
        core.publisher
            .register_listener(EventKind::ErrorRaised, trap.clone());

        // simulate a previous interval that saw more documents
        core.prev_overview.insert(DOCS_WRITTEN_METRIC, 10);
        let mut published = HashMap::new();
        core.aggregate(&mut published);
        assert!(*trap.hit.lock());
    }

    #[test]
    fn test_queue_depth_histograms() {
        let mut core = test_core();
        core.process_event(&event(
            EventKind::DataReceived,
            "xmem_0",
            EventAux {
                queue_len: 5,
                queue_bytes: 640,
                ..Default::default()
            },
        ));
        let mut published = HashMap::new();
        core.aggregate(&mut published);
        let xmem = published.get("xmem_0").unwrap();
        assert_eq!(xmem[DOCS_REP_QUEUE_METRIC]["max"], 5);
        assert_eq!(xmem[SIZE_REP_QUEUE_METRIC]["max"], 640);
    }
}
