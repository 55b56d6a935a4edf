//! Metric collection and fan-out.
//!
//! The collector scrapes the gateway on per-type intervals; the controller
//! owns the queues between collectors, plugins and local receivers and does
//! the rate bookkeeping.

pub mod collector;

pub use collector::MetricsCollector;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::warn;

use crate::plugins::PluginController;
use crate::serial::SerialTransport;
use shared::rpc::{Metric, MetricDefinition, MetricKind};

pub type LocalReceiver = Box<dyn Fn(&Metric, &MetricDefinition) + Send + Sync>;

const SELF_METRICS_INTERVAL: Duration = Duration::from_secs(10);
const COLLECT_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_IDLE: Duration = Duration::from_millis(100);

pub fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Validate a raw plugin metric definition against the required schema.
pub fn validate_definition(raw: &Value) -> Result<MetricDefinition, String> {
    let object = raw.as_object().ok_or("metric definition should be an object")?;
    for (key, wanted) in [
        ("type", "string"),
        ("name", "string"),
        ("description", "string"),
        ("mtype", "string"),
        ("unit", "string"),
        ("tags", "list"),
    ] {
        let value = object
            .get(key)
            .ok_or_else(|| format!("metric definition should contain key {key}"))?;
        let ok = match wanted {
            "string" => value.is_string(),
            _ => value.is_array(),
        };
        if !ok {
            return Err(format!("metric definition key {key} should be of type {wanted}"));
        }
    }

    serde_json::from_value(raw.clone()).map_err(|e| format!("invalid metric definition: {e}"))
}

/// Check a metric against its definition: every declared tag must carry a
/// value.
pub fn metric_matches_definition(metric: &Metric, definition: &MetricDefinition) -> bool {
    definition
        .tags
        .iter()
        .all(|tag| metric.tags.get(tag).is_some_and(|value| !value.is_null()))
}

fn rate_key(metric: &Metric) -> String {
    format!(
        "{}.{}",
        metric.source.to_lowercase(),
        metric.metric_type.to_lowercase()
    )
}

struct Queues {
    plugins: VecDeque<(Metric, MetricDefinition)>,
    local: VecDeque<(Metric, MetricDefinition)>,
}

struct Inner<T: SerialTransport> {
    collector: Arc<MetricsCollector<T>>,
    plugins: Arc<PluginController>,
    definitions: std::sync::Mutex<HashMap<String, Vec<MetricDefinition>>>,
    queues: std::sync::Mutex<Queues>,
    inbound_rates: std::sync::Mutex<HashMap<String, u64>>,
    outbound_rates: std::sync::Mutex<HashMap<String, u64>>,
    receivers: std::sync::Mutex<Vec<LocalReceiver>>,
    stopped: AtomicBool,
}

pub struct MetricsController<T: SerialTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SerialTransport> Clone for MetricsController<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: SerialTransport> MetricsController<T> {
    pub fn new(collector: Arc<MetricsCollector<T>>, plugins: Arc<PluginController>) -> Self {
        Self {
            inner: Arc::new(Inner {
                collector,
                plugins,
                definitions: std::sync::Mutex::new(HashMap::new()),
                queues: std::sync::Mutex::new(Queues {
                    plugins: VecDeque::new(),
                    local: VecDeque::new(),
                }),
                inbound_rates: std::sync::Mutex::new(HashMap::from([("total".to_string(), 0)])),
                outbound_rates: std::sync::Mutex::new(HashMap::from([("total".to_string(), 0)])),
                receivers: std::sync::Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe a local receiver to every metric that flows through.
    pub fn add_receiver(&self, receiver: LocalReceiver) {
        self.inner.receivers.lock().unwrap().push(receiver);
    }

    /// Load and validate the metric definitions of every running plugin.
    pub async fn load_definitions(&self) {
        let raw_definitions = self.inner.plugins.get_metric_definitions().await;
        let mut definitions = self.inner.definitions.lock().unwrap();
        for (plugin, raw_list) in raw_definitions {
            for raw in raw_list {
                match validate_definition(&raw) {
                    Ok(definition) => {
                        definitions.entry(plugin.clone()).or_default().push(definition);
                    }
                    Err(reason) => warn!("plugin {plugin}: {reason}"),
                }
            }
        }
    }

    pub fn inbound_rates(&self) -> HashMap<String, u64> {
        self.inner.inbound_rates.lock().unwrap().clone()
    }

    pub fn outbound_rates(&self) -> HashMap<String, u64> {
        self.inner.outbound_rates.lock().unwrap().clone()
    }

    pub fn queue_lengths(&self) -> (usize, usize) {
        let queues = self.inner.queues.lock().unwrap();
        (queues.plugins.len(), queues.local.len())
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { collect_openmotics(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { collect_plugins(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { distribute_plugins(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { distribute_local(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { generate_internal_stats(inner).await });
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

impl<T: SerialTransport> Inner<T> {
    fn put(&self, metric: Metric, definition: MetricDefinition) {
        {
            let mut rates = self.inbound_rates.lock().unwrap();
            *rates.entry(rate_key(&metric)).or_insert(0) += 1;
            *rates.entry("total".to_string()).or_insert(0) += 1;
        }
        let mut queues = self.queues.lock().unwrap();
        queues.plugins.push_front((metric.clone(), definition.clone()));
        queues.local.push_front((metric, definition));
    }

    fn count_outbound(&self, metric: &Metric, deliveries: u64) {
        if deliveries == 0 {
            return;
        }
        let mut rates = self.outbound_rates.lock().unwrap();
        *rates.entry(rate_key(metric)).or_insert(0) += deliveries;
        *rates.entry("total".to_string()).or_insert(0) += deliveries;
    }
}

async fn collect_openmotics<T: SerialTransport>(inner: Arc<Inner<T>>) {
    while !inner.stopped.load(Ordering::SeqCst) {
        for (metric, definition) in inner.collector.drain() {
            inner.put(metric, definition);
        }
        tokio::time::sleep(COLLECT_INTERVAL).await;
    }
}

async fn collect_plugins<T: SerialTransport>(inner: Arc<Inner<T>>) {
    while !inner.stopped.load(Ordering::SeqCst) {
        for metric in inner.plugins.collect_metrics().await {
            let definition = {
                let definitions = inner.definitions.lock().unwrap();
                definitions.get(&metric.source).and_then(|list| {
                    list.iter().find(|d| d.name == metric.metric).cloned()
                })
            };
            let Some(definition) = definition else {
                continue;
            };
            if !metric_matches_definition(&metric, &definition) {
                warn!(
                    "metric {} from {} is missing declared tags",
                    metric.metric, metric.source
                );
                continue;
            }
            inner.put(metric, definition);
        }
        tokio::time::sleep(COLLECT_INTERVAL).await;
    }
}

async fn distribute_plugins<T: SerialTransport>(inner: Arc<Inner<T>>) {
    while !inner.stopped.load(Ordering::SeqCst) {
        let next = inner.queues.lock().unwrap().plugins.pop_back();
        match next {
            Some((metric, definition)) => {
                let deliveries = inner.plugins.distribute_metric(&metric, &definition).await;
                inner.count_outbound(&metric, deliveries as u64);
            }
            None => tokio::time::sleep(DRAIN_IDLE).await,
        }
    }
}

async fn distribute_local<T: SerialTransport>(inner: Arc<Inner<T>>) {
    while !inner.stopped.load(Ordering::SeqCst) {
        let next = inner.queues.lock().unwrap().local.pop_back();
        match next {
            Some((metric, definition)) => {
                let receivers = inner.receivers.lock().unwrap();
                for receiver in receivers.iter() {
                    receiver(&metric, &definition);
                }
                inner.count_outbound(&metric, receivers.len() as u64);
            }
            None => tokio::time::sleep(DRAIN_IDLE).await,
        }
    }
}

/// Queue lengths and rate counters, emitted as system metrics every 10 s.
async fn generate_internal_stats<T: SerialTransport>(inner: Arc<Inner<T>>) {
    let queue_definition = MetricDefinition {
        metric_type: "system".to_string(),
        name: "queue_length".to_string(),
        description: "Metrics queue length".to_string(),
        mtype: MetricKind::Gauge,
        unit: String::new(),
        tags: vec!["name".to_string(), "target".to_string()],
    };
    let inbound_definition = MetricDefinition {
        metric_type: "system".to_string(),
        name: "metrics_in".to_string(),
        description: "Inbound metrics processed".to_string(),
        mtype: MetricKind::Counter,
        unit: String::new(),
        tags: vec!["name".to_string(), "namespace".to_string()],
    };
    let outbound_definition = MetricDefinition {
        metric_type: "system".to_string(),
        name: "metrics_out".to_string(),
        description: "Outbound metrics processed".to_string(),
        mtype: MetricKind::Counter,
        unit: String::new(),
        tags: vec!["name".to_string(), "namespace".to_string()],
    };

    let system_metric = |name: &str, tag: (&str, &str), value: f64| {
        let mut tags = serde_json::Map::new();
        tags.insert("name".to_string(), Value::String("gateway".to_string()));
        tags.insert(tag.0.to_string(), Value::String(tag.1.to_string()));
        Metric {
            source: "OpenMotics".to_string(),
            metric_type: "system".to_string(),
            metric: name.to_string(),
            timestamp: epoch_now(),
            value,
            tags,
        }
    };

    while !inner.stopped.load(Ordering::SeqCst) {
        let (plugins_len, local_len) = {
            let queues = inner.queues.lock().unwrap();
            (queues.plugins.len(), queues.local.len())
        };
        inner.put(
            system_metric("queue_length", ("target", "plugins"), plugins_len as f64),
            queue_definition.clone(),
        );
        inner.put(
            system_metric("queue_length", ("target", "openmotics"), local_len as f64),
            queue_definition.clone(),
        );

        let inbound = inner.inbound_rates.lock().unwrap().clone();
        for (key, value) in inbound {
            inner.put(
                system_metric("metrics_in", ("namespace", &key), value as f64),
                inbound_definition.clone(),
            );
        }
        let outbound = inner.outbound_rates.lock().unwrap().clone();
        for (key, value) in outbound {
            inner.put(
                system_metric("metrics_out", ("namespace", &key), value as f64),
                outbound_definition.clone(),
            );
        }

        tokio::time::sleep(SELF_METRICS_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(tags: &[&str]) -> MetricDefinition {
        MetricDefinition {
            metric_type: "energy".to_string(),
            name: "power".to_string(),
            description: "Power usage".to_string(),
            mtype: MetricKind::Gauge,
            unit: "W".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn metric(tags: &[(&str, Value)]) -> Metric {
        let mut map = serde_json::Map::new();
        for (key, value) in tags {
            map.insert(key.to_string(), value.clone());
        }
        Metric {
            source: "OpenMotics".to_string(),
            metric_type: "energy".to_string(),
            metric: "power".to_string(),
            timestamp: 1_497_677_091,
            value: 1234.0,
            tags: map,
        }
    }

    #[test]
    fn definitions_require_the_full_schema() {
        let complete = json!({
            "type": "energy", "name": "power", "description": "Total energy",
            "mtype": "counter", "unit": "kWh", "tags": ["device", "id"],
        });
        assert!(validate_definition(&complete).is_ok());

        let missing = json!({
            "type": "energy", "name": "power", "description": "Total energy",
            "mtype": "counter", "unit": "kWh",
        });
        assert!(validate_definition(&missing).is_err());

        let wrong_type = json!({
            "type": "energy", "name": "power", "description": "Total energy",
            "mtype": "counter", "unit": "kWh", "tags": "device",
        });
        assert!(validate_definition(&wrong_type).is_err());

        let bad_kind = json!({
            "type": "energy", "name": "power", "description": "Total energy",
            "mtype": "histogram", "unit": "kWh", "tags": [],
        });
        assert!(validate_definition(&bad_kind).is_err());
    }

    #[test]
    fn metrics_must_carry_their_declared_tags() {
        let definition = definition(&["device", "id"]);
        assert!(metric_matches_definition(
            &metric(&[("device", json!("energy module")), ("id", json!(0))]),
            &definition
        ));
        assert!(!metric_matches_definition(&metric(&[("device", json!("x"))]), &definition));
        assert!(!metric_matches_definition(
            &metric(&[("device", json!("x")), ("id", Value::Null)]),
            &definition
        ));
    }

    #[test]
    fn rate_keys_combine_source_and_type() {
        assert_eq!(rate_key(&metric(&[])), "openmotics.energy");
    }
}
