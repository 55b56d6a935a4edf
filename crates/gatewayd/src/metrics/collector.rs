//! Scrapes the gateway into the metrics pipeline.
//!
//! One task per metric type, each sleeping its negotiated interval. The
//! interval is the smallest one any subscriber asked for, clamped at the
//! per-type minimum; sleepers re-check every 100 ms so a new shorter
//! interval wakes them early.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::warn;

use super::epoch_now;
use crate::gateway::GatewayApi;
use crate::pulses::PulseCounterController;
use crate::serial::SerialTransport;
use shared::rpc::{Metric, MetricDefinition, MetricKind};

pub const METRIC_TYPES: [&str; 8] = [
    "system",
    "output",
    "sensor",
    "thermostat",
    "error",
    "counter",
    "energy",
    "energy_analytics",
];

/// Hard per-type interval floors in seconds.
pub fn min_interval(metric_type: &str) -> u64 {
    match metric_type {
        "system" => 60,
        "output" => 60,
        "sensor" => 5,
        "thermostat" => 30,
        "error" => 120,
        "counter" => 30,
        "energy" => 5,
        "energy_analytics" => 300,
        _ => 900,
    }
}

const DEFAULT_INTERVAL: u64 = 900;
const PAUSE_STEP: Duration = Duration::from_millis(100);

struct IntervalState {
    current: u64,
    cloud: u64,
    plugins: Vec<u64>,
    websockets: HashMap<String, u64>,
}

impl IntervalState {
    fn new() -> Self {
        Self {
            current: DEFAULT_INTERVAL,
            cloud: DEFAULT_INTERVAL,
            plugins: Vec::new(),
            websockets: HashMap::new(),
        }
    }

    fn update(&mut self, floor: u64) {
        let mut interval = floor.max(self.cloud);
        for requested in &self.plugins {
            interval = interval.min((*requested).max(floor));
        }
        for requested in self.websockets.values() {
            interval = interval.min((*requested).max(floor));
        }
        self.current = interval;
    }
}

struct Inner<T: SerialTransport> {
    gateway: Arc<GatewayApi<T>>,
    pulses: Arc<PulseCounterController<T>>,
    queue: std::sync::Mutex<VecDeque<(Metric, MetricDefinition)>>,
    intervals: std::sync::Mutex<HashMap<&'static str, IntervalState>>,
    /// Types whose scraper should wake at the next sleep-manager check.
    forced: std::sync::Mutex<std::collections::HashSet<&'static str>>,
    started_at: Instant,
    stopped: AtomicBool,
}

pub struct MetricsCollector<T: SerialTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SerialTransport> MetricsCollector<T> {
    pub fn new(gateway: Arc<GatewayApi<T>>, pulses: Arc<PulseCounterController<T>>) -> Self {
        let intervals = METRIC_TYPES
            .iter()
            .map(|metric_type| (*metric_type, IntervalState::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                gateway,
                pulses,
                queue: std::sync::Mutex::new(VecDeque::new()),
                intervals: std::sync::Mutex::new(intervals),
                forced: std::sync::Mutex::new(std::collections::HashSet::new()),
                started_at: Instant::now(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Metrics scraped since the last drain, oldest first.
    pub fn drain(&self) -> Vec<(Metric, MetricDefinition)> {
        self.inner.queue.lock().unwrap().drain(..).collect()
    }

    pub fn interval(&self, metric_type: &str) -> u64 {
        self.inner
            .intervals
            .lock()
            .unwrap()
            .get(metric_type)
            .map(|state| state.current)
            .unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn set_cloud_interval(&self, metric_type: &str, interval: u64) {
        let mut intervals = self.inner.intervals.lock().unwrap();
        if let Some((key, state)) = intervals.iter_mut().find(|(key, _)| **key == metric_type) {
            state.cloud = interval;
            state.update(min_interval(key));
        }
    }

    /// Apply the intervals requested by plugin metric collectors.
    pub fn set_plugin_intervals(&self, requests: &[(String, u64)]) {
        let mut intervals = self.inner.intervals.lock().unwrap();
        for (key, state) in intervals.iter_mut() {
            state.plugins = requests
                .iter()
                .filter(|(metric_type, _)| metric_type == key)
                .map(|(_, interval)| *interval)
                .collect();
            state.update(min_interval(key));
        }
    }

    pub fn set_websocket_interval(&self, client_id: &str, metric_type: &str, interval: Option<u64>) {
        let mut intervals = self.inner.intervals.lock().unwrap();
        for (key, state) in intervals.iter_mut() {
            if *key == metric_type {
                match interval {
                    Some(interval) => {
                        state.websockets.insert(client_id.to_string(), interval);
                    }
                    None => {
                        state.websockets.remove(client_id);
                    }
                }
                state.update(min_interval(key));
            }
        }
    }

    pub fn start(&self) {
        macro_rules! spawn_scraper {
            ($name:ident) => {{
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    loop {
                        if inner.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        let started = Instant::now();
                        if let Err(error) = inner.$name().await {
                            warn!("{} metrics scrape failed: {error}", stringify!($name));
                        }
                        inner.pause(stringify!($name).trim_start_matches("run_"), started).await;
                    }
                });
            }};
        }

        spawn_scraper!(run_system);
        spawn_scraper!(run_output);
        spawn_scraper!(run_sensor);
        spawn_scraper!(run_thermostat);
        spawn_scraper!(run_error);
        spawn_scraper!(run_counter);
        spawn_scraper!(run_energy);
        spawn_scraper!(run_energy_analytics);
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Wake the output scraper right away; called from the OL stream so a
    /// state change is visible before the next polling interval.
    pub fn on_output_change(&self) {
        self.inner.forced.lock().unwrap().insert("output");
    }

    /// The definitions of everything this collector emits.
    pub fn definitions() -> Vec<MetricDefinition> {
        fn def(
            metric_type: &str,
            name: &str,
            description: &str,
            mtype: MetricKind,
            unit: &str,
            tags: &[&str],
        ) -> MetricDefinition {
            MetricDefinition {
                metric_type: metric_type.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                mtype,
                unit: unit.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            }
        }

        vec![
            def("system", "service_uptime", "Service uptime", MetricKind::Gauge, "s", &["name"]),
            def("system", "bytes_read", "Bytes read from a bus", MetricKind::Counter, "B", &["name", "bus"]),
            def("system", "bytes_written", "Bytes written to a bus", MetricKind::Counter, "B", &["name", "bus"]),
            def("system", "metric_interval", "Collection interval per type", MetricKind::Gauge, "s", &["name", "metric_type"]),
            def("output", "output", "Output state (dimmer percentage)", MetricKind::Gauge, "", &["id", "name"]),
            def("sensor", "temperature", "Sensor temperature", MetricKind::Gauge, "degree C", &["id"]),
            def("sensor", "humidity", "Sensor humidity", MetricKind::Gauge, "%", &["id"]),
            def("sensor", "brightness", "Sensor brightness", MetricKind::Gauge, "%", &["id"]),
            def("thermostat", "temperature", "Thermostat temperature", MetricKind::Gauge, "degree C", &["id", "name"]),
            def("thermostat", "setpoint", "Thermostat setpoint", MetricKind::Gauge, "degree C", &["id", "name"]),
            def("error", "module_errors", "Errors per module", MetricKind::Counter, "", &["module"]),
            def("error", "seconds_since_last_success", "Bus health", MetricKind::Gauge, "s", &["bus"]),
            def("counter", "pulses", "Pulse counter value", MetricKind::Counter, "", &["id", "name"]),
            def("energy", "voltage", "Measured voltage", MetricKind::Gauge, "V", &["module", "port"]),
            def("energy", "frequency", "Measured frequency", MetricKind::Gauge, "Hz", &["module", "port"]),
            def("energy", "current", "Measured current", MetricKind::Gauge, "A", &["module", "port"]),
            def("energy", "power", "Instantaneous power", MetricKind::Gauge, "W", &["module", "port"]),
            def("energy_analytics", "energy", "Accumulated energy", MetricKind::Counter, "Wh", &["module", "port", "tariff"]),
        ]
    }
}

impl<T: SerialTransport> Inner<T> {
    /// Sleep until the type's interval has elapsed, waking early when the
    /// interval is renegotiated shorter.
    async fn pause(&self, metric_type: &str, started: Instant) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            if self.forced.lock().unwrap().remove(metric_type) {
                return;
            }
            let interval = {
                let intervals = self.intervals.lock().unwrap();
                intervals
                    .get(metric_type)
                    .map(|state| state.current)
                    .unwrap_or(DEFAULT_INTERVAL)
            };
            if started.elapsed() >= Duration::from_secs(interval) {
                return;
            }
            tokio::time::sleep(PAUSE_STEP).await;
        }
    }

    fn enqueue(
        &self,
        metric_type: &str,
        name: &str,
        timestamp: i64,
        tags: serde_json::Map<String, Value>,
        value: f64,
    ) {
        let definition = MetricsCollector::<T>::definitions()
            .into_iter()
            .find(|d| d.metric_type == metric_type && d.name == name);
        let Some(definition) = definition else {
            return;
        };
        let metric = Metric {
            source: "OpenMotics".to_string(),
            metric_type: metric_type.to_string(),
            metric: name.to_string(),
            timestamp,
            value,
            tags,
        };
        self.queue.lock().unwrap().push_back((metric, definition));
    }

    fn tags(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    async fn run_system(&self) -> Result<(), crate::gateway::GatewayError> {
        let now = epoch_now();
        let master = self.gateway.master_communicator();

        self.enqueue(
            "system",
            "service_uptime",
            now,
            Self::tags(&[("name", Value::from("gateway"))]),
            self.started_at.elapsed().as_secs() as f64,
        );
        self.enqueue(
            "system",
            "bytes_read",
            now,
            Self::tags(&[("name", Value::from("gateway")), ("bus", Value::from("master"))]),
            master.bytes_read() as f64,
        );
        self.enqueue(
            "system",
            "bytes_written",
            now,
            Self::tags(&[("name", Value::from("gateway")), ("bus", Value::from("master"))]),
            master.bytes_written() as f64,
        );

        let intervals: Vec<(&'static str, u64)> = {
            let intervals = self.intervals.lock().unwrap();
            intervals.iter().map(|(key, state)| (*key, state.current)).collect()
        };
        for (metric_type, interval) in intervals {
            self.enqueue(
                "system",
                "metric_interval",
                now,
                Self::tags(&[
                    ("name", Value::from("gateway")),
                    ("metric_type", Value::from(metric_type)),
                ]),
                interval as f64,
            );
        }
        Ok(())
    }

    async fn run_output(&self) -> Result<(), crate::gateway::GatewayError> {
        let outputs = self.gateway.get_outputs().await?;
        let now = epoch_now();
        for output in outputs {
            let value = if output.status == 1 { f64::from(output.dimmer) } else { 0.0 };
            self.enqueue(
                "output",
                "output",
                now,
                Self::tags(&[
                    ("id", Value::from(output.output_nr)),
                    ("name", Value::from(output.name.clone())),
                ]),
                value,
            );
        }
        Ok(())
    }

    async fn run_sensor(&self) -> Result<(), crate::gateway::GatewayError> {
        let temperatures = self.gateway.get_sensor_temperatures().await?;
        let humidities = self.gateway.get_sensor_humidities().await?;
        let brightness = self.gateway.get_sensor_brightness().await?;
        let now = epoch_now();

        for (id, value) in temperatures.into_iter().enumerate() {
            self.enqueue("sensor", "temperature", now, Self::tags(&[("id", Value::from(id))]), value);
        }
        for (id, value) in humidities.into_iter().enumerate() {
            if value != 255.0 {
                self.enqueue("sensor", "humidity", now, Self::tags(&[("id", Value::from(id))]), value);
            }
        }
        for (id, value) in brightness.into_iter().enumerate() {
            self.enqueue(
                "sensor",
                "brightness",
                now,
                Self::tags(&[("id", Value::from(id))]),
                f64::from(value),
            );
        }
        Ok(())
    }

    async fn run_thermostat(&self) -> Result<(), crate::gateway::GatewayError> {
        let group = self.gateway.get_thermostats_short().await?;
        let now = epoch_now();
        for thermostat in group.thermostats {
            let tags = Self::tags(&[
                ("id", Value::from(thermostat.thermostat)),
                ("name", Value::from(thermostat.name.clone())),
            ]);
            self.enqueue("thermostat", "temperature", now, tags.clone(), thermostat.act);
            self.enqueue("thermostat", "setpoint", now, tags, thermostat.csetp);
        }
        Ok(())
    }

    async fn run_error(&self) -> Result<(), crate::gateway::GatewayError> {
        let errors = self.gateway.get_errors().await?;
        let now = epoch_now();
        for (module, count) in errors {
            self.enqueue(
                "error",
                "module_errors",
                now,
                Self::tags(&[("module", Value::from(module))]),
                f64::from(count),
            );
        }
        self.enqueue(
            "error",
            "seconds_since_last_success",
            now,
            Self::tags(&[("bus", Value::from("master"))]),
            self.gateway.master_communicator().seconds_since_last_success() as f64,
        );
        Ok(())
    }

    async fn run_counter(&self) -> Result<(), crate::gateway::GatewayError> {
        let configs = self.pulses.get_configurations().await?;
        let values = self.pulses.get_status().await?;
        let now = epoch_now();
        for (config, value) in configs.iter().zip(values) {
            self.enqueue(
                "counter",
                "pulses",
                now,
                Self::tags(&[
                    ("id", Value::from(config.id)),
                    ("name", Value::from(config.name.clone())),
                ]),
                f64::from(value),
            );
        }
        Ok(())
    }

    async fn run_energy(&self) -> Result<(), crate::gateway::GatewayError> {
        let readings = self.gateway.get_realtime_power().await?;
        let now = epoch_now();
        for (module, ports) in readings {
            for (port, reading) in ports.iter().enumerate() {
                let tags = Self::tags(&[("module", Value::from(module)), ("port", Value::from(port))]);
                self.enqueue("energy", "voltage", now, tags.clone(), reading.voltage);
                self.enqueue("energy", "frequency", now, tags.clone(), reading.frequency);
                self.enqueue("energy", "current", now, tags.clone(), reading.current);
                self.enqueue("energy", "power", now, tags, reading.power);
            }
        }
        Ok(())
    }

    async fn run_energy_analytics(&self) -> Result<(), crate::gateway::GatewayError> {
        let totals = self.gateway.get_total_energy().await?;
        let now = epoch_now();
        for (module, ports) in totals {
            for (port, energy) in ports.iter().enumerate() {
                for (tariff, value) in [("day", energy.day), ("night", energy.night)] {
                    self.enqueue(
                        "energy_analytics",
                        "energy",
                        now,
                        Self::tags(&[
                            ("module", Value::from(module)),
                            ("port", Value::from(port)),
                            ("tariff", Value::from(tariff)),
                        ]),
                        f64::from(value),
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eeprom::controller::EepromController;
    use crate::eeprom::extension::EepromExtension;
    use crate::eeprom::file::EepromFile;
    use crate::master::MasterCommunicator;
    use crate::master::communicator::MasterOptions;
    use crate::power::PowerController;
    use crate::power::communicator::{PowerCommunicator, PowerOptions};
    use crate::serial::MockSerial;
    use crate::storage::Database;

    async fn collector() -> MetricsCollector<MockSerial> {
        let serial = Arc::new(MockSerial::new());
        let master = MasterCommunicator::new(
            serial.clone(),
            MasterOptions {
                init_master: false,
                ..MasterOptions::default()
            },
        );
        let power_controller = PowerController::new(Database::open_in_memory().unwrap())
            .await
            .unwrap();
        let power = PowerCommunicator::new(
            serial.clone(),
            power_controller.clone(),
            PowerOptions::default(),
        );
        let extension = EepromExtension::new(Database::open_in_memory().unwrap())
            .await
            .unwrap();
        let eeprom = Arc::new(EepromController::new(EepromFile::new(master.clone()), extension));
        let gateway = Arc::new(crate::gateway::GatewayApi::new(
            master.clone(),
            power,
            power_controller,
            eeprom.clone(),
        ));
        let pulses = Arc::new(
            PulseCounterController::new(Database::open_in_memory().unwrap(), master, eeprom)
                .await
                .unwrap(),
        );
        MetricsCollector::new(gateway, pulses)
    }

    #[tokio::test]
    async fn intervals_start_at_the_default() {
        let collector = collector().await;
        for metric_type in METRIC_TYPES {
            assert_eq!(collector.interval(metric_type), DEFAULT_INTERVAL);
        }
    }

    #[tokio::test]
    async fn requested_intervals_clamp_at_the_minimum() {
        let collector = collector().await;

        collector.set_plugin_intervals(&[("sensor".to_string(), 1)]);
        assert_eq!(collector.interval("sensor"), 5);

        collector.set_plugin_intervals(&[("sensor".to_string(), 60)]);
        assert_eq!(collector.interval("sensor"), 60);

        collector.set_websocket_interval("client-1", "energy", Some(2));
        assert_eq!(collector.interval("energy"), 5);

        collector.set_websocket_interval("client-1", "energy", None);
        assert_eq!(collector.interval("energy"), DEFAULT_INTERVAL);
    }

    #[tokio::test]
    async fn cloud_interval_is_clamped_but_never_raises_others() {
        let collector = collector().await;

        collector.set_cloud_interval("system", 30);
        assert_eq!(collector.interval("system"), 60);

        collector.set_cloud_interval("system", 300);
        assert_eq!(collector.interval("system"), 300);

        // A plugin asking for a faster rate wins over the cloud.
        collector.set_plugin_intervals(&[("system".to_string(), 120)]);
        assert_eq!(collector.interval("system"), 120);
    }

    #[tokio::test]
    async fn system_scrape_fills_the_queue() {
        let collector = collector().await;
        collector.inner.run_system().await.unwrap();

        let scraped = collector.drain();
        assert!(!scraped.is_empty());
        assert!(scraped.iter().all(|(metric, _)| metric.source == "OpenMotics"));
        let uptime = scraped
            .iter()
            .find(|(metric, _)| metric.metric == "service_uptime")
            .unwrap();
        assert_eq!(uptime.0.metric_type, "system");
        assert_eq!(uptime.1.mtype, MetricKind::Gauge);

        // Every scraped metric satisfies its own definition.
        for (metric, definition) in &scraped {
            assert!(super::super::metric_matches_definition(metric, definition));
        }
        assert!(collector.drain().is_empty());
    }

    #[test]
    fn every_metric_type_has_definitions() {
        let definitions = MetricsCollector::<MockSerial>::definitions();
        for metric_type in METRIC_TYPES {
            assert!(
                definitions.iter().any(|d| d.metric_type == metric_type),
                "missing definitions for {metric_type}"
            );
        }
    }
}
