//! Out-of-process plugin host.
//!
//! Each plugin runs as a child process speaking JSON lines over stdio; the
//! controller fans status updates and metrics out to every healthy runner.

pub mod runner;

pub use runner::{PluginRunner, RunnerOptions, RunnerWatchdog};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use shared::rpc::{ExposedCall, Metric, MetricDefinition};

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin runner was stopped")]
    Stopped,

    #[error("plugin did not respond in time")]
    Timeout,

    #[error("plugin call failed: {0}")]
    CallFailed(String),

    #[error("unknown exposed call {0}")]
    UnknownCall(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct PluginController {
    runtime_path: PathBuf,
    runners: std::sync::Mutex<Vec<Arc<PluginRunner>>>,
}

impl PluginController {
    pub fn new(runtime_path: impl Into<PathBuf>) -> Self {
        Self {
            runtime_path: runtime_path.into(),
            runners: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start one runner per plugin directory and put it under watchdog
    /// supervision.
    pub async fn start_plugins(&self, plugins_dir: &Path) -> Result<(), PluginError> {
        let mut entries = tokio::fs::read_dir(plugins_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let plugin_path = entry.path();
            let runner = Arc::new(PluginRunner::new(
                &self.runtime_path,
                &plugin_path,
                RunnerOptions::default(),
            ));
            match runner.start().await {
                Ok(()) => {
                    info!("started plugin {}", runner.name());
                    RunnerWatchdog::new(runner.clone()).start();
                    self.register_runner(runner);
                }
                Err(error) => warn!("could not start plugin at {plugin_path:?}: {error}"),
            }
        }
        Ok(())
    }

    pub fn register_runner(&self, runner: Arc<PluginRunner>) {
        self.runners.lock().unwrap().push(runner);
    }

    fn runners(&self) -> Vec<Arc<PluginRunner>> {
        self.runners.lock().unwrap().clone()
    }

    pub async fn stop_plugins(&self) {
        let runners = self.runners();
        join_all(runners.iter().map(|runner| runner.stop())).await;
    }

    /// Fan an input press out to every subscribed plugin.
    pub fn process_input_status(&self, status: &[(u8, u8)]) {
        for runner in self.runners() {
            runner.process_input_status(status);
        }
    }

    pub fn process_output_status(&self, status: &[(u8, u8)]) {
        for runner in self.runners() {
            runner.process_output_status(status);
        }
    }

    pub fn process_shutter_status(&self, status: &[u8]) {
        for runner in self.runners() {
            runner.process_shutter_status(status);
        }
    }

    pub fn process_event(&self, code: u32) {
        for runner in self.runners() {
            runner.process_event(code);
        }
    }

    /// Poll every runner's due metric collectors concurrently.
    pub async fn collect_metrics(&self) -> Vec<Metric> {
        let runners = self.runners();
        join_all(runners.iter().map(|runner| runner.collect_metrics()))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Deliver one metric to every runner that receives metrics; returns
    /// the delivery count.
    pub async fn distribute_metric(&self, metric: &Metric, _definition: &MetricDefinition) -> usize {
        let mut deliveries = 0;
        for runner in self.runners() {
            deliveries += runner.distribute_metric(metric);
        }
        deliveries
    }

    /// Raw metric definitions per plugin; validated by the metrics
    /// controller.
    pub async fn get_metric_definitions(&self) -> HashMap<String, Vec<Value>> {
        let runners = self.runners();
        let results = join_all(
            runners
                .iter()
                .map(|runner| async { (runner.name(), runner.get_metric_definitions().await) }),
        )
        .await;

        let mut definitions = HashMap::new();
        for (name, result) in results {
            match result {
                Ok(list) => {
                    definitions.insert(name, list);
                }
                Err(error) => warn!("plugin {name}: {error}"),
            }
        }
        definitions
    }

    /// The intervals requested by every plugin metric collector, for the
    /// metrics collector's interval negotiation.
    pub fn metric_collector_intervals(&self) -> Vec<(String, u64)> {
        self.runners()
            .iter()
            .flat_map(|runner| runner.metric_collectors())
            .map(|collector| (collector.name, collector.interval))
            .collect()
    }

    /// Find an exposed call by name over all plugins.
    pub fn exposed_call(&self, name: &str) -> Option<ExposedCall> {
        self.runners()
            .iter()
            .flat_map(|runner| runner.exposed_calls())
            .find(|call| call.name == name)
    }

    /// Proxy a request to the plugin exposing `method`.
    pub async fn request(
        &self,
        method: &str,
        parameters: &serde_json::Map<String, Value>,
    ) -> Result<Value, PluginError> {
        let runner = self
            .runners()
            .into_iter()
            .find(|runner| runner.exposed_calls().iter().any(|call| call.name == method))
            .ok_or_else(|| PluginError::UnknownCall(method.to_string()))?;
        runner.request(method, parameters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_controller_is_inert() {
        let controller = PluginController::new("/usr/bin/plugin-runtime");
        assert!(controller.collect_metrics().await.is_empty());
        assert!(controller.get_metric_definitions().await.is_empty());
        assert!(controller.exposed_call("anything").is_none());
        assert!(controller.metric_collector_intervals().is_empty());

        let metric = Metric {
            source: "test".to_string(),
            metric_type: "energy".to_string(),
            metric: "power".to_string(),
            timestamp: 0,
            value: 0.0,
            tags: serde_json::Map::new(),
        };
        let definition = MetricDefinition {
            metric_type: "energy".to_string(),
            name: "power".to_string(),
            description: String::new(),
            mtype: shared::rpc::MetricKind::Gauge,
            unit: String::new(),
            tags: Vec::new(),
        };
        assert_eq!(controller.distribute_metric(&metric, &definition).await, 0);
    }

    #[tokio::test]
    async fn unknown_requests_are_rejected() {
        let controller = PluginController::new("/usr/bin/plugin-runtime");
        let result = controller.request("missing", &serde_json::Map::new()).await;
        assert!(matches!(result, Err(PluginError::UnknownCall(_))));
    }
}
