//! One plugin subprocess: JSON-line RPC over stdio, bounded async fan-out
//! and error-score supervision.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{info, warn};

use super::PluginError;
use shared::protocol::{receive_message, send_message};
use shared::rpc::{ExposedCall, Metric, MetricCollector, PluginCommand, PluginResponse, StartResponse};

const ASYNC_QUEUE_SIZE: usize = 100;
const STOP_GRACE: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_millis(500);

pub struct RunnerOptions {
    pub command_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything the plugin reported in its `start` handshake.
#[derive(Debug, Clone, Default)]
struct PluginInfo {
    name: String,
    version: String,
    receivers: Vec<String>,
    exposes: Vec<ExposedCall>,
    metric_collectors: Vec<MetricCollector>,
    metric_receivers: Vec<String>,
}

struct AsyncCommand {
    action: &'static str,
    fields: serde_json::Map<String, Value>,
}

pub struct PluginRunner {
    runtime_path: PathBuf,
    plugin_path: PathBuf,
    command_timeout: Duration,

    info: std::sync::Mutex<PluginInfo>,
    process: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    command_lock: Mutex<()>,
    cid: std::sync::Mutex<u32>,
    responses: Mutex<Option<mpsc::UnboundedReceiver<PluginResponse>>>,
    async_queue: std::sync::Mutex<Option<mpsc::Sender<AsyncCommand>>>,
    stopped: Arc<AtomicBool>,
    commands_executed: AtomicU64,
    commands_failed: AtomicU64,
    collector_runs: std::sync::Mutex<HashMap<String, Instant>>,
}

impl PluginRunner {
    pub fn new(runtime_path: &Path, plugin_path: &Path, options: RunnerOptions) -> Self {
        Self {
            runtime_path: runtime_path.to_path_buf(),
            plugin_path: plugin_path.to_path_buf(),
            command_timeout: options.command_timeout,
            info: std::sync::Mutex::new(PluginInfo::default()),
            process: Mutex::new(None),
            stdin: Mutex::new(None),
            command_lock: Mutex::new(()),
            cid: std::sync::Mutex::new(0),
            responses: Mutex::new(None),
            async_queue: std::sync::Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            commands_executed: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            collector_runs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> String {
        self.info.lock().unwrap().name.clone()
    }

    pub fn version(&self) -> String {
        self.info.lock().unwrap().version.clone()
    }

    pub fn exposed_calls(&self) -> Vec<ExposedCall> {
        self.info.lock().unwrap().exposes.clone()
    }

    pub fn metric_collectors(&self) -> Vec<MetricCollector> {
        self.info.lock().unwrap().metric_collectors.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawn the subprocess, run the `start` handshake and wire the stdout
    /// reader and async sender tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), PluginError> {
        let mut child = Command::new(&self.runtime_path)
            .arg("start")
            .arg(&self.plugin_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Protocol("child has no stdout".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Protocol("child has no stdin".to_string()))?;

        self.stopped.store(false, Ordering::SeqCst);
        self.commands_executed.store(0, Ordering::SeqCst);
        self.commands_failed.store(0, Ordering::SeqCst);
        *self.process.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        *self.responses.lock().await = Some(response_rx);

        let stopped = self.stopped.clone();
        let plugin = self.plugin_path.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match receive_message::<_, PluginResponse>(&mut reader).await {
                    Ok(Some(response)) => {
                        if response.cid == 0 {
                            handle_async_message(&plugin, &response);
                        } else if response_tx.send(response).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("plugin at {plugin:?} closed its stdout");
                        stopped.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(error) => {
                        warn!("unreadable message from plugin at {plugin:?}: {error}");
                    }
                }
            }
        });

        let start = self.do_command("start", serde_json::Map::new()).await?;
        let start: StartResponse = serde_json::from_value(Value::Object(start.fields))
            .map_err(|e| PluginError::Protocol(format!("bad start response: {e}")))?;
        *self.info.lock().unwrap() = PluginInfo {
            name: start.name,
            version: start.version,
            receivers: start.receivers,
            exposes: start.exposes,
            metric_collectors: start.metric_collectors,
            metric_receivers: start.metric_receivers,
        };

        let (async_tx, mut async_rx) = mpsc::channel::<AsyncCommand>(ASYNC_QUEUE_SIZE);
        *self.async_queue.lock().unwrap() = Some(async_tx);
        let runner = self.clone();
        tokio::spawn(async move {
            while let Some(command) = async_rx.recv().await {
                if runner.is_stopped() {
                    break;
                }
                if let Err(error) = runner.do_command(command.action, command.fields).await {
                    warn!("async {} to plugin {} failed: {error}", command.action, runner.name());
                }
            }
        });

        Ok(())
    }

    /// Stop the plugin: ask politely, then SIGTERM, then SIGKILL.
    pub async fn stop(&self) {
        if self.is_stopped() {
            return;
        }

        info!("sending stop command to plugin {}", self.name());
        if let Err(error) = self.do_command("stop", serde_json::Map::new()).await {
            warn!("stop command to plugin {} failed: {error}", self.name());
        }
        tokio::time::sleep(STOP_GRACE).await;

        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            if child.try_wait().ok().flatten().is_none() {
                if let Some(pid) = child.id() {
                    info!("terminating plugin {}", self.name());
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                tokio::time::sleep(TERM_GRACE).await;
                if child.try_wait().ok().flatten().is_none() {
                    info!("killing plugin {}", self.name());
                    let _ = child.kill().await;
                }
            }
            let _ = child.wait().await;
        }
        *process = None;
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn next_cid(&self) -> u32 {
        let mut cid = self.cid.lock().unwrap();
        *cid += 1;
        *cid
    }

    /// One synchronous RPC round trip.
    pub async fn do_command(
        &self,
        action: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<PluginResponse, PluginError> {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        if self.is_stopped() {
            return Err(PluginError::Stopped);
        }

        let _guard = self.command_lock.lock().await;
        let cid = self.next_cid();
        let mut command = PluginCommand::new(cid, action);
        command.fields = fields;

        {
            let mut stdin = self.stdin.lock().await;
            let stdin = stdin.as_mut().ok_or(PluginError::Stopped)?;
            send_message(stdin, &command).await?;
        }

        let mut responses = self.responses.lock().await;
        let responses = responses.as_mut().ok_or(PluginError::Stopped)?;
        let deadline = Instant::now() + self.command_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, responses.recv()).await {
                Ok(Some(response)) if response.cid == cid => return Ok(response),
                Ok(Some(stale)) => {
                    warn!("dropping stale response with cid {}", stale.cid);
                }
                Ok(None) => {
                    self.commands_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(PluginError::Stopped);
                }
                Err(_) => {
                    self.commands_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("plugin {} did not answer {action} in time", self.name());
                    return Err(PluginError::Timeout);
                }
            }
        }
    }

    fn do_async(&self, action: &'static str, fields: serde_json::Map<String, Value>, filter: bool) {
        if self.is_stopped() {
            return;
        }
        if filter && !self.info.lock().unwrap().receivers.iter().any(|r| r == action) {
            return;
        }

        let queue = self.async_queue.lock().unwrap();
        if let Some(queue) = queue.as_ref()
            && queue.try_send(AsyncCommand { action, fields }).is_err()
        {
            warn!("async queue of plugin {} is full", self.name());
        }
    }

    pub fn process_input_status(&self, status: &[(u8, u8)]) {
        let mut fields = serde_json::Map::new();
        fields.insert("status".to_string(), serde_json::json!(status));
        self.do_async("input_status", fields, true);
    }

    pub fn process_output_status(&self, status: &[(u8, u8)]) {
        let mut fields = serde_json::Map::new();
        fields.insert("status".to_string(), serde_json::json!(status));
        self.do_async("output_status", fields, true);
    }

    pub fn process_shutter_status(&self, status: &[u8]) {
        let mut fields = serde_json::Map::new();
        fields.insert("status".to_string(), serde_json::json!(status));
        self.do_async("shutter_status", fields, true);
    }

    pub fn process_event(&self, code: u32) {
        let mut fields = serde_json::Map::new();
        fields.insert("code".to_string(), serde_json::json!(code));
        self.do_async("process_event", fields, true);
    }

    /// Poll the plugin's metric collectors that are due, stamping the
    /// plugin as metric source.
    pub async fn collect_metrics(&self) -> Vec<Metric> {
        let due: Vec<MetricCollector> = {
            let collectors = self.metric_collectors();
            let runs = self.collector_runs.lock().unwrap();
            collectors
                .into_iter()
                .filter(|collector| {
                    runs.get(&collector.name)
                        .map(|last| last.elapsed() >= Duration::from_secs(collector.interval))
                        .unwrap_or(true)
                })
                .collect()
        };

        let mut metrics = Vec::new();
        for collector in due {
            self.collector_runs
                .lock()
                .unwrap()
                .insert(collector.name.clone(), Instant::now());

            let mut fields = serde_json::Map::new();
            fields.insert("name".to_string(), Value::String(collector.name.clone()));
            match self.do_command("collect_metrics", fields).await {
                Ok(response) => {
                    let raw = response
                        .field("metrics")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    for value in raw {
                        match serde_json::from_value::<Metric>(value) {
                            Ok(mut metric) => {
                                metric.source = self.name();
                                metrics.push(metric);
                            }
                            Err(error) => {
                                warn!("bad metric from plugin {}: {error}", self.name());
                            }
                        }
                    }
                }
                Err(error) => warn!("collector {} of plugin {} failed: {error}", collector.name, self.name()),
            }
        }
        metrics
    }

    /// Queue one metric for delivery; returns the number of receivers it
    /// was queued for.
    pub fn distribute_metric(&self, metric: &Metric) -> usize {
        let receivers = self.info.lock().unwrap().metric_receivers.clone();
        for receiver in &receivers {
            let mut fields = serde_json::Map::new();
            fields.insert("name".to_string(), Value::String(receiver.clone()));
            fields.insert(
                "metric".to_string(),
                serde_json::to_value(metric).unwrap_or(Value::Null),
            );
            self.do_async("distribute_metric", fields, false);
        }
        receivers.len()
    }

    pub async fn get_metric_definitions(&self) -> Result<Vec<Value>, PluginError> {
        let response = self.do_command("get_metric_definitions", serde_json::Map::new()).await?;
        Ok(response
            .field("metric_definitions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Proxy one exposed call through the `request` RPC.
    pub async fn request(
        &self,
        method: &str,
        parameters: &serde_json::Map<String, Value>,
    ) -> Result<Value, PluginError> {
        let mut fields = serde_json::Map::new();
        fields.insert("method".to_string(), Value::String(method.to_string()));
        fields.insert("kwargs".to_string(), Value::Object(parameters.clone()));

        let response = self.do_command("request", fields).await?;
        if response.field("success").and_then(Value::as_bool).unwrap_or(false) {
            Ok(response.field("response").cloned().unwrap_or(Value::Null))
        } else {
            let exception = response
                .field("exception")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(PluginError::CallFailed(exception.to_string()))
        }
    }

    /// Failure ratio since the last check; reading resets the counters.
    pub fn error_score(&self) -> f64 {
        let executed = self.commands_executed.swap(0, Ordering::Relaxed);
        let failed = self.commands_failed.swap(0, Ordering::Relaxed);
        if executed == 0 {
            0.0
        } else {
            failed as f64 / executed as f64
        }
    }
}

fn handle_async_message(plugin: &Path, response: &PluginResponse) {
    if response.action == "logs" {
        let logs = response.field("logs").and_then(Value::as_str).unwrap_or_default();
        info!("[{plugin:?}] {logs}");
    } else {
        warn!("unknown async message from plugin at {plugin:?}: {}", response.action);
    }
}

/// Restarts a runner whose error score crosses the threshold.
pub struct RunnerWatchdog {
    runner: Arc<PluginRunner>,
    threshold: f64,
    check_interval: Duration,
}

impl RunnerWatchdog {
    pub fn new(runner: Arc<PluginRunner>) -> Self {
        Self {
            runner,
            threshold: 0.25,
            check_interval: Duration::from_secs(60),
        }
    }

    pub fn start(self) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.check_interval).await;

                let score = self.runner.error_score();
                if score > self.threshold {
                    warn!("stopping unhealthy plugin {} (score {score:.2})", self.runner.name());
                    self.runner.stop().await;
                }
                if self.runner.is_stopped() {
                    info!("restarting stopped plugin {}", self.runner.name());
                    if let Err(error) = self.runner.start().await {
                        warn!("could not restart plugin {}: {error}", self.runner.name());
                    }
                }
            }
        });
    }
}
