use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatewayd::cloud::CloudLoop;
use gatewayd::config::{ConfigController, ConfigError};
use gatewayd::eeprom::controller::EepromController;
use gatewayd::eeprom::extension::EepromExtension;
use gatewayd::eeprom::file::EepromFile;
use gatewayd::eeprom::EepromError;
use gatewayd::gateway::{GatewayApi, GatewayError};
use gatewayd::master::communicator::MasterOptions;
use gatewayd::master::{api as master_api, MasterCommunicator, MasterError};
use gatewayd::metrics::{MetricsCollector, MetricsController};
use gatewayd::plugins::{PluginController, PluginError};
use gatewayd::power::communicator::PowerOptions;
use gatewayd::power::time_keeper::TimeKeeper;
use gatewayd::power::{PowerCommunicator, PowerController, PowerError};
use gatewayd::pulses::PulseCounterController;
use gatewayd::scheduler::{ScheduleExecutor, SchedulerError, SchedulingController};
use gatewayd::serial::SerialDevice;
use gatewayd::storage::{Database, StorageError};

const BAUD_RATE: u32 = 115_200;
const TIME_KEEPER_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
enum GatewaydError {
    #[error("{0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("{0}")]
    Master(#[from] MasterError),
    #[error("{0}")]
    Power(#[from] PowerError),
    #[error("{0}")]
    Eeprom(#[from] EepromError),
    #[error("{0}")]
    Gateway(#[from] GatewayError),
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    Plugin(#[from] PluginError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Runtime settings, from the environment with sensible defaults.
struct Settings {
    master_port: String,
    power_port: String,
    data_dir: PathBuf,
    plugin_runtime: PathBuf,
    plugins_dir: PathBuf,
    cloud_url: Option<String>,
}

impl Settings {
    fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        Self {
            master_port: var("GATEWAY_MASTER_PORT", "/dev/ttyO5"),
            power_port: var("GATEWAY_POWER_PORT", "/dev/ttyO2"),
            data_dir: PathBuf::from(var("GATEWAY_DATA_DIR", "/var/lib/gatewayd")),
            plugin_runtime: PathBuf::from(var(
                "GATEWAY_PLUGIN_RUNTIME",
                "/usr/lib/gatewayd/plugin-runtime",
            )),
            plugins_dir: PathBuf::from(var("GATEWAY_PLUGINS_DIR", "/var/lib/gatewayd/plugins")),
            cloud_url: std::env::var("GATEWAY_CLOUD_URL").ok(),
        }
    }

    fn database(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

/// Executes schedules against the gateway and the plugin host.
struct SystemExecutor {
    gateway: Arc<GatewayApi<SerialDevice>>,
    plugins: Arc<PluginController>,
}

impl ScheduleExecutor for SystemExecutor {
    async fn do_group_action(&self, group_action_id: u8) -> Result<(), SchedulerError> {
        self.gateway
            .do_group_action(group_action_id)
            .await
            .map_err(|e| SchedulerError::Execution(e.to_string()))
    }

    async fn do_basic_action(&self, action_type: u8, action_number: u8) -> Result<(), SchedulerError> {
        self.gateway
            .do_basic_action(action_type, action_number)
            .await
            .map_err(|e| SchedulerError::Execution(e.to_string()))
    }

    async fn do_local_api_call(
        &self,
        name: &str,
        parameters: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SchedulerError> {
        self.plugins
            .request(name, parameters)
            .await
            .map(|_| ())
            .map_err(|e| SchedulerError::Execution(e.to_string()))
    }

    fn local_api_call(&self, name: &str) -> Option<shared::rpc::ExposedCall> {
        self.plugins.exposed_call(name)
    }
}

/// Every long-lived controller of the gateway, wired together once.
struct System {
    master: MasterCommunicator<SerialDevice>,
    power_time_keeper: TimeKeeper<SerialDevice>,
    gateway: Arc<GatewayApi<SerialDevice>>,
    plugins: Arc<PluginController>,
    collector: Arc<MetricsCollector<SerialDevice>>,
    metrics: MetricsController<SerialDevice>,
    scheduler: SchedulingController<SystemExecutor>,
}

impl System {
    async fn start(settings: &Settings) -> Result<Self, GatewaydError> {
        tokio::fs::create_dir_all(&settings.data_dir).await?;

        let master_serial = Arc::new(SerialDevice::open(&settings.master_port, BAUD_RATE)?);
        let power_serial = Arc::new(SerialDevice::open(&settings.power_port, BAUD_RATE)?);

        let master = MasterCommunicator::new(master_serial, MasterOptions::default());
        master.start().await?;

        let power_controller =
            PowerController::new(Database::open(settings.database("power.db"))?).await?;
        let power = PowerCommunicator::new(
            power_serial,
            power_controller.clone(),
            PowerOptions::default(),
        );
        let power_time_keeper = TimeKeeper::new(
            power.clone(),
            power_controller.clone(),
            TIME_KEEPER_PERIOD,
        );
        power_time_keeper.start();

        let extension =
            EepromExtension::new(Database::open(settings.database("eeprom_extensions.db"))?).await?;
        let eeprom = Arc::new(EepromController::new(EepromFile::new(master.clone()), extension));

        let gateway = Arc::new(GatewayApi::new(
            master.clone(),
            power.clone(),
            power_controller.clone(),
            eeprom.clone(),
        ));
        gateway.init_master().await;
        gateway.start_clock_sync();

        let pulses = Arc::new(
            PulseCounterController::new(
                Database::open(settings.database("pulse_counters.db"))?,
                master.clone(),
                eeprom.clone(),
            )
            .await?,
        );

        let config = ConfigController::new(Database::open(settings.database("config.db"))?).await?;

        let plugins = Arc::new(PluginController::new(&settings.plugin_runtime));
        if settings.plugins_dir.is_dir() {
            plugins.start_plugins(&settings.plugins_dir).await?;
        } else {
            info!("no plugin directory at {:?}, skipping plugins", settings.plugins_dir);
        }
        Self::wire_plugin_events(&master, &plugins);

        let collector = Arc::new(MetricsCollector::new(gateway.clone(), pulses.clone()));
        collector.set_plugin_intervals(&plugins.metric_collector_intervals());
        collector.start();

        // Output changes should show up in the metrics before the next poll.
        let wake = collector.clone();
        master.register_background_consumer(master_api::output_list(), 0, move |_| {
            wake.on_output_change();
        });

        let metrics = MetricsController::new(collector.clone(), plugins.clone());
        metrics.load_definitions().await;
        metrics.start();

        let executor = Arc::new(SystemExecutor {
            gateway: gateway.clone(),
            plugins: plugins.clone(),
        });
        let scheduler =
            SchedulingController::new(Database::open(settings.database("schedules.db"))?, executor)
                .await?;
        scheduler.start();

        match &settings.cloud_url {
            Some(url) => {
                CloudLoop::new(url.clone(), gateway.clone(), pulses.clone(), config.clone()).start();
            }
            None => info!("no cloud url configured, heartbeat disabled"),
        }

        Ok(Self {
            master,
            power_time_keeper,
            gateway,
            plugins,
            collector,
            metrics,
            scheduler,
        })
    }

    /// Relay unsolicited master frames to the plugin host.
    fn wire_plugin_events(master: &MasterCommunicator<SerialDevice>, plugins: &Arc<PluginController>) {
        let sink = plugins.clone();
        master.register_background_consumer(master_api::output_list(), 0, move |fields| {
            if let Ok(outputs) = fields.output_list("outputs") {
                sink.process_output_status(outputs);
            }
        });

        let sink = plugins.clone();
        master.register_background_consumer(master_api::input_list(), 0, move |fields| {
            if let (Ok(input), Ok(output)) = (fields.byte("input"), fields.byte("output")) {
                sink.process_input_status(&[(input, output)]);
            }
        });
    }

    async fn shutdown(&self) {
        info!("shutting down");
        self.scheduler.stop();
        self.metrics.stop();
        self.collector.stop();
        self.power_time_keeper.stop();
        self.plugins.stop_plugins().await;
        if self.gateway.in_maintenance_mode()
            && let Err(error) = self.gateway.stop_maintenance_mode().await
        {
            warn!("could not leave maintenance mode on shutdown: {error}");
        }
        self.master.stop();
    }
}

#[tokio::main]
async fn main() -> Result<(), GatewaydError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();
    info!(
        "starting gateway (master {}, power {})",
        settings.master_port, settings.power_port
    );

    let system = System::start(&settings).await?;
    info!("gateway is up");

    tokio::signal::ctrl_c().await?;
    system.shutdown().await;

    Ok(())
}
