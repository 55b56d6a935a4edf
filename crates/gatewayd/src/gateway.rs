//! High-level gateway operations composed from the master engine, the power
//! engine and the EEPROM controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::{error, info, warn};

use crate::eeprom::controller::EepromController;
use crate::eeprom::EepromError;
use crate::master::{api, Fields, MasterCommunicator, MasterError, Svt, Value};
use crate::power::{api as power_api, PowerCommunicator, PowerController, PowerError, PowerValue};
use crate::serial::SerialTransport;
use crate::status::{InputStatus, OutputInfo, OutputStatus, ThermostatInfo, ThermostatStatus};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
const EEPROM_TIMEOUT: Duration = Duration::from_secs(2);
const OUTPUT_REFRESH: Duration = Duration::from_secs(600);
const THERMOSTAT_REFRESH: Duration = Duration::from_secs(1800);
const DEFAULT_MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(600);

const OUTPUT_TIMER_VALUES: [u16; 6] = [150, 450, 900, 1500, 2220, 3120];

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Master(#[from] MasterError),

    #[error("{0}")]
    Power(#[from] PowerError),

    #[error("{0}")]
    Eeprom(#[from] EepromError),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::InvalidValue(message.into())
}

/// Master clock, mode and firmware versions.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterStatus {
    pub time: String,
    pub date: String,
    pub mode: u8,
    pub version: String,
    pub hw_version: u8,
}

/// One day of the automatic thermostat program.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatSchedule {
    pub temp_night: f64,
    pub start_d1: String,
    pub stop_d1: String,
    pub temp_d1: f64,
    pub start_d2: String,
    pub stop_d2: String,
    pub temp_d2: f64,
}

/// Full per-thermostat configuration as read from the master.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatDetail {
    pub thermostat: u8,
    pub act: f64,
    pub csetp: f64,
    pub setpoints: Vec<f64>,
    pub sensor_nr: u8,
    pub output0_nr: u8,
    pub output1_nr: u8,
    pub output0: u8,
    pub output1: u8,
    pub outside: f64,
    pub mode: u8,
    pub name: String,
    pub pid_p: u8,
    pub pid_i: u8,
    pub pid_d: u8,
    pub pid_ithresh: u8,
    pub threshold_temp: f64,
    /// Monday..Sunday.
    pub schedule: Vec<ThermostatSchedule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatShort {
    pub thermostat: u8,
    pub act: f64,
    pub csetp: f64,
    pub outside: f64,
    pub mode: u8,
    pub output0: u8,
    pub output1: u8,
    pub name: String,
    pub sensor_nr: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatGroup<S> {
    pub thermostats_on: bool,
    pub automatic: bool,
    pub setpoint: u8,
    pub thermostats: Vec<S>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupAction {
    pub id: u8,
    pub name: String,
}

/// A module that announced itself during discovery mode.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredModule {
    pub id: String,
    pub instruction: String,
    pub module_nr: u8,
}

/// Realtime readings of one power module port.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimePower {
    pub voltage: f64,
    pub frequency: f64,
    pub current: f64,
    pub power: f64,
}

/// Day/night energy counters of one power module port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEnergy {
    pub day: u32,
    pub night: u32,
}

const DAY_KEYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

pub struct GatewayApi<T: SerialTransport> {
    master: MasterCommunicator<T>,
    power: PowerCommunicator<T>,
    power_controller: PowerController,
    eeprom: Arc<EepromController<T>>,
    output_status: Arc<std::sync::Mutex<Option<OutputStatus>>>,
    input_status: Arc<std::sync::Mutex<InputStatus>>,
    thermostat_status: Arc<std::sync::Mutex<Option<ThermostatStatus>>>,
    discovered_modules: Arc<std::sync::Mutex<Vec<DiscoveredModule>>>,
    maintenance_last_send: Arc<std::sync::Mutex<Instant>>,
    maintenance_timeout: Duration,
}

impl<T: SerialTransport> GatewayApi<T> {
    pub fn new(
        master: MasterCommunicator<T>,
        power: PowerCommunicator<T>,
        power_controller: PowerController,
        eeprom: Arc<EepromController<T>>,
    ) -> Self {
        let api = Self {
            master,
            power,
            power_controller,
            eeprom,
            output_status: Arc::new(std::sync::Mutex::new(None)),
            input_status: Arc::new(std::sync::Mutex::new(InputStatus::new())),
            thermostat_status: Arc::new(std::sync::Mutex::new(None)),
            discovered_modules: Arc::new(std::sync::Mutex::new(Vec::new())),
            maintenance_last_send: Arc::new(std::sync::Mutex::new(Instant::now())),
            maintenance_timeout: DEFAULT_MAINTENANCE_TIMEOUT,
        };

        let output_status = api.output_status.clone();
        api.master
            .register_background_consumer(api::output_list(), 0, move |fields| {
                if let Ok(outputs) = fields.output_list("outputs")
                    && let Some(status) = output_status.lock().unwrap().as_mut()
                {
                    status.partial_update(outputs);
                }
            });

        let input_status = api.input_status.clone();
        api.master
            .register_background_consumer(api::input_list(), 0, move |fields| {
                if let (Ok(input), Ok(output)) = (fields.byte("input"), fields.byte("output")) {
                    input_status.lock().unwrap().add_data((input, output));
                }
            });

        let discovered = api.discovered_modules.clone();
        api.master
            .register_background_consumer(api::module_initialize(), 0, move |fields| {
                if let (Ok(id), Ok(instruction), Ok(module_nr)) =
                    (fields.text("id"), fields.text("instr"), fields.byte("module_nr"))
                {
                    info!("module {id} announced itself (instruction {instruction})");
                    discovered.lock().unwrap().push(DiscoveredModule {
                        id,
                        instruction,
                        module_nr,
                    });
                }
            });

        api
    }

    async fn do_master_command(
        &self,
        spec: &crate::master::MasterCommandSpec,
        fields: Fields,
        timeout: Duration,
    ) -> Result<Fields, GatewayError> {
        Ok(self.master.do_command(spec, &fields, timeout).await?)
    }

    /// Execute one basic action on the master.
    pub async fn do_basic_action(
        &self,
        action_type: u8,
        action_number: u8,
    ) -> Result<(), GatewayError> {
        self.do_master_command(
            &api::basic_action(),
            Fields::new()
                .set("action_type", Value::Byte(action_type))
                .set("action_number", Value::Byte(action_number)),
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Configure the master's unsolicited messages: RO disabled, OL and IL
    /// enabled. Communication failures are logged, not fatal.
    pub async fn init_master(&self) {
        if let Err(error) = self.try_init_master().await {
            error!("master initialization failed: {error}");
        }
    }

    async fn try_init_master(&self) -> Result<(), GatewayError> {
        let output = self
            .do_master_command(
                &api::eeprom_list(),
                Fields::new().set("bank", Value::Byte(0)),
                EEPROM_TIMEOUT,
            )
            .await?;
        let data = output.bytes("data")?.to_vec();

        let mut write = false;
        for (address, wanted, what) in [
            (11usize, 0xffu8, "disabling async RO messages"),
            (18, 0x00, "enabling async OL messages"),
            (20, 0x00, "enabling async IL messages"),
        ] {
            if data[address] != wanted {
                info!("{what}");
                self.do_master_command(
                    &api::write_eeprom(),
                    Fields::new()
                        .set("bank", Value::Byte(0))
                        .set("address", Value::Byte(address as u8))
                        .set("data", Value::Bytes(vec![wanted])),
                    EEPROM_TIMEOUT,
                )
                .await?;
                write = true;
            }
        }

        if write {
            self.do_master_command(
                &api::activate_eeprom(),
                Fields::new().set("eep", Value::Byte(0)),
                EEPROM_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }

    /// Push the local wall clock to the master.
    pub async fn sync_master_time(&self) -> Result<(), GatewayError> {
        let now = Local::now();
        self.do_master_command(
            &api::set_time(),
            Fields::new()
                .set("sec", Value::Byte(now.second() as u8))
                .set("min", Value::Byte(now.minute() as u8))
                .set("hours", Value::Byte(now.hour() as u8))
                .set("weekday", Value::Byte(now.weekday().number_from_monday() as u8))
                .set("day", Value::Byte(now.day() as u8))
                .set("month", Value::Byte(now.month() as u8))
                .set("year", Value::Byte((now.year() % 100) as u8)),
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Keep the master clock in sync: once at startup and then daily at
    /// 02:01 (or 03:01 when started before 03:00, so a DST change never
    /// skips the sync).
    pub fn start_clock_sync(self: &Arc<Self>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(error) = gateway.sync_master_time().await {
                    error!("could not set the time on the master: {error}");
                }
                let delay = next_clock_sync_delay(Local::now());
                tokio::time::sleep(delay).await;
            }
        });
    }

    pub async fn get_status(&self) -> Result<MasterStatus, GatewayError> {
        let out = self
            .do_master_command(&api::status(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        Ok(MasterStatus {
            time: format!("{:02}:{:02}", out.byte("hours")?, out.byte("minutes")?),
            date: format!(
                "{:02}/{:02}/{}",
                out.byte("day")?,
                out.byte("month")?,
                out.byte("year")?
            ),
            mode: out.byte("mode")?,
            version: format!("{}.{}.{}", out.byte("f1")?, out.byte("f2")?, out.byte("f3")?),
            hw_version: out.byte("h")?,
        })
    }

    fn output_from_fields(fields: &Fields) -> Result<OutputInfo, MasterError> {
        Ok(OutputInfo {
            output_nr: fields.byte("id")?,
            module_type: fields.text("type")?,
            name: fields.text("name")?,
            light: fields.byte("light")?,
            timer: fields.word("timer")?,
            ctimer: fields.word("ctimer")?,
            status: fields.byte("status")?,
            dimmer: fields.dimmer("dimmer")?,
            controller_out: fields.byte("controller_out")?,
            max_power: fields.byte("max_power")?,
            floor_level: fields.byte("floor_level")?,
        })
    }

    async fn read_outputs(&self) -> Result<Vec<OutputInfo>, GatewayError> {
        let modules = self
            .do_master_command(&api::number_of_io_modules(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        let num_outputs = u16::from(modules.byte("out")?) * 8;

        let mut outputs = Vec::with_capacity(usize::from(num_outputs));
        for output_nr in 0..num_outputs {
            let fields = self
                .do_master_command(
                    &api::read_output(),
                    Fields::new().set("id", Value::Byte(output_nr as u8)),
                    COMMAND_TIMEOUT,
                )
                .await?;
            outputs.push(Self::output_from_fields(&fields)?);
        }
        Ok(outputs)
    }

    /// The status of all outputs, served from the OL-maintained cache.
    pub async fn get_outputs(&self) -> Result<Vec<OutputInfo>, GatewayError> {
        let needs_refresh = match self.output_status.lock().unwrap().as_ref() {
            None => true,
            Some(status) => status.should_refresh(),
        };

        if needs_refresh {
            let outputs = self.read_outputs().await?;
            let mut cache = self.output_status.lock().unwrap();
            match cache.as_mut() {
                Some(status) => status.full_update(outputs),
                None => *cache = Some(OutputStatus::new(outputs, OUTPUT_REFRESH)),
            }
        }

        Ok(self
            .output_status
            .lock()
            .unwrap()
            .as_ref()
            .map(|status| status.get_outputs().to_vec())
            .unwrap_or_default())
    }

    /// Set status, dimmer and timer of one output in a single call.
    pub async fn set_output(
        &self,
        output_nr: u8,
        is_on: bool,
        dimmer: Option<u8>,
        timer: Option<u16>,
    ) -> Result<(), GatewayError> {
        if !is_on {
            if dimmer.is_some() || timer.is_some() {
                return Err(invalid("cannot set timer and dimmer when setting output off"));
            }
            return self.set_output_status(output_nr, false).await;
        }

        if let Some(dimmer) = dimmer {
            self.set_output_dimmer(output_nr, dimmer).await?;
        }
        self.set_output_status(output_nr, true).await?;
        if let Some(timer) = timer {
            self.set_output_timer(output_nr, timer).await?;
        }
        Ok(())
    }

    fn check_output_nr(output_nr: u8) -> Result<(), GatewayError> {
        if output_nr > 240 {
            return Err(invalid(format!("output_nr not in [0, 240]: {output_nr}")));
        }
        Ok(())
    }

    pub async fn set_output_status(&self, output_nr: u8, is_on: bool) -> Result<(), GatewayError> {
        Self::check_output_nr(output_nr)?;
        let action = if is_on { api::BA_LIGHT_ON } else { api::BA_LIGHT_OFF };
        self.do_basic_action(action, output_nr).await
    }

    /// Set the dimmer of an output. Values round down to the nearest
    /// multiple of 10.
    pub async fn set_output_dimmer(&self, output_nr: u8, dimmer: u8) -> Result<(), GatewayError> {
        Self::check_output_nr(output_nr)?;
        if dimmer > 100 {
            return Err(invalid(format!("dimmer not in [0, 100]: {dimmer}")));
        }

        let dimmer = dimmer / 10 * 10;
        let action = match dimmer {
            0 => api::BA_DIMMER_MIN,
            100 => api::BA_DIMMER_MAX,
            other => api::light_on_dimmer_action(other)
                .ok_or_else(|| invalid(format!("no dimmer action for {other}")))?,
        };
        self.do_basic_action(action, output_nr).await
    }

    pub async fn set_output_timer(&self, output_nr: u8, timer: u16) -> Result<(), GatewayError> {
        Self::check_output_nr(output_nr)?;
        let action = api::light_timer_action(timer).ok_or_else(|| {
            invalid(format!("timer not in {OUTPUT_TIMER_VALUES:?}: {timer}"))
        })?;
        self.do_basic_action(action, output_nr).await
    }

    /// Store the floor level of an output directly in the master's EEPROM.
    pub async fn set_output_floor_level(
        &self,
        output_nr: u8,
        floor_level: u8,
    ) -> Result<(), GatewayError> {
        Self::check_output_nr(output_nr)?;
        self.do_master_command(
            &api::write_eeprom(),
            Fields::new()
                .set("bank", Value::Byte(33 + output_nr / 8))
                .set("address", Value::Byte(157 + output_nr % 8))
                .set("data", Value::Bytes(vec![floor_level])),
            EEPROM_TIMEOUT,
        )
        .await?;

        // The floor level must be visible on the next get_outputs.
        if let Some(status) = self.output_status.lock().unwrap().as_mut() {
            status.force_refresh();
        }
        Ok(())
    }

    pub async fn set_all_lights_off(&self) -> Result<(), GatewayError> {
        self.do_basic_action(api::BA_ALL_LIGHTS_OFF, 0).await
    }

    pub async fn set_all_lights_floor_off(&self, floor: u8) -> Result<(), GatewayError> {
        self.do_basic_action(api::BA_LIGHTS_OFF_FLOOR, floor).await
    }

    pub async fn set_all_lights_floor_on(&self, floor: u8) -> Result<(), GatewayError> {
        self.do_basic_action(api::BA_LIGHTS_ON_FLOOR, floor).await
    }

    /// The last five input presses of the past five minutes.
    pub fn get_last_inputs(&self) -> Vec<(u8, u8)> {
        self.input_status.lock().unwrap().get_status()
    }

    fn split_mode(mode: u8) -> (bool, bool, u8) {
        (mode & 128 == 128, mode & 8 == 8, mode & 7)
    }

    async fn thermostat_mode(&self) -> Result<u8, GatewayError> {
        let fields = self
            .do_master_command(&api::thermostat_mode(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        Ok(fields.byte("mode")?)
    }

    fn thermostat_is_active(fields: &Fields) -> Result<bool, MasterError> {
        let sensor_nr = fields.byte("sensor_nr")?;
        let output0_nr = fields.byte("output0_nr")?;
        Ok((sensor_nr < 30 || sensor_nr == 240) && output0_nr < 240)
    }

    fn detail_from_fields(thermostat: u8, fields: &Fields) -> Result<ThermostatDetail, MasterError> {
        let mut schedule = Vec::with_capacity(DAY_KEYS.len());
        for day in DAY_KEYS {
            schedule.push(ThermostatSchedule {
                temp_night: fields.svt(&format!("{day}_temp_n"))?.to_temperature(),
                start_d1: fields.svt(&format!("{day}_start_d1"))?.to_time(),
                stop_d1: fields.svt(&format!("{day}_stop_d1"))?.to_time(),
                temp_d1: fields.svt(&format!("{day}_temp_d1"))?.to_temperature(),
                start_d2: fields.svt(&format!("{day}_start_d2"))?.to_time(),
                stop_d2: fields.svt(&format!("{day}_stop_d2"))?.to_time(),
                temp_d2: fields.svt(&format!("{day}_temp_d2"))?.to_temperature(),
            });
        }

        let mut setpoints = Vec::with_capacity(6);
        for setpoint in 0..6 {
            setpoints.push(fields.svt(&format!("psetp{setpoint}"))?.to_temperature());
        }

        Ok(ThermostatDetail {
            thermostat,
            act: fields.svt("act")?.to_temperature(),
            csetp: fields.svt("csetp")?.to_temperature(),
            setpoints,
            sensor_nr: fields.byte("sensor_nr")?,
            output0_nr: fields.byte("output0_nr")?,
            output1_nr: fields.byte("output1_nr")?,
            output0: api::dimmer_to_percentage(fields.byte("output0")?),
            output1: api::dimmer_to_percentage(fields.byte("output1")?),
            outside: fields.svt("outside")?.to_temperature(),
            mode: fields.byte("mode")?,
            name: fields.text("name")?,
            pid_p: fields.byte("pid_p")?,
            pid_i: fields.byte("pid_i")?,
            pid_d: fields.byte("pid_d")?,
            pid_ithresh: fields.byte("pid_ithresh")?,
            threshold_temp: fields.svt("threshold_temp")?.to_temperature(),
            schedule,
        })
    }

    /// Full configuration of every active thermostat.
    pub async fn get_thermostats(&self) -> Result<ThermostatGroup<ThermostatDetail>, GatewayError> {
        let (thermostats_on, automatic, setpoint) = Self::split_mode(self.thermostat_mode().await?);

        let mut thermostats = Vec::new();
        for thermostat in 0..24u8 {
            let fields = self
                .do_master_command(
                    &api::read_setpoint(),
                    Fields::new().set("thermostat", Value::Byte(thermostat)),
                    COMMAND_TIMEOUT,
                )
                .await?;
            if Self::thermostat_is_active(&fields)? {
                thermostats.push(Self::detail_from_fields(thermostat, &fields)?);
            }
        }

        Ok(ThermostatGroup { thermostats_on, automatic, setpoint, thermostats })
    }

    async fn get_all_thermostat_infos(&self) -> Result<Vec<ThermostatInfo>, GatewayError> {
        let mut infos = Vec::with_capacity(24);
        for thermostat in 0..24u8 {
            let fields = self
                .do_master_command(
                    &api::read_setpoint(),
                    Fields::new().set("thermostat", Value::Byte(thermostat)),
                    COMMAND_TIMEOUT,
                )
                .await?;
            infos.push(ThermostatInfo {
                active: Self::thermostat_is_active(&fields)?,
                sensor_nr: fields.byte("sensor_nr")?,
                output0_nr: fields.byte("output0_nr")?,
                output1_nr: fields.byte("output1_nr")?,
                name: fields.text("name")?,
            });
        }
        Ok(infos)
    }

    /// Live temperatures and setpoints, combined with the slow-changing
    /// thermostat info cache and the output states.
    pub async fn get_thermostats_short(
        &self,
    ) -> Result<ThermostatGroup<ThermostatShort>, GatewayError> {
        let needs_refresh = match self.thermostat_status.lock().unwrap().as_ref() {
            None => true,
            Some(status) => status.should_refresh(),
        };
        if needs_refresh {
            let infos = self.get_all_thermostat_infos().await?;
            let mut cache = self.thermostat_status.lock().unwrap();
            match cache.as_mut() {
                Some(status) => status.update(infos),
                None => *cache = Some(ThermostatStatus::new(infos, THERMOSTAT_REFRESH)),
            }
        }
        let cached: Vec<ThermostatInfo> = self
            .thermostat_status
            .lock()
            .unwrap()
            .as_ref()
            .map(|status| status.get_thermostats().to_vec())
            .unwrap_or_default();

        let info = self
            .do_master_command(&api::thermostat_list(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        let mode = info.byte("mode")?;
        let (thermostats_on, automatic, setpoint) = Self::split_mode(mode);
        let outside = info.svt("outside")?.to_temperature();
        let outputs = self.get_outputs().await?;

        let output_level = |output_nr: u8| -> u8 {
            match outputs.get(usize::from(output_nr)) {
                Some(output) if output.status == 1 => output.dimmer,
                _ => 0,
            }
        };

        let mut thermostats = Vec::new();
        for (thermostat, cached) in cached.iter().enumerate().take(24) {
            if !cached.active {
                continue;
            }
            thermostats.push(ThermostatShort {
                thermostat: thermostat as u8,
                act: info.svt(&format!("tmp{thermostat}"))?.to_temperature(),
                csetp: info.svt(&format!("setp{thermostat}"))?.to_temperature(),
                outside,
                mode,
                output0: output_level(cached.output0_nr),
                output1: output_level(cached.output1_nr),
                name: cached.name.clone(),
                sensor_nr: cached.sensor_nr,
            });
        }

        Ok(ThermostatGroup { thermostats_on, automatic, setpoint, thermostats })
    }

    fn check_thermostat(thermostat: u8) -> Result<(), GatewayError> {
        if thermostat > 24 {
            return Err(invalid(format!("thermostat not in [0, 24]: {thermostat}")));
        }
        Ok(())
    }

    async fn write_setpoint(
        &self,
        thermostat: u8,
        config: u8,
        temperature: Svt,
    ) -> Result<f64, GatewayError> {
        let fields = self
            .do_master_command(
                &api::write_setpoint(),
                Fields::new()
                    .set("thermostat", Value::Byte(thermostat))
                    .set("config", Value::Byte(config))
                    .set("temp", Value::Svt(temperature)),
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(fields.svt("temp")?.to_temperature())
    }

    /// Set the current setpoint of a thermostat.
    pub async fn set_current_setpoint(
        &self,
        thermostat: u8,
        temperature: f64,
    ) -> Result<f64, GatewayError> {
        Self::check_thermostat(thermostat)?;
        self.write_setpoint(thermostat, 0, Svt::temperature(temperature)?).await
    }

    /// Set one of the six programmed setpoints of a thermostat.
    pub async fn set_programmed_setpoint(
        &self,
        thermostat: u8,
        setpoint: u8,
        temperature: f64,
    ) -> Result<f64, GatewayError> {
        Self::check_thermostat(thermostat)?;
        if setpoint > 5 {
            return Err(invalid(format!("setpoint not in [0, 5]: {setpoint}")));
        }

        let written = self
            .write_setpoint(thermostat, setpoint + 1, Svt::temperature(temperature)?)
            .await?;

        // Re-apply the mode so a manual thermostat sitting on this setpoint
        // picks up the new value.
        let (on, automatic, csetp) = Self::split_mode(self.thermostat_mode().await?);
        if !automatic && csetp == setpoint {
            self.set_thermostat_mode(on, automatic, csetp).await?;
        }
        Ok(written)
    }

    /// Program one weekday of a thermostat's automatic schedule.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_thermostat_automatic_configuration(
        &self,
        thermostat: u8,
        day_of_week: u8,
        temperature_night: f64,
        start_time_day1: &str,
        stop_time_day1: &str,
        temperature_day1: f64,
        start_time_day2: &str,
        stop_time_day2: &str,
        temperature_day2: f64,
    ) -> Result<(), GatewayError> {
        Self::check_thermostat(thermostat)?;
        if !(1..=7).contains(&day_of_week) {
            return Err(invalid(format!("day of week not in [1, 7]: {day_of_week}")));
        }
        let day = day_of_week - 1;

        for (config, temperature) in [
            (18 + day * 4, Svt::time(start_time_day1)?),
            (19 + day * 4, Svt::time(stop_time_day1)?),
            (20 + day * 4, Svt::time(start_time_day2)?),
            (21 + day * 4, Svt::time(stop_time_day2)?),
            (46 + day, Svt::temperature(temperature_day1)?),
            (53 + day, Svt::temperature(temperature_day2)?),
            (60 + day, Svt::temperature(temperature_night)?),
        ] {
            self.write_setpoint(thermostat, config, temperature).await?;
        }

        // An automatic thermostat needs a mode nudge to load the new program.
        let (on, automatic, csetp) = Self::split_mode(self.thermostat_mode().await?);
        if automatic {
            self.set_thermostat_mode(on, automatic, csetp).await?;
        }
        Ok(())
    }

    /// Switch the thermostats on/off, between automatic and manual, and to
    /// one of the six setpoints.
    pub async fn set_thermostat_mode(
        &self,
        _thermostat_on: bool,
        automatic: bool,
        setpoint: u8,
    ) -> Result<(), GatewayError> {
        if setpoint > 5 {
            return Err(invalid(format!("setpoint not in [0, 5]: {setpoint}")));
        }

        let checked = |fields: Fields| -> Result<(), GatewayError> {
            if fields.text("resp")? != "OK" {
                return Err(invalid("setting thermostat mode did not return OK"));
            }
            Ok(())
        };

        if automatic {
            checked(
                self.do_master_command(
                    &api::basic_action(),
                    Fields::new()
                        .set("action_type", Value::Byte(api::BA_THERMOSTAT_AUTOMATIC))
                        .set("action_number", Value::Byte(255)),
                    COMMAND_TIMEOUT,
                )
                .await?,
            )?;
        } else {
            checked(
                self.do_master_command(
                    &api::basic_action(),
                    Fields::new()
                        .set("action_type", Value::Byte(api::BA_THERMOSTAT_AUTOMATIC))
                        .set("action_number", Value::Byte(0)),
                    COMMAND_TIMEOUT,
                )
                .await?,
            )?;
            let action = api::all_setpoint_action(setpoint)
                .ok_or_else(|| invalid(format!("no setpoint action for {setpoint}")))?;
            checked(
                self.do_master_command(
                    &api::basic_action(),
                    Fields::new()
                        .set("action_type", Value::Byte(action))
                        .set("action_number", Value::Byte(0)),
                    COMMAND_TIMEOUT,
                )
                .await?,
            )?;
        }
        Ok(())
    }

    /// Set the outside temperature threshold below which heating engages.
    pub async fn set_thermostat_threshold(&self, threshold: f64) -> Result<(), GatewayError> {
        self.do_master_command(
            &api::write_eeprom(),
            Fields::new()
                .set("bank", Value::Byte(0))
                .set("address", Value::Byte(17))
                .set("data", Value::Bytes(vec![Svt::temperature(threshold)?.as_byte()])),
            EEPROM_TIMEOUT,
        )
        .await?;
        self.do_master_command(
            &api::activate_eeprom(),
            Fields::new().set("eep", Value::Byte(0)),
            EEPROM_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Execute a group action.
    pub async fn do_group_action(&self, group_action_id: u8) -> Result<(), GatewayError> {
        if group_action_id > 159 {
            return Err(invalid(format!("group_action_id not in [0, 160]: {group_action_id}")));
        }
        self.do_basic_action(api::BA_GROUP_ACTION, group_action_id).await
    }

    /// The ids and names of all 160 group actions.
    pub async fn get_group_actions(&self) -> Result<Vec<GroupAction>, GatewayError> {
        let mut names = Vec::with_capacity(160);
        for bank in 158..168u8 {
            let data = self
                .do_master_command(
                    &api::eeprom_list(),
                    Fields::new().set("bank", Value::Byte(bank)),
                    EEPROM_TIMEOUT,
                )
                .await?;
            let data = data.bytes("data")?.to_vec();
            for offset in (0..256).step_by(16) {
                let name: Vec<u8> = data[offset..offset + 16]
                    .iter()
                    .copied()
                    .filter(|b| *b != 0xff)
                    .collect();
                names.push(String::from_utf8_lossy(&name).to_string());
            }
        }

        Ok(names
            .into_iter()
            .take(160)
            .enumerate()
            .map(|(id, name)| GroupAction { id: id as u8, name })
            .collect())
    }

    /// Dump all 256 EEPROM banks into one 64 KiB image.
    pub async fn get_master_backup(&self) -> Result<Vec<u8>, GatewayError> {
        let mut backup = Vec::with_capacity(256 * 256);
        for bank in 0..=255u8 {
            let data = self
                .do_master_command(
                    &api::eeprom_list(),
                    Fields::new().set("bank", Value::Byte(bank)),
                    EEPROM_TIMEOUT,
                )
                .await?;
            backup.extend_from_slice(data.bytes("data")?);
        }
        Ok(backup)
    }

    /// Restore a 64 KiB EEPROM image, writing only the differing chunks.
    /// Returns the `B<bank>A<address>` markers of every write plus an
    /// activation marker.
    pub async fn master_restore(&self, data: &[u8]) -> Result<Vec<String>, GatewayError> {
        if data.len() != 256 * 256 {
            return Err(invalid(format!("backup must be 65536 bytes, got {}", data.len())));
        }

        let mut written = Vec::new();
        for bank in 0..=255u8 {
            let current = self
                .do_master_command(
                    &api::eeprom_list(),
                    Fields::new().set("bank", Value::Byte(bank)),
                    EEPROM_TIMEOUT,
                )
                .await?;
            let current = current.bytes("data")?.to_vec();

            for address in (0..256).step_by(10) {
                let end = (address + 10).min(256);
                let original = &current[address..end];
                let wanted = &data[usize::from(bank) * 256 + address..usize::from(bank) * 256 + end];
                if original != wanted {
                    written.push(format!("B{bank}A{address}"));
                    self.do_master_command(
                        &api::write_eeprom(),
                        Fields::new()
                            .set("bank", Value::Byte(bank))
                            .set("address", Value::Byte(address as u8))
                            .set("data", Value::Bytes(wanted.to_vec())),
                        EEPROM_TIMEOUT,
                    )
                    .await?;
                }
            }
        }

        self.do_master_command(
            &api::activate_eeprom(),
            Fields::new().set("eep", Value::Byte(0)),
            EEPROM_TIMEOUT,
        )
        .await?;
        written.push("Activated eeprom".to_string());

        self.eeprom.file().invalidate_cache().await;
        Ok(written)
    }

    /// Reset the master (used around firmware updates).
    pub async fn master_reset(&self) -> Result<(), GatewayError> {
        self.do_master_command(&api::reset(), Fields::new(), COMMAND_TIMEOUT).await?;
        Ok(())
    }

    pub async fn set_master_status_leds(&self, status: bool) -> Result<(), GatewayError> {
        self.do_basic_action(api::BA_STATUS_LEDS, if status { 1 } else { 0 }).await
    }

    /// Put the master in module discovery mode; MI announcements are
    /// collected until discovery is stopped.
    pub async fn module_discover_start(&self) -> Result<(), GatewayError> {
        self.discovered_modules.lock().unwrap().clear();
        self.do_master_command(&api::module_discover_start(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn module_discover_stop(&self) -> Result<(), GatewayError> {
        self.do_master_command(&api::module_discover_stop(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    pub fn get_discovered_modules(&self) -> Vec<DiscoveredModule> {
        self.discovered_modules.lock().unwrap().clone()
    }

    /// Enter maintenance mode. The mode exits automatically when no data is
    /// sent for the configured timeout.
    pub async fn start_maintenance_mode(self: &Arc<Self>) -> Result<(), GatewayError> {
        if let Err(error) = self.set_master_status_leds(true).await {
            warn!("could not switch status leds on before maintenance mode: {error}");
        }

        self.master.start_maintenance_mode().await?;
        *self.maintenance_last_send.lock().unwrap() = Instant::now();

        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                let last_send = *gateway.maintenance_last_send.lock().unwrap();
                let deadline = last_send + gateway.maintenance_timeout;
                let now = Instant::now();
                if now >= deadline {
                    if gateway.master.in_maintenance_mode() {
                        info!("maintenance mode timed out, closing it");
                        if let Err(error) = gateway.stop_maintenance_mode().await {
                            warn!("could not close maintenance mode: {error}");
                        }
                    }
                    break;
                }
                tokio::time::sleep(deadline - now).await;
                if !gateway.master.in_maintenance_mode() {
                    break;
                }
            }
        });
        Ok(())
    }

    pub async fn send_maintenance_data(&self, data: &[u8]) -> Result<(), GatewayError> {
        *self.maintenance_last_send.lock().unwrap() = Instant::now();
        Ok(self.master.send_maintenance_data(data).await?)
    }

    pub async fn get_maintenance_data(&self) -> Result<Option<Vec<u8>>, GatewayError> {
        Ok(self.master.get_maintenance_data().await?)
    }

    /// Leave maintenance mode and refresh every cache the CLI session may
    /// have invalidated.
    pub async fn stop_maintenance_mode(&self) -> Result<(), GatewayError> {
        self.master.stop_maintenance_mode().await?;

        if let Some(status) = self.output_status.lock().unwrap().as_mut() {
            status.force_refresh();
        }
        if let Some(status) = self.thermostat_status.lock().unwrap().as_mut() {
            status.force_refresh();
        }

        if let Err(error) = self.set_master_status_leds(false).await {
            warn!("could not switch status leds off after maintenance mode: {error}");
        }
        Ok(())
    }

    pub fn in_maintenance_mode(&self) -> bool {
        self.master.in_maintenance_mode()
    }

    /// Temperatures of the 32 sensors, in degrees Celsius.
    pub async fn get_sensor_temperatures(&self) -> Result<Vec<f64>, GatewayError> {
        let fields = self
            .do_master_command(&api::sensor_temperature_list(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        let mut values = Vec::with_capacity(32);
        for sensor in 0..32 {
            values.push(fields.svt(&format!("tmp{sensor}"))?.to_temperature());
        }
        Ok(values)
    }

    /// Humidity of the 32 sensors in percent; 255.0 marks an absent sensor.
    pub async fn get_sensor_humidities(&self) -> Result<Vec<f64>, GatewayError> {
        let fields = self
            .do_master_command(&api::sensor_humidity_list(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        let mut values = Vec::with_capacity(32);
        for sensor in 0..32 {
            values.push(fields.humidity(&format!("hum{sensor}"))?);
        }
        Ok(values)
    }

    /// Brightness of the 32 sensors in percent.
    pub async fn get_sensor_brightness(&self) -> Result<Vec<u8>, GatewayError> {
        let fields = self
            .do_master_command(&api::sensor_brightness_list(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        let mut values = Vec::with_capacity(32);
        for sensor in 0..32 {
            values.push(fields.byte(&format!("bri{sensor}"))?);
        }
        Ok(values)
    }

    /// Error counters of every input and output module.
    pub async fn get_errors(&self) -> Result<Vec<(String, u16)>, GatewayError> {
        let fields = self
            .do_master_command(&api::error_list(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        Ok(fields.error_list("errors")?.to_vec())
    }

    pub async fn clear_errors(&self) -> Result<(), GatewayError> {
        self.do_master_command(&api::clear_error_list(), Fields::new(), COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn get_power_modules(&self) -> Result<Vec<crate::power::controller::PowerModule>, GatewayError> {
        Ok(self.power_controller.get_power_modules().await?)
    }

    /// Live voltage/frequency/current/power per port of every power module.
    pub async fn get_realtime_power(
        &self,
    ) -> Result<HashMap<i64, Vec<RealtimePower>>, GatewayError> {
        let mut result = HashMap::new();
        for module in self.power_controller.get_power_modules().await? {
            let ports = power_api::num_ports(module.version)?;

            let voltage = self
                .power
                .do_command(module.address, &power_api::get_voltage(), &[])
                .await?
                .first()
                .map(PowerValue::as_f64)
                .unwrap_or(0.0);
            let frequency = self
                .power
                .do_command(module.address, &power_api::get_frequency(), &[])
                .await?
                .first()
                .map(PowerValue::as_f64)
                .unwrap_or(0.0);
            let current = self
                .power
                .do_command(module.address, &power_api::get_current(module.version)?, &[])
                .await?;
            let power = self
                .power
                .do_command(module.address, &power_api::get_power(module.version)?, &[])
                .await?;

            let mut readings = Vec::with_capacity(ports);
            for port in 0..ports {
                readings.push(RealtimePower {
                    voltage,
                    frequency,
                    current: current.get(port).map(PowerValue::as_f64).unwrap_or(0.0),
                    power: power.get(port).map(PowerValue::as_f64).unwrap_or(0.0),
                });
            }
            result.insert(module.id, readings);
        }
        Ok(result)
    }

    /// Day and night energy counters per port of every power module.
    pub async fn get_total_energy(&self) -> Result<HashMap<i64, Vec<PortEnergy>>, GatewayError> {
        let mut result = HashMap::new();
        for module in self.power_controller.get_power_modules().await? {
            let ports = power_api::num_ports(module.version)?;
            let day = self
                .power
                .do_command(module.address, &power_api::get_day_energy(module.version)?, &[])
                .await?;
            let night = self
                .power
                .do_command(module.address, &power_api::get_night_energy(module.version)?, &[])
                .await?;

            let as_u32 = |value: Option<&PowerValue>| match value {
                Some(PowerValue::U32(v)) => *v,
                _ => 0,
            };
            let mut energy = Vec::with_capacity(ports);
            for port in 0..ports {
                energy.push(PortEnergy {
                    day: as_u32(day.get(port)),
                    night: as_u32(night.get(port)),
                });
            }
            result.insert(module.id, energy);
        }
        Ok(result)
    }

    pub async fn set_power_voltage(&self, module_id: i64, voltage: f64) -> Result<(), GatewayError> {
        let address = self
            .power_controller
            .get_address(module_id)
            .await?
            .ok_or_else(|| invalid(format!("unknown power module {module_id}")))?;
        self.power
            .do_command(address, &power_api::set_voltage(), &[PowerValue::F32(voltage as f32)])
            .await?;
        Ok(())
    }

    pub fn start_power_address_mode(&self) -> Result<(), GatewayError> {
        Ok(self.power.start_address_mode()?)
    }

    pub async fn stop_power_address_mode(&self) -> Result<(), GatewayError> {
        Ok(self.power.stop_address_mode().await?)
    }

    pub fn in_power_address_mode(&self) -> bool {
        self.power.in_address_mode()
    }

    pub fn master_communicator(&self) -> &MasterCommunicator<T> {
        &self.master
    }

    pub fn eeprom(&self) -> &Arc<EepromController<T>> {
        &self.eeprom
    }
}

/// Time until the next master clock sync: 03:01 when it is still before
/// 03:00, otherwise 02:01 tomorrow. Never less than a minute.
pub fn next_clock_sync_delay(now: DateTime<Local>) -> Duration {
    let today = now.date_naive();
    let target = if now.hour() < 3 {
        today.and_hms_opt(3, 1, 0)
    } else {
        today.succ_opt().and_then(|day| day.and_hms_opt(2, 1, 0))
    };

    let seconds = target
        .map(|target| (target - now.naive_local()).num_seconds())
        .unwrap_or(0);
    Duration::from_secs(seconds.max(60) as u64)
}
