//! The master command table.
//!
//! One constructor per API call, mirroring the firmware's command set. The
//! reader's prefix registry is keyed on the 2-byte action of these specs.

use super::command::{Field, MasterCommandSpec, decode_dimmer};

pub const BA_GROUP_ACTION: u8 = 2;

pub const BA_STATUS_LEDS: u8 = 64;

pub const BA_ALL_SETPOINT_0: u8 = 134;
pub const BA_THERMOSTAT_MODE: u8 = 140;
pub const BA_THERMOSTAT_AUTOMATIC: u8 = 141;

pub const BA_LIGHT_OFF: u8 = 160;
pub const BA_LIGHT_ON: u8 = 161;
pub const BA_LIGHT_TOGGLE: u8 = 162;
pub const BA_ALL_LIGHTS_OFF: u8 = 163;
pub const BA_ALL_OUTPUTS_OFF: u8 = 164;
pub const BA_DIMMER_MIN: u8 = 169;
pub const BA_DIMMER_MAX: u8 = 170;
pub const BA_LIGHTS_OFF_FLOOR: u8 = 171;
pub const BA_LIGHTS_ON_FLOOR: u8 = 172;
pub const BA_LIGHTS_TOGGLE_FLOOR: u8 = 173;

/// Setpoint actions are laid out consecutively from
/// [`BA_ALL_SETPOINT_0`].
pub fn all_setpoint_action(setpoint: u8) -> Option<u8> {
    (setpoint <= 5).then(|| BA_ALL_SETPOINT_0 + setpoint)
}

/// "Light on at N percent" actions, laid out consecutively for the decades
/// 10..=90.
pub fn light_on_dimmer_action(dimmer: u8) -> Option<u8> {
    match dimmer {
        10 | 20 | 30 | 40 | 50 | 60 | 70 | 80 | 90 => Some(176 + (dimmer / 10 - 1)),
        _ => None,
    }
}

/// "Light on with overrule timer" actions for the supported durations.
pub fn light_timer_action(timer: u16) -> Option<u8> {
    let index = [150u16, 450, 900, 1500, 2220, 3120]
        .iter()
        .position(|t| *t == timer)?;
    Some(195 + index as u8)
}

pub fn dimmer_to_percentage(dimmer_value: u8) -> u8 {
    decode_dimmer(dimmer_value)
}

/// Basic actions.
pub fn basic_action() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"BA",
        vec![Field::byte("action_type"), Field::byte("action_number"), Field::padding(11)],
        vec![Field::str("resp", 2), Field::padding(11), Field::lit(b"\r\n")],
    )
}

/// Reset the master, used for firmware updates.
pub fn reset() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"re",
        vec![Field::padding(13)],
        vec![Field::str("resp", 2), Field::padding(11), Field::lit(b"\r\n")],
    )
}

/// Get the status of the master.
pub fn status() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"ST",
        vec![Field::padding(13)],
        vec![
            Field::byte("seconds"), Field::byte("minutes"), Field::byte("hours"),
            Field::byte("weekday"), Field::byte("day"), Field::byte("month"),
            Field::byte("year"), Field::lit(b"\x00"), Field::byte("mode"),
            Field::byte("f1"), Field::byte("f2"), Field::byte("f3"),
            Field::byte("h"), Field::lit(b"\r\n"),
        ],
    )
}

/// Set the time on the master.
pub fn set_time() -> MasterCommandSpec {
    let fields = || {
        vec![
            Field::byte("sec"), Field::byte("min"), Field::byte("hours"),
            Field::byte("weekday"), Field::byte("day"), Field::byte("month"),
            Field::byte("year"), Field::padding(6),
        ]
    };
    MasterCommandSpec::new(*b"st", fields(), fields())
}

/// List all bytes of one eeprom bank.
pub fn eeprom_list() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"EL",
        vec![Field::byte("bank"), Field::padding(12)],
        vec![Field::byte("bank"), Field::str("data", 256)],
    )
}

/// Read 1-10 bytes from an eeprom bank and address.
pub fn read_eeprom() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"RE",
        vec![Field::byte("bank"), Field::byte("addr"), Field::byte("num"), Field::padding(10)],
        vec![Field::byte("bank"), Field::byte("addr"), Field::byte("num"), Field::str("data", 10)],
    )
}

/// Write up to 10 bytes to an eeprom bank.
pub fn write_eeprom() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"WE",
        vec![Field::byte("bank"), Field::byte("address"), Field::varstr("data", 10)],
        vec![
            Field::byte("bank"), Field::byte("address"), Field::varstr("data", 10),
            Field::lit(b"\r\n"),
        ],
    )
}

/// Activate the eeprom after writes.
pub fn activate_eeprom() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"AE",
        vec![Field::byte("eep"), Field::padding(12)],
        vec![Field::byte("eep"), Field::str("resp", 2), Field::padding(10), Field::lit(b"\r\n")],
    )
}

/// Read the number of input and output modules.
pub fn number_of_io_modules() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"rn",
        vec![Field::padding(13)],
        vec![Field::byte("in"), Field::byte("out"), Field::padding(11), Field::lit(b"\r\n")],
    )
}

/// Read the information about an output.
pub fn read_output() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"ro",
        vec![Field::byte("id"), Field::padding(12)],
        vec![
            Field::byte("id"), Field::str("type", 1), Field::byte("light"),
            Field::word("timer"), Field::word("ctimer"), Field::byte("status"),
            Field::dimmer("dimmer"), Field::byte("controller_out"),
            Field::byte("max_power"), Field::byte("floor_level"),
            Field::bytes("menu_position", 3), Field::str("name", 16),
            Field::crc(), Field::lit(b"\r\n\r\n"),
        ],
    )
}

/// Read the information about an input.
pub fn read_input() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"ri",
        vec![Field::byte("input_nr"), Field::padding(12)],
        vec![
            Field::byte("input_nr"), Field::byte("output_action"),
            Field::bytes("output_list", 30), Field::str("input_name", 8),
            Field::crc(), Field::lit(b"\r\n\r\n"),
        ],
    )
}

fn svt_series(names: &[&'static str]) -> Vec<Field> {
    names.iter().copied().map(Field::svt).collect()
}

/// Read the temperature sensors of one series of 12 thermostats.
pub fn temperature_list() -> MasterCommandSpec {
    let mut output = vec![Field::byte("series")];
    output.extend(svt_series(&[
        "tmp0", "tmp1", "tmp2", "tmp3", "tmp4", "tmp5", "tmp6", "tmp7", "tmp8", "tmp9", "tmp10",
        "tmp11",
    ]));
    output.push(Field::lit(b"\r\n"));
    MasterCommandSpec::new(*b"TL", vec![Field::byte("series"), Field::padding(12)], output)
}

/// Read the current setpoints of one series of 12 thermostats.
pub fn setpoint_list() -> MasterCommandSpec {
    let mut output = vec![Field::byte("series")];
    output.extend(svt_series(&[
        "tmp0", "tmp1", "tmp2", "tmp3", "tmp4", "tmp5", "tmp6", "tmp7", "tmp8", "tmp9", "tmp10",
        "tmp11",
    ]));
    output.push(Field::lit(b"\r\n"));
    MasterCommandSpec::new(*b"SL", vec![Field::byte("series"), Field::padding(12)], output)
}

/// Read the current thermostat mode.
pub fn thermostat_mode() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"TM",
        vec![Field::padding(13)],
        vec![Field::byte("mode"), Field::padding(12), Field::lit(b"\r\n")],
    )
}

/// Read the full programmed setpoint of a thermostat.
pub fn read_setpoint() -> MasterCommandSpec {
    let mut output = vec![Field::byte("thermostat")];
    output.extend(svt_series(&["act", "csetp", "psetp0", "psetp1", "psetp2", "psetp3", "psetp4", "psetp5"]));
    output.extend([
        Field::byte("sensor_nr"), Field::byte("output0_nr"), Field::byte("output1_nr"),
        Field::byte("output0"), Field::byte("output1"),
    ]);
    output.extend(svt_series(&["outside"]));
    output.push(Field::byte("mode"));
    output.push(Field::str("name", 16));
    output.extend([
        Field::byte("pid_p"), Field::byte("pid_i"), Field::byte("pid_d"),
        Field::byte("pid_ithresh"),
    ]);
    output.extend(svt_series(&["threshold_temp"]));
    output.extend([Field::byte("days"), Field::byte("hours"), Field::byte("minutes")]);
    output.extend(svt_series(&[
        "mon_start_d1", "mon_stop_d1", "mon_start_d2", "mon_stop_d2",
        "tue_start_d1", "tue_stop_d1", "tue_start_d2", "tue_stop_d2",
        "wed_start_d1", "wed_stop_d1", "wed_start_d2", "wed_stop_d2",
        "thu_start_d1", "thu_stop_d1", "thu_start_d2", "thu_stop_d2",
        "fri_start_d1", "fri_stop_d1", "fri_start_d2", "fri_stop_d2",
        "sat_start_d1", "sat_stop_d1", "sat_start_d2", "sat_stop_d2",
        "sun_start_d1", "sun_stop_d1", "sun_start_d2", "sun_stop_d2",
    ]));
    output.push(Field::lit(b"T"));
    output.extend(svt_series(&[
        "mon_temp_d1", "tue_temp_d1", "wed_temp_d1", "thu_temp_d1", "fri_temp_d1",
        "sat_temp_d1", "sun_temp_d1",
        "mon_temp_d2", "tue_temp_d2", "wed_temp_d2", "thu_temp_d2", "fri_temp_d2",
        "sat_temp_d2", "sun_temp_d2",
        "mon_temp_n", "tue_temp_n", "wed_temp_n", "thu_temp_n", "fri_temp_n",
        "sat_temp_n", "sun_temp_n",
    ]));
    output.push(Field::crc());
    output.push(Field::lit(b"\r\n\r\n"));

    MasterCommandSpec::new(*b"rs", vec![Field::byte("thermostat"), Field::padding(12)], output)
}

/// Write one setpoint of a thermostat.
pub fn write_setpoint() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"ws",
        vec![
            Field::byte("thermostat"), Field::byte("config"), Field::svt("temp"),
            Field::padding(10),
        ],
        vec![
            Field::byte("thermostat"), Field::byte("config"), Field::svt("temp"),
            Field::padding(10), Field::lit(b"\r\n"),
        ],
    )
}

/// Read the mode, the outside temperature and every thermostat's temperature
/// and setpoint in one frame.
pub fn thermostat_list() -> MasterCommandSpec {
    let mut output = vec![Field::byte("mode")];
    output.extend(svt_series(&["outside"]));
    output.extend(svt_series(&[
        "tmp0", "tmp1", "tmp2", "tmp3", "tmp4", "tmp5", "tmp6", "tmp7", "tmp8", "tmp9",
        "tmp10", "tmp11", "tmp12", "tmp13", "tmp14", "tmp15", "tmp16", "tmp17", "tmp18",
        "tmp19", "tmp20", "tmp21", "tmp22", "tmp23",
    ]));
    output.extend(svt_series(&[
        "setp0", "setp1", "setp2", "setp3", "setp4", "setp5", "setp6", "setp7", "setp8",
        "setp9", "setp10", "setp11", "setp12", "setp13", "setp14", "setp15", "setp16",
        "setp17", "setp18", "setp19", "setp20", "setp21", "setp22", "setp23",
    ]));
    output.push(Field::crc());
    output.push(Field::lit(b"\r\n"));

    MasterCommandSpec::new(*b"tl", vec![Field::padding(13)], output)
}

const HUM_NAMES: [&str; 32] = [
    "hum0", "hum1", "hum2", "hum3", "hum4", "hum5", "hum6", "hum7", "hum8", "hum9", "hum10",
    "hum11", "hum12", "hum13", "hum14", "hum15", "hum16", "hum17", "hum18", "hum19", "hum20",
    "hum21", "hum22", "hum23", "hum24", "hum25", "hum26", "hum27", "hum28", "hum29", "hum30",
    "hum31",
];

const SENSOR_TMP_NAMES: [&str; 32] = [
    "tmp0", "tmp1", "tmp2", "tmp3", "tmp4", "tmp5", "tmp6", "tmp7", "tmp8", "tmp9", "tmp10",
    "tmp11", "tmp12", "tmp13", "tmp14", "tmp15", "tmp16", "tmp17", "tmp18", "tmp19", "tmp20",
    "tmp21", "tmp22", "tmp23", "tmp24", "tmp25", "tmp26", "tmp27", "tmp28", "tmp29", "tmp30",
    "tmp31",
];

const BRI_NAMES: [&str; 32] = [
    "bri0", "bri1", "bri2", "bri3", "bri4", "bri5", "bri6", "bri7", "bri8", "bri9", "bri10",
    "bri11", "bri12", "bri13", "bri14", "bri15", "bri16", "bri17", "bri18", "bri19", "bri20",
    "bri21", "bri22", "bri23", "bri24", "bri25", "bri26", "bri27", "bri28", "bri29", "bri30",
    "bri31",
];

pub const PULSE_VALUE_NAMES: [&str; 24] = [
    "pv0", "pv1", "pv2", "pv3", "pv4", "pv5", "pv6", "pv7", "pv8", "pv9", "pv10", "pv11", "pv12",
    "pv13", "pv14", "pv15", "pv16", "pv17", "pv18", "pv19", "pv20", "pv21", "pv22", "pv23",
];

/// Read the humidity values of the 32 sensors.
pub fn sensor_humidity_list() -> MasterCommandSpec {
    let mut output: Vec<Field> = HUM_NAMES.iter().copied().map(Field::hum).collect();
    output.push(Field::crc());
    output.push(Field::lit(b"\r\n"));
    MasterCommandSpec::new(*b"hl", vec![Field::padding(13)], output)
}

/// Read the temperature values of the 32 sensors.
pub fn sensor_temperature_list() -> MasterCommandSpec {
    let mut output = svt_series(&SENSOR_TMP_NAMES);
    output.push(Field::crc());
    output.push(Field::lit(b"\r\n"));
    MasterCommandSpec::new(*b"cl", vec![Field::padding(13)], output)
}

/// Read the brightness values of the 32 sensors.
pub fn sensor_brightness_list() -> MasterCommandSpec {
    let mut output: Vec<Field> = BRI_NAMES.iter().copied().map(Field::byte).collect();
    output.push(Field::crc());
    output.push(Field::lit(b"\r\n"));
    MasterCommandSpec::new(*b"bl", vec![Field::padding(13)], output)
}

/// List the pulse counter values.
pub fn pulse_list() -> MasterCommandSpec {
    let mut output: Vec<Field> = PULSE_VALUE_NAMES.iter().copied().map(Field::word).collect();
    output.push(Field::lit(b"\r\n"));
    MasterCommandSpec::new(*b"PL", vec![Field::padding(13)], output)
}

/// Get the number of errors for each input and output module.
pub fn error_list() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"el",
        vec![Field::padding(13)],
        vec![Field::error_list("errors"), Field::crc(), Field::lit(b"\r\n\r\n")],
    )
}

/// Clear the error counters.
pub fn clear_error_list() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"ec",
        vec![Field::padding(13)],
        vec![Field::str("resp", 2), Field::padding(11), Field::lit(b"\r\n")],
    )
}

/// Switch the master to CLI (maintenance) mode. No reply follows.
pub fn to_cli_mode() -> MasterCommandSpec {
    MasterCommandSpec::new(*b"CM", vec![Field::padding(13)], vec![])
}

/// Put the master in module discovery mode.
pub fn module_discover_start() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"DA",
        vec![Field::padding(13)],
        vec![Field::str("resp", 2), Field::padding(11), Field::lit(b"\r\n")],
    )
}

/// Put the master back in its normal working state.
pub fn module_discover_stop() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"DO",
        vec![Field::padding(13)],
        vec![Field::str("resp", 2), Field::padding(11), Field::lit(b"\r\n")],
    )
}

/// Unsolicited message sent whenever outputs change.
pub fn output_list() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"OL",
        vec![],
        vec![Field::output_list("outputs"), Field::lit(b"\r\n\r\n")],
    )
}

/// Unsolicited message sent whenever an input is pressed.
pub fn input_list() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"IL",
        vec![],
        vec![Field::byte("input"), Field::byte("output"), Field::lit(b"\r\n\r\n")],
    )
}

/// Unsolicited message sent while a module initializes in discovery mode.
pub fn module_initialize() -> MasterCommandSpec {
    MasterCommandSpec::new(
        *b"MI",
        vec![],
        vec![
            Field::str("id", 4), Field::str("instr", 1), Field::byte("module_nr"),
            Field::byte("data"), Field::padding(6), Field::lit(b"\r\n"),
        ],
    )
}
