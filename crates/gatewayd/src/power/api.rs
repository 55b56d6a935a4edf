//! The power-bus command table.

use super::PowerError;
use super::command::{MODE_GET, MODE_SET, PowerCommand, PowerValueType};

/// `AGT` argument putting the bus back in its normal state.
pub const NORMAL_MODE: u8 = 0x00;
/// `AGT` argument opening the address-assignment window.
pub const ADDRESS_MODE: u8 = 0x01;

pub const POWER_MODULE_8_PORTS: u8 = 8;
pub const POWER_MODULE_12_PORTS: u8 = 12;

pub const DAY: u8 = 0;
pub const NIGHT: u8 = 1;

pub fn num_ports(version: u8) -> Result<usize, PowerError> {
    match version {
        POWER_MODULE_8_PORTS => Ok(8),
        POWER_MODULE_12_PORTS => Ok(12),
        other => Err(PowerError::UnknownVersion(other)),
    }
}

fn per_port(ty: PowerValueType, version: u8) -> Result<Vec<PowerValueType>, PowerError> {
    Ok(vec![ty; num_ports(version)?])
}

/// Bus voltage of a module.
pub fn get_voltage() -> PowerCommand {
    PowerCommand::new(MODE_GET, *b"VOL", vec![], vec![PowerValueType::F32])
}

/// Mains frequency measured by a module.
pub fn get_frequency() -> PowerCommand {
    PowerCommand::new(MODE_GET, *b"FRE", vec![], vec![PowerValueType::F32])
}

/// Current per port.
pub fn get_current(version: u8) -> Result<PowerCommand, PowerError> {
    Ok(PowerCommand::new(MODE_GET, *b"CUR", vec![], per_port(PowerValueType::F32, version)?))
}

/// Instantaneous power per port.
pub fn get_power(version: u8) -> Result<PowerCommand, PowerError> {
    Ok(PowerCommand::new(MODE_GET, *b"POW", vec![], per_port(PowerValueType::F32, version)?))
}

/// Accumulated day-tariff energy per port.
pub fn get_day_energy(version: u8) -> Result<PowerCommand, PowerError> {
    Ok(PowerCommand::new(MODE_GET, *b"EDA", vec![], per_port(PowerValueType::U32, version)?))
}

/// Accumulated night-tariff energy per port.
pub fn get_night_energy(version: u8) -> Result<PowerCommand, PowerError> {
    Ok(PowerCommand::new(MODE_GET, *b"ENI", vec![], per_port(PowerValueType::U32, version)?))
}

/// Calibrate the measured voltage of a module.
pub fn set_voltage() -> PowerCommand {
    PowerCommand::new(MODE_SET, *b"SVO", vec![PowerValueType::F32], vec![])
}

/// Push the day/night tariff bitmap for every port.
pub fn set_day_night(version: u8) -> Result<PowerCommand, PowerError> {
    Ok(PowerCommand::new(MODE_SET, *b"SDN", per_port(PowerValueType::U8, version)?, vec![]))
}

/// Broadcast toggling the address-assignment window.
pub fn set_address_mode() -> PowerCommand {
    PowerCommand::new(MODE_SET, *b"AGT", vec![PowerValueType::U8], vec![])
}

/// Sent by an unaddressed module asking for an address. The payload is
/// empty for 8-port modules and non-empty for 12-port ones.
pub fn want_an_address() -> PowerCommand {
    PowerCommand::new(MODE_SET, *b"WAA", vec![], vec![])
}

/// Assign an address to the module that sent a WAA.
pub fn set_address() -> PowerCommand {
    PowerCommand::new(MODE_SET, *b"SAD", vec![PowerValueType::U8], vec![])
}

/// Leave the bootloader and start the application firmware.
pub fn bootloader_jump_application() -> PowerCommand {
    PowerCommand::new(MODE_SET, *b"JAP", vec![], vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_counts_follow_the_version() {
        assert_eq!(num_ports(POWER_MODULE_8_PORTS).unwrap(), 8);
        assert_eq!(num_ports(POWER_MODULE_12_PORTS).unwrap(), 12);
        assert!(num_ports(9).is_err());

        assert_eq!(get_power(POWER_MODULE_8_PORTS).unwrap().output_format.len(), 8);
        assert_eq!(get_power(POWER_MODULE_12_PORTS).unwrap().output_format.len(), 12);
        assert_eq!(set_day_night(POWER_MODULE_12_PORTS).unwrap().input_format.len(), 12);
    }
}
