pub mod cloud;
pub mod config;
pub mod eeprom;
pub mod gateway;
pub mod master;
pub mod metrics;
pub mod plugins;
pub mod power;
pub mod pulses;
pub mod scheduler;
pub mod serial;
pub mod status;
pub mod storage;
