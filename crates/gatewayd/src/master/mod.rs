//! Master serial protocol engine: framed command/response codec, background
//! consumers, maintenance passthrough and the communication watchdog.

pub mod api;
pub mod command;
pub mod communicator;

pub use command::{Fields, MasterCommandSpec, Svt, Value};
pub use communicator::MasterCommunicator;

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("communication timed out")]
    CommunicationTimedOut,

    #[error("crc check failed")]
    CrcCheckFailed,

    #[error("master is in maintenance mode")]
    InMaintenanceMode,

    #[error("master is not in maintenance mode")]
    NotInMaintenanceMode,

    #[error("field {0} is missing or has an unexpected type")]
    Field(String),

    #[error("value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("invalid time, expected HH:MM with minutes a multiple of 10: {0}")]
    InvalidTime(String),

    #[error("serial i/o error: {0}")]
    Serial(#[from] std::io::Error),
}
