//! Power-bus protocol engine: framed request/response with CRC7, the
//! address-assignment state machine and per-module time keeping.

pub mod api;
pub mod command;
pub mod communicator;
pub mod controller;
pub mod time_keeper;

pub use command::{PowerCommand, PowerValue, BROADCAST_ADDRESS};
pub use communicator::PowerCommunicator;
pub use controller::PowerController;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error("communication timed out")]
    CommunicationTimedOut,

    #[error("power bus is in address mode")]
    InAddressMode,

    #[error("power bus is not in address mode")]
    NotInAddressMode,

    #[error("module responded with an unknown-command NACK")]
    UnknownCommand,

    #[error("crc check failed")]
    CrcCheckFailed,

    #[error("reply header did not match the command")]
    HeaderMismatch,

    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("argument {0} does not match the command's input format")]
    BadArgument(usize),

    #[error("unknown power module version {0}")]
    UnknownVersion(u8),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("serial i/o error: {0}")]
    Serial(#[from] std::io::Error),
}
