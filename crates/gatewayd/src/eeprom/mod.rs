//! Typed, cached, diff-minimizing overlay on the master's EEPROM.

pub mod controller;
pub mod extension;
pub mod file;
pub mod models;
#[cfg(test)]
pub mod testutil;
pub mod types;

pub use controller::EepromController;
pub use extension::EepromExtension;
pub use file::EepromFile;
pub use types::{EepromAddress, EepromData};

use crate::master::MasterError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum EepromError {
    #[error("{0}")]
    Master(#[from] MasterError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("model {0} does not take an id")]
    UnexpectedId(&'static str),

    #[error("model {0} requires an id")]
    MissingId(&'static str),

    #[error("id {id} out of range for model {model} (max {max})")]
    IdOutOfRange {
        model: &'static str,
        id: u16,
        max: u16,
    },

    #[error("model {model} has no field {field}")]
    UnknownField { model: &'static str, field: String },

    #[error("field {field}: {reason}")]
    Codec { field: String, reason: String },

    #[error("data length {len} does not match address length {expected}")]
    LengthMismatch { len: usize, expected: usize },

    #[error("max id address of model {0} must have length 1")]
    BadMaxIdAddress(&'static str),
}
