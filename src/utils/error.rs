//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::sync;

use crate::mailbox::TableId;

/// Customized error type for Parasync.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ParasyncError {
    /// General failure. Foreign errors are converted into this.
    Msg(String),

    /// Invalid partition layout, or a key no server owns.
    Partition(String),

    /// Table (model) ID not registered where it was looked up.
    UnknownModel(TableId),

    /// Thread-ID pool exhausted, or an ID the mapper does not own.
    IdMap(String),

    /// Client table asked for with a value type other than the table's.
    ValueType {
        table: TableId,
        expected: &'static str,
        got: &'static str,
    },
}

impl ParasyncError {
    pub fn msg(msg: impl ToString) -> Self {
        ParasyncError::Msg(msg.to_string())
    }
}

impl fmt::Display for ParasyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParasyncError::Msg(msg) => write!(f, "{}", msg),
            ParasyncError::Partition(msg) => write!(f, "partition: {}", msg),
            ParasyncError::UnknownModel(id) => {
                write!(f, "unknown table {}", id)
            }
            ParasyncError::IdMap(msg) => write!(f, "id mapper: {}", msg),
            ParasyncError::ValueType {
                table,
                expected,
                got,
            } => write!(f, "table {} holds {}, not {}", table, expected, got),
        }
    }
}

impl error::Error for ParasyncError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ParasyncError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ParasyncError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ParasyncError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ParasyncError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ParasyncError {
            fn from(e: $error) -> ParasyncError {
                ParasyncError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::ParseFloatError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(sync::PoisonError<T>);
