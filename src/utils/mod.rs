//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod queue;
mod codec;

pub use error::ParasyncError;
pub use print::{log_tag, logger_init, ME};
pub use queue::ThreadsafeQueue;
pub use codec::{Codec, Value};
