//! Parasync: a parameter-server runtime for data-parallel training.
//!
//! Worker threads read and accumulate into sharded key-value tables held
//! by server threads, under a per-table consistency model (BSP, SSP, or
//! ASP). Workers of different nodes steal tail slices of each other's
//! sample ranges to even out stragglers.

#[macro_use]
mod utils;

pub mod client;
pub mod engine;
pub mod mailbox;
pub mod server;

pub use utils::{
    log_tag, logger_init, Codec, ParasyncError, ThreadsafeQueue, Value, ME,
};

pub use client::{DataRange, KvClientTable, PartitionManager, WorkAssigner};
pub use engine::{
    ClusterConfig, Engine, EngineConfig, Info, MlTask, NodeInfo, WorkerAlloc,
};
pub use mailbox::{Flag, Key, Message, NodeId, TableId, ThreadId};
pub use server::{ModelType, StorageType};
