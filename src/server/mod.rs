//! Server side: table storage, consistency models, and server threads.

mod storage;
mod progress;
mod models;
mod thread;

pub use storage::{MapStorage, Storage, StorageType};
pub use progress::{Clock, PendingBuffer, ProgressTracker};
pub use models::{
    AspModel, BspModel, ConsistencyModel, ModelType, SspModel,
};
pub use thread::ServerThread;
