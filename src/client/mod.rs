//! Worker side: key partitioning, client tables, reply bookkeeping, helper
//! threads, and work assignment.

mod partition;
mod blocker;
mod table;
mod helper;
mod assigner;

pub use partition::{
    HashPartitionManager, PartitionManager, RangePartitionManager,
};
pub use blocker::{AppBlocker, FinishHandle, RecvHandle};
pub use table::KvClientTable;
pub use helper::WorkerHelperThread;
pub use assigner::{
    AssignerConfig, AssignerStatus, DataRange, HelpRequestStatus,
    HelpingStatus, WorkAssigner,
};

pub(crate) use assigner::AssignerEvent;
