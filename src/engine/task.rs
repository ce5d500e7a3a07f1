//! Task description, worker bookkeeping, and the per-worker context handed
//! to user code.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::client::{
    AppBlocker, DataRange, KvClientTable, PartitionManager, WorkAssigner,
};
use crate::mailbox::{Message, NodeId, TableId, ThreadId};
use crate::server::{ModelType, StorageType};
use crate::utils::{ParasyncError, ThreadsafeQueue, Value};

/// Global worker ID of a task, assigned in allocation order.
pub type WorkerId = u32;

/// User closure run once on every worker thread.
pub type TaskLambda = Arc<dyn Fn(&Info) + Send + Sync>;

/// Number of workers a task runs on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerAlloc {
    pub node_id: NodeId,
    pub num_workers: u16,
}

/// Registered table metadata shared with worker contexts.
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub partition: Arc<PartitionManager>,
    pub model_type: ModelType,
    pub storage_type: StorageType,
    pub(crate) value_type: TypeId,
    pub(crate) value_name: &'static str,
}

/// Worker placement of one task run.
#[derive(Debug, Default)]
pub struct WorkerSpec {
    /// Node of every worker, indexed by worker ID.
    nodes: Vec<NodeId>,
    worker_to_thread: HashMap<WorkerId, ThreadId>,
    thread_to_worker: HashMap<ThreadId, WorkerId>,
    node_to_threads: BTreeMap<NodeId, Vec<ThreadId>>,
}

impl WorkerSpec {
    /// Numbers workers consecutively in allocation order.
    pub fn new(allocs: &[WorkerAlloc]) -> Self {
        let nodes = allocs
            .iter()
            .flat_map(|a| {
                std::iter::repeat(a.node_id).take(a.num_workers as usize)
            })
            .collect();
        WorkerSpec {
            nodes,
            ..Default::default()
        }
    }

    pub fn num_workers(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_of(&self, worker: WorkerId) -> Option<NodeId> {
        self.nodes.get(worker as usize).copied()
    }

    /// Worker IDs placed on `node`, ascending.
    pub fn workers_on(&self, node: NodeId) -> Vec<WorkerId> {
        (0..self.nodes.len() as WorkerId)
            .filter(|&w| self.nodes[w as usize] == node)
            .collect()
    }

    pub fn insert_thread(
        &mut self,
        worker: WorkerId,
        tid: ThreadId,
    ) -> Result<(), ParasyncError> {
        if self.node_of(worker) != Some(tid.node) {
            return logged_err!("worker {} cannot run on {}", worker, tid);
        }
        if self.worker_to_thread.contains_key(&worker) {
            return logged_err!("worker {} already has a thread", worker);
        }
        self.worker_to_thread.insert(worker, tid);
        self.thread_to_worker.insert(tid, worker);
        self.node_to_threads.entry(tid.node).or_default().push(tid);
        Ok(())
    }

    pub fn thread_of(&self, worker: WorkerId) -> Option<ThreadId> {
        self.worker_to_thread.get(&worker).copied()
    }

    pub fn worker_of(&self, tid: ThreadId) -> Option<WorkerId> {
        self.thread_to_worker.get(&tid).copied()
    }

    /// Threads on `node` in worker ID order.
    pub fn threads_on(&self, node: NodeId) -> &[ThreadId] {
        self.node_to_threads
            .get(&node)
            .map_or(&[], |tids| tids.as_slice())
    }

    /// Nodes that run at least one worker, ascending.
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.node_to_threads
            .iter()
            .filter(|(_, tids)| !tids.is_empty())
            .map(|(&node, _)| node)
            .collect()
    }

    /// All worker threads of the task, in worker ID order.
    pub fn all_threads(&self) -> Vec<ThreadId> {
        (0..self.nodes.len() as WorkerId)
            .filter_map(|w| self.thread_of(w))
            .collect()
    }
}

/// A training task: closure, placement, tables, and data layout.
#[derive(Default)]
pub struct MlTask {
    lambda: Option<TaskLambda>,
    worker_alloc: Vec<WorkerAlloc>,
    tables: Vec<TableId>,
    /// `(total, divider)` of the local data store.
    data_range: Option<(usize, usize)>,
}

impl MlTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lambda<F>(&mut self, lambda: F) -> &mut Self
    where
        F: Fn(&Info) + Send + Sync + 'static,
    {
        self.lambda = Some(Arc::new(lambda));
        self
    }

    pub fn set_worker_alloc(&mut self, alloc: Vec<WorkerAlloc>) -> &mut Self {
        self.worker_alloc = alloc;
        self
    }

    pub fn set_tables(&mut self, tables: Vec<TableId>) -> &mut Self {
        self.tables = tables;
        self
    }

    /// Local data store of `total` samples: own data in `[0, divider)`,
    /// backup copy of the helpee node's data in `[divider, total)`.
    pub fn set_data_range(
        &mut self,
        total: usize,
        divider: usize,
    ) -> &mut Self {
        self.data_range = Some((total, divider.min(total)));
        self
    }

    pub fn is_setup(&self) -> bool {
        self.lambda.is_some()
            && !self.worker_alloc.is_empty()
            && self.data_range.is_some()
    }

    pub fn lambda(&self) -> Option<&TaskLambda> {
        self.lambda.as_ref()
    }

    pub fn worker_alloc(&self) -> &[WorkerAlloc] {
        &self.worker_alloc
    }

    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    /// Own data range `[0, divider)`.
    pub fn own_range(&self) -> DataRange {
        self.data_range
            .map_or(DataRange::default(), |(_, divider)| {
                DataRange::new(0, divider)
            })
    }

    /// Backup data range `[divider, total)`.
    pub fn backup_range(&self) -> DataRange {
        self.data_range
            .map_or(DataRange::default(), |(total, divider)| {
                DataRange::new(divider, total)
            })
    }
}

impl fmt::Debug for MlTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MlTask")
            .field("has_lambda", &self.lambda.is_some())
            .field("worker_alloc", &self.worker_alloc)
            .field("tables", &self.tables)
            .field("data_range", &self.data_range)
            .finish()
    }
}

/// Context of one worker thread.
pub struct Info {
    pub thread_id: ThreadId,
    pub worker_id: WorkerId,
    pub(crate) send_queue: Arc<ThreadsafeQueue<Message>>,
    pub(crate) work_assigner: Arc<WorkAssigner>,
    pub(crate) tables: Arc<HashMap<TableId, TableHandle>>,
    pub(crate) callback_runner: Arc<AppBlocker>,
}

impl Info {
    /// Next sample index, or `None` at the end of a pass.
    pub fn next_sample(&self) -> Result<Option<usize>, ParasyncError> {
        self.work_assigner.next_sample()
    }

    pub fn data_range(&self) -> DataRange {
        self.work_assigner.data_range()
    }

    pub fn work_assigner(&self) -> &WorkAssigner {
        &self.work_assigner
    }

    /// Client handle of table `table_id`. `V` must be the value type the
    /// table was created with.
    pub fn create_kv_client_table<V: Value>(
        &self,
        table_id: TableId,
    ) -> Result<KvClientTable<V>, ParasyncError> {
        let handle = match self.tables.get(&table_id) {
            Some(handle) => handle,
            None => {
                pf_error!("table {} not in this task", table_id);
                return Err(ParasyncError::UnknownModel(table_id));
            }
        };
        if handle.value_type != TypeId::of::<V>() {
            let e = ParasyncError::ValueType {
                table: table_id,
                expected: handle.value_name,
                got: std::any::type_name::<V>(),
            };
            pf_error!("{}", e);
            return Err(e);
        }
        Ok(KvClientTable::new(
            self.thread_id,
            table_id,
            self.send_queue.clone(),
            handle.partition.clone(),
            self.callback_runner.clone(),
        ))
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn worker_spec_layout() -> Result<(), ParasyncError> {
        let mut spec = WorkerSpec::new(&[
            WorkerAlloc {
                node_id: 1,
                num_workers: 2,
            },
            WorkerAlloc {
                node_id: 0,
                num_workers: 1,
            },
        ]);
        assert_eq!(spec.num_workers(), 3);
        assert_eq!(spec.workers_on(1), vec![0, 1]);
        assert_eq!(spec.node_of(2), Some(0));

        spec.insert_thread(0, ThreadId::worker(1, 0))?;
        spec.insert_thread(1, ThreadId::worker(1, 1))?;
        spec.insert_thread(2, ThreadId::worker(0, 0))?;
        assert!(spec.insert_thread(2, ThreadId::worker(0, 1)).is_err());
        assert!(spec.insert_thread(3, ThreadId::worker(0, 1)).is_err());

        assert_eq!(spec.threads_on(1).len(), 2);
        assert!(spec.threads_on(5).is_empty());
        assert_eq!(spec.worker_of(ThreadId::worker(0, 0)), Some(2));
        assert_eq!(spec.active_nodes(), vec![0, 1]);
        assert_eq!(
            spec.all_threads(),
            vec![
                ThreadId::worker(1, 0),
                ThreadId::worker(1, 1),
                ThreadId::worker(0, 0)
            ]
        );
        Ok(())
    }

    #[test]
    fn rejected_insert_keeps_binding() -> Result<(), ParasyncError> {
        let mut spec = WorkerSpec::new(&[WorkerAlloc {
            node_id: 0,
            num_workers: 2,
        }]);
        spec.insert_thread(0, ThreadId::worker(0, 3))?;
        assert!(spec.insert_thread(0, ThreadId::worker(0, 4)).is_err());

        assert_eq!(spec.thread_of(0), Some(ThreadId::worker(0, 3)));
        assert_eq!(spec.worker_of(ThreadId::worker(0, 4)), None);
        assert_eq!(spec.threads_on(0), &[ThreadId::worker(0, 3)]);
        assert_eq!(spec.all_threads(), vec![ThreadId::worker(0, 3)]);
        Ok(())
    }

    #[test]
    fn task_setup() {
        let mut task = MlTask::new();
        assert!(!task.is_setup());
        task.set_lambda(|_info| {})
            .set_worker_alloc(vec![WorkerAlloc {
                node_id: 0,
                num_workers: 2,
            }])
            .set_tables(vec![0]);
        assert!(!task.is_setup());
        task.set_data_range(100, 60);
        assert!(task.is_setup());
        assert_eq!(task.own_range(), DataRange::new(0, 60));
        assert_eq!(task.backup_range(), DataRange::new(60, 100));
        task.set_data_range(10, 60);
        assert_eq!(task.backup_range().length(), 0);
    }
}
