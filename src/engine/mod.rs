//! Per-node driver: owns the mailbox, the server and helper thread pools,
//! the table registry, and runs training tasks across the cluster.

mod config;
mod idmap;
mod task;

use std::any::TypeId;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::client::{
    AppBlocker, DataRange, PartitionManager, WorkAssigner, WorkerHelperThread,
};
use crate::mailbox::{Flag, Mailbox, Message, NodeId, TableId, ThreadId};
use crate::server::{ModelType, ServerThread, StorageType};
use crate::utils::{Codec, ParasyncError, ThreadsafeQueue, Value, ME};

pub use config::{ClusterConfig, EngineConfig, NodeInfo};
pub use idmap::IdMapper;
pub use task::{
    Info, MlTask, TableHandle, TaskLambda, WorkerAlloc, WorkerId, WorkerSpec,
};

/// Driver of one node. Every node of a cluster runs the same sequence of
/// engine calls; `start_everything`, `run` and `stop_everything` contain
/// cluster-wide barriers.
pub struct Engine {
    cluster: ClusterConfig,
    config: EngineConfig,
    mailbox: Mailbox,
    id_mapper: IdMapper,

    /// Callback runner shared by helpers and client tables.
    blocker: Arc<AppBlocker>,

    servers: HashMap<ThreadId, ServerThread>,
    helpers: HashMap<ThreadId, WorkerHelperThread>,

    tables: HashMap<TableId, TableHandle>,
    next_table_id: TableId,

    /// Inbound queue of my driver thread ID.
    driver_queue: Arc<ThreadsafeQueue<Message>>,

    /// Barrier arrivals seen per epoch, including early ones.
    barrier_arrivals: HashMap<u64, usize>,
    barrier_epoch: u64,

    /// Reset acknowledgements not yet consumed.
    reset_acks: usize,

    started: bool,
}

impl Engine {
    /// Creates the engine of node `cluster.me`. Nothing is spawned until
    /// `start_everything`.
    pub fn new(
        cluster: ClusterConfig,
        config_str: Option<&str>,
    ) -> Result<Self, ParasyncError> {
        cluster.validate()?;
        // first engine of the process names the log prefix
        let _ = ME.set(format!("n{}", cluster.me));
        let config = EngineConfig::parse(config_str)?;

        let id_mapper = IdMapper::new(
            &cluster.node_ids(),
            config.num_server_threads,
            config.num_helper_threads,
            config.max_workers_per_node,
        );
        let mailbox = Mailbox::new(cluster.me);

        Ok(Engine {
            cluster,
            config,
            mailbox,
            id_mapper,
            blocker: Arc::new(AppBlocker::new()),
            servers: HashMap::new(),
            helpers: HashMap::new(),
            tables: HashMap::new(),
            next_table_id: 0,
            driver_queue: Arc::new(ThreadsafeQueue::new()),
            barrier_arrivals: HashMap::new(),
            barrier_epoch: 0,
            reset_acks: 0,
            started: false,
        })
    }

    fn me(&self) -> NodeId {
        self.cluster.me
    }

    fn driver(&self) -> ThreadId {
        ThreadId::driver(self.cluster.me)
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Server threads of the whole cluster.
    pub fn server_thread_ids(&self) -> Vec<ThreadId> {
        self.id_mapper.all_server_threads()
    }

    /// Helper thread bound to worker `tid` while a task runs.
    pub fn helper_of_worker(&self, tid: ThreadId) -> Option<ThreadId> {
        self.id_mapper.helper_for_worker(tid)
    }

    /// Spawns local server and helper threads, connects to peer nodes,
    /// starts the sender thread, and waits for every node to get here.
    pub fn start_everything(&mut self) -> Result<(), ParasyncError> {
        if self.started {
            return logged_err!("engine already started");
        }
        let me = self.me();
        self.mailbox
            .register_queue(self.driver(), self.driver_queue.clone())?;

        let send_queue = self.mailbox.send_queue();
        for &tid in self.id_mapper.server_threads_for_node(me)? {
            let server = ServerThread::new_and_setup(tid, send_queue.clone())?;
            self.mailbox.register_queue(tid, server.queue())?;
            self.servers.insert(tid, server);
        }
        for &tid in self.id_mapper.helper_threads_for_node(me)? {
            let helper =
                WorkerHelperThread::new_and_setup(tid, self.blocker.clone())?;
            self.helpers.insert(tid, helper);
        }
        pf_debug!(
            "spawned {} servers {} helpers",
            self.servers.len(),
            self.helpers.len()
        );

        if self.cluster.num_nodes() > 1 {
            self.mailbox
                .connect(self.cluster.my_addr()?, self.cluster.addrs())?;
            pf_info!("connected to {} peers", self.cluster.num_nodes() - 1);
        }
        self.mailbox.start_sender()?;
        self.started = true;

        self.barrier()
    }

    /// Creates a table hash-partitioned over all server threads of the
    /// cluster. Returns the new table ID.
    pub fn create_table<V: Value>(
        &mut self,
        model_type: ModelType,
        storage_type: StorageType,
    ) -> Result<TableId, ParasyncError> {
        let partition =
            PartitionManager::new_hash(self.id_mapper.all_server_threads())?;
        self.create_table_with::<V>(partition, model_type, storage_type)
    }

    /// Creates a table with the given partitioning and installs its model on
    /// the local server threads the partitioning covers.
    pub fn create_table_with<V: Value>(
        &mut self,
        partition: PartitionManager,
        model_type: ModelType,
        storage_type: StorageType,
    ) -> Result<TableId, ParasyncError> {
        if !self.started {
            return logged_err!("create_table before start_everything");
        }
        let me = self.me();
        let table_id = self.next_table_id;

        for tid in partition.server_thread_ids() {
            if tid.node != me {
                continue;
            }
            let server = match self.servers.get(tid) {
                Some(server) => server,
                None => {
                    return logged_err!(
                        "table {} uses unknown {}",
                        table_id,
                        tid
                    )
                }
            };
            let storage = storage_type.new_storage::<V>();
            server.register_model(model_type.new_model(table_id, storage))?;
        }

        self.tables.insert(
            table_id,
            TableHandle {
                partition: Arc::new(partition),
                model_type,
                storage_type,
                value_type: TypeId::of::<V>(),
                value_name: std::any::type_name::<V>(),
            },
        );
        self.next_table_id += 1;
        pf_info!(
            "created table {} {:?} of {}",
            table_id,
            model_type,
            std::any::type_name::<V>()
        );
        Ok(table_id)
    }

    /// Sorts a driver message into barrier arrivals or reset acks.
    fn note_driver_msg(&mut self, msg: Message) -> Result<(), ParasyncError> {
        match msg.meta.flag {
            Flag::Barrier => {
                for epoch in msg.get_data::<u64>(0)? {
                    *self.barrier_arrivals.entry(epoch).or_default() += 1;
                }
            }
            Flag::ResetWorkerInModel => self.reset_acks += 1,
            flag => {
                pf_warn!(
                    "driver ignoring {:?} from {}",
                    flag,
                    msg.meta.sender
                );
            }
        }
        Ok(())
    }

    /// Blocks until every other node has entered the same barrier.
    pub fn barrier(&mut self) -> Result<(), ParasyncError> {
        if !self.started {
            return logged_err!("barrier before start_everything");
        }
        self.barrier_epoch += 1;
        let epoch = self.barrier_epoch;
        let me = self.me();
        let driver = self.driver();
        let send_queue = self.mailbox.send_queue();

        let others: Vec<NodeId> = self
            .cluster
            .node_ids()
            .into_iter()
            .filter(|&node| node != me)
            .collect();
        for &node in &others {
            send_queue.push(
                Message::new(driver, ThreadId::driver(node), 0, Flag::Barrier)
                    .with_data::<u64>(&[epoch]),
            );
        }

        while self.barrier_arrivals.get(&epoch).copied().unwrap_or(0)
            < others.len()
        {
            let msg = self.driver_queue.wait_and_pop()?;
            self.note_driver_msg(msg)?;
        }
        self.barrier_arrivals.remove(&epoch);
        pf_trace!("passed barrier {}", epoch);
        Ok(())
    }

    /// Allocates every worker of the task in allocation order. On failure
    /// the IDs taken so far are released.
    fn allocate_workers(
        &mut self,
        task: &MlTask,
    ) -> Result<WorkerSpec, ParasyncError> {
        let mut spec = WorkerSpec::new(task.worker_alloc());
        let mut result = Ok(());
        for worker in 0..spec.num_workers() as WorkerId {
            let node = match spec.node_of(worker) {
                Some(node) => node,
                None => break,
            };
            result = self
                .id_mapper
                .allocate_worker_thread(node)
                .and_then(|tid| spec.insert_thread(worker, tid));
            if result.is_err() {
                break;
            }
        }

        if let Err(e) = result {
            for tid in spec.all_threads() {
                let _ = self.id_mapper.deallocate_worker_thread(tid);
            }
            return Err(e);
        }
        Ok(spec)
    }

    /// Installs the task's worker set into every table shard on my servers
    /// and waits for all acknowledgements.
    fn reset_tables(
        &mut self,
        task: &MlTask,
        spec: &WorkerSpec,
    ) -> Result<(), ParasyncError> {
        let me = self.me();
        let driver = self.driver();
        let send_queue = self.mailbox.send_queue();
        let workers = ThreadId::encode(&spec.all_threads());

        let mut expected = 0;
        for table_id in task.tables() {
            let handle = match self.tables.get(table_id) {
                Some(handle) => handle,
                None => {
                    return logged_err!("task uses unknown table {}", table_id)
                }
            };
            for &server in handle.partition.server_thread_ids() {
                if server.node != me {
                    continue;
                }
                let mut msg = Message::new(
                    driver,
                    server,
                    *table_id,
                    Flag::ResetWorkerInModel,
                );
                msg.data.push(workers.clone());
                send_queue.push(msg);
                expected += 1;
            }
        }

        while self.reset_acks < expected {
            let msg = self.driver_queue.wait_and_pop()?;
            self.note_driver_msg(msg)?;
        }
        self.reset_acks -= expected;
        Ok(())
    }

    /// Own range and helpee assignment of every local worker.
    fn plan_local_workers(
        &self,
        task: &MlTask,
        spec: &WorkerSpec,
    ) -> Vec<(ThreadId, DataRange, DataRange, Option<ThreadId>)> {
        let me = self.me();
        let local = spec.threads_on(me);
        let own_ranges = task.own_range().split(local.len());
        let active = spec.active_nodes();

        local
            .iter()
            .zip(own_ranges.iter())
            .enumerate()
            .map(|(i, (&tid, &range))| {
                let (helpee, helpee_range) = if active.len() > 1 {
                    // same local index on the next node in the ring; its
                    // data sits in my backup range
                    let pos =
                        active.iter().position(|&n| n == me).unwrap_or(0);
                    let next = active[(pos + 1) % active.len()];
                    let peers = spec.threads_on(next);
                    let j = i % peers.len();
                    let backup = task.backup_range();
                    let theirs = DataRange::new(0, backup.length())
                        .split(peers.len())[j];
                    (
                        Some(peers[j]),
                        DataRange::new(
                            backup.start + theirs.start,
                            backup.start + theirs.end,
                        ),
                    )
                } else if local.len() > 1 {
                    let j = (i + 1) % local.len();
                    (Some(local[j]), own_ranges[j])
                } else {
                    (None, DataRange::default())
                };
                (tid, range, helpee_range, helpee)
            })
            .collect()
    }

    /// Runs `task` on every node of its worker allocation and returns once
    /// all workers of the cluster have finished. Every node must call `run`
    /// with an identically shaped task.
    pub fn run(&mut self, task: &MlTask) -> Result<(), ParasyncError> {
        if !self.started {
            return logged_err!("run before start_everything");
        }
        let lambda = match task.lambda() {
            Some(lambda) if task.is_setup() => lambda.clone(),
            _ => return logged_err!("task not set up: {:?}", task),
        };
        let tables: HashMap<TableId, TableHandle> = task
            .tables()
            .iter()
            .map(|id| match self.tables.get(id) {
                Some(handle) => Ok((*id, handle.clone())),
                None => logged_err!("task uses unknown table {}", id),
            })
            .collect::<Result<_, _>>()?;
        let tables = Arc::new(tables);

        let me = self.me();
        let spec = self.allocate_workers(task)?;
        let local: Vec<ThreadId> = spec.threads_on(me).to_vec();
        pf_info!(
            "running task with {} workers, {} local",
            spec.num_workers(),
            local.len()
        );

        let mut registered = vec![];
        let mut assigners: Vec<Arc<WorkAssigner>> = vec![];
        let outcome = self.setup_and_run(
            task,
            &spec,
            lambda,
            tables,
            &mut registered,
            &mut assigners,
        );

        // cleanup runs whatever happened above
        for assigner in &assigners {
            if let Err(e) = assigner.shutdown() {
                pf_error!("assigner shutdown: {}", e);
            }
        }
        for &tid in &registered {
            if let Some(helper) = self
                .id_mapper
                .helper_for_worker(tid)
                .and_then(|h| self.helpers.get(&h))
            {
                let _ = helper.deregister_assigner();
            }
            let _ = self.mailbox.deregister_queue(tid);
        }
        for tid in spec.all_threads() {
            let _ = self.id_mapper.deallocate_worker_thread(tid);
        }

        let panicked = outcome?;
        if panicked > 0 {
            return logged_err!("{} worker closures panicked", panicked);
        }
        pf_info!("task finished");
        Ok(())
    }

    /// Body of `run` between allocation and cleanup. Returns the number of
    /// local worker closures that panicked.
    fn setup_and_run(
        &mut self,
        task: &MlTask,
        spec: &WorkerSpec,
        lambda: TaskLambda,
        tables: Arc<HashMap<TableId, TableHandle>>,
        registered: &mut Vec<ThreadId>,
        assigners: &mut Vec<Arc<WorkAssigner>>,
    ) -> Result<usize, ParasyncError> {
        // worker IDs receive through their helper's queue
        for &tid in spec.threads_on(self.me()) {
            let helper = match self
                .id_mapper
                .helper_for_worker(tid)
                .and_then(|h| self.helpers.get(&h))
            {
                Some(helper) => helper,
                None => return logged_err!("no helper bound to {}", tid),
            };
            self.mailbox.register_queue(tid, helper.queue())?;
            registered.push(tid);
        }

        self.reset_tables(task, spec)?;

        let send_queue = self.mailbox.send_queue();
        let assigner_config = self.config.assigner_config();
        for (tid, range, helpee_range, helpee) in
            self.plan_local_workers(task, spec)
        {
            let assigner = Arc::new(WorkAssigner::new_and_setup(
                tid,
                range,
                helpee_range,
                helpee,
                send_queue.clone(),
                assigner_config,
            )?);
            if let Some(helper) = self
                .id_mapper
                .helper_for_worker(tid)
                .and_then(|h| self.helpers.get(&h))
            {
                helper.register_assigner(&assigner)?;
            }
            pf_debug!("{} owns {:?} helping {:?}", tid, range, helpee);
            assigners.push(assigner);
        }

        self.barrier()?;

        let mut handles = vec![];
        let mut spawn_result = Ok(());
        for assigner in assigners.iter() {
            let tid = assigner.me();
            let info = Info {
                thread_id: tid,
                worker_id: spec.worker_of(tid).unwrap_or_default(),
                send_queue: send_queue.clone(),
                work_assigner: assigner.clone(),
                tables: tables.clone(),
                callback_runner: self.blocker.clone(),
            };
            let lambda = lambda.clone();
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", tid))
                .spawn(move || Self::worker_thread(info, lambda));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    spawn_result = Err(ParasyncError::from(e));
                    break;
                }
            }
        }

        let mut panicked = 0;
        for handle in handles {
            match handle.join() {
                Ok(true) => {}
                _ => panicked += 1,
            }
        }
        spawn_result?;

        self.barrier()?;
        Ok(panicked)
    }

    /// Worker thread function. Returns false if the closure panicked.
    fn worker_thread(info: Info, lambda: TaskLambda) -> bool {
        pf_debug!("worker {} ({}) started", info.worker_id, info.thread_id);
        let ok =
            panic::catch_unwind(AssertUnwindSafe(|| lambda(&info))).is_ok();
        if !ok {
            pf_error!("worker {} closure panicked", info.thread_id);
        }
        if let Err(e) = info.work_assigner.retire() {
            pf_error!("retiring {}: {}", info.thread_id, e);
        }
        pf_debug!("worker {} finished", info.thread_id);
        ok
    }

    /// Waits for every node, then stops all local threads and the mailbox.
    pub fn stop_everything(&mut self) -> Result<(), ParasyncError> {
        if !self.started {
            return Ok(());
        }
        self.barrier()?;

        for server in self.servers.values_mut() {
            server.stop()?;
        }
        for helper in self.helpers.values_mut() {
            helper.stop()?;
        }
        self.mailbox.stop()?;
        self.servers.clear();
        self.helpers.clear();
        self.started = false;
        pf_info!("engine stopped");
        Ok(())
    }
}
