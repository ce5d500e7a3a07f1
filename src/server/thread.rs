//! Server thread: a single dispatch loop owning the consistency models of
//! every table shard it serves.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crate::mailbox::{Flag, Message, TableId, ThreadId};
use crate::server::ConsistencyModel;
use crate::utils::{ParasyncError, ThreadsafeQueue};

use tokio::sync::mpsc;

/// Handle to a running server thread.
pub struct ServerThread {
    /// My thread ID.
    id: ThreadId,

    /// Inbound queue, to be registered with the mailbox.
    queue: Arc<ThreadsafeQueue<Message>>,

    /// Sender side of the model registration channel.
    tx_model: mpsc::UnboundedSender<ConsistencyModel>,

    /// Join handle of the dispatch thread.
    handle: Option<thread::JoinHandle<()>>,
}

impl ServerThread {
    /// Spawns the dispatch thread. Replies go into `send_queue`.
    pub fn new_and_setup(
        id: ThreadId,
        send_queue: Arc<ThreadsafeQueue<Message>>,
    ) -> Result<Self, ParasyncError> {
        let queue = Arc::new(ThreadsafeQueue::new());
        let (tx_model, rx_model) = mpsc::unbounded_channel();

        let thread_queue = queue.clone();
        let handle = thread::Builder::new()
            .name(format!("server-{}", id))
            .spawn(move || {
                Self::server_thread(id, thread_queue, rx_model, send_queue)
            })?;

        Ok(ServerThread {
            id,
            queue,
            tx_model,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn queue(&self) -> Arc<ThreadsafeQueue<Message>> {
        self.queue.clone()
    }

    /// Hands a table's model to the thread. It is installed before the next
    /// message is dispatched.
    pub fn register_model(
        &self,
        model: ConsistencyModel,
    ) -> Result<(), ParasyncError> {
        self.tx_model.send(model).map_err(|_| {
            ParasyncError::msg(format!("server {} already exited", self.id))
        })
    }

    /// Pushes `Exit` into my queue and joins the thread.
    pub fn stop(&mut self) -> Result<(), ParasyncError> {
        if let Some(handle) = self.handle.take() {
            self.queue.push(Message::exit(self.id, self.id));
            if handle.join().is_err() {
                return logged_err!("server {} panicked", self.id);
            }
        }
        Ok(())
    }

    /// Dispatch loop.
    fn server_thread(
        me: ThreadId,
        queue: Arc<ThreadsafeQueue<Message>>,
        mut rx_model: mpsc::UnboundedReceiver<ConsistencyModel>,
        send_queue: Arc<ThreadsafeQueue<Message>>,
    ) {
        pf_debug!("server thread {} spawned", me);
        let mut models: HashMap<TableId, ConsistencyModel> = HashMap::new();

        loop {
            let msg = match queue.wait_and_pop() {
                Ok(msg) => msg,
                Err(e) => {
                    pf_error!("server {} queue error: {}", me, e);
                    break;
                }
            };

            while let Ok(model) = rx_model.try_recv() {
                let model_id = model.model_id();
                if models.insert(model_id, model).is_some() {
                    pf_warn!("server {} replaced model {}", me, model_id);
                }
            }

            if msg.meta.flag == Flag::Exit {
                break;
            }
            pf_trace!("server {} dispatching {:?}", me, msg.meta);

            let model_id = msg.meta.model_id;
            let (flag, sender) = (msg.meta.flag, msg.meta.sender);
            let result = match models.get_mut(&model_id) {
                Some(model) => model.handle(msg),
                None => Err(ParasyncError::UnknownModel(model_id)),
            };
            match result {
                Ok(replies) => {
                    for reply in replies {
                        send_queue.push(reply);
                    }
                }
                Err(e @ ParasyncError::UnknownModel(_)) => {
                    pf_warn!(
                        "server {} {}, dropping {:?} from {}",
                        me,
                        e,
                        flag,
                        sender
                    );
                }
                Err(e) => {
                    pf_error!("server {} table {}: {}", me, model_id, e);
                }
            }
        }

        pf_debug!("server thread {} exited", me);
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod thread_tests {
    use super::*;
    use crate::mailbox::Key;
    use crate::server::{ModelType, StorageType};

    #[test]
    fn serve_registered_tables() -> Result<(), ParasyncError> {
        let me = ThreadId::server(0, 0);
        let worker = ThreadId::worker(0, 0);
        let send_queue = Arc::new(ThreadsafeQueue::new());
        let mut server = ServerThread::new_and_setup(me, send_queue.clone())?;
        server.register_model(
            ModelType::Asp.new_model(1, StorageType::Map.new_storage::<f64>()),
        )?;
        server.register_model(
            ModelType::Bsp.new_model(2, StorageType::Map.new_storage::<f64>()),
        )?;

        let queue = server.queue();
        for model_id in [1, 2] {
            queue.push(
                Message::new(
                    ThreadId::driver(0),
                    me,
                    model_id,
                    Flag::ResetWorkerInModel,
                )
                .with_data(&[worker]),
            );
        }
        queue.push(
            Message::new(worker, me, 1, Flag::Add)
                .with_data::<Key>(&[8])
                .with_data::<f64>(&[2.5]),
        );
        queue.push(
            Message::new(worker, me, 1, Flag::Get).with_data::<Key>(&[8]),
        );
        // unknown table is dropped
        queue.push(
            Message::new(worker, me, 9, Flag::Get).with_data::<Key>(&[8]),
        );

        let ack1 = send_queue.wait_and_pop()?;
        let ack2 = send_queue.wait_and_pop()?;
        assert_eq!(ack1.meta.flag, Flag::ResetWorkerInModel);
        assert_eq!(ack2.meta.model_id, 2);
        let reply = send_queue.wait_and_pop()?;
        assert_eq!(reply.meta.recver, worker);
        assert_eq!(reply.get_data::<f64>(1)?, vec![2.5]);

        server.stop()?;
        assert!(send_queue.is_empty()?);
        assert!(server
            .register_model(
                ModelType::Asp
                    .new_model(3, StorageType::Map.new_storage::<f64>())
            )
            .is_err());
        Ok(())
    }
}
