//! Message routing substrate: a registry of per-thread inbound queues plus a
//! sender thread that drains the shared outbound queue, delivering locally
//! or over the inter-node transport.

mod message;
mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::thread;

use crate::utils::{ParasyncError, ThreadsafeQueue};

use transport::{PeerSenders, TransportHub};

pub use message::{
    Flag, Key, Message, Meta, NodeId, TableId, ThreadId, ThreadKind,
};

/// Shared registry from thread ID -> that thread's inbound queue.
pub(crate) type QueueMap =
    Arc<RwLock<HashMap<ThreadId, Arc<ThreadsafeQueue<Message>>>>>;

/// Per-node message router.
pub struct Mailbox {
    /// My node ID.
    me: NodeId,

    /// Registered local inbound queues.
    queues: QueueMap,

    /// Shared outbound queue all local threads push into.
    send_queue: Arc<ThreadsafeQueue<Message>>,

    /// Inter-node transport, present when the cluster has peers.
    transport: Option<TransportHub>,

    /// Join handle of the sender thread.
    sender_handle: Option<thread::JoinHandle<()>>,
}

impl Mailbox {
    /// Creates a new mailbox for node `me` with no queues registered.
    pub fn new(me: NodeId) -> Self {
        Mailbox {
            me,
            queues: Arc::new(RwLock::new(HashMap::new())),
            send_queue: Arc::new(ThreadsafeQueue::new()),
            transport: None,
            sender_handle: None,
        }
    }

    /// Opens TCP links to every peer node. Does nothing when `peer_addrs`
    /// holds no node other than me.
    pub fn connect(
        &mut self,
        bind_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
    ) -> Result<(), ParasyncError> {
        if self.transport.is_some() {
            return logged_err!("mailbox already connected");
        }
        if self.sender_handle.is_some() {
            return logged_err!("connect called after sender started");
        }
        if peer_addrs.keys().all(|&id| id == self.me) {
            return Ok(());
        }
        self.transport = Some(TransportHub::new_and_setup(
            self.me,
            bind_addr,
            peer_addrs,
            self.queues.clone(),
        )?);
        Ok(())
    }

    /// Registers the inbound queue of a local thread.
    pub fn register_queue(
        &self,
        tid: ThreadId,
        queue: Arc<ThreadsafeQueue<Message>>,
    ) -> Result<(), ParasyncError> {
        if tid.node != self.me {
            return logged_err!("cannot register remote thread {}", tid);
        }
        let mut queues = self.queues.write()?;
        if queues.contains_key(&tid) {
            return logged_err!("queue of {} already registered", tid);
        }
        queues.insert(tid, queue);
        Ok(())
    }

    /// Removes the inbound queue of a local thread.
    pub fn deregister_queue(&self, tid: ThreadId) -> Result<(), ParasyncError> {
        let mut queues = self.queues.write()?;
        if queues.remove(&tid).is_none() {
            return logged_err!("queue of {} not registered", tid);
        }
        Ok(())
    }

    /// Delivers a message directly into a local registered queue.
    pub fn deliver(&self, msg: Message) -> Result<(), ParasyncError> {
        Self::deliver_local(&self.queues, msg)
    }

    /// The shared outbound queue.
    pub fn send_queue(&self) -> Arc<ThreadsafeQueue<Message>> {
        self.send_queue.clone()
    }

    /// Spawns the sender thread.
    pub fn start_sender(&mut self) -> Result<(), ParasyncError> {
        if self.sender_handle.is_some() {
            return logged_err!("sender thread already started");
        }
        let peers = self
            .transport
            .as_ref()
            .map(|hub| hub.peer_senders())
            .unwrap_or_default();
        let me = self.me;
        let queues = self.queues.clone();
        let send_queue = self.send_queue.clone();
        let handle = thread::Builder::new()
            .name(format!("sender-n{}", me))
            .spawn(move || Self::sender_thread(me, queues, send_queue, peers))?;
        self.sender_handle = Some(handle);
        Ok(())
    }

    /// Stops the sender thread after everything queued before this call has
    /// been routed, then closes the transport.
    pub fn stop(&mut self) -> Result<(), ParasyncError> {
        if let Some(handle) = self.sender_handle.take() {
            let driver = ThreadId::driver(self.me);
            self.send_queue.push(Message::exit(driver, driver));
            if handle.join().is_err() {
                return logged_err!("sender thread panicked");
            }
        }
        if let Some(hub) = self.transport.take() {
            hub.shutdown();
        }
        Ok(())
    }

    fn deliver_local(
        queues: &QueueMap,
        msg: Message,
    ) -> Result<(), ParasyncError> {
        let queue = queues.read()?.get(&msg.meta.recver).cloned();
        match queue {
            Some(queue) => {
                queue.push(msg);
                Ok(())
            }
            None => logged_err!(
                "no queue registered for {} ({:?} from {})",
                msg.meta.recver,
                msg.meta.flag,
                msg.meta.sender
            ),
        }
    }

    /// Sender thread function.
    fn sender_thread(
        me: NodeId,
        queues: QueueMap,
        send_queue: Arc<ThreadsafeQueue<Message>>,
        peers: PeerSenders,
    ) {
        pf_debug!("sender thread spawned");
        let driver = ThreadId::driver(me);

        loop {
            let msg = match send_queue.wait_and_pop() {
                Ok(msg) => msg,
                Err(e) => {
                    pf_error!("error popping send queue: {}", e);
                    break;
                }
            };
            if msg.meta.flag == Flag::Exit
                && msg.meta.recver == driver
                && msg.meta.sender == driver
            {
                break;
            }

            let recver = msg.meta.recver;
            if recver.node == me {
                // failure already logged; the message is dropped
                let _ = Self::deliver_local(&queues, msg);
            } else {
                match peers.get(&recver.node) {
                    Some(tx_send) => {
                        if let Err(e) = tx_send.send(msg) {
                            pf_error!(
                                "error sending to n{}: {}",
                                recver.node,
                                e
                            );
                        }
                    }
                    None => pf_warn!(
                        "no link to node {}, dropping {:?}",
                        recver.node,
                        msg.meta.flag
                    ),
                }
            }
        }

        pf_debug!("sender thread exited");
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            pf_error!("error stopping mailbox: {}", e);
        }
    }
}
