//! Background thread paired with one worker: owns the worker's inbound
//! queue and fans replies out to the callback runner or the work assigner.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::client::{AppBlocker, AssignerEvent, WorkAssigner};
use crate::mailbox::{Flag, Message, ThreadId};
use crate::utils::{ParasyncError, ThreadsafeQueue};

use tokio::sync::mpsc;

type AssignerInbox = Arc<Mutex<Option<mpsc::UnboundedSender<AssignerEvent>>>>;

/// Handle to a running helper thread.
pub struct WorkerHelperThread {
    /// My thread ID.
    id: ThreadId,

    /// Inbound queue; registered with the mailbox under the paired worker's
    /// ID while a task runs.
    queue: Arc<ThreadsafeQueue<Message>>,

    /// Inbox of the current worker's assigner, if any.
    assigner_inbox: AssignerInbox,

    /// Join handle of the helper thread.
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerHelperThread {
    /// Spawns the helper thread.
    pub fn new_and_setup(
        id: ThreadId,
        blocker: Arc<AppBlocker>,
    ) -> Result<Self, ParasyncError> {
        let queue = Arc::new(ThreadsafeQueue::new());
        let assigner_inbox: AssignerInbox = Arc::new(Mutex::new(None));

        let thread_queue = queue.clone();
        let thread_inbox = assigner_inbox.clone();
        let handle = thread::Builder::new()
            .name(format!("helper-{}", id))
            .spawn(move || {
                Self::helper_thread(id, thread_queue, blocker, thread_inbox)
            })?;

        Ok(WorkerHelperThread {
            id,
            queue,
            assigner_inbox,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn queue(&self) -> Arc<ThreadsafeQueue<Message>> {
        self.queue.clone()
    }

    /// Routes subsequent protocol messages to `assigner`.
    pub fn register_assigner(
        &self,
        assigner: &WorkAssigner,
    ) -> Result<(), ParasyncError> {
        *self.assigner_inbox.lock()? = Some(assigner.inbox());
        Ok(())
    }

    pub fn deregister_assigner(&self) -> Result<(), ParasyncError> {
        *self.assigner_inbox.lock()? = None;
        Ok(())
    }

    /// Pushes `Exit` into my queue and joins the thread.
    pub fn stop(&mut self) -> Result<(), ParasyncError> {
        if let Some(handle) = self.handle.take() {
            self.queue.push(Message::exit(self.id, self.id));
            if handle.join().is_err() {
                return logged_err!("helper {} panicked", self.id);
            }
        }
        Ok(())
    }

    /// Helper thread function.
    fn helper_thread(
        me: ThreadId,
        queue: Arc<ThreadsafeQueue<Message>>,
        blocker: Arc<AppBlocker>,
        assigner_inbox: AssignerInbox,
    ) {
        pf_debug!("helper thread {} spawned", me);

        loop {
            let msg = match queue.wait_and_pop() {
                Ok(msg) => msg,
                Err(e) => {
                    pf_error!("helper {} queue error: {}", me, e);
                    break;
                }
            };

            match msg.meta.flag {
                Flag::Exit => break,
                Flag::Get => {
                    let (app, model_id) = (msg.meta.recver, msg.meta.model_id);
                    if let Err(e) = blocker.add_response(app, model_id, &msg) {
                        pf_error!("helper {} reply handling: {}", me, e);
                    }
                }
                flag => {
                    let inbox = match assigner_inbox.lock() {
                        Ok(inbox) => inbox.clone(),
                        Err(e) => {
                            pf_error!("helper {} inbox poisoned: {}", me, e);
                            break;
                        }
                    };
                    match inbox {
                        Some(inbox) => {
                            if inbox.send(AssignerEvent::Peer(msg)).is_err() {
                                pf_debug!("helper {} assigner gone", me);
                            }
                        }
                        None => {
                            pf_debug!(
                                "helper {} has no assigner, dropping {:?}",
                                me,
                                flag
                            );
                        }
                    }
                }
            }
        }

        pf_debug!("helper thread {} exited", me);
    }
}

impl Drop for WorkerHelperThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
