//! Per (app thread, table) request bookkeeping that blocks a client thread
//! until all shard replies of its request have been processed.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::mailbox::{Message, TableId, ThreadId};
use crate::utils::ParasyncError;

/// Handler invoked on every reply of a request.
pub type RecvHandle = Box<dyn FnMut(&Message) + Send>;

/// Handler invoked once after the last reply of a request was processed.
pub type FinishHandle = Box<dyn FnMut() + Send>;

type BlockerKey = (ThreadId, TableId);

#[derive(Default)]
struct Handles {
    recv: Option<RecvHandle>,
    finish: Option<FinishHandle>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tracker {
    expected: usize,
    received: usize,
}

/// Callback runner shared by the client tables of a node and the helper
/// threads feeding them replies.
#[derive(Default)]
pub struct AppBlocker {
    handles: Mutex<HashMap<BlockerKey, Arc<Mutex<Handles>>>>,
    trackers: Mutex<HashMap<BlockerKey, Tracker>>,
    cond: Condvar,
}

impl AppBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles_of(
        &self,
        key: BlockerKey,
    ) -> Result<Arc<Mutex<Handles>>, ParasyncError> {
        let mut handles = self.handles.lock()?;
        Ok(handles.entry(key).or_default().clone())
    }

    /// Sets the per-reply handler of `(app_thread, model_id)`.
    pub fn register_recv_handle(
        &self,
        app_thread: ThreadId,
        model_id: TableId,
        recv: RecvHandle,
    ) -> Result<(), ParasyncError> {
        self.handles_of((app_thread, model_id))?.lock()?.recv = Some(recv);
        Ok(())
    }

    /// Sets the finish handler of `(app_thread, model_id)`.
    pub fn register_recv_finish_handle(
        &self,
        app_thread: ThreadId,
        model_id: TableId,
        finish: FinishHandle,
    ) -> Result<(), ParasyncError> {
        self.handles_of((app_thread, model_id))?.lock()?.finish = Some(finish);
        Ok(())
    }

    /// Starts a request expecting `expected` replies.
    pub fn new_request(
        &self,
        app_thread: ThreadId,
        model_id: TableId,
        expected: usize,
    ) -> Result<(), ParasyncError> {
        let mut trackers = self.trackers.lock()?;
        trackers.insert(
            (app_thread, model_id),
            Tracker {
                expected,
                received: 0,
            },
        );
        Ok(())
    }

    /// Blocks until every expected reply of the current request has been
    /// processed.
    pub fn wait_request(
        &self,
        app_thread: ThreadId,
        model_id: TableId,
    ) -> Result<(), ParasyncError> {
        let key = (app_thread, model_id);
        let mut trackers = self.trackers.lock()?;
        loop {
            let done = match trackers.get(&key) {
                Some(t) => t.received >= t.expected,
                None => {
                    return logged_err!(
                        "waiting on {} table {} with no request",
                        app_thread,
                        model_id
                    );
                }
            };
            if done {
                return Ok(());
            }
            trackers = self.cond.wait(trackers)?;
        }
    }

    /// Processes one reply: runs the recv handler, then the finish handler
    /// if this is the last expected reply, then counts it and wakes waiters.
    pub fn add_response(
        &self,
        app_thread: ThreadId,
        model_id: TableId,
        msg: &Message,
    ) -> Result<(), ParasyncError> {
        let key = (app_thread, model_id);
        let is_last = match self.trackers.lock()?.get(&key) {
            Some(t) if t.received < t.expected => t.received + 1 == t.expected,
            Some(_) => {
                pf_warn!(
                    "unexpected extra reply for {} table {}",
                    app_thread,
                    model_id
                );
                return Ok(());
            }
            None => {
                pf_warn!(
                    "reply for {} table {} without request",
                    app_thread,
                    model_id
                );
                return Ok(());
            }
        };

        {
            let handles = self.handles_of(key)?;
            let mut handles = handles.lock()?;
            if let Some(recv) = handles.recv.as_mut() {
                recv(msg);
            }
            if is_last {
                if let Some(finish) = handles.finish.as_mut() {
                    finish();
                }
            }
        }

        let mut trackers = self.trackers.lock()?;
        if let Some(t) = trackers.get_mut(&key) {
            t.received += 1;
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Number of replies processed for the current request.
    pub fn received(
        &self,
        app_thread: ThreadId,
        model_id: TableId,
    ) -> Result<Option<usize>, ParasyncError> {
        let trackers = self.trackers.lock()?;
        Ok(trackers.get(&(app_thread, model_id)).map(|t| t.received))
    }
}

#[cfg(test)]
mod blocker_tests {
    use super::*;
    use crate::mailbox::Flag;
    use std::thread;
    use std::time::Duration;

    fn reply(to: ThreadId, tag: u32) -> Message {
        Message::new(ThreadId::server(0, 0), to, 0, Flag::Get)
            .with_data::<u32>(&[tag])
    }

    #[test]
    fn finish_runs_once_after_all_recvs() -> Result<(), ParasyncError> {
        let blocker = Arc::new(AppBlocker::new());
        let app = ThreadId::worker(0, 1);
        let log = Arc::new(Mutex::new(vec![]));

        let recv_log = log.clone();
        blocker.register_recv_handle(
            app,
            0,
            Box::new(move |msg| {
                let tag = msg.get_data::<u32>(0).unwrap()[0];
                recv_log.lock().unwrap().push(format!("recv{}", tag));
            }),
        )?;
        let finish_log = log.clone();
        blocker.register_recv_finish_handle(
            app,
            0,
            Box::new(move || finish_log.lock().unwrap().push("finish".into())),
        )?;

        blocker.new_request(app, 0, 3)?;
        let feeder = {
            let blocker = blocker.clone();
            thread::spawn(move || -> Result<(), ParasyncError> {
                for tag in 0..3 {
                    thread::sleep(Duration::from_millis(5));
                    blocker.add_response(app, 0, &reply(app, tag))?;
                }
                Ok(())
            })
        };
        blocker.wait_request(app, 0)?;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["recv0", "recv1", "recv2", "finish"]
        );
        assert_eq!(blocker.received(app, 0)?, Some(3));
        feeder.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn stray_replies_ignored() -> Result<(), ParasyncError> {
        let blocker = AppBlocker::new();
        let app = ThreadId::worker(0, 0);
        blocker.add_response(app, 0, &reply(app, 0))?;
        assert_eq!(blocker.received(app, 0)?, None);
        assert!(blocker.wait_request(app, 0).is_err());

        blocker.new_request(app, 0, 1)?;
        blocker.add_response(app, 0, &reply(app, 0))?;
        blocker.add_response(app, 0, &reply(app, 1))?;
        assert_eq!(blocker.received(app, 0)?, Some(1));
        blocker.wait_request(app, 0)?;
        Ok(())
    }

    #[test]
    fn zero_expected_does_not_block() -> Result<(), ParasyncError> {
        let blocker = AppBlocker::new();
        let app = ThreadId::worker(0, 0);
        blocker.new_request(app, 7, 0)?;
        blocker.wait_request(app, 7)?;
        Ok(())
    }
}
