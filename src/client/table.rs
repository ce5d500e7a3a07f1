//! Worker-side handle to one sharded parameter table.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::client::{AppBlocker, PartitionManager};
use crate::mailbox::{Flag, Key, Message, TableId, ThreadId};
use crate::utils::{ParasyncError, ThreadsafeQueue, Value};

/// Client table used from a single worker thread.
pub struct KvClientTable<V> {
    /// The worker thread owning this handle.
    app_thread: ThreadId,

    model_id: TableId,

    /// Outbound queue of the node.
    send_queue: Arc<ThreadsafeQueue<Message>>,

    partition: Arc<PartitionManager>,

    blocker: Arc<AppBlocker>,

    _value: PhantomData<V>,
}

impl<V: Value> KvClientTable<V> {
    pub fn new(
        app_thread: ThreadId,
        model_id: TableId,
        send_queue: Arc<ThreadsafeQueue<Message>>,
        partition: Arc<PartitionManager>,
        blocker: Arc<AppBlocker>,
    ) -> Self {
        KvClientTable {
            app_thread,
            model_id,
            send_queue,
            partition,
            blocker,
            _value: PhantomData,
        }
    }

    pub fn model_id(&self) -> TableId {
        self.model_id
    }

    /// Sends one `Add` per owning server shard. No reply is expected.
    pub fn add(&self, keys: &[Key], vals: &[V]) -> Result<(), ParasyncError> {
        for (server, (ks, vs)) in self.partition.slice_kvs(keys, vals)? {
            self.send_queue.push(
                Message::new(self.app_thread, server, self.model_id, Flag::Add)
                    .with_data(&ks)
                    .with_data(&vs),
            );
        }
        Ok(())
    }

    /// Fetches values of `keys`, blocking until every shard has replied.
    /// Values come back in input order; duplicate keys repeat their value.
    pub fn get(&self, keys: &[Key]) -> Result<Vec<V>, ParasyncError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let sliced = self.partition.slice_keys(keys)?;

        let merged: Arc<Mutex<HashMap<Key, V>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(keys.len())));
        let done: Arc<Mutex<Option<HashMap<Key, V>>>> =
            Arc::new(Mutex::new(None));

        let recv_merged = merged.clone();
        self.blocker.register_recv_handle(
            self.app_thread,
            self.model_id,
            Box::new(move |msg: &Message| {
                let decoded = msg
                    .get_data::<Key>(0)
                    .and_then(|ks| Ok((ks, msg.get_data::<V>(1)?)));
                match (decoded, recv_merged.lock()) {
                    (Ok((ks, vs)), Ok(mut merged)) => {
                        merged.extend(ks.into_iter().zip(vs));
                    }
                    (Err(e), _) => {
                        pf_error!("bad reply from {}: {}", msg.meta.sender, e)
                    }
                    (_, Err(e)) => pf_error!("merge map poisoned: {}", e),
                }
            }),
        )?;
        let finish_done = done.clone();
        self.blocker.register_recv_finish_handle(
            self.app_thread,
            self.model_id,
            Box::new(move || {
                if let (Ok(mut merged), Ok(mut done)) =
                    (merged.lock(), finish_done.lock())
                {
                    *done = Some(std::mem::take(&mut *merged));
                }
            }),
        )?;

        self.blocker
            .new_request(self.app_thread, self.model_id, sliced.len())?;
        for (server, ks) in sliced {
            self.send_queue.push(
                Message::new(self.app_thread, server, self.model_id, Flag::Get)
                    .with_data(&ks),
            );
        }
        self.blocker.wait_request(self.app_thread, self.model_id)?;

        let merged = done.lock()?.take().ok_or(ParasyncError::msg(format!(
            "get on table {} finished without merged replies",
            self.model_id
        )))?;
        keys.iter()
            .map(|key| {
                merged.get(key).copied().ok_or(ParasyncError::msg(format!(
                    "key {} missing from replies",
                    key
                )))
            })
            .collect()
    }

    /// Sends `Clock` to every server thread of the table, whether or not
    /// this worker touched its shard in the current round.
    pub fn clock(&self) -> Result<(), ParasyncError> {
        for &server in self.partition.server_thread_ids() {
            self.send_queue.push(Message::new(
                self.app_thread,
                server,
                self.model_id,
                Flag::Clock,
            ));
        }
        Ok(())
    }

    /// Convenience for updates given as `(key, value)` pairs.
    pub fn add_pairs(&self, pairs: &[(Key, V)]) -> Result<(), ParasyncError> {
        let (keys, vals): (Vec<Key>, Vec<V>) = pairs.iter().copied().unzip();
        self.add(&keys, &vals)
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;
    use std::thread;

    struct Fixture {
        app: ThreadId,
        send_queue: Arc<ThreadsafeQueue<Message>>,
        blocker: Arc<AppBlocker>,
        table: KvClientTable<f64>,
    }

    fn fixture() -> Result<Fixture, ParasyncError> {
        let app = ThreadId::worker(0, 0);
        let send_queue = Arc::new(ThreadsafeQueue::new());
        let blocker = Arc::new(AppBlocker::new());
        let partition = Arc::new(PartitionManager::new_range(
            vec![ThreadId::server(0, 0), ThreadId::server(1, 0)],
            vec![0..4, 4..10],
        )?);
        let table = KvClientTable::new(
            app,
            3,
            send_queue.clone(),
            partition,
            blocker.clone(),
        );
        Ok(Fixture {
            app,
            send_queue,
            blocker,
            table,
        })
    }

    #[test]
    fn add_sliced_per_shard() -> Result<(), ParasyncError> {
        let f = fixture()?;
        f.table.add(&[6, 3, 5], &[0.5, 1.0, 2.0])?;
        let first = f.send_queue.wait_and_pop()?;
        assert_eq!(first.meta.recver, ThreadId::server(1, 0));
        assert_eq!(first.meta.flag, Flag::Add);
        assert_eq!(first.get_data::<Key>(0)?, vec![6, 5]);
        assert_eq!(first.get_data::<f64>(1)?, vec![0.5, 2.0]);
        let second = f.send_queue.wait_and_pop()?;
        assert_eq!(second.get_data::<Key>(0)?, vec![3]);
        assert!(f.send_queue.is_empty()?);
        assert!(f.table.add(&[11], &[1.0]).is_err());
        Ok(())
    }

    #[test]
    fn clock_hits_every_server() -> Result<(), ParasyncError> {
        let f = fixture()?;
        f.table.clock()?;
        let a = f.send_queue.wait_and_pop()?;
        let b = f.send_queue.wait_and_pop()?;
        assert_eq!(a.meta.flag, Flag::Clock);
        assert_eq!(a.meta.recver, ThreadId::server(0, 0));
        assert_eq!(b.meta.recver, ThreadId::server(1, 0));
        assert_eq!(b.meta.model_id, 3);
        Ok(())
    }

    #[test]
    fn get_in_input_order() -> Result<(), ParasyncError> {
        let f = fixture()?;
        let table = f.table;
        let getter = thread::spawn(move || table.get(&[6, 3, 5, 4, 3]));

        let req_hi = f.send_queue.wait_and_pop()?;
        let req_lo = f.send_queue.wait_and_pop()?;
        assert_eq!(req_hi.get_data::<Key>(0)?, vec![6, 5, 4]);
        assert_eq!(req_lo.get_data::<Key>(0)?, vec![3, 3]);

        // replies arrive in reverse order
        let reply_lo = req_lo
            .reply(Flag::Get)
            .with_data::<Key>(&[3])
            .with_data::<f64>(&[0.1]);
        let reply_hi = req_hi
            .reply(Flag::Get)
            .with_data::<Key>(&[4, 5, 6])
            .with_data::<f64>(&[0.4, 0.2, 0.3]);
        f.blocker.add_response(f.app, 3, &reply_lo)?;
        f.blocker.add_response(f.app, 3, &reply_hi)?;

        let vals = getter.join().unwrap()?;
        assert_eq!(vals, vec![0.3, 0.1, 0.2, 0.4, 0.1]);
        Ok(())
    }

    #[test]
    fn empty_get_returns_immediately() -> Result<(), ParasyncError> {
        let f = fixture()?;
        assert!(f.table.get(&[])?.is_empty());
        f.table.add_pairs(&[])?;
        assert!(f.send_queue.is_empty()?);
        Ok(())
    }
}
