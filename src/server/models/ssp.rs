//! Stale synchronous parallel model.

use crate::mailbox::{Flag, Message, TableId};
use crate::server::{Clock, PendingBuffer, ProgressTracker, Storage};
use crate::utils::ParasyncError;

/// Applies Adds immediately. A Get from a worker more than `staleness`
/// clocks ahead of the min clock is deferred until the min clock reaches
/// `progress - staleness`.
pub struct SspModel {
    model_id: TableId,
    staleness: u64,
    storage: Box<dyn Storage>,
    tracker: ProgressTracker,
    buffer: PendingBuffer,
}

impl SspModel {
    pub fn new(
        model_id: TableId,
        staleness: u64,
        storage: Box<dyn Storage>,
    ) -> Self {
        SspModel {
            model_id,
            staleness,
            storage,
            tracker: ProgressTracker::new(),
            buffer: PendingBuffer::new(),
        }
    }

    pub fn model_id(&self) -> TableId {
        self.model_id
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Number of messages deferred until min clock reaches `clock`.
    pub fn pending_at(&self, clock: Clock) -> usize {
        self.buffer.size(clock)
    }

    pub fn add(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        self.storage.add(&msg)?;
        Ok(vec![])
    }

    pub fn get(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        if let Some(progress) = self.tracker.progress(msg.meta.sender) {
            let min_clock = self.tracker.min_clock();
            if progress - min_clock > self.staleness {
                self.buffer.push(progress - self.staleness, msg);
                return Ok(vec![]);
            }
        }
        Ok(vec![self.storage.get(&msg)?])
    }

    pub fn clock(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        let sender = msg.meta.sender;
        if !self.tracker.contains(sender) {
            pf_debug!("table {} ignoring clock of {}", self.model_id, sender);
            return Ok(vec![]);
        }
        let min_clock =
            match self.tracker.advance_and_get_changed_min_clock(sender) {
                Some(c) => c,
                None => return Ok(vec![]),
            };

        let mut replies = vec![];
        for pending in self.buffer.pop(min_clock) {
            match pending.meta.flag {
                Flag::Add => self.storage.add(&pending)?,
                Flag::Get => replies.push(self.storage.get(&pending)?),
                flag => {
                    pf_warn!("unexpected {:?} in pending buffer", flag);
                }
            }
        }
        Ok(replies)
    }

    pub fn reset_worker(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        let tids = super::reset_tids(&msg)?;
        self.tracker.init(&tids);
        self.buffer.clear();
        Ok(vec![msg.reply(msg.meta.flag)])
    }
}

#[cfg(test)]
mod ssp_tests {
    use super::super::test_helpers::*;
    use super::*;
    use crate::server::StorageType;

    fn new_model(staleness: u64) -> SspModel {
        let mut model =
            SspModel::new(0, staleness, StorageType::Map.new_storage::<i64>());
        model.reset_worker(reset(0, &[w(0), w(1)])).unwrap();
        model
    }

    #[test]
    fn adds_apply_immediately() -> Result<(), ParasyncError> {
        let mut model = new_model(1);
        model.add(add(0, w(0), &[3], &[2]))?;
        assert_eq!(vals_of(&model.get(get(0, w(1), &[3]))?[0]), vec![2]);
        Ok(())
    }

    #[test]
    fn get_within_bound_served() -> Result<(), ParasyncError> {
        let mut model = new_model(2);
        model.clock(clock(0, w(0)))?;
        model.clock(clock(0, w(0)))?;
        // progress 2, min 0, lag 2 <= 2
        assert_eq!(model.get(get(0, w(0), &[1]))?.len(), 1);
        Ok(())
    }

    #[test]
    fn get_deferred_then_released() -> Result<(), ParasyncError> {
        let mut model = new_model(1);
        model.clock(clock(0, w(0)))?;
        model.clock(clock(0, w(0)))?;
        // progress 2, min 0, lag 2 > 1: deferred until min reaches 1
        assert!(model.get(get(0, w(0), &[4]))?.is_empty());
        assert_eq!(model.pending_at(1), 1);

        model.add(add(0, w(1), &[4], &[9]))?;
        let replies = model.clock(clock(0, w(1)))?;
        assert_eq!(model.tracker().min_clock(), 1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].meta.recver, w(0));
        assert_eq!(vals_of(&replies[0]), vec![9]);
        assert_eq!(model.pending_at(1), 0);
        Ok(())
    }

    #[test]
    fn deferred_keyed_by_bound() -> Result<(), ParasyncError> {
        let mut model = new_model(0);
        for _ in 0..3 {
            model.clock(clock(0, w(0)))?;
        }
        // progress 3, staleness 0: served only once min reaches 3
        assert!(model.get(get(0, w(0), &[1]))?.is_empty());
        assert_eq!(model.pending_at(3), 1);
        assert!(model.clock(clock(0, w(1)))?.is_empty());
        assert!(model.clock(clock(0, w(1)))?.is_empty());
        assert_eq!(model.clock(clock(0, w(1)))?.len(), 1);
        Ok(())
    }
}
