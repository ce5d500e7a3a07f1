//! Asynchronous parallel model.

use crate::mailbox::{Message, TableId};
use crate::server::{ProgressTracker, Storage};
use crate::utils::ParasyncError;

/// Applies every Add and serves every Get immediately. Clocks only update
/// the tracker.
pub struct AspModel {
    model_id: TableId,
    storage: Box<dyn Storage>,
    tracker: ProgressTracker,
}

impl AspModel {
    pub fn new(model_id: TableId, storage: Box<dyn Storage>) -> Self {
        AspModel {
            model_id,
            storage,
            tracker: ProgressTracker::new(),
        }
    }

    pub fn model_id(&self) -> TableId {
        self.model_id
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn add(&mut self, msg: Message) -> Result<Vec<Message>, ParasyncError> {
        self.storage.add(&msg)?;
        Ok(vec![])
    }

    pub fn get(&mut self, msg: Message) -> Result<Vec<Message>, ParasyncError> {
        Ok(vec![self.storage.get(&msg)?])
    }

    pub fn clock(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        let _ = self.tracker.advance_and_get_changed_min_clock(msg.meta.sender);
        Ok(vec![])
    }

    pub fn reset_worker(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        let tids = super::reset_tids(&msg)?;
        self.tracker.init(&tids);
        Ok(vec![msg.reply(msg.meta.flag)])
    }
}

#[cfg(test)]
mod asp_tests {
    use super::super::test_helpers::*;
    use super::*;
    use crate::server::StorageType;

    #[test]
    fn immediate_visibility() -> Result<(), ParasyncError> {
        let mut model =
            AspModel::new(0, StorageType::Map.new_storage::<i64>());
        model.reset_worker(reset(0, &[w(0), w(1)]))?;
        assert!(model.add(add(0, w(0), &[7], &[3]))?.is_empty());
        let replies = model.get(get(0, w(1), &[7]))?;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].meta.recver, w(1));
        assert_eq!(vals_of(&replies[0]), vec![3]);

        // a worker far ahead still reads immediately
        for _ in 0..5 {
            model.clock(clock(0, w(1)))?;
        }
        assert_eq!(model.tracker().progress(w(1)), Some(5));
        assert_eq!(model.tracker().min_clock(), 0);
        model.add(add(0, w(0), &[7], &[4]))?;
        assert_eq!(vals_of(&model.get(get(0, w(1), &[7]))?[0]), vec![7]);
        Ok(())
    }
}
