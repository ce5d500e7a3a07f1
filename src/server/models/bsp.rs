//! Bulk synchronous parallel model.

use crate::mailbox::{Message, TableId};
use crate::server::{ProgressTracker, Storage};
use crate::utils::ParasyncError;

/// Buffers Adds of the active superstep and Gets of workers already past
/// the barrier; flushes both once the last lagging worker clocks.
///
/// An Add from a worker whose clock is not the current min clock is
/// dropped rather than buffered.
pub struct BspModel {
    model_id: TableId,
    storage: Box<dyn Storage>,
    tracker: ProgressTracker,
    add_buffer: Vec<Message>,
    get_buffer: Vec<Message>,
}

impl BspModel {
    pub fn new(model_id: TableId, storage: Box<dyn Storage>) -> Self {
        BspModel {
            model_id,
            storage,
            tracker: ProgressTracker::new(),
            add_buffer: vec![],
            get_buffer: vec![],
        }
    }

    pub fn model_id(&self) -> TableId {
        self.model_id
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn pending_adds(&self) -> usize {
        self.add_buffer.len()
    }

    pub fn pending_gets(&self) -> usize {
        self.get_buffer.len()
    }

    pub fn add(&mut self, msg: Message) -> Result<Vec<Message>, ParasyncError> {
        match self.tracker.progress(msg.meta.sender) {
            Some(p) if p == self.tracker.min_clock() => {
                self.add_buffer.push(msg);
            }
            Some(p) => {
                pf_debug!(
                    "table {} dropping late add from {} at clock {} (min {})",
                    self.model_id,
                    msg.meta.sender,
                    p,
                    self.tracker.min_clock()
                );
            }
            None => {
                pf_debug!(
                    "table {} dropping add from unknown {}",
                    self.model_id,
                    msg.meta.sender
                );
            }
        }
        Ok(vec![])
    }

    pub fn get(&mut self, msg: Message) -> Result<Vec<Message>, ParasyncError> {
        match self.tracker.progress(msg.meta.sender) {
            Some(p) if p > self.tracker.min_clock() => {
                self.get_buffer.push(msg);
                Ok(vec![])
            }
            _ => Ok(vec![self.storage.get(&msg)?]),
        }
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
        match self.tracker.advance_and_get_changed_min_clock(sender) {
            Some(min_clock) => {
                pf_trace!(
                    "table {} superstep done, min clock {}",
                    self.model_id,
                    min_clock
                );
                for add in self.add_buffer.drain(..) {
                    self.storage.add(&add)?;
                }
                self.get_buffer
                    .drain(..)
                    .map(|get| self.storage.get(&get))
                    .collect()
            }
            None => Ok(vec![]),
        }
    }

    pub fn reset_worker(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        let tids = super::reset_tids(&msg)?;
        self.tracker.init(&tids);
        self.add_buffer.clear();
        self.get_buffer.clear();
        Ok(vec![msg.reply(msg.meta.flag)])
    }
}
