//! Consistency models deciding when Add/Get traffic of a table touches its
//! storage relative to worker clocks.

mod asp;
mod bsp;
mod ssp;

use crate::mailbox::{Flag, Message, TableId, ThreadId};
use crate::server::Storage;
use crate::utils::ParasyncError;

use serde::{Deserialize, Serialize};

pub use asp::AspModel;
pub use bsp::BspModel;
pub use ssp::SspModel;

/// Consistency policy chosen at table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    /// Asynchronous: everything applied and served immediately.
    Asp,
    /// Bulk synchronous: updates become visible only once every worker has
    /// clocked.
    Bsp,
    /// Stale synchronous with the given staleness bound.
    Ssp { staleness: u64 },
}

impl ModelType {
    /// Creates the model instance owning `storage` for table `model_id`.
    pub fn new_model(
        &self,
        model_id: TableId,
        storage: Box<dyn Storage>,
    ) -> ConsistencyModel {
        match *self {
            ModelType::Asp => {
                ConsistencyModel::Asp(AspModel::new(model_id, storage))
            }
            ModelType::Bsp => {
                ConsistencyModel::Bsp(BspModel::new(model_id, storage))
            }
            ModelType::Ssp { staleness } => ConsistencyModel::Ssp(
                SspModel::new(model_id, staleness, storage),
            ),
        }
    }
}

/// One table's consistency state machine on one server thread.
pub enum ConsistencyModel {
    Asp(AspModel),
    Bsp(BspModel),
    Ssp(SspModel),
}

impl ConsistencyModel {
    pub fn model_id(&self) -> TableId {
        match self {
            ConsistencyModel::Asp(m) => m.model_id(),
            ConsistencyModel::Bsp(m) => m.model_id(),
            ConsistencyModel::Ssp(m) => m.model_id(),
        }
    }

    /// Handles one message and returns the replies to send out. Messages
    /// for another model id or with an unrelated flag are ignored.
    pub fn handle(
        &mut self,
        msg: Message,
    ) -> Result<Vec<Message>, ParasyncError> {
        if msg.meta.model_id != self.model_id() {
            pf_debug!(
                "model {} ignoring msg for model {}",
                self.model_id(),
                msg.meta.model_id
            );
            return Ok(vec![]);
        }

        match (self, msg.meta.flag) {
            (ConsistencyModel::Asp(m), Flag::Add) => m.add(msg),
            (ConsistencyModel::Asp(m), Flag::Get) => m.get(msg),
            (ConsistencyModel::Asp(m), Flag::Clock) => m.clock(msg),
            (ConsistencyModel::Asp(m), Flag::ResetWorkerInModel) => {
                m.reset_worker(msg)
            }
            (ConsistencyModel::Bsp(m), Flag::Add) => m.add(msg),
            (ConsistencyModel::Bsp(m), Flag::Get) => m.get(msg),
            (ConsistencyModel::Bsp(m), Flag::Clock) => m.clock(msg),
            (ConsistencyModel::Bsp(m), Flag::ResetWorkerInModel) => {
                m.reset_worker(msg)
            }
            (ConsistencyModel::Ssp(m), Flag::Add) => m.add(msg),
            (ConsistencyModel::Ssp(m), Flag::Get) => m.get(msg),
            (ConsistencyModel::Ssp(m), Flag::Clock) => m.clock(msg),
            (ConsistencyModel::Ssp(m), Flag::ResetWorkerInModel) => {
                m.reset_worker(msg)
            }
            (_, flag) => {
                pf_debug!("ignoring {:?} from {}", flag, msg.meta.sender);
                Ok(vec![])
            }
        }
    }
}

/// Decodes the worker set of a `ResetWorkerInModel` message.
fn reset_tids(msg: &Message) -> Result<Vec<ThreadId>, ParasyncError> {
    msg.get_data::<ThreadId>(0)
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use crate::mailbox::Key;
    use crate::utils::Codec;

    pub(crate) const SERVER: ThreadId = ThreadId {
        node: 0,
        kind: crate::mailbox::ThreadKind::Server,
        slot: 0,
    };

    pub(crate) fn w(slot: u16) -> ThreadId {
        ThreadId::worker(0, slot)
    }

    pub(crate) fn reset(model_id: TableId, tids: &[ThreadId]) -> Message {
        Message::new(
            ThreadId::driver(0),
            SERVER,
            model_id,
            Flag::ResetWorkerInModel,
        )
        .with_data(tids)
    }

    pub(crate) fn add(
        model_id: TableId,
        from: ThreadId,
        keys: &[Key],
        vals: &[i64],
    ) -> Message {
        Message::new(from, SERVER, model_id, Flag::Add)
            .with_data(keys)
            .with_data(vals)
    }

    pub(crate) fn get(
        model_id: TableId,
        from: ThreadId,
        keys: &[Key],
    ) -> Message {
        Message::new(from, SERVER, model_id, Flag::Get).with_data(keys)
    }

    pub(crate) fn clock(model_id: TableId, from: ThreadId) -> Message {
        Message::new(from, SERVER, model_id, Flag::Clock)
    }

    /// Values carried by a Get reply.
    pub(crate) fn vals_of(reply: &Message) -> Vec<i64> {
        i64::decode(&reply.data[1]).unwrap()
    }
}

#[cfg(test)]
mod model_tests {
    use super::test_helpers::*;
    use super::*;
    use crate::server::StorageType;

    #[test]
    fn mismatched_model_id_ignored() -> Result<(), ParasyncError> {
        let mut model =
            ModelType::Asp.new_model(3, StorageType::Map.new_storage::<i64>());
        assert!(model.handle(add(4, w(0), &[1], &[5]))?.is_empty());
        assert!(model.handle(get(4, w(0), &[1]))?.is_empty());
        let replies = model.handle(get(3, w(0), &[1]))?;
        assert_eq!(vals_of(&replies[0]), vec![0]);
        Ok(())
    }

    #[test]
    fn unrelated_flag_ignored() -> Result<(), ParasyncError> {
        let mut model =
            ModelType::Bsp.new_model(0, StorageType::Map.new_storage::<i64>());
        let msg = Message::new(w(0), SERVER, 0, Flag::DoThis);
        assert!(model.handle(msg)?.is_empty());
        Ok(())
    }

    #[test]
    fn reset_replies_to_driver() -> Result<(), ParasyncError> {
        for model_type in
            [ModelType::Asp, ModelType::Bsp, ModelType::Ssp { staleness: 1 }]
        {
            let mut model = model_type
                .new_model(1, StorageType::Map.new_storage::<i64>());
            let replies = model.handle(reset(1, &[w(0), w(1)]))?;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].meta.flag, Flag::ResetWorkerInModel);
            assert_eq!(replies[0].meta.recver, ThreadId::driver(0));
            assert_eq!(replies[0].meta.sender, SERVER);
        }
        Ok(())
    }
}
