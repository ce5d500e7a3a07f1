//! Thread identities and the message envelope exchanged between threads.

use std::fmt;

use crate::utils::{Codec, ParasyncError};

use bytes::{BufMut, Bytes, BytesMut};

use serde::{Deserialize, Serialize};

/// Parameter (feature) key.
pub type Key = u32;

/// Table (model) identifier.
pub type TableId = u32;

/// Node identifier within the cluster.
pub type NodeId = u16;

/// Role pool a thread id is drawn from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum ThreadKind {
    /// Server thread owning table shards.
    Server,
    /// Background helper thread paired with a worker.
    Helper,
    /// Dynamically allocated application worker thread.
    Worker,
    /// The node's engine driver (reset acks and barriers).
    Driver,
}

impl ThreadKind {
    fn tag(&self) -> u8 {
        match self {
            ThreadKind::Server => 0,
            ThreadKind::Helper => 1,
            ThreadKind::Worker => 2,
            ThreadKind::Driver => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ParasyncError> {
        match tag {
            0 => Ok(ThreadKind::Server),
            1 => Ok(ThreadKind::Helper),
            2 => Ok(ThreadKind::Worker),
            3 => Ok(ThreadKind::Driver),
            _ => Err(ParasyncError::msg(format!(
                "invalid thread kind tag {}",
                tag
            ))),
        }
    }
}

/// Opaque handle of a thread in the cluster. The owning node and the pool
/// are explicit fields; `slot` indexes into that node's pool.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct ThreadId {
    pub node: NodeId,
    pub kind: ThreadKind,
    pub slot: u16,
}

impl ThreadId {
    pub fn server(node: NodeId, slot: u16) -> Self {
        ThreadId {
            node,
            kind: ThreadKind::Server,
            slot,
        }
    }

    pub fn helper(node: NodeId, slot: u16) -> Self {
        ThreadId {
            node,
            kind: ThreadKind::Helper,
            slot,
        }
    }

    pub fn worker(node: NodeId, slot: u16) -> Self {
        ThreadId {
            node,
            kind: ThreadKind::Worker,
            slot,
        }
    }

    pub fn driver(node: NodeId) -> Self {
        ThreadId {
            node,
            kind: ThreadKind::Driver,
            slot: 0,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ThreadKind::Server => 's',
            ThreadKind::Helper => 'h',
            ThreadKind::Worker => 'w',
            ThreadKind::Driver => 'd',
        };
        write!(f, "{}{}.{}", kind, self.node, self.slot)
    }
}

impl Codec for ThreadId {
    const WIDTH: usize = 5;

    fn encode(vals: &[Self]) -> Bytes {
        let mut buf = BytesMut::with_capacity(vals.len() * Self::WIDTH);
        for tid in vals {
            buf.put_u16_le(tid.node);
            buf.put_u8(tid.kind.tag());
            buf.put_u16_le(tid.slot);
        }
        buf.freeze()
    }

    fn decode(buf: &[u8]) -> Result<Vec<Self>, ParasyncError> {
        if buf.len() % Self::WIDTH != 0 {
            return Err(ParasyncError::msg(format!(
                "buffer length {} not a multiple of {} for ThreadId",
                buf.len(),
                Self::WIDTH
            )));
        }
        buf.chunks_exact(Self::WIDTH)
            .map(|c| {
                Ok(ThreadId {
                    node: u16::from_le_bytes([c[0], c[1]]),
                    kind: ThreadKind::from_tag(c[2])?,
                    slot: u16::from_le_bytes([c[3], c[4]]),
                })
            })
            .collect()
    }
}

/// Operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    Add,
    Get,
    Clock,
    ResetWorkerInModel,
    Exit,
    Barrier,
    ProgressReport,
    DoThis,
    BegunHelping,
    HelpCompleted,
    CancelHelp,
    DontNeedHelp,
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub sender: ThreadId,
    pub recver: ThreadId,
    pub model_id: TableId,
    pub flag: Flag,
}

/// Unit of communication: a header plus an ordered list of encoded typed
/// arrays. For `Add`/`Get` the first array holds keys, and the second holds
/// values in the table's value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub meta: Meta,
    pub data: Vec<Bytes>,
}

impl Message {
    pub fn new(
        sender: ThreadId,
        recver: ThreadId,
        model_id: TableId,
        flag: Flag,
    ) -> Self {
        Message {
            meta: Meta {
                sender,
                recver,
                model_id,
                flag,
            },
            data: vec![],
        }
    }

    /// Termination notice for a dispatch loop.
    pub fn exit(sender: ThreadId, recver: ThreadId) -> Self {
        Self::new(sender, recver, 0, Flag::Exit)
    }

    /// Appends an encoded array to the payload.
    pub fn add_data<T: Codec>(&mut self, vals: &[T]) {
        self.data.push(T::encode(vals));
    }

    /// Builder-style variant of `add_data`.
    pub fn with_data<T: Codec>(mut self, vals: &[T]) -> Self {
        self.add_data(vals);
        self
    }

    /// Decodes the payload array at `idx`.
    pub fn get_data<T: Codec>(
        &self,
        idx: usize,
    ) -> Result<Vec<T>, ParasyncError> {
        match self.data.get(idx) {
            Some(buf) => T::decode(buf),
            None => Err(ParasyncError::msg(format!(
                "message {:?} has no data array {}",
                self.meta.flag, idx
            ))),
        }
    }

    /// Empty message going back to this message's sender on the same model.
    pub fn reply(&self, flag: Flag) -> Message {
        Message::new(
            self.meta.recver,
            self.meta.sender,
            self.meta.model_id,
            flag,
        )
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[test]
    fn thread_id_display() {
        assert_eq!(format!("{}", ThreadId::server(0, 1)), "s0.1");
        assert_eq!(format!("{}", ThreadId::worker(2, 13)), "w2.13");
        assert_eq!(format!("{}", ThreadId::driver(1)), "d1.0");
    }

    #[test]
    fn thread_id_codec() -> Result<(), ParasyncError> {
        let tids = vec![
            ThreadId::worker(3, 70),
            ThreadId::helper(0, 1),
            ThreadId::driver(258),
        ];
        let buf = ThreadId::encode(&tids);
        assert_eq!(buf.len(), 15);
        assert_eq!(ThreadId::decode(&buf)?, tids);
        assert!(ThreadId::decode(&[0, 0, 9, 0, 0]).is_err());
        Ok(())
    }

    #[test]
    fn payload_arrays() -> Result<(), ParasyncError> {
        let msg = Message::new(
            ThreadId::worker(0, 0),
            ThreadId::server(0, 0),
            5,
            Flag::Add,
        )
        .with_data::<u32>(&[3, 9])
        .with_data::<f32>(&[0.5, -1.0]);
        assert_eq!(msg.get_data::<u32>(0)?, vec![3, 9]);
        assert_eq!(msg.get_data::<f32>(1)?, vec![0.5, -1.0]);
        assert!(msg.get_data::<u32>(2).is_err());
        Ok(())
    }

    #[test]
    fn reply_swaps_ends() {
        let msg = Message::new(
            ThreadId::worker(1, 2),
            ThreadId::server(0, 0),
            5,
            Flag::Get,
        );
        let reply = msg.reply(Flag::Get);
        assert_eq!(reply.meta.sender, ThreadId::server(0, 0));
        assert_eq!(reply.meta.recver, ThreadId::worker(1, 2));
        assert_eq!(reply.meta.model_id, 5);
        assert!(reply.data.is_empty());
    }

    #[test]
    fn wire_encoding() -> Result<(), ParasyncError> {
        let msg = Message::new(
            ThreadId::helper(0, 3),
            ThreadId::worker(1, 0),
            0,
            Flag::DoThis,
        )
        .with_data::<i64>(&[1, 95, 100, 1700000000000]);
        let bytes = rmp_serde::encode::to_vec(&msg)?;
        let back: Message = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(back, msg);
        Ok(())
    }
}
