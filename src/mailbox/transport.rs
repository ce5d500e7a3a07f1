//! TCP links between nodes. Each peer link gets a writer task draining a
//! per-peer channel and a reader task delivering inbound messages straight
//! into the registered local queues.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::mailbox::{Message, NodeId, QueueMap};
use crate::utils::ParasyncError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Sender sides of the per-peer send channels. Cheap to clone into the
/// mailbox sender thread.
pub(crate) type PeerSenders = HashMap<NodeId, mpsc::UnboundedSender<Message>>;

/// Inter-node TCP transport hub.
pub(crate) struct TransportHub {
    /// My node ID.
    me: NodeId,

    /// Runtime driving all link tasks.
    runtime: Runtime,

    /// Map from peer ID -> sender side of the send channel.
    tx_sends: PeerSenders,

    /// Join handles of the writer tasks, awaited on shutdown so that queued
    /// messages get flushed.
    writer_handles: Vec<JoinHandle<()>>,

    /// Join handles of the reader tasks.
    reader_handles: Vec<JoinHandle<()>>,
}

impl TransportHub {
    /// Creates the hub and establishes links to every peer in `peer_addrs`,
    /// blocking until the whole group is connected.
    pub(crate) fn new_and_setup(
        me: NodeId,
        bind_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
        queues: QueueMap,
    ) -> Result<Self, ParasyncError> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .thread_name(format!("tokio-transport-n{}", me))
            .build()?;

        let streams =
            runtime.block_on(Self::group_connect(me, bind_addr, peer_addrs))?;

        let mut tx_sends = HashMap::new();
        let mut writer_handles = vec![];
        let mut reader_handles = vec![];
        for (id, stream) in streams {
            let (conn_read, conn_write) = stream.into_split();
            let (tx_send, rx_send) = mpsc::unbounded_channel();
            tx_sends.insert(id, tx_send);
            writer_handles.push(runtime.spawn(Self::peer_writer_task(
                me, id, conn_write, rx_send,
            )));
            reader_handles.push(runtime.spawn(Self::peer_reader_task(
                me,
                id,
                conn_read,
                queues.clone(),
            )));
        }

        Ok(TransportHub {
            me,
            runtime,
            tx_sends,
            writer_handles,
            reader_handles,
        })
    }

    /// Clones the per-peer senders.
    pub(crate) fn peer_senders(&self) -> PeerSenders {
        self.tx_sends.clone()
    }

    /// Closes all send channels, waits for the writers to flush, then tears
    /// down the runtime.
    pub(crate) fn shutdown(self) {
        let TransportHub {
            me,
            runtime,
            tx_sends,
            writer_handles,
            reader_handles,
        } = self;
        drop(tx_sends);

        runtime.block_on(async move {
            for handle in writer_handles {
                if time::timeout(Duration::from_secs(5), handle).await.is_err()
                {
                    pf_warn!("writer task flush timed out");
                }
            }
        });
        for handle in reader_handles {
            handle.abort();
        }
        runtime.shutdown_background();
        pf_debug!("transport hub of node {} shut down", me);
    }

    /// Deadlock-free group connection: actively connect to peers with a
    /// smaller ID, wait on connections from peers with a larger ID.
    async fn group_connect(
        me: NodeId,
        bind_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
    ) -> Result<HashMap<NodeId, TcpStream>, ParasyncError> {
        let mut peer_ids: Vec<NodeId> =
            peer_addrs.keys().filter(|&&id| id != me).cloned().collect();
        peer_ids.sort();

        let listener = TcpListener::bind(bind_addr).await?;
        let mid_idx = peer_ids.partition_point(|&id| id < me);
        let mut streams = HashMap::new();

        // for peers with ID smaller than me, connect to them actively
        for &id in &peer_ids[..mid_idx] {
            let addr = peer_addrs[&id];
            let mut stream = loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => break stream,
                    // retry until connected
                    Err(_) => time::sleep(Duration::from_millis(10)).await,
                }
            };
            stream.set_nodelay(true)?;
            stream.write_u16(me).await?; // send my ID
            streams.insert(id, stream);
            pf_debug!("connected to peer n{}", id);
        }

        // for peers with ID larger than me, wait on their connection
        for _ in &peer_ids[mid_idx..] {
            let (mut stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let id = stream.read_u16().await?; // receive peer's ID
            if id <= me || !peer_addrs.contains_key(&id) {
                return logged_err!("unexpected peer ID {} from {}", id, addr);
            }
            if streams.contains_key(&id) {
                return logged_err!("duplicate peer ID {} waited on", id);
            }
            streams.insert(id, stream);
            pf_debug!("waited on peer n{} ({})", id, addr);
        }

        pf_info!("group connected peers {:?}", peer_ids);
        Ok(streams)
    }

    /// Writes a length-prefixed message through given write half.
    async fn write_msg(
        msg: &Message,
        conn_write: &mut OwnedWriteHalf,
    ) -> Result<(), ParasyncError> {
        let msg_bytes = encode_to_vec(msg)?;
        conn_write.write_u64(msg_bytes.len() as u64).await?; // length first
        conn_write.write_all(&msg_bytes[..]).await?;
        Ok(())
    }

    /// Reads a length-prefixed message from given read half.
    async fn read_msg(
        conn_read: &mut OwnedReadHalf,
    ) -> Result<Message, ParasyncError> {
        let msg_len = conn_read.read_u64().await?; // length first
        let mut msg_buf: Vec<u8> = vec![0; msg_len as usize];
        conn_read.read_exact(&mut msg_buf[..]).await?;
        let msg = decode_from_slice(&msg_buf)?;
        Ok(msg)
    }

    /// Peer writer task function.
    async fn peer_writer_task(
        me: NodeId,
        id: NodeId,
        mut conn_write: OwnedWriteHalf,
        mut rx_send: mpsc::UnboundedReceiver<Message>,
    ) {
        pf_debug!("n{} writer task for n{} spawned", me, id);
        while let Some(msg) = rx_send.recv().await {
            if let Err(e) = Self::write_msg(&msg, &mut conn_write).await {
                pf_error!("error sending to n{}: {}", id, e);
                break;
            }
            pf_trace!("sent to n{} msg {:?}", id, msg.meta);
        }
        let _ = conn_write.shutdown().await;
        pf_debug!("n{} writer task for n{} exited", me, id);
    }

    /// Peer reader task function.
    async fn peer_reader_task(
        me: NodeId,
        id: NodeId,
        mut conn_read: OwnedReadHalf,
        queues: QueueMap,
    ) {
        pf_debug!("n{} reader task for n{} spawned", me, id);
        loop {
            let msg = match Self::read_msg(&mut conn_read).await {
                Ok(msg) => msg,
                Err(e) => {
                    // peer closing its write half ends the link
                    pf_debug!("link from n{} closed: {}", id, e);
                    break;
                }
            };
            pf_trace!("recv from n{} msg {:?}", id, msg.meta);
            let queue = match queues.read() {
                Ok(map) => map.get(&msg.meta.recver).cloned(),
                Err(e) => {
                    pf_error!("queue registry poisoned: {}", e);
                    break;
                }
            };
            match queue {
                Some(queue) => queue.push(msg),
                None => pf_warn!(
                    "dropping {:?} from n{} for unregistered {}",
                    msg.meta.flag,
                    id,
                    msg.meta.recver
                ),
            }
        }
        pf_debug!("n{} reader task for n{} exited", me, id);
    }
}
