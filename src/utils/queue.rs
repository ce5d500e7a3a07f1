//! Blocking multi-producer multi-consumer queue used by every dispatch loop.

use std::sync::Mutex;

use crate::utils::ParasyncError;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Thread-safe FIFO queue. Pushes never block; pops block the calling OS
/// thread until an item is available. Must not be popped from inside an
/// async context.
#[derive(Debug)]
pub struct ThreadsafeQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> ThreadsafeQueue<T> {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ThreadsafeQueue {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Appends an item to the back of the queue.
    pub fn push(&self, item: T) {
        // the receiver lives in self, so the channel can never be closed
        let _ = self.tx.send(item);
    }

    /// Blocks until an item is available and pops it from the front.
    pub fn wait_and_pop(&self) -> Result<T, ParasyncError> {
        let mut rx = self.rx.lock()?;
        rx.blocking_recv()
            .ok_or(ParasyncError::msg("queue channel closed"))
    }

    /// Pops the front item if one is immediately available.
    pub fn try_pop(&self) -> Result<Option<T>, ParasyncError> {
        let mut rx = self.rx.lock()?;
        match rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> Result<usize, ParasyncError> {
        let rx = self.rx.lock()?;
        Ok(rx.len())
    }

    pub fn is_empty(&self) -> Result<bool, ParasyncError> {
        Ok(self.len()? == 0)
    }
}

impl<T> Default for ThreadsafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
