// Frame queue: ordered buffer of frames waiting for the worker

use crate::error::{RelayError, Result};
use crate::relay::types::FramePayload;
use clap::ValueEnum;
use serde::Serialize;
use std::collections::VecDeque;
use std::num::NonZeroUsize;

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the frame at the head to make room.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
    /// Refuse the incoming frame with an error.
    Reject,
}

/// FIFO of pending frames. A single global order across all clients.
#[derive(Debug, Default)]
pub struct FrameQueue {
    items: VecDeque<FramePayload>,
    capacity: Option<NonZeroUsize>,
    policy: OverflowPolicy,
}

impl FrameQueue {
    /// Unbounded queue.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(capacity: Option<NonZeroUsize>, policy: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            policy,
        }
    }

    /// Append to the tail.
    ///
    /// Returns the frame that was discarded to honour the capacity, if any:
    /// the old head under `DropOldest`, the incoming frame under `DropNewest`.
    /// Under `Reject` a full queue yields `QueueFull` and nothing changes.
    pub fn enqueue(&mut self, payload: FramePayload) -> Result<Option<FramePayload>> {
        let Some(capacity) = self.capacity else {
            self.items.push_back(payload);
            return Ok(None);
        };

        if self.items.len() < capacity.get() {
            self.items.push_back(payload);
            return Ok(None);
        }

        match self.policy {
            OverflowPolicy::DropOldest => {
                let evicted = self.items.pop_front();
                self.items.push_back(payload);
                Ok(evicted)
            }
            OverflowPolicy::DropNewest => Ok(Some(payload)),
            OverflowPolicy::Reject => Err(RelayError::QueueFull(self.items.len())),
        }
    }

    /// Remove and return the head.
    pub fn dequeue(&mut self) -> Option<FramePayload> {
        self.items.pop_front()
    }

    /// Put a frame back at the head after a hand-off that never reached the worker.
    pub fn requeue_front(&mut self, payload: FramePayload) {
        self.items.push_front(payload);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
