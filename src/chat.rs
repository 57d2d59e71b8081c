//! Bounded in-memory ring of stamped chat records, replayed on request.
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::protocol::ServerMessage;

/// Last-N chat/broadcast/unicast records. Stored as the outbound message
/// type so `history` replays exactly what recipients originally saw.
pub struct ChatLog {
    capacity: usize,
    ring: Mutex<VecDeque<ServerMessage>>,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, ring: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn push(&self, record: ServerMessage) {
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Copy of the ring, oldest first.
    pub fn replay(&self) -> Vec<ServerMessage> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}
