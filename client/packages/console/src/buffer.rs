//! Bounded in-memory store for messages received while monitoring a
//! subscription.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// One received message as shown to the UI. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedMessage {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_attempt: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

/// FIFO buffer bounded by a runtime-adjustable maximum. One writer (the
/// subscription's receive loop) and any number of readers.
#[derive(Debug)]
pub struct MessageBuffer {
    inner: RwLock<BufferState>,
}

#[derive(Debug)]
struct BufferState {
    messages: VecDeque<BufferedMessage>,
    max_size: usize,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(BufferState {
                messages: VecDeque::new(),
                max_size,
            }),
        }
    }

    /// Append, evicting the single oldest entry when the bound is exceeded.
    pub fn add(&self, message: BufferedMessage) {
        if let Ok(mut state) = self.inner.write() {
            state.messages.push_back(message);
            while state.messages.len() > state.max_size {
                state.messages.pop_front();
            }
        }
    }

    /// Snapshot of the current contents, oldest first.
    pub fn get_all(&self) -> Vec<BufferedMessage> {
        match self.inner.read() {
            Ok(state) => state.messages.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.write() {
            state.messages.clear();
        }
    }

    /// Change the bound; shrinking evicts the oldest excess immediately.
    pub fn set_max_size(&self, max_size: usize) {
        if let Ok(mut state) = self.inner.write() {
            state.max_size = max_size;
            while state.messages.len() > max_size {
                state.messages.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|state| state.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn message(id: usize) -> BufferedMessage {
        BufferedMessage {
            id: id.to_string(),
            publish_time: None,
            received_at: Utc::now(),
            data: format!("payload-{id}").into_bytes(),
            attributes: HashMap::new(),
            delivery_attempt: None,
            ordering_key: None,
        }
    }

    #[test]
    fn size_never_exceeds_the_bound() {
        let buffer = MessageBuffer::with_capacity(5);
        for id in 0..50 {
            buffer.add(message(id));
            assert!(buffer.len() <= 5);
        }
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn eviction_is_strictly_fifo() {
        let buffer = MessageBuffer::with_capacity(5);
        for id in 1..=8 {
            buffer.add(message(id));
        }
        let ids: Vec<String> = buffer.get_all().into_iter().map(|m| m.id).collect();
        // 8 inserts into a bound of 5: the earliest survivor is the 4th.
        assert_eq!(ids, vec!["4", "5", "6", "7", "8"]);
    }

    #[test]
    fn shrinking_evicts_oldest_excess_immediately() {
        let buffer = MessageBuffer::with_capacity(10);
        for id in 1..=10 {
            buffer.add(message(id));
        }
        buffer.set_max_size(3);
        let ids: Vec<String> = buffer.get_all().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["8", "9", "10"]);

        buffer.set_max_size(5);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let buffer = MessageBuffer::with_capacity(5);
        buffer.add(message(1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.get_all().is_empty());
    }

    #[test]
    fn concurrent_reads_see_consistent_snapshots() {
        let buffer = Arc::new(MessageBuffer::with_capacity(100));
        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for id in 0..2_000 {
                    buffer.add(message(id));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snapshot = buffer.get_all();
                        assert!(snapshot.len() <= 100);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.len(), 100);
    }
}
