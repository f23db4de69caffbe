//! Offline publish buffer
//!
//! Holds publishes issued while a session is down, oldest first, and hands
//! them back in order when the next session comes up.

use crate::error::HermesError;
use crate::types::{BufferOptions, OutboundMessage};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct OfflineBuffer {
    options: BufferOptions,
    queue: VecDeque<OutboundMessage>,
}

impl OfflineBuffer {
    pub fn new(options: BufferOptions) -> Self {
        Self {
            options,
            queue: VecDeque::new(),
        }
    }

    pub fn options(&self) -> BufferOptions {
        self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    /// New options apply to later pushes; queued entries are kept
    pub fn set_options(&mut self, options: BufferOptions) {
        self.options = options;
    }

    /// Queue a publish, evicting the oldest entries when full and allowed to.
    /// Returns every evicted entry, oldest first. More than one is evicted
    /// when the capacity was lowered below the queue length.
    pub fn push(&mut self, message: OutboundMessage) -> Result<Vec<OutboundMessage>, HermesError> {
        let capacity = self.options.capacity;
        if capacity == 0 {
            return Err(HermesError::BufferFull { capacity });
        }
        if self.queue.len() >= capacity && !self.options.delete_oldest {
            return Err(HermesError::BufferFull { capacity });
        }

        let excess = (self.queue.len() + 1).saturating_sub(capacity);
        let evicted = self.queue.drain(..excess).collect();
        self.queue.push_back(message);
        Ok(evicted)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&OutboundMessage> {
        self.queue.get(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<OutboundMessage> {
        self.queue.remove(index)
    }

    /// Take every queued entry, oldest first
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.queue.drain(..).collect()
    }

    /// Put back entries that could not be sent, ahead of anything queued since
    pub fn requeue_front(&mut self, messages: Vec<OutboundMessage>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeliveryToken, Qos};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn message(n: usize) -> OutboundMessage {
        OutboundMessage {
            token: DeliveryToken(n as u64),
            topic: format!("topic/{n}"),
            payload: Bytes::from(n.to_string()),
            qos: Qos::AtLeastOnce,
            retained: false,
        }
    }

    fn options(capacity: usize, delete_oldest: bool) -> BufferOptions {
        BufferOptions {
            enabled: true,
            capacity,
            delete_oldest,
        }
    }

    #[test]
    fn test_full_buffer_rejects_and_keeps_queue() {
        let mut buffer = OfflineBuffer::new(options(2, false));
        buffer.push(message(1)).unwrap();
        buffer.push(message(2)).unwrap();

        assert!(matches!(
            buffer.push(message(3)),
            Err(HermesError::BufferFull { capacity: 2 })
        ));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get(0), Some(&message(1)));
    }

    #[test]
    fn test_delete_oldest_evicts_head() {
        let mut buffer = OfflineBuffer::new(options(2, true));
        buffer.push(message(1)).unwrap();
        buffer.push(message(2)).unwrap();

        let evicted = buffer.push(message(3)).unwrap();
        assert_eq!(evicted, vec![message(1)]);
        assert_eq!(buffer.drain(), vec![message(2), message(3)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_shrunk_capacity_reports_every_eviction() {
        let mut buffer = OfflineBuffer::new(options(5, true));
        for n in 0..5 {
            buffer.push(message(n)).unwrap();
        }
        buffer.set_options(options(2, true));
        assert_eq!(buffer.len(), 5);

        let evicted = buffer.push(message(5)).unwrap();
        assert_eq!(evicted, vec![message(0), message(1), message(2), message(3)]);
        assert_eq!(buffer.drain(), vec![message(4), message(5)]);
    }

    #[test]
    fn test_remove_and_requeue() {
        let mut buffer = OfflineBuffer::new(options(10, false));
        for n in 0..4 {
            buffer.push(message(n)).unwrap();
        }
        assert_eq!(buffer.remove(1), Some(message(1)));
        assert_eq!(buffer.remove(10), None);

        let mut drained = buffer.drain();
        let unsent = drained.split_off(1);
        buffer.push(message(9)).unwrap();
        buffer.requeue_front(unsent);
        assert_eq!(buffer.drain(), vec![message(2), message(3), message(9)]);
    }

    #[test]
    fn test_zero_capacity_rejects() {
        let mut buffer = OfflineBuffer::new(options(0, true));
        assert!(buffer.push(message(1)).is_err());
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(
            capacity in 1usize..20,
            delete_oldest in any::<bool>(),
            pushes in 0usize..60,
        ) {
            let mut buffer = OfflineBuffer::new(options(capacity, delete_oldest));
            for n in 0..pushes {
                let _ = buffer.push(message(n));
                prop_assert!(buffer.len() <= capacity);
            }
        }

        #[test]
        fn prop_delete_oldest_keeps_newest_in_order(capacity in 1usize..20, pushes in 0usize..60) {
            let mut buffer = OfflineBuffer::new(options(capacity, true));
            for n in 0..pushes {
                buffer.push(message(n)).unwrap();
            }
            let expected: Vec<_> = (pushes.saturating_sub(capacity)..pushes).map(message).collect();
            prop_assert_eq!(buffer.drain(), expected);
        }

        #[test]
        fn prop_reject_mode_keeps_first_entries(capacity in 1usize..20, pushes in 0usize..60) {
            let mut buffer = OfflineBuffer::new(options(capacity, false));
            for n in 0..pushes {
                let _ = buffer.push(message(n));
            }
            let expected: Vec<_> = (0..pushes.min(capacity)).map(message).collect();
            prop_assert_eq!(buffer.drain(), expected);
        }
    }
}
