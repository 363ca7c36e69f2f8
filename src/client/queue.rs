//! Bounded FIFO of outbound messages
//!
//! Two semaphores carry the accounting: `space` counts free slots and `items`
//! counts messages ready to be taken. A slot is only returned when a lease is
//! committed, so a leased message still occupies capacity until it is sent.

use super::ClientError;
use crate::protocol::Message;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Semaphore;

pub struct DeliveryQueue {
    messages: Mutex<VecDeque<Message>>,
    space: Semaphore,
    items: Semaphore,
    capacity: usize,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        }
    }

    /// Append a message, waiting while the queue is full
    pub async fn enqueue(&self, message: Message) -> Result<(), ClientError> {
        let permit = self
            .space
            .acquire()
            .await
            .map_err(|_| ClientError::Shutdown)?;
        permit.forget();
        self.push_back(message);
        Ok(())
    }

    /// Append a message without waiting
    pub fn try_enqueue(&self, message: Message) -> Result<(), ClientError> {
        match self.space.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push_back(message);
                Ok(())
            }
            Err(tokio::sync::TryAcquireError::Closed) => Err(ClientError::Shutdown),
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                Err(ClientError::QueueFull(Box::new(message)))
            }
        }
    }

    /// Take the head, waiting while the queue is empty
    ///
    /// Cancel safe: a cancelled wait removes nothing.
    pub async fn dequeue(&self) -> QueueLease<'_> {
        loop {
            // `items` is never closed
            if let Ok(permit) = self.items.acquire().await {
                permit.forget();
            }
            if let Some(message) = self.lock().pop_front() {
                return QueueLease {
                    queue: self,
                    message: Some(message),
                };
            }
        }
    }

    /// Messages waiting, not counting an outstanding lease
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fail current and future enqueue waits with `Shutdown`
    pub fn close(&self) {
        self.space.close();
    }

    fn push_back(&self, message: Message) {
        self.lock().push_back(message);
        self.items.add_permits(1);
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A dequeued message that goes back to the head unless committed
pub struct QueueLease<'a> {
    queue: &'a DeliveryQueue,
    message: Option<Message>,
}

impl QueueLease<'_> {
    pub fn message(&self) -> &Message {
        match &self.message {
            Some(message) => message,
            None => unreachable!("lease holds its message until commit or drop"),
        }
    }

    /// Remove the message for good and free its slot
    pub fn commit(mut self) -> Option<Message> {
        let message = self.message.take();
        self.queue.space.add_permits(1);
        message
    }
}

impl Drop for QueueLease<'_> {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.queue.lock().push_front(message);
            self.queue.items.add_permits(1);
        }
    }
}
