use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    },
    time::Duration,
};

use crate::{frame::Message, lock};

/// Notifications raised by the router to its subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceAttached,
    DeviceDetached,
    DownloadProgressed(u8),
    MessageReceived(Message),
}

type Subscribers<T> = Arc<Mutex<Vec<(u64, Sender<T>)>>>;

/// Fan-out of events to any number of channel subscribers.
pub struct EventBus<T> {
    subscribers: Subscribers<T>,
    next_id: AtomicU64,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        EventBus {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, tx));
        Subscription {
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn publish(&self, event: T) {
        lock(&self.subscribers)
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [EventBus]; unsubscribes when dropped.
pub struct Subscription<T> {
    id: u64,
    rx: Receiver<T>,
    subscribers: Subscribers<T>,
}

impl<T> Subscription<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                None
            }
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        lock(&self.subscribers).retain(|(id, _)| *id != self.id);
    }
}
