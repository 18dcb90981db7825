//! Per-camera fan-out of live events.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a
//! subscriber whose queue is full is torn down on the spot, so one slow
//! viewer cannot stall the recognition loop or silently lose events.

use common::events::LiveEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;
pub const DEFAULT_RECENT_CAPACITY: usize = 200;

/// Result of waiting on a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum NextEvent {
    Event(LiveEvent),
    /// Nothing arrived within the timeout; callers use this to send keep-alives
    Timeout,
    /// The subscription no longer exists (unsubscribed, overflowed or hub closed)
    Closed,
}

struct Subscriber {
    tx: mpsc::Sender<LiveEvent>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LiveEvent>>>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
    recent: VecDeque<LiveEvent>,
}

pub struct FanoutHub {
    inner: Mutex<HubInner>,
    capacity: usize,
    recent_capacity: usize,
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY, DEFAULT_RECENT_CAPACITY)
    }
}

impl FanoutHub {
    pub fn new(capacity: usize, recent_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            capacity: capacity.max(1),
            recent_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> u64 {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
        );
        tracing::debug!(subscription = id, "subscribed");
        id
    }

    /// Subscribe and get a handle that unsubscribes when dropped
    pub fn subscription(self: &Arc<Self>) -> Subscription {
        Subscription {
            id: self.subscribe(),
            hub: self.clone(),
        }
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.lock().subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = id, "unsubscribed");
        }
        removed
    }

    pub fn is_subscribed(&self, id: u64) -> bool {
        self.lock().subscribers.contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Offer `event` to every subscriber without blocking; returns how many accepted it
    pub fn publish(&self, event: LiveEvent) -> usize {
        let mut inner = self.lock();

        if self.recent_capacity > 0 {
            if inner.recent.len() == self.recent_capacity {
                inner.recent.pop_front();
            }
            inner.recent.push_back(event.clone());
        }

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, subscriber) in inner.subscribers.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscription = *id, camera_id = %event.camera_id, "subscriber queue full, disconnecting");
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in &dropped {
            inner.subscribers.remove(id);
        }
        drop(inner);

        if !dropped.is_empty() {
            telemetry::metrics::SUBSCRIBERS_DROPPED.inc_by(dropped.len() as u64);
        }
        telemetry::metrics::LIVE_EVENTS_PUBLISHED.inc();
        delivered
    }

    /// Wait up to `timeout` for the next event on subscription `id`
    pub async fn next(&self, id: u64, timeout: Duration) -> NextEvent {
        let rx = match self.lock().subscribers.get(&id) {
            Some(subscriber) => subscriber.rx.clone(),
            None => return NextEvent::Closed,
        };

        let mut rx = rx.lock().await;
        // A torn-down subscription must not keep draining its queue.
        if !self.is_subscribed(id) {
            return NextEvent::Closed;
        }
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => NextEvent::Event(event),
            Ok(None) => NextEvent::Closed,
            Err(_) => NextEvent::Timeout,
        }
    }

    /// The last published events, oldest first
    pub fn recent(&self) -> Vec<LiveEvent> {
        self.lock().recent.iter().cloned().collect()
    }

    /// Drop every subscription; pending `next` calls observe `Closed`
    pub fn close(&self) {
        let mut inner = self.lock();
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        if count > 0 {
            tracing::debug!(count, "closed all subscriptions");
        }
    }
}

/// A subscription that unsubscribes itself on drop
pub struct Subscription {
    id: u64,
    hub: Arc<FanoutHub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn next(&self, timeout: Duration) -> NextEvent {
        self.hub.next(self.id, timeout).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
