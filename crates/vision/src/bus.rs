//! Fan-out of detection events to independently paced subscribers.
//!
//! Each subscriber owns a bounded queue. `publish` never blocks: when a queue
//! is full its oldest pending event is discarded to make room, so a slow
//! subscriber always converges on the freshest event.

use std::{
    collections::HashMap,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, warn};

use crate::{
    data::{DetectionEvent, LatestSlot},
    error::BridgeError,
    pipeline::telemetry,
};

/// Callback invoked on a subscriber's delivery thread.
pub type EventHandler = Box<dyn FnMut(&DetectionEvent) -> anyhow::Result<()> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber {
    name: String,
    tx: Sender<Arc<DetectionEvent>>,
    /// Bus-side receiver used to evict the oldest entry when the queue is full.
    evict: Receiver<Arc<DetectionEvent>>,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
    latest: LatestSlot<DetectionEvent>,
    published: AtomicU64,
}

#[derive(Clone)]
pub struct DetectionEventBus {
    inner: Arc<BusInner>,
}

impl DetectionEventBus {
    /// `capacity` is the per-subscriber queue depth (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                latest: LatestSlot::new(),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Record `event` as the last known value and offer it to every subscriber.
    pub fn publish(&self, event: DetectionEvent) -> Arc<DetectionEvent> {
        let event = Arc::new(event);
        self.inner.latest.replace(event.clone());
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.values() {
            offer(subscriber, event.clone());
        }
        event
    }

    /// Register a callback. It runs on its own thread so a slow or failing
    /// handler cannot reach the publisher or other subscribers.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        mut handler: EventHandler,
    ) -> io::Result<SubscriptionHandle> {
        let name = name.into();
        let (handle, rx) = self.register(name.clone());
        let thread_name = format!("bus-{name}");
        let spawned = telemetry::spawn_thread(thread_name, move || {
            for event in rx.iter() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
                let message = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => format!("{err:#}"),
                    Err(payload) => panic_message(payload.as_ref()),
                };
                let err = BridgeError::SubscriberDeliveryFailure {
                    subscriber: name.clone(),
                    sequence: event.sequence,
                    message,
                };
                err.record();
                warn!("{err}");
            }
            debug!(subscriber = %name, "delivery thread finished");
        });
        if let Err(err) = spawned {
            self.unsubscribe(handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Register a pull-style subscriber and hand back its queue.
    pub fn subscribe_channel(
        &self,
        name: impl Into<String>,
    ) -> (SubscriptionHandle, Receiver<Arc<DetectionEvent>>) {
        self.register(name.into())
    }

    /// Remove a subscriber. Its delivery thread exits after the queue drains.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if let Some(subscriber) = &removed {
            debug!(subscriber = %subscriber.name, "unsubscribed");
        }
        removed.is_some()
    }

    pub fn latest(&self) -> Option<Arc<DetectionEvent>> {
        self.inner.latest.get()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Events discarded for this subscriber by the drop-oldest policy.
    pub fn dropped(&self, handle: SubscriptionHandle) -> Option<u64> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.0)
            .map(|subscriber| subscriber.dropped.load(Ordering::Relaxed))
    }

    fn register(&self, name: String) -> (SubscriptionHandle, Receiver<Arc<DetectionEvent>>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(self.inner.capacity);
        let subscriber = Subscriber {
            name,
            tx,
            evict: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, subscriber);
        (SubscriptionHandle(id), rx)
    }
}

fn offer(subscriber: &Subscriber, event: Arc<DetectionEvent>) {
    let mut pending = event;
    loop {
        match subscriber.tx.try_send(pending) {
            Ok(()) => return,
            Err(TrySendError::Full(returned)) => {
                pending = returned;
                match subscriber.evict.try_recv() {
                    Ok(stale) => {
                        subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("vision_bus_dropped_total").increment(1);
                        debug!(
                            subscriber = %subscriber.name,
                            dropped = stale.sequence,
                            "subscriber queue full, dropping oldest event"
                        );
                    }
                    // The consumer drained concurrently; retry the send.
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
