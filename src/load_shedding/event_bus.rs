//! Publish/subscribe channel carrying telemetry signals to external observers.
//!
//! One bus exists per middleware installation. Emission is synchronous
//! fan-out to the subscribers registered at that moment; a signal with no
//! subscribers is discarded, never buffered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Named signals the engine produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Current measured request rate, once per evaluated request.
    RequestRate,
    /// Moving-average CPU percentage, once per CPU-trigger check.
    TriggerCpu,
    /// Current request rate, once per rate-trigger check.
    TriggerRequestRate,
    /// Accepted/rejected tallies for the prior second, only when rejections
    /// occurred.
    LoadSheddingTriggered,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestRate => "request-rate",
            Self::TriggerCpu => "trigger:cpu",
            Self::TriggerRequestRate => "trigger:request-rate",
            Self::LoadSheddingTriggered => "load-shedding-triggered",
        };
        f.write_str(name)
    }
}

/// Typed payloads, one variant per [`Signal`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    RequestRate { rate: f64 },
    TriggerCpu { average: f64 },
    TriggerRequestRate { rate: f64 },
    LoadSheddingTriggered { accepted: u64, rejected: u64 },
}

impl Event {
    pub fn signal(&self) -> Signal {
        match self {
            Self::RequestRate { .. } => Signal::RequestRate,
            Self::TriggerCpu { .. } => Signal::TriggerCpu,
            Self::TriggerRequestRate { .. } => Signal::TriggerRequestRate,
            Self::LoadSheddingTriggered { .. } => Signal::LoadSheddingTriggered,
        }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle identifying a registered subscriber, for [`EventBus::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    signal: Signal,
    id: u64,
}

/// Registry mapping signals to subscriber callbacks.
pub struct EventBus {
    subscribers: RwLock<HashMap<Signal, Vec<(u64, Callback)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a callback for one signal.
    pub fn subscribe<F>(&self, signal: Signal, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap()
            .entry(signal)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription { signal, id }
    }

    /// Remove a previously registered callback. Unknown handles are ignored.
    pub fn unsubscribe(&self, subscription: Subscription) {
        if let Some(callbacks) = self
            .subscribers
            .write()
            .unwrap()
            .get_mut(&subscription.signal)
        {
            callbacks.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Deliver one event to every current subscriber of its signal.
    ///
    /// The subscriber list is snapshotted before invocation, so callbacks may
    /// themselves subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: Event) {
        let callbacks: Vec<Callback> = {
            let subscribers = self.subscribers.read().unwrap();
            match subscribers.get(&event.signal()) {
                Some(callbacks) if !callbacks.is_empty() => callbacks
                    .iter()
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect(),
                _ => return,
            }
        };

        for callback in callbacks {
            callback(&event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscriber_count: usize = self
            .subscribers
            .read()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum();
        f.debug_struct("EventBus")
            .field("subscribers", &subscriber_count)
            .finish()
    }
}
