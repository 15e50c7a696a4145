//! In-memory broker
//!
//! A process-local implementation of the broker port with the semantics the
//! rest of the crate relies on:
//! - sends to an undeclared destination are routed to `<bus>/deadletter`
//!   with the original address recorded on the envelope
//! - ephemeral destinations are created on demand and deleted once their
//!   sole receiver unsubscribes
//! - expired messages (TTL) are moved to `<bus>/deadletter` with their origin,
//!   so an unconsumed message is noticed by whoever watches the deadletters
//! - closing a connection hands its unacknowledged deliveries back

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering}
    },
    time::Duration
};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};
use tracing::{Level, event};

use crate::{
    domain::{address::Address, constant::bus, error::DispatchError},
    port::bus::{Broker, BusConnection, ConnectionOptions, Delivery, Envelope, ReceiverOptions, SubscriptionId}
};

struct Queued {
    envelope:   Envelope,
    expires_at: Option<Instant>
}

#[derive(Default)]
struct Queue {
    messages:  VecDeque<Queued>,
    receivers: usize,
    ephemeral: bool
}

struct Subscription {
    address:    Address,
    connection: u64,
    capacity:   usize,
    in_flight:  HashSet<u64>
}

struct InFlight {
    subscription: SubscriptionId,
    address:      Address,
    envelope:     Envelope
}

#[derive(Default)]
struct BrokerState {
    queues:        HashMap<Address, Queue>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    in_flight:     HashMap<u64, InFlight>,
    next_tag:      u64,
    next_sub:      u64,
    cursor:        usize
}

struct BrokerCore {
    default_bus:     String,
    state:           Mutex<BrokerState>,
    notify:          Notify,
    next_connection: AtomicU64,
    close_delay:     Option<Duration>
}

impl BrokerCore {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deadletter_for(&self, address: &Address) -> Address {
        Address::deadletter(address.bus.as_deref().unwrap_or(&self.default_bus))
    }

    fn enqueue(queue: &mut Queue, envelope: Envelope) {
        let expires_at = envelope.properties.ttl.map(|ttl| Instant::now() + ttl);
        queue.messages.push_back(Queued { envelope, expires_at });
    }

    fn route_deadletter(&self, state: &mut BrokerState, origin: &Address, mut envelope: Envelope) {
        let deadletter = self.deadletter_for(origin);
        if *origin == deadletter {
            event!(Level::WARN, event = bus::MESSAGE_DEADLETTERED, address = %origin, message = "dropped_deadletter");
            return;
        }

        event!(Level::DEBUG, event = bus::MESSAGE_DEADLETTERED, origin = %origin, deadletter = %deadletter);
        if envelope.properties.deadletter_origin.is_none() {
            envelope.properties.deadletter_origin = Some(origin.to_string());
        }
        Self::enqueue(state.queues.entry(deadletter).or_default(), envelope);
    }

    /// Move every expired message, wherever it sits in its queue, to the deadletter destination
    fn expire(&self, state: &mut BrokerState) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (address, queue) in state.queues.iter_mut() {
            if !queue.messages.iter().any(|queued| queued.expires_at.is_some_and(|at| at <= now)) {
                continue;
            }
            let (dead, live): (VecDeque<Queued>, VecDeque<Queued>) = std::mem::take(&mut queue.messages)
                .into_iter()
                .partition(|queued| queued.expires_at.is_some_and(|at| at <= now));
            queue.messages = live;
            expired.extend(dead.into_iter().map(|queued| (address.clone(), queued.envelope)));
        }

        let count = expired.len();
        for (origin, mut envelope) in expired {
            event!(Level::DEBUG, event = bus::MESSAGE_EXPIRED, address = %origin);
            envelope.properties.ttl = None;
            self.route_deadletter(state, &origin, envelope);
        }
        count
    }

    fn next_expiry(state: &BrokerState) -> Option<Instant> {
        state.queues.values().flat_map(|queue| queue.messages.iter()).filter_map(|queued| queued.expires_at).min()
    }

    fn drop_subscription(&self, state: &mut BrokerState, id: SubscriptionId) -> Option<()> {
        let subscription = state.subscriptions.remove(&id)?;

        let mut returned: Vec<(u64, Envelope)> = subscription
            .in_flight
            .iter()
            .filter_map(|tag| state.in_flight.remove(tag).map(|flight| (*tag, flight.envelope)))
            .collect();
        returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        let queue = state.queues.get_mut(&subscription.address)?;
        for (_, envelope) in returned {
            let expires_at = envelope.properties.ttl.map(|ttl| Instant::now() + ttl);
            queue.messages.push_front(Queued { envelope, expires_at });
        }
        queue.receivers = queue.receivers.saturating_sub(1);

        if queue.ephemeral && queue.receivers == 0 {
            state.queues.remove(&subscription.address);
            event!(Level::DEBUG, event = bus::DESTINATION_DELETED, address = %subscription.address);
        }
        Some(())
    }

    fn try_take(&self, state: &mut BrokerState, subscriptions: &[SubscriptionId]) -> Result<Option<Delivery>, DispatchError> {
        let count = subscriptions.len();
        for offset in 0..count {
            let index = (state.cursor + offset) % count;
            let id = subscriptions[index];

            let BrokerState { queues, subscriptions: subs, in_flight, next_tag, .. } = state;
            let subscription =
                subs.get_mut(&id).ok_or_else(|| DispatchError::Bus(format!("unknown subscription {:?}", id)))?;
            if subscription.in_flight.len() >= subscription.capacity {
                continue;
            }
            let Some(queue) = queues.get_mut(&subscription.address) else {
                continue;
            };

            if let Some(queued) = queue.messages.pop_front() {
                *next_tag += 1;
                let tag = *next_tag;
                subscription.in_flight.insert(tag);
                in_flight.insert(tag, InFlight {
                    subscription: id,
                    address:      subscription.address.clone(),
                    envelope:     queued.envelope.clone()
                });
                let delivery = Delivery {
                    tag,
                    subscription: id,
                    address: subscription.address.clone(),
                    envelope: queued.envelope
                };
                state.cursor = index + 1;
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    fn settle(&self, state: &mut BrokerState, delivery: &Delivery) -> Result<InFlight, DispatchError> {
        let flight = state
            .in_flight
            .remove(&delivery.tag)
            .ok_or_else(|| DispatchError::Bus(format!("delivery {} is not outstanding", delivery.tag)))?;
        if let Some(subscription) = state.subscriptions.get_mut(&flight.subscription) {
            subscription.in_flight.remove(&delivery.tag);
        }
        Ok(flight)
    }
}

/// Process-local broker shared by every connection made from it
#[derive(Clone)]
pub struct InMemoryBroker {
    core: Arc<BrokerCore>
}

impl InMemoryBroker {
    /// `default_bus` receives deadletters of addresses without a bus prefix
    pub fn new(default_bus: impl Into<String>) -> Self {
        Self::build(default_bus.into(), None)
    }

    /// Broker whose connections take `delay` to close, to exercise close timeouts
    pub fn with_close_delay(default_bus: impl Into<String>, delay: Duration) -> Self {
        Self::build(default_bus.into(), Some(delay))
    }

    fn build(default_bus: String, close_delay: Option<Duration>) -> Self {
        Self {
            core: Arc::new(BrokerCore {
                default_bus,
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_connection: AtomicU64::new(1),
                close_delay
            })
        }
    }

    pub fn has_destination(&self, address: &Address) -> bool {
        self.core.lock().queues.contains_key(address)
    }

    /// Messages waiting in a destination (not counting outstanding deliveries)
    pub fn queue_depth(&self, address: &Address) -> usize {
        self.core.lock().queues.get(address).map(|queue| queue.messages.len()).unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.core.lock().subscriptions.len()
    }

    /// Deliveries handed out and not yet acknowledged, released or rejected
    pub fn in_flight_count(&self) -> usize {
        self.core.lock().in_flight.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, _options: &ConnectionOptions) -> Result<Arc<dyn BusConnection>, DispatchError> {
        let id = self.core.next_connection.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryConnection { id, core: self.core.clone(), open: AtomicBool::new(true) }))
    }
}

struct MemoryConnection {
    id:   u64,
    core: Arc<BrokerCore>,
    open: AtomicBool
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DispatchError::Bus(format!("connection {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn declare(&self, address: &Address) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.core.lock().queues.entry(address.clone()).or_default();
        Ok(())
    }

    async fn send(&self, address: &Address, envelope: Envelope) -> Result<(), DispatchError> {
        self.ensure_open()?;
        {
            let mut state = self.core.lock();
            match state.queues.get_mut(address) {
                Some(queue) => BrokerCore::enqueue(queue, envelope),
                None => self.core.route_deadletter(&mut state, address, envelope)
            }
        }
        self.core.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, address: &Address, options: &ReceiverOptions) -> Result<SubscriptionId, DispatchError> {
        self.ensure_open()?;
        if options.capacity == 0 {
            return Err(DispatchError::Validation("receiver capacity must be at least 1".to_string()));
        }

        let mut state = self.core.lock();
        let queue = state
            .queues
            .entry(address.clone())
            .or_insert_with(|| Queue { ephemeral: options.ephemeral, ..Queue::default() });
        queue.receivers += 1;

        state.next_sub += 1;
        let id = SubscriptionId(state.next_sub);
        state.subscriptions.insert(id, Subscription {
            address:    address.clone(),
            connection: self.id,
            capacity:   options.capacity,
            in_flight:  HashSet::new()
        });
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), DispatchError> {
        {
            let mut state = self.core.lock();
            self.core.drop_subscription(&mut state, subscription);
        }
        self.core.notify.notify_waiters();
        Ok(())
    }

    async fn next_message(
        &self,
        subscriptions: &[SubscriptionId],
        timeout: Duration
    ) -> Result<Option<Delivery>, DispatchError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_open()?;

            let notified = self.core.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.core.lock();
                self.core.expire(&mut state);
                if let Some(delivery) = self.core.try_take(&mut state, subscriptions)? {
                    return Ok(Some(delivery));
                }
                BrokerCore::next_expiry(&state).map_or(deadline, |at| at.min(deadline))
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(wake_at.saturating_duration_since(now), notified).await;
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        let mut state = self.core.lock();
        self.core.settle(&mut state, delivery).map(|_| ())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        {
            let mut state = self.core.lock();
            let flight = self.core.settle(&mut state, delivery)?;
            match state.queues.get_mut(&flight.address) {
                Some(queue) => queue.messages.push_front(Queued { envelope: flight.envelope, expires_at: None }),
                None => self.core.route_deadletter(&mut state, &flight.address, flight.envelope)
            }
        }
        self.core.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        {
            let mut state = self.core.lock();
            let flight = self.core.settle(&mut state, delivery)?;
            self.core.route_deadletter(&mut state, &flight.address, flight.envelope);
        }
        self.core.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), DispatchError> {
        if let Some(delay) = self.core.close_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut state = self.core.lock();
            let owned: Vec<SubscriptionId> = state
                .subscriptions
                .iter()
                .filter(|(_, subscription)| subscription.connection == self.id)
                .map(|(id, _)| *id)
                .collect();
            for id in owned {
                self.core.drop_subscription(&mut state, id);
            }
        }
        self.core.notify.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
