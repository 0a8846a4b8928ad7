pub mod envelope;
pub mod events;
pub mod monitor;

pub use envelope::Envelope;
pub use events::{OverflowPolicy, is_public_event, overflow_policy};
pub use monitor::ChannelMonitor;

use crate::errors::ErrorCode;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

const DEFAULT_INBOX_CAPACITY: usize = 256;
/// Timeout for blocking deliveries (`task.*`, `message.*`) before the emitter
/// is told the send failed.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded subscriber inbox. Overflow behavior is chosen per event class at
/// delivery time: observability events drop the oldest entry, message and
/// task events block the emitter up to a timeout.
struct Inbox {
    queue: std::sync::Mutex<VecDeque<Envelope>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn push_drop_oldest(&self, envelope: Envelope) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if queue.len() >= self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!("bus inbox full, dropped {} events so far", dropped);
            }
        }
        queue.push_back(envelope);
        drop(queue);
        self.readable.notify_one();
    }

    /// Push that waits for space up to `timeout`. Returns `false` if the
    /// inbox stayed full (or closed) for the whole window.
    async fn push_blocking(&self, envelope: Envelope, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_closed() {
                return false;
            }
            {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if queue.len() < self.capacity {
                    queue.push_back(envelope);
                    drop(queue);
                    self.readable.notify_one();
                    return true;
                }
            }
            let notified = self.writable.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(envelope) = queue.pop_front() {
                    drop(queue);
                    self.writable.notify_one();
                    return Some(envelope);
                }
            }
            if self.is_closed() {
                return None;
            }
            self.readable.notified().await;
        }
    }

    fn try_recv(&self) -> Option<Envelope> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let envelope = queue.pop_front();
        if envelope.is_some() {
            self.writable.notify_one();
        }
        envelope
    }
}

/// Topic + channel filter for one subscription. A `None` field matches
/// everything; `topic` matches exact names or, with a trailing `*`, prefixes.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub topic: Option<String>,
    pub channel_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            channel_id: None,
        }
    }

    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            topic: None,
            channel_id: Some(channel_id.into()),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(topic) = &self.topic {
            let matched = match topic.strip_suffix('*') {
                Some(prefix) => envelope.event_type.starts_with(prefix),
                None => envelope.event_type == *topic,
            };
            if !matched {
                return false;
            }
        }
        if let Some(channel_id) = &self.channel_id {
            // Events without a channel never match a channel-filtered view.
            if envelope.channel_id.as_deref() != Some(channel_id.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    inbox: Arc<Inbox>,
    /// Only whitelisted events are delivered (transport-facing views).
    public_only: bool,
    label: String,
}

/// Receiving end of one subscription. Dropping it closes the inbox; the bus
/// prunes closed subscribers on the next matching emit.
pub struct Subscription {
    id: u64,
    inbox: Arc<Inbox>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.inbox.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inbox.close();
    }
}

/// Outcome of one emit: which subscribers failed and why. A failed delivery
/// never blocks the remaining subscribers.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: Vec<DeliveryFailure>,
}

#[derive(Debug)]
pub struct DeliveryFailure {
    pub subscriber: String,
    pub code: ErrorCode,
    pub message: String,
}

/// In-process event bus. At-least-once delivery to all matching subscribers;
/// ordering is preserved per emitter (each emitter awaits `emit` before the
/// next), not across emitters.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    inbox_capacity: usize,
    send_timeout: Duration,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_capacity(inbox_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inbox_capacity,
            send_timeout,
        }
    }

    /// Subscribe with a filter. Internal views see every event; use
    /// [`EventBus::subscribe_public`] for transport-facing subscribers.
    pub async fn subscribe(&self, filter: SubscriptionFilter, label: &str) -> Subscription {
        self.add_subscriber(filter, label, false).await
    }

    /// Subscribe restricted to the public-event whitelist. Used by sessions
    /// and channel monitors; non-whitelisted events never reach these views.
    pub async fn subscribe_public(&self, filter: SubscriptionFilter, label: &str) -> Subscription {
        self.add_subscriber(filter, label, true).await
    }

    async fn add_subscriber(
        &self,
        filter: SubscriptionFilter,
        label: &str,
        public_only: bool,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(Inbox::new(self.inbox_capacity));
        let subscriber = Subscriber {
            filter,
            inbox: inbox.clone(),
            public_only,
            label: label.to_string(),
        };
        self.subscribers.lock().await.insert(id, subscriber);
        debug!("bus: subscriber '{}' added (id={})", label, id);
        Subscription { id, inbox }
    }

    pub async fn unsubscribe(&self, id: u64) {
        if let Some(subscriber) = self.subscribers.lock().await.remove(&id) {
            subscriber.inbox.close();
            debug!("bus: subscriber '{}' removed (id={})", subscriber.label, id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Deliver an envelope to every matching subscriber.
    ///
    /// Matching inboxes are collected under the registry lock, then deliveries
    /// run outside it so one slow blocking subscriber cannot stall the
    /// registry. Closed subscribers are pruned here.
    pub async fn emit(&self, envelope: Envelope) -> DeliveryReport {
        let policy = events::overflow_policy(&envelope.event_type);
        let public = events::is_public_event(&envelope.event_type);

        let targets: Vec<(Arc<Inbox>, String)> = {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.retain(|_, s| !s.inbox.is_closed());
            subscribers
                .values()
                .filter(|s| (!s.public_only || public) && s.filter.matches(&envelope))
                .map(|s| (s.inbox.clone(), s.label.clone()))
                .collect()
        };

        let mut report = DeliveryReport::default();
        for (inbox, label) in targets {
            match policy {
                OverflowPolicy::DropOldest => {
                    inbox.push_drop_oldest(envelope.clone());
                    report.delivered += 1;
                }
                OverflowPolicy::Block => {
                    if inbox.push_blocking(envelope.clone(), self.send_timeout).await {
                        report.delivered += 1;
                    } else {
                        warn!(
                            "bus: delivery of '{}' to '{}' failed (inbox full past {:?})",
                            envelope.event_type, label, self.send_timeout
                        );
                        report.failed.push(DeliveryFailure {
                            subscriber: label,
                            code: ErrorCode::Timeout,
                            message: "MESSAGE_SEND_FAILED".to_string(),
                        });
                    }
                }
            }
        }
        report
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel-scoped view handed to an agent runtime. Subscriptions are
/// automatically filtered to the agent's channel, and every emission has the
/// channel (and agent) id injected.
#[derive(Clone)]
pub struct ChannelBus {
    bus: Arc<EventBus>,
    channel_id: String,
    agent_id: String,
}

impl ChannelBus {
    pub fn new(bus: Arc<EventBus>, channel_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            bus,
            channel_id: channel_id.into(),
            agent_id: agent_id.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn inner(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe to a topic within this channel only.
    pub async fn on(&self, topic: &str) -> Subscription {
        let filter = SubscriptionFilter::topic(topic).with_channel(self.channel_id.clone());
        let label = format!("{}@{}", self.agent_id, self.channel_id);
        self.bus.subscribe(filter, &label).await
    }

    /// Emit with this view's channel and agent ids injected. An explicit
    /// `channel_id` on the envelope is overwritten: a channel-scoped handle
    /// cannot emit into foreign channels.
    pub async fn emit(&self, mut envelope: Envelope) -> DeliveryReport {
        envelope.channel_id = Some(self.channel_id.clone());
        if envelope.agent_id.is_none() {
            envelope.agent_id = Some(self.agent_id.clone());
        }
        self.bus.emit(envelope).await
    }
}

#[cfg(test)]
mod tests;
