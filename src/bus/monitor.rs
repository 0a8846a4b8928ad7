use crate::bus::{Envelope, EventBus, Subscription, SubscriptionFilter};
use std::sync::Arc;

/// Read-only observer bound to a single channel.
///
/// Receives every whitelisted event whose `channelId` matches, regardless of
/// which agent emitted it. The handle carries no emit capability; dashboards
/// and orchestrators consume the channel through it without being members.
pub struct ChannelMonitor {
    channel_id: String,
    subscription: Subscription,
}

impl ChannelMonitor {
    pub async fn attach(bus: &Arc<EventBus>, channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        let label = format!("monitor:{}", channel_id);
        let subscription = bus
            .subscribe_public(SubscriptionFilter::channel(channel_id.clone()), &label)
            .await;
        Self {
            channel_id,
            subscription,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub async fn recv(&self) -> Option<Envelope> {
        self.subscription.recv().await
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.subscription.try_recv()
    }
}
