//! Subscription Registry
//!
//! Reference-counted channel subscriptions. Each subscriber holds a topic
//! set and one callback table; the channel's transport lives exactly as
//! long as it has at least one subscriber.

use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::model::update::Topic;
use crate::sync::dispatcher::MatchCallbacks;
use crate::transport::ChannelKey;

/// Subscriber handle, unique per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

/// Which topics an unsubscribe removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Every topic.
    All,
    /// Only the listed topics.
    Only(Vec<Topic>),
}

impl TopicFilter {
    fn matches(&self, topic: Topic) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Only(topics) => topics.contains(&topic),
        }
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscribed {
    /// Subscriber handle.
    pub id: SubscriberId,
    /// Whether this created the channel subscription.
    pub first: bool,
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriberId,
    topics: BTreeSet<Topic>,
    callbacks: MatchCallbacks,
}

/// Subscribers of one channel.
#[derive(Debug, Default)]
pub struct ChannelSubscription {
    subscribers: Vec<Subscriber>,
}

impl ChannelSubscription {
    /// Reference count.
    pub fn ref_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Union of every subscriber's topics.
    pub fn topics(&self) -> BTreeSet<Topic> {
        self.subscribers.iter().flat_map(|s| s.topics.iter().copied()).collect()
    }
}

/// All channel subscriptions of one client.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: BTreeMap<ChannelKey, ChannelSubscription>,
    next_id: u64,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callbacks` for `topics`. Registering the same table again
    /// merges the topics into its existing subscription.
    pub fn subscribe(
        &mut self,
        channel: &ChannelKey,
        topics: &[Topic],
        callbacks: MatchCallbacks,
    ) -> Subscribed {
        let first = !self.channels.contains_key(channel);
        let subscription = self.channels.entry(channel.clone()).or_default();

        if let Some(existing) = subscription
            .subscribers
            .iter_mut()
            .find(|s| s.callbacks.same_table(&callbacks))
        {
            existing.topics.extend(topics.iter().copied());
            existing.callbacks = callbacks;
            debug!(%channel, id = existing.id.0, "subscription merged");
            return Subscribed { id: existing.id, first };
        }

        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        subscription.subscribers.push(Subscriber {
            id,
            topics: topics.iter().copied().collect(),
            callbacks,
        });
        debug!(%channel, id = id.0, refs = subscription.ref_count(), "subscriber added");
        Subscribed { id, first }
    }

    /// Remove topics from every subscriber; subscribers left without topics
    /// are dropped. Returns the remaining reference count.
    pub fn unsubscribe(&mut self, channel: &ChannelKey, filter: &TopicFilter) -> usize {
        let Some(subscription) = self.channels.get_mut(channel) else {
            return 0;
        };
        for subscriber in &mut subscription.subscribers {
            subscriber.topics.retain(|t| !filter.matches(*t));
        }
        subscription.subscribers.retain(|s| !s.topics.is_empty());
        self.prune(channel)
    }

    /// Remove one subscriber. Returns the remaining reference count.
    pub fn remove_subscriber(&mut self, channel: &ChannelKey, id: SubscriberId) -> usize {
        let Some(subscription) = self.channels.get_mut(channel) else {
            return 0;
        };
        subscription.subscribers.retain(|s| s.id != id);
        self.prune(channel)
    }

    fn prune(&mut self, channel: &ChannelKey) -> usize {
        let refs = self.ref_count(channel);
        if refs == 0 {
            self.channels.remove(channel);
            debug!(%channel, "last subscriber gone");
        }
        refs
    }

    /// Number of subscribers on a channel.
    pub fn ref_count(&self, channel: &ChannelKey) -> usize {
        self.channels.get(channel).map(ChannelSubscription::ref_count).unwrap_or(0)
    }

    /// Whether the channel has subscribers.
    pub fn contains(&self, channel: &ChannelKey) -> bool {
        self.channels.contains_key(channel)
    }

    /// Subscription of a channel.
    pub fn get(&self, channel: &ChannelKey) -> Option<&ChannelSubscription> {
        self.channels.get(channel)
    }

    /// Callback tables subscribed to `topic` on `channel`.
    pub fn listeners(&self, channel: &ChannelKey, topic: Topic) -> Vec<MatchCallbacks> {
        self.channels
            .get(channel)
            .map(|s| {
                s.subscribers
                    .iter()
                    .filter(|sub| sub.topics.contains(&topic))
                    .map(|sub| sub.callbacks.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every callback table on `channel`.
    pub fn tables(&self, channel: &ChannelKey) -> Vec<MatchCallbacks> {
        self.channels
            .get(channel)
            .map(|s| s.subscribers.iter().map(|sub| sub.callbacks.clone()).collect())
            .unwrap_or_default()
    }

    /// Subscribed channels.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelKey> {
        self.channels.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_counting() {
        let mut registry = SubscriptionRegistry::new();
        let channel = ChannelKey::for_match(42);

        let a = registry.subscribe(&channel, &[Topic::ScoreDelta], MatchCallbacks::new());
        let b = registry.subscribe(&channel, &[Topic::HeroChange], MatchCallbacks::new());
        assert!(a.first);
        assert!(!b.first);
        assert_eq!(registry.ref_count(&channel), 2);

        assert_eq!(registry.remove_subscriber(&channel, a.id), 1);
        assert_eq!(registry.remove_subscriber(&channel, b.id), 0);
        assert!(!registry.contains(&channel));
    }

    #[test]
    fn test_same_table_subscribes_once() {
        let mut registry = SubscriptionRegistry::new();
        let channel = ChannelKey::for_match(1);
        let callbacks = MatchCallbacks::new();

        let a = registry.subscribe(&channel, &[Topic::ScoreDelta], callbacks.clone());
        let b = registry.subscribe(&channel, &[Topic::StatDelta], callbacks);
        assert_eq!(a.id, b.id);
        assert_eq!(registry.ref_count(&channel), 1);
        assert_eq!(registry.listeners(&channel, Topic::StatDelta).len(), 1);
        assert_eq!(registry.listeners(&channel, Topic::ScoreDelta).len(), 1);
    }

    #[test]
    fn test_partial_unsubscribe_keeps_channel() {
        let mut registry = SubscriptionRegistry::new();
        let channel = ChannelKey::for_match(1);
        registry.subscribe(&channel, &[Topic::ScoreDelta, Topic::HeroChange], MatchCallbacks::new());
        registry.subscribe(&channel, &[Topic::ScoreDelta], MatchCallbacks::new());

        let refs = registry.unsubscribe(&channel, &TopicFilter::Only(vec![Topic::ScoreDelta]));
        assert_eq!(refs, 1);
        assert!(registry.listeners(&channel, Topic::ScoreDelta).is_empty());
        assert_eq!(registry.listeners(&channel, Topic::HeroChange).len(), 1);

        assert_eq!(registry.unsubscribe(&channel, &TopicFilter::All), 0);
        assert!(registry.get(&channel).is_none());
    }

    #[test]
    fn test_unknown_channel_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        let channel = ChannelKey::for_match(9);
        assert_eq!(registry.unsubscribe(&channel, &TopicFilter::All), 0);
        assert_eq!(registry.remove_subscriber(&channel, SubscriberId(1)), 0);
    }
}
