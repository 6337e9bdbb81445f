use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tileworld_common::{EntityId, Position};

use crate::notification::{Notification, Topic};

/// What a subscriber wants after receiving a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Retain,
    Unsubscribe,
}

/// Stable handle for a subscription across all of its topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

type Callback = Arc<dyn Fn(&Notification) -> Delivery + Send + Sync>;

/// A delivery callback and the topics it listens on.
///
/// An anchored subscription follows its entity: when the router is told the
/// entity moved, the subscription's position topic moves with it.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    topics: Vec<Topic>,
    anchor: Option<EntityId>,
    callback: Callback,
}

impl Subscription {
    pub fn new<F>(topics: impl IntoIterator<Item = Topic>, callback: F) -> Self
    where
        F: Fn(&Notification) -> Delivery + Send + Sync + 'static,
    {
        Self {
            id: SubscriptionId::next(),
            topics: topics.into_iter().collect(),
            anchor: None,
            callback: Arc::new(callback),
        }
    }

    /// Make the subscription's position topics follow `entity`.
    pub fn anchored_to(mut self, entity: EntityId) -> Self {
        self.anchor = Some(entity);
        self
    }

    /// Point the subscription's position topic at `position`. A
    /// subscription without one is returned unchanged.
    pub fn repositioned(mut self, position: Position) -> Self {
        let mut placed = false;
        self.topics.retain_mut(|topic| match topic {
            Topic::Position(_) if placed => false,
            Topic::Position(at) => {
                *at = position;
                placed = true;
                true
            }
            _ => true,
        });
        self
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn anchor(&self) -> Option<EntityId> {
        self.anchor
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .field("anchor", &self.anchor)
            .finish_non_exhaustive()
    }
}

/// One registration of a subscription under one topic.
#[derive(Clone)]
struct Listener {
    id: SubscriptionId,
    anchor: Option<EntityId>,
    callback: Callback,
}

/// Topic-keyed subscriber registry.
///
/// Owned by a single routing loop; not shared between threads.
#[derive(Default)]
pub struct Router {
    topics: HashMap<Topic, Vec<Listener>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under every topic the subscription names.
    pub fn subscribe(&mut self, sub: Subscription) {
        tracing::debug!(id = %sub.id, topics = sub.topics.len(), "subscribed");
        for topic in &sub.topics {
            self.topics.entry(*topic).or_default().push(Listener {
                id: sub.id,
                anchor: sub.anchor,
                callback: Arc::clone(&sub.callback),
            });
        }
    }

    /// Deliver to every subscriber of the notification's topic.
    ///
    /// Topics nobody listens on are dropped silently. Returns how many
    /// callbacks ran.
    pub fn publish(&mut self, notification: Notification) -> usize {
        let topic = notification.topic;
        let Some(listeners) = self.topics.get_mut(&topic) else {
            tracing::trace!(%topic, "no subscribers");
            return 0;
        };

        let delivered = listeners.len();
        listeners.retain(|l| match (l.callback)(&notification) {
            Delivery::Retain => true,
            Delivery::Unsubscribe => {
                tracing::debug!(id = %l.id, %topic, "unsubscribed by callback");
                false
            }
        });
        if listeners.is_empty() {
            self.topics.remove(&topic);
        }

        tracing::trace!(%topic, delivered, "published");
        delivered
    }

    /// Drop a subscription from every topic. Returns whether it was present.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut found = false;
        self.topics.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|l| l.id != id);
            found |= listeners.len() != before;
            !listeners.is_empty()
        });
        if found {
            tracing::debug!(%id, "unsubscribed");
        }
        found
    }

    /// Move subscriptions anchored to `entity` from one position topic to
    /// another. Returns how many moved.
    pub fn relocate(&mut self, entity: EntityId, from: Position, to: Position) -> usize {
        if from == to {
            return 0;
        }
        let from_topic = Topic::Position(from);
        let Some(listeners) = self.topics.get_mut(&from_topic) else {
            return 0;
        };

        let mut moving = Vec::new();
        listeners.retain(|l| {
            if l.anchor == Some(entity) {
                moving.push(l.clone());
                false
            } else {
                true
            }
        });
        if listeners.is_empty() {
            self.topics.remove(&from_topic);
        }

        let moved = moving.len();
        if moved > 0 {
            let target = self.topics.entry(Topic::Position(to)).or_default();
            for listener in moving {
                if !target.iter().any(|l| l.id == listener.id) {
                    target.push(listener);
                }
            }
            tracing::debug!(%entity, %from, %to, moved, "subscriptions followed entity");
        }
        moved
    }

    /// Number of subscribers on a topic.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map_or(0, Vec::len)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tileworld_kernel::{ClearAllEntities, Mutation};

    fn note(topic: Topic) -> Notification {
        Notification::single(topic, ClearAllEntities {})
    }

    fn recorder(
        topics: Vec<Topic>,
        answer: Delivery,
    ) -> (Subscription, Arc<Mutex<Vec<Topic>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = Subscription::new(topics, move |n: &Notification| {
            sink.lock().unwrap().push(n.topic);
            answer
        });
        (sub, seen)
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let mut router = Router::new();
        assert_eq!(router.publish(note(Topic::Broadcast)), 0);
    }

    #[test]
    fn entity_topic_only_receives_its_own_entity() {
        let mut router = Router::new();
        let me = EntityId::new();
        let (sub, seen) = recorder(vec![Topic::Entity(me)], Delivery::Retain);
        router.subscribe(sub);

        router.publish(note(Topic::Entity(EntityId::new())));
        router.publish(note(Topic::Position(Position::new(0, 0))));
        router.publish(note(Topic::Broadcast));
        router.publish(note(Topic::Entity(me)));

        assert_eq!(*seen.lock().unwrap(), vec![Topic::Entity(me)]);
    }

    #[test]
    fn broadcast_requires_explicit_subscription() {
        let mut router = Router::new();
        let me = EntityId::new();
        let (plain, plain_seen) = recorder(vec![Topic::Entity(me)], Delivery::Retain);
        let (listener, bcast_seen) = recorder(vec![Topic::Broadcast], Delivery::Retain);
        router.subscribe(plain);
        router.subscribe(listener);

        router.publish(note(Topic::Broadcast));
        assert!(plain_seen.lock().unwrap().is_empty());
        assert_eq!(*bcast_seen.lock().unwrap(), vec![Topic::Broadcast]);
    }

    #[test]
    fn unsubscribe_by_return_value_prunes_topic() {
        let mut router = Router::new();
        let topic = Topic::Position(Position::new(1, 1));
        let (once, seen) = recorder(vec![topic], Delivery::Unsubscribe);
        router.subscribe(once);

        assert_eq!(router.publish(note(topic)), 1);
        assert_eq!(router.publish(note(topic)), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(router.topic_count(), 0);
    }

    #[test]
    fn unsubscribe_by_return_value_only_affects_that_topic() {
        let mut router = Router::new();
        let me = EntityId::new();
        let tile = Topic::Position(Position::new(0, 0));
        let (sub, _seen) = recorder(vec![tile, Topic::Entity(me)], Delivery::Unsubscribe);
        router.subscribe(sub);

        router.publish(note(tile));
        assert_eq!(router.subscriber_count(tile), 0);
        assert_eq!(router.subscriber_count(Topic::Entity(me)), 1);
    }

    #[test]
    fn removal_mid_list_keeps_other_subscribers() {
        let mut router = Router::new();
        let topic = Topic::Broadcast;
        let (a, a_seen) = recorder(vec![topic], Delivery::Retain);
        let (b, b_seen) = recorder(vec![topic], Delivery::Unsubscribe);
        let (c, c_seen) = recorder(vec![topic], Delivery::Retain);
        router.subscribe(a);
        router.subscribe(b);
        router.subscribe(c);

        assert_eq!(router.publish(note(topic)), 3);
        assert_eq!(router.publish(note(topic)), 2);
        assert_eq!(a_seen.lock().unwrap().len(), 2);
        assert_eq!(b_seen.lock().unwrap().len(), 1);
        assert_eq!(c_seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn delivery_follows_registration_order() {
        let mut router = Router::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..4 {
            let order = Arc::clone(&order);
            router.subscribe(Subscription::new([Topic::Broadcast], move |_: &Notification| {
                order.lock().unwrap().push(n);
                Delivery::Retain
            }));
        }
        router.publish(note(Topic::Broadcast));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn explicit_unsubscribe_removes_all_topics() {
        let mut router = Router::new();
        let me = EntityId::new();
        let (sub, _) = recorder(
            vec![Topic::Entity(me), Topic::Broadcast, Topic::Position(Position::new(2, 2))],
            Delivery::Retain,
        );
        let id = sub.id();
        router.subscribe(sub);
        assert_eq!(router.topic_count(), 3);

        assert!(router.unsubscribe(id));
        assert_eq!(router.topic_count(), 0);
        assert!(!router.unsubscribe(id));
    }

    #[test]
    fn relocate_moves_only_anchored_subscriptions() {
        let mut router = Router::new();
        let me = EntityId::new();
        let from = Position::new(0, 0);
        let to = Position::new(1, 0);

        let (mine, mine_seen) = recorder(vec![Topic::Position(from)], Delivery::Retain);
        let (other, other_seen) = recorder(vec![Topic::Position(from)], Delivery::Retain);
        router.subscribe(mine.anchored_to(me));
        router.subscribe(other);

        assert_eq!(router.relocate(me, from, to), 1);
        router.publish(note(Topic::Position(to)));
        router.publish(note(Topic::Position(from)));

        assert_eq!(*mine_seen.lock().unwrap(), vec![Topic::Position(to)]);
        assert_eq!(*other_seen.lock().unwrap(), vec![Topic::Position(from)]);
    }

    #[test]
    fn repositioned_replaces_only_the_position_topic() {
        let me = EntityId::new();
        let (sub, _) = recorder(
            vec![Topic::Position(Position::new(9, 9)), Topic::Entity(me)],
            Delivery::Retain,
        );
        let sub = sub.anchored_to(me).repositioned(Position::new(1, 2));
        assert_eq!(
            sub.topics(),
            &[Topic::Position(Position::new(1, 2)), Topic::Entity(me)]
        );
        assert_eq!(sub.anchor(), Some(me));

        let (plain, _) = recorder(vec![Topic::Broadcast], Delivery::Retain);
        assert_eq!(plain.repositioned(Position::new(1, 2)).topics(), &[Topic::Broadcast]);
    }

    #[test]
    fn relocate_without_listeners_is_noop() {
        let mut router = Router::new();
        assert_eq!(
            router.relocate(EntityId::new(), Position::new(0, 0), Position::new(0, 1)),
            0
        );
        assert_eq!(router.topic_count(), 0);
    }

    #[test]
    fn notification_carries_mutations_in_order() {
        let n = Notification::new(
            Topic::Broadcast,
            vec![Mutation::from(ClearAllEntities {}), Mutation::from(ClearAllEntities {})],
        );
        assert_eq!(n.mutations.len(), 2);
    }
}
