//! Notification routing: topic-keyed subscriber registry.
//!
//! # Invariants
//! - A notification reaches only subscriptions registered on its exact topic.
//! - A callback answering [`Delivery::Unsubscribe`] is removed from that
//!   topic before the next publish; empty topics are pruned.
//! - Within one topic, subscribers are called in registration order.

mod notification;
mod router;

pub use notification::{Notification, Topic};
pub use router::{Delivery, Router, Subscription, SubscriptionId};
