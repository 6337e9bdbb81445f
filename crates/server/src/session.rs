use crossbeam_channel::{Sender, select};
use std::thread::{self, JoinHandle};
use tileworld_command::Perceive;
use tileworld_common::EntityId;
use tileworld_kernel::{StoreError, WorldStore};
use tileworld_net::{Message, Tunnel};
use tileworld_pubsub::{Delivery, Notification, Subscription, SubscriptionId, Topic};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::pipeline::{PipelineError, PipelineHandle};

/// Why a connection could not be attached.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("client {0} controls no entity in this world")]
    UnknownEntity(EntityId),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("cannot start session thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::UnknownEntity(id),
            other => Self::Store(other),
        }
    }
}

/// A connected client driving one entity.
///
/// The tunnel's peer ID is the controlled entity's ID. The session owns the
/// tunnel; when the peer goes away the session drops its subscription.
#[derive(Debug)]
pub struct Session {
    client_id: Uuid,
    subscription: SubscriptionId,
    thread: JoinHandle<()>,
}

impl Session {
    /// Subscribe the tunnel to its entity's topics, queue an initial
    /// `Perceive`, and start forwarding its commands.
    pub fn attach(
        tunnel: Tunnel,
        store: &WorldStore,
        pipeline: PipelineHandle,
        config: &ServerConfig,
    ) -> Result<Self, SessionError> {
        let client_id = tunnel.peer_id();
        let entity = store.get(EntityId(client_id))?;

        // When following, the router re-reads the tile on registration.
        let mut topics = vec![Topic::Position(entity.position), Topic::Entity(entity.id)];
        if config.subscribe_broadcast {
            topics.push(Topic::Broadcast);
        }
        let mut subscription =
            Subscription::new(topics, forwarder(client_id, tunnel.outgoing().clone()));
        if config.follow_entity {
            subscription = subscription.anchored_to(entity.id);
        }
        let subscription_id = subscription.id();

        pipeline.subscribe(subscription)?;
        pipeline.submit(Perceive {
            source_id: entity.id,
        })?;

        let loop_pipeline = pipeline.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{client_id}"))
            .spawn(move || run(tunnel, entity.id, subscription_id, loop_pipeline));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                let _ = pipeline.unsubscribe(subscription_id);
                return Err(e.into());
            }
        };

        tracing::info!(client = %client_id, position = %entity.position, %subscription_id, "session attached");
        Ok(Self {
            client_id,
            subscription: subscription_id,
            thread,
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the session to end.
    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!(client = %self.client_id, "session thread panicked");
        }
    }
}

/// Delivery callback: one outbound message per mutation, in order.
fn forwarder(
    client_id: Uuid,
    outgoing: Sender<Message>,
) -> impl Fn(&Notification) -> Delivery + Send + Sync + 'static {
    move |notification: &Notification| {
        for mutation in &notification.mutations {
            let message = match Message::from_mutation(client_id, mutation) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(client = %client_id, error = %e, "cannot encode mutation");
                    continue;
                }
            };
            if outgoing.send(message).is_err() {
                tracing::debug!(client = %client_id, topic = %notification.topic, "client gone, unsubscribing");
                return Delivery::Unsubscribe;
            }
            tracing::trace!(
                client = %client_id,
                topic = %notification.topic,
                tag = mutation.type_tag(),
                "delivered"
            );
        }
        Delivery::Retain
    }
}

fn run(tunnel: Tunnel, entity: EntityId, subscription: SubscriptionId, pipeline: PipelineHandle) {
    let client = tunnel.peer_id();
    loop {
        let next = select! {
            recv(tunnel.incoming()) -> message => message.ok(),
            recv(tunnel.closed()) -> _ => None,
        };
        let Some(message) = next else {
            break;
        };

        let command = match message.to_command() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(%client, content_type = %message.content_type, error = %e, "dropping undecodable message");
                continue;
            }
        };
        if command.source_id() != entity {
            tracing::warn!(
                %client,
                source = %command.source_id(),
                tag = command.type_tag(),
                "command for an entity this client does not control"
            );
            continue;
        }
        if pipeline.submit(command).is_err() {
            tracing::warn!(%client, "pipeline stopped, closing session");
            break;
        }
    }

    if let Err(e) = pipeline.unsubscribe(subscription) {
        tracing::debug!(%client, error = %e, "unsubscribe after pipeline stop");
    }
    tunnel.close();
    tracing::info!(%client, "session ended");
}
