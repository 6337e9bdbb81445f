use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tileworld_command::{Command, CommandError};
use tileworld_kernel::{Relocation, StoreError, WorldStore};
use tileworld_pubsub::{Notification, Router, Subscription, SubscriptionId};

/// Errors from driving the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline has stopped")]
    Stopped,
    #[error("store failure stopped the pipeline: {0}")]
    Store(#[from] StoreError),
    #[error("{0} loop panicked")]
    Panicked(&'static str),
    #[error("cannot start pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Work for the routing loop, the only owner of the [`Router`].
#[derive(Debug)]
pub enum RouterEvent {
    Subscribe(Subscription),
    Unsubscribe(SubscriptionId),
    Publish(Notification),
    Relocate(Relocation),
}

/// Cloneable entry point into a running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    commands: Sender<Command>,
    events: Sender<RouterEvent>,
}

impl PipelineHandle {
    /// Queue a command, blocking while the command queue is full.
    pub fn submit(&self, command: impl Into<Command>) -> Result<(), PipelineError> {
        self.commands
            .send(command.into())
            .map_err(|_| PipelineError::Stopped)
    }

    pub fn subscribe(&self, subscription: Subscription) -> Result<(), PipelineError> {
        self.route(RouterEvent::Subscribe(subscription))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), PipelineError> {
        self.route(RouterEvent::Unsubscribe(id))
    }

    /// Publish outside of any command, e.g. server announcements.
    pub fn publish(&self, notification: Notification) -> Result<(), PipelineError> {
        self.route(RouterEvent::Publish(notification))
    }

    fn route(&self, event: RouterEvent) -> Result<(), PipelineError> {
        self.events.send(event).map_err(|_| PipelineError::Stopped)
    }
}

/// Two single-consumer loops over bounded queues.
///
/// The command loop computes each command against the store and applies its
/// mutations in order before taking the next one, so at most one mutation is
/// ever in flight. It then forwards notifications, followed by any entity
/// relocations, to the routing loop, which owns the subscriber registry.
///
/// # Invariants
/// - Commands are computed and applied strictly in queue order.
/// - A rejected command changes nothing and does not stop the loop.
/// - Only a poisoned store stops the command loop.
/// - An anchored subscription starts on its entity's tile as of the moment
///   the router registers it.
#[derive(Debug)]
pub struct Pipeline {
    handle: PipelineHandle,
    stopped: Receiver<Result<(), StoreError>>,
    command_loop: JoinHandle<Result<(), StoreError>>,
    router_loop: JoinHandle<()>,
}

impl Pipeline {
    pub fn start(store: Arc<WorldStore>, capacity: usize) -> Result<Self, PipelineError> {
        let capacity = capacity.max(1);
        let (commands, command_rx) = bounded(capacity);
        let (events, event_rx) = bounded(capacity);
        let (stopped_tx, stopped) = bounded(1);

        let loop_events = events.clone();
        let router_store = Arc::clone(&store);
        let command_loop = thread::Builder::new()
            .name("pipeline-commands".into())
            .spawn(move || {
                let result = run_commands(&store, &command_rx, &loop_events);
                let _ = stopped_tx.try_send(result.clone());
                result
            })?;
        let router_loop = thread::Builder::new()
            .name("pipeline-router".into())
            .spawn(move || run_router(&router_store, &event_rx))?;

        tracing::info!(capacity, "pipeline started");
        Ok(Self {
            handle: PipelineHandle { commands, events },
            stopped,
            command_loop,
            router_loop,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Receives the command loop's outcome once, when it exits.
    pub fn stopped(&self) -> &Receiver<Result<(), StoreError>> {
        &self.stopped
    }

    /// Drain both queues and join the loops.
    ///
    /// Blocks until every [`PipelineHandle`] clone is dropped.
    pub fn shutdown(self) -> Result<(), PipelineError> {
        drop(self.handle);
        let commands = self
            .command_loop
            .join()
            .map_err(|_| PipelineError::Panicked("command"))?;
        self.router_loop
            .join()
            .map_err(|_| PipelineError::Panicked("router"))?;
        tracing::info!("pipeline stopped");
        Ok(commands?)
    }
}

fn run_commands(
    store: &WorldStore,
    commands: &Receiver<Command>,
    events: &Sender<RouterEvent>,
) -> Result<(), StoreError> {
    for command in commands.iter() {
        let span = tracing::debug_span!(
            "command",
            tag = command.type_tag(),
            source = %command.source_id()
        );
        let _entered = span.enter();

        let computed = match command.compute(store) {
            Ok(computed) => computed,
            Err(CommandError::Store(e)) => {
                tracing::error!(error = %e, "store failure, stopping command loop");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "command rejected");
                continue;
            }
        };
        if computed.is_empty() {
            tracing::debug!("command had no effect");
            continue;
        }

        let mut relocations = Vec::new();
        for mutation in &computed.mutations {
            match mutation.apply(store) {
                Ok(Some(moved)) => relocations.push(moved),
                Ok(None) => {}
                Err(StoreError::NotFound(id)) => {
                    tracing::warn!(%id, tag = mutation.type_tag(), "mutation target vanished");
                }
                Err(e) => {
                    tracing::error!(error = %e, "store failure, stopping command loop");
                    return Err(e);
                }
            }
        }
        tracing::debug!(
            mutations = computed.mutations.len(),
            notifications = computed.notifications.len(),
            "command applied"
        );

        let routed = computed
            .notifications
            .into_iter()
            .map(RouterEvent::Publish)
            .chain(relocations.into_iter().map(RouterEvent::Relocate));
        for event in routed {
            if events.send(event).is_err() {
                tracing::warn!("router loop gone, stopping command loop");
                return Ok(());
            }
        }
    }
    Ok(())
}

fn run_router(store: &WorldStore, events: &Receiver<RouterEvent>) {
    let mut router = Router::new();
    for event in events.iter() {
        match event {
            RouterEvent::Subscribe(sub) => router.subscribe(on_current_tile(store, sub)),
            RouterEvent::Unsubscribe(id) => {
                router.unsubscribe(id);
            }
            RouterEvent::Publish(notification) => {
                router.publish(notification);
            }
            RouterEvent::Relocate(moved) => {
                router.relocate(moved.id, moved.from, moved.to);
            }
        }
    }
    tracing::debug!(topics = router.topic_count(), "router loop drained");
}

/// Key an anchored subscription to where its entity stands now.
///
/// Moves applied before this point may have sent their relocations ahead
/// of the subscription, so the tile it was built with can be stale. Moves
/// applied after it are relocated as usual.
fn on_current_tile(store: &WorldStore, sub: Subscription) -> Subscription {
    let Some(anchor) = sub.anchor() else {
        return sub;
    };
    match store.get(anchor) {
        Ok(entity) => sub.repositioned(entity.position),
        Err(e) => {
            tracing::warn!(%anchor, error = %e, "cannot place anchored subscription");
            sub
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tileworld_command::{Move, OpenSpatial, Perceive};
    use tileworld_common::{Entity, EntityId, Position, Spatial};
    use tileworld_kernel::{ClearAllEntities, Mutation, PlaceEntity, VacatePosition};
    use tileworld_pubsub::{Delivery, Topic};

    const WAIT: Duration = Duration::from_secs(5);

    fn walker(x: i32, y: i32) -> Entity {
        Entity::new(
            EntityId::new(),
            Position::new(x, y),
            Spatial {
                stackable: true,
                toggleable: false,
            },
        )
    }

    fn wall(x: i32, y: i32) -> Entity {
        Entity::new(
            EntityId::new(),
            Position::new(x, y),
            Spatial {
                stackable: false,
                toggleable: false,
            },
        )
    }

    /// Subscription forwarding every delivered mutation into a channel.
    fn tap(topics: Vec<Topic>) -> (Subscription, Receiver<(Topic, Mutation)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sub = Subscription::new(topics, move |n: &Notification| {
            for m in &n.mutations {
                let _ = tx.send((n.topic, *m));
            }
            Delivery::Retain
        });
        (sub, rx)
    }

    #[test]
    fn move_is_applied_and_notified() {
        let e = walker(0, 0);
        let store = Arc::new(WorldStore::from_entities([e]));
        let pipeline = Pipeline::start(Arc::clone(&store), 8).unwrap();
        let handle = pipeline.handle();

        let (sub, rx) = tap(vec![Topic::Entity(e.id)]);
        handle.subscribe(sub).unwrap();
        handle
            .submit(Move {
                source_id: e.id,
                position: Position::new(1, 1),
            })
            .unwrap();

        let (topic, first) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(topic, Topic::Entity(e.id));
        assert_eq!(first.type_tag(), "mutations.PlaceEntity");
        assert_eq!(store.get(e.id).unwrap().position, Position::new(1, 1));

        drop(handle);
        pipeline.shutdown().unwrap();
        store.check_invariants().unwrap().unwrap();
    }

    #[test]
    fn rejected_command_does_not_stop_pipeline() {
        let e = walker(0, 0);
        let store = Arc::new(WorldStore::from_entities([e]));
        let pipeline = Pipeline::start(Arc::clone(&store), 4).unwrap();
        let handle = pipeline.handle();

        handle
            .submit(Move {
                source_id: e.id,
                position: Position::new(5, 5),
            })
            .unwrap();
        handle
            .submit(Move {
                source_id: EntityId::new(),
                position: Position::new(0, 1),
            })
            .unwrap();
        handle
            .submit(Move {
                source_id: e.id,
                position: Position::new(0, 1),
            })
            .unwrap();

        drop(handle);
        pipeline.shutdown().unwrap();
        assert_eq!(store.get(e.id).unwrap().position, Position::new(0, 1));
    }

    #[test]
    fn blocked_move_publishes_nothing() {
        let e = walker(0, 0);
        let w = wall(1, 0);
        let store = Arc::new(WorldStore::from_entities([e, w]));
        let pipeline = Pipeline::start(Arc::clone(&store), 4).unwrap();
        let handle = pipeline.handle();

        let (sub, rx) = tap(vec![Topic::Entity(e.id), Topic::Position(w.position)]);
        handle.subscribe(sub).unwrap();
        handle
            .submit(Move {
                source_id: e.id,
                position: w.position,
            })
            .unwrap();

        drop(handle);
        pipeline.shutdown().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get(e.id).unwrap().position, Position::new(0, 0));
    }

    #[test]
    fn anchored_subscription_follows_moves() {
        let e = walker(0, 0);
        let store = Arc::new(WorldStore::from_entities([e]));
        let pipeline = Pipeline::start(Arc::clone(&store), 8).unwrap();
        let handle = pipeline.handle();

        let (sub, rx) = tap(vec![Topic::Position(e.position), Topic::Entity(e.id)]);
        handle.subscribe(sub.anchored_to(e.id)).unwrap();
        // Once the marker comes back the router holds the subscription, so
        // it is keyed to the starting tile before any move is applied.
        handle
            .publish(Notification::single(e.id, ClearAllEntities {}))
            .unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            (Topic::Entity(e.id), Mutation::from(ClearAllEntities {}))
        );
        for x in 1..=3 {
            handle
                .submit(Move {
                    source_id: e.id,
                    position: Position::new(x, 0),
                })
                .unwrap();
        }
        // Someone else arriving on the final tile is heard there.
        let newcomer = walker(3, 1);
        store.upsert(newcomer).unwrap();
        handle
            .submit(Move {
                source_id: newcomer.id,
                position: Position::new(3, 0),
            })
            .unwrap();

        drop(handle);
        pipeline.shutdown().unwrap();

        let (by_tile, by_entity): (Vec<_>, Vec<_>) = rx
            .try_iter()
            .partition(|(topic, _)| matches!(topic, Topic::Position(_)));

        // The subscription moves after each move's notifications went out, so
        // on the tile topic it hears every vacate it left behind and then the
        // newcomer's arrival on the tile it now watches.
        let vacated = |x| {
            (
                Topic::Position(Position::new(x, 0)),
                Mutation::from(VacatePosition {
                    source_id: e.id,
                    position: Position::new(x, 0),
                }),
            )
        };
        let arrival = (
            Topic::Position(Position::new(3, 0)),
            Mutation::from(PlaceEntity {
                source_id: newcomer.id,
                position: Position::new(3, 0),
            }),
        );
        assert_eq!(by_tile, vec![vacated(0), vacated(1), vacated(2), arrival]);

        // Its own arrivals come through the entity topic.
        let arrived: Vec<Position> = by_entity
            .iter()
            .filter_map(|(_, m)| match m {
                Mutation::PlaceEntity(p) if p.source_id == e.id => Some(p.position),
                _ => None,
            })
            .collect();
        assert_eq!(
            arrived,
            vec![Position::new(1, 0), Position::new(2, 0), Position::new(3, 0)]
        );
    }

    #[test]
    fn anchored_subscription_starts_on_the_current_tile() {
        let e = walker(0, 0);
        let newcomer = walker(0, 1);
        let store = Arc::new(WorldStore::from_entities([e, newcomer]));
        let pipeline = Pipeline::start(Arc::clone(&store), 8).unwrap();
        let handle = pipeline.handle();

        // Built from a position read before a move whose relocation the
        // router has already seen.
        let stale = Position::new(-1, 0);
        let (sub, rx) = tap(vec![Topic::Position(stale)]);
        handle.subscribe(sub.anchored_to(e.id)).unwrap();
        handle
            .submit(Move {
                source_id: newcomer.id,
                position: e.position,
            })
            .unwrap();

        drop(handle);
        pipeline.shutdown().unwrap();

        let heard: Vec<(Topic, Mutation)> = rx.try_iter().collect();
        assert_eq!(
            heard,
            vec![(
                Topic::Position(e.position),
                Mutation::from(PlaceEntity {
                    source_id: newcomer.id,
                    position: e.position,
                }),
            )]
        );
    }

    #[test]
    fn perceive_and_toggle_reach_the_source_topic() {
        let e = walker(0, 0);
        let door = Entity::new(
            EntityId::new(),
            Position::new(1, 0),
            Spatial {
                stackable: false,
                toggleable: true,
            },
        );
        let store = Arc::new(WorldStore::from_entities([e, door]));
        let pipeline = Pipeline::start(Arc::clone(&store), 8).unwrap();
        let handle = pipeline.handle();

        let (sub, rx) = tap(vec![Topic::Entity(e.id)]);
        handle.subscribe(sub).unwrap();
        handle.submit(Perceive { source_id: e.id }).unwrap();
        handle
            .submit(OpenSpatial {
                source_id: e.id,
                target_id: door.id,
            })
            .unwrap();

        drop(handle);
        pipeline.shutdown().unwrap();

        let tags: Vec<&str> = rx.try_iter().map(|(_, m)| m.type_tag()).collect();
        assert_eq!(
            tags,
            vec![
                "mutations.ClearAllEntities",
                "mutations.SetEntity",
                "mutations.SetEntity",
                "mutations.SetStackability",
            ]
        );
        assert!(store.get(door.id).unwrap().spatial.stackable);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let e = walker(0, 0);
        let store = Arc::new(WorldStore::from_entities([e]));
        let pipeline = Pipeline::start(Arc::clone(&store), 4).unwrap();
        let handle = pipeline.handle();

        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        let sub = Subscription::new([Topic::Entity(e.id)], move |_: &Notification| {
            *seen.lock().unwrap() += 1;
            Delivery::Retain
        });
        let id = sub.id();
        handle.subscribe(sub).unwrap();
        handle.unsubscribe(id).unwrap();
        handle.submit(Perceive { source_id: e.id }).unwrap();

        drop(handle);
        pipeline.shutdown().unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn shutdown_waits_for_handles_then_signals_stopped() {
        let store = Arc::new(WorldStore::new());
        let pipeline = Pipeline::start(store, 1).unwrap();
        let handle = pipeline.handle();
        let stopped = pipeline.stopped().clone();

        // Shutdown waits for every handle, so join on another thread.
        let joiner = thread::spawn(move || pipeline.shutdown());
        let orphan = handle.clone();
        drop(handle);
        drop(orphan);
        joiner.join().unwrap().unwrap();
        assert_eq!(stopped.recv_timeout(WAIT).unwrap(), Ok(()));
    }
}
