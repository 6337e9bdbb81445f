use crossbeam_channel::{Receiver, Sender, bounded};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tileworld_command::Command;
use tileworld_common::EntityId;
use tileworld_kernel::{StoreError, WorldStore};
use tileworld_net::{Message, NetError, Tunnel, TunnelConfig, dial};

use crate::plan::{Direction, plan_step};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot start mirror thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The mirror does not hold the client's own entity yet, either before
    /// the first perception or between a clear and the resync after it.
    #[error("entity {0} not perceived yet")]
    NotPerceived(EntityId),
}

/// A connection to the server plus the local mirror it keeps current.
///
/// The client's ID is the ID of the entity it controls.
#[derive(Debug)]
pub struct Client {
    entity: EntityId,
    mirror: Arc<WorldStore>,
    updates: Receiver<()>,
    tunnel: Tunnel,
    mirror_loop: JoinHandle<()>,
}

impl Client {
    /// Dial the server and start mirroring.
    pub fn connect(
        addr: impl ToSocketAddrs,
        entity: EntityId,
        config: TunnelConfig,
    ) -> Result<Self, ClientError> {
        let tunnel = dial(addr, entity.0, config)?;
        Self::from_tunnel(tunnel, entity)
    }

    /// Start mirroring over an established tunnel.
    pub fn from_tunnel(tunnel: Tunnel, entity: EntityId) -> Result<Self, ClientError> {
        let mirror = Arc::new(WorldStore::new());
        let (updated, updates) = bounded(1);
        let incoming = tunnel.incoming().clone();
        let loop_mirror = Arc::clone(&mirror);
        let mirror_loop = thread::Builder::new()
            .name(format!("mirror-{entity}"))
            .spawn(move || run_mirror(&loop_mirror, &incoming, &updated))?;

        tracing::info!(%entity, server = %tunnel.peer_id(), "client connected");
        Ok(Self {
            entity,
            mirror,
            updates,
            tunnel,
            mirror_loop,
        })
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Local copy of the world as the server has described it.
    pub fn mirror(&self) -> &Arc<WorldStore> {
        &self.mirror
    }

    /// Signals after mirror writes. Several writes may share one signal.
    pub fn updates(&self) -> &Receiver<()> {
        &self.updates
    }

    pub fn closed(&self) -> &Receiver<()> {
        self.tunnel.closed()
    }

    /// Whether the mirror loop has exited, i.e. the connection is gone.
    pub fn is_finished(&self) -> bool {
        self.mirror_loop.is_finished()
    }

    pub fn send(&self, command: impl Into<Command>) -> Result<(), ClientError> {
        let command = command.into();
        let message = Message::from_command(self.entity.0, &command)?;
        self.tunnel.send(message)?;
        tracing::debug!(tag = command.type_tag(), "sent");
        Ok(())
    }

    /// Plan a step against the mirror and send it. Returns how many
    /// commands went out; zero when the way is blocked.
    pub fn step(&self, direction: Direction) -> Result<usize, ClientError> {
        let plan = plan_step(&self.mirror, self.entity, direction).map_err(|e| match e {
            StoreError::NotFound(_) => ClientError::NotPerceived(self.entity),
            other => ClientError::Store(other),
        })?;
        let sent = plan.len();
        for command in plan {
            self.send(command)?;
        }
        Ok(sent)
    }

    /// Close the connection and wait for the mirror loop to stop.
    pub fn close(self) {
        self.tunnel.close();
        if self.mirror_loop.join().is_err() {
            tracing::error!(entity = %self.entity, "mirror loop panicked");
        }
    }
}

fn run_mirror(mirror: &WorldStore, incoming: &Receiver<Message>, updated: &Sender<()>) {
    for message in incoming.iter() {
        let mutation = match message.to_mutation() {
            Ok(mutation) => mutation,
            Err(e) => {
                tracing::warn!(content_type = %message.content_type, error = %e, "dropping undecodable message");
                continue;
            }
        };
        match mutation.apply(mirror) {
            Ok(_) => {}
            // The mirror may not know an entity yet; a later resync fills it.
            Err(StoreError::NotFound(id)) => {
                tracing::debug!(%id, tag = mutation.type_tag(), "mutation for unseen entity");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "mirror failure, stopping");
                return;
            }
        }
        tracing::trace!(tag = mutation.type_tag(), "mirrored");
        let _ = updated.try_send(());
    }
    tracing::debug!("server stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tileworld_common::{Entity, Position, Spatial};
    use tileworld_kernel::{ClearAllEntities, Mutation, PlaceEntity, SetEntity};
    use tileworld_net::Listener;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> TunnelConfig {
        TunnelConfig {
            idle_timeout: Duration::from_secs(10),
            queue_capacity: 16,
        }
    }

    /// A client wired to a bare server-side tunnel the test drives by hand.
    fn connected() -> (Client, Tunnel) {
        let listener = Listener::bind("127.0.0.1:0", Uuid::new_v4(), config()).unwrap();
        let addr = listener.local_addr().unwrap();
        let entity = EntityId::new();
        let client = thread::spawn(move || Client::connect(addr, entity, config()).unwrap());
        let server = listener.accept().unwrap();
        (client.join().unwrap(), server)
    }

    fn push(server: &Tunnel, mutation: impl Into<Mutation>) {
        let message = Message::from_mutation(server.peer_id(), &mutation.into()).unwrap();
        server.send(message).unwrap();
    }

    fn wait_for(client: &Client, done: impl Fn(&WorldStore) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done(client.mirror()) {
            assert!(Instant::now() < deadline, "mirror never converged");
            let _ = client.updates().recv_timeout(Duration::from_millis(50));
        }
    }

    #[test]
    fn server_mutations_reach_the_mirror() {
        let (client, server) = connected();
        let me = Entity::new(
            client.entity(),
            Position::new(0, 0),
            Spatial {
                stackable: true,
                toggleable: false,
            },
        );

        push(&server, ClearAllEntities {});
        push(&server, SetEntity { entity: me });
        push(
            &server,
            PlaceEntity {
                source_id: me.id,
                position: Position::new(0, 1),
            },
        );

        wait_for(&client, |m| {
            m.get(me.id).map(|e| e.position) == Ok(Position::new(0, 1))
        });
        client.mirror().check_invariants().unwrap().unwrap();
    }

    #[test]
    fn step_sends_planned_commands() {
        let (client, server) = connected();
        let me = Entity::new(client.entity(), Position::new(0, 0), Spatial::default());
        push(&server, SetEntity { entity: me });
        wait_for(&client, |m| m.get(me.id).is_ok());

        assert_eq!(client.step(Direction::Right).unwrap(), 2);
        let first = server.incoming().recv_timeout(WAIT).unwrap();
        let second = server.incoming().recv_timeout(WAIT).unwrap();
        assert_eq!(first.client_id, me.id.0);
        assert_eq!(first.to_command().unwrap().type_tag(), "commands.Move");
        assert_eq!(second.to_command().unwrap().type_tag(), "commands.Perceive");
    }

    #[test]
    fn step_before_perception_is_reported_and_recoverable() {
        let (client, server) = connected();
        let err = client.step(Direction::Up).unwrap_err();
        assert!(matches!(err, ClientError::NotPerceived(id) if id == client.entity()));
        assert!(server.incoming().try_recv().is_err());

        let me = Entity::new(client.entity(), Position::new(0, 0), Spatial::default());
        push(&server, SetEntity { entity: me });
        wait_for(&client, |m| m.get(me.id).is_ok());
        assert_eq!(client.step(Direction::Up).unwrap(), 2);
    }

    #[test]
    fn unknown_messages_are_skipped() {
        let (client, server) = connected();
        server
            .send(Message::new(Uuid::nil(), "mutations.Explode", serde_json::json!({})))
            .unwrap();
        let me = Entity::new(client.entity(), Position::new(4, 4), Spatial::default());
        push(&server, SetEntity { entity: me });
        wait_for(&client, |m| m.get(me.id).is_ok());
    }

    #[test]
    fn server_hangup_ends_mirror_loop() {
        let (client, server) = connected();
        drop(server);
        client.closed().recv_timeout(WAIT).unwrap();
        let deadline = Instant::now() + WAIT;
        while !client.is_finished() {
            assert!(Instant::now() < deadline, "mirror loop kept running");
            thread::sleep(Duration::from_millis(10));
        }
        client.close();
    }
}
