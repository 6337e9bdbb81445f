use crossbeam_channel::{Receiver, select};
use std::sync::Arc;
use tileworld_kernel::{StoreError, WorldStore};
use tileworld_net::{NetError, Tunnel};
use tileworld_persist::{PersistError, load_snapshot, validate};

use crate::config::{ConfigError, ServerConfig};
use crate::pipeline::{Pipeline, PipelineError, PipelineHandle};
use crate::session::{Session, SessionError};

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("tunnel source closed")]
    ListenerClosed,
}

/// Build the world named by the config: the snapshot file if one is set,
/// otherwise an empty world. Validation issues are logged, not fatal.
pub fn load_world(config: &ServerConfig) -> Result<WorldStore, ServerError> {
    let Some(path) = &config.entities_path else {
        tracing::info!("no snapshot configured, starting with an empty world");
        return Ok(WorldStore::new());
    };
    let snapshot = load_snapshot(path)?;
    for issue in validate(&snapshot.entities) {
        tracing::warn!(path = %path.display(), %issue, "snapshot issue");
    }
    Ok(WorldStore::from_entities(snapshot.entities))
}

/// The world server: a store, its pipeline, and the attached sessions.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    store: Arc<WorldStore>,
    pipeline: Pipeline,
    sessions: Vec<Session>,
}

impl Server {
    pub fn start(config: ServerConfig, store: Arc<WorldStore>) -> Result<Self, ServerError> {
        config.validate()?;
        let entities = store.len()?;
        let pipeline = Pipeline::start(Arc::clone(&store), config.queue_capacity)?;
        tracing::info!(entities, "server started");
        Ok(Self {
            config,
            store,
            pipeline,
            sessions: Vec::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<WorldStore> {
        &self.store
    }

    pub fn handle(&self) -> PipelineHandle {
        self.pipeline.handle()
    }

    /// Attach one tunnel. Ended sessions are forgotten first.
    pub fn attach(&mut self, tunnel: Tunnel) -> Result<(), SessionError> {
        self.sessions.retain(|s| !s.is_finished());
        let session = Session::attach(tunnel, &self.store, self.pipeline.handle(), &self.config)?;
        self.sessions.push(session);
        tracing::debug!(sessions = self.sessions.len(), "sessions live");
        Ok(())
    }

    /// Attach tunnels until the source closes or the pipeline stops.
    ///
    /// A tunnel that cannot attach is dropped, which closes it.
    pub fn serve(&mut self, tunnels: &Receiver<Tunnel>) -> Result<(), ServerError> {
        loop {
            let tunnel = select! {
                recv(tunnels) -> tunnel => tunnel.map_err(|_| ServerError::ListenerClosed)?,
                recv(self.pipeline.stopped()) -> outcome => {
                    return Err(match outcome {
                        Ok(Err(e)) => PipelineError::Store(e),
                        _ => PipelineError::Stopped,
                    }
                    .into());
                }
            };
            let client = tunnel.peer_id();
            match self.attach(tunnel) {
                Ok(()) => {}
                Err(SessionError::Pipeline(e)) => return Err(e.into()),
                Err(e) => tracing::warn!(%client, error = %e, "rejecting connection"),
            }
        }
    }

    /// Number of sessions that have not ended yet.
    pub fn session_count(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_finished()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tileworld_common::{Entity, EntityId, Position, Spatial};
    use tileworld_persist::dump_snapshot;

    #[test]
    fn empty_world_without_snapshot() {
        let store = load_world(&ServerConfig::default()).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn world_is_seeded_from_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("entities.json");
        let e = Entity::new(EntityId::new(), Position::new(2, 3), Spatial::default());
        dump_snapshot(&path, &[e]).unwrap();

        let config = ServerConfig {
            entities_path: Some(path),
            ..ServerConfig::default()
        };
        let store = load_world(&config).unwrap();
        assert_eq!(store.get(e.id).unwrap(), e);
    }

    #[test]
    fn missing_snapshot_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            entities_path: Some(tmp.path().join("nope.json")),
            ..ServerConfig::default()
        };
        assert!(matches!(load_world(&config), Err(ServerError::Persist(_))));
    }

    #[test]
    fn start_rejects_invalid_config() {
        let config = ServerConfig {
            queue_capacity: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::start(config, Arc::new(WorldStore::new())),
            Err(ServerError::Config(_))
        ));
    }
}
