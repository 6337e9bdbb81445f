use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tileworld_kernel::WorldStore;
use tileworld_net::Listener;
use tileworld_persist::{dump_snapshot, load_snapshot, validate};
use tileworld_server::{Server, ServerConfig, load_world};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tileworld-server", about = "Tile world server", version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a world and accept client connections
    Serve(ServeArgs),
    /// Check a snapshot file for duplicate IDs and crowded tiles
    Validate {
        /// Snapshot file (JSON array of entities)
        path: PathBuf,
    },
    /// Rewrite a snapshot sorted by entity ID
    Dump {
        /// Snapshot to read
        input: PathBuf,
        /// Where to write; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listen address, overrides the config file
    #[arg(long)]
    bind: Option<String>,
    /// World snapshot, overrides the config file
    #[arg(long)]
    entities: Option<PathBuf>,
    /// Capacity of every internal queue
    #[arg(long)]
    queue_capacity: Option<usize>,
    /// Per-connection idle deadline in seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
    /// Do not subscribe connections to broadcasts
    #[arg(long)]
    no_broadcast: bool,
    /// Keep position subscriptions on the tile where each client attached
    #[arg(long)]
    no_follow: bool,
    /// Identity announced in the handshake; random when omitted
    #[arg(long)]
    server_id: Option<Uuid>,
}

impl ServeArgs {
    fn resolve(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind.clone_from(bind);
        }
        if let Some(entities) = &self.entities {
            config.entities_path = Some(entities.clone());
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
        if self.no_broadcast {
            config.subscribe_broadcast = false;
        }
        if self.no_follow {
            config.follow_entity = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Serve(args) => serve(&args),
        Commands::Validate { path } => {
            let snapshot = load_snapshot(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            let issues = validate(&snapshot.entities);
            for issue in &issues {
                println!("{issue}");
            }
            println!(
                "{}: {} entities, sha256 {}",
                path.display(),
                snapshot.entities.len(),
                snapshot.sha256
            );
            if !issues.is_empty() {
                bail!("{} issue(s) found", issues.len());
            }
            Ok(())
        }
        Commands::Dump { input, output } => {
            let snapshot = load_snapshot(&input)
                .with_context(|| format!("loading {}", input.display()))?;
            // Round-trip through a store so duplicate IDs collapse.
            let entities = WorldStore::from_entities(snapshot.entities).dump_snapshot()?;
            match output {
                Some(path) => {
                    let digest = dump_snapshot(&path, &entities)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{}: {} entities, sha256 {digest}", path.display(), entities.len());
                }
                None => println!("{}", serde_json::to_string_pretty(&entities)?),
            }
            Ok(())
        }
    }
}

fn serve(args: &ServeArgs) -> anyhow::Result<()> {
    let config = args.resolve().context("resolving server config")?;
    let store = Arc::new(load_world(&config).context("loading world")?);

    let server_id = args.server_id.unwrap_or_else(Uuid::new_v4);
    let listener = Listener::bind(&config.bind, server_id, config.tunnel_config())
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, %server_id, "listening");
    let tunnels = listener.spawn()?;

    let mut server = Server::start(config, store)?;
    server.serve(&tunnels)?;
    Ok(())
}
