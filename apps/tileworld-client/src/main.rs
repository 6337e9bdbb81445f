use anyhow::{Context, anyhow};
use clap::Parser;
use std::io::BufRead;
use std::time::Duration;
use tileworld_client::{Client, ClientError, Direction, render_view};
use tileworld_command::{CloseSpatial, Info, OpenSpatial, Perceive};
use tileworld_common::EntityId;
use tileworld_net::TunnelConfig;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const HELP: &str = "\
commands:
  up | down | left | right   step (w a s d also work)
  look                       print the map around you
  perceive                   ask the server for a full resync
  info                       ask for your own entity
  open <id> | close <id>     toggle a door
  quit";

#[derive(Parser)]
#[command(name = "tileworld-client", about = "Headless tile world client", version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,
    /// Client identity, which is also the controlled entity's ID
    #[arg(long)]
    client_id: Uuid,
    /// Per-connection idle deadline in seconds
    #[arg(long, default_value = "120")]
    idle_timeout_secs: u64,
    /// Half-width of the map printed by `look`
    #[arg(long, default_value = "5")]
    radius: i32,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let config = TunnelConfig {
        idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
        ..TunnelConfig::default()
    };
    let me = EntityId(cli.client_id);
    let client = Client::connect(&cli.addr, me, config)
        .with_context(|| format!("connecting to {}", cli.addr))?;
    println!("{HELP}");

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if client.is_finished() {
            println!("server closed the connection");
            break;
        }
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            continue;
        };
        let target = words.next();
        match verb {
            "quit" | "q" | "exit" => break,
            "help" | "?" => println!("{HELP}"),
            "look" | "view" => print_view(&client, cli.radius),
            "perceive" => client.send(Perceive { source_id: me })?,
            "info" => client.send(Info { source_id: me })?,
            "open" | "close" => match parse_target(target) {
                Ok(target_id) if verb == "open" => client.send(OpenSpatial {
                    source_id: me,
                    target_id,
                })?,
                Ok(target_id) => client.send(CloseSpatial {
                    source_id: me,
                    target_id,
                })?,
                Err(e) => println!("{e:#}"),
            },
            other => match other.parse::<Direction>() {
                Ok(direction) => match client.step(direction) {
                    Ok(sent) => {
                        if sent == 0 {
                            println!("blocked");
                        }
                        // Give the server a moment to answer before drawing.
                        let _ = client.updates().recv_timeout(Duration::from_millis(300));
                        print_view(&client, cli.radius);
                    }
                    Err(e @ ClientError::NotPerceived(_)) => println!("{e}; try `perceive`"),
                    Err(e) => return Err(e.into()),
                },
                Err(e) => println!("{e}"),
            },
        }
    }

    client.close();
    Ok(())
}

fn parse_target(word: Option<&str>) -> anyhow::Result<EntityId> {
    let word = word.ok_or_else(|| anyhow!("missing target entity id"))?;
    let id = Uuid::parse_str(word).with_context(|| format!("bad entity id {word:?}"))?;
    Ok(EntityId(id))
}

fn print_view(client: &Client, radius: i32) {
    match render_view(client.mirror(), client.entity(), radius) {
        Ok(view) => print!("{view}"),
        Err(e) => println!("nothing to show yet: {e}"),
    }
}
