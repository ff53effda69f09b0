//! Impromptu CLI: join a room over WebSockets from a terminal.
//!
//! Every instance started with the same room name (and the same host and
//! port range) ends up in the same room; the first one becomes the hub.

mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use commands::{parse_command, Command, HELP};
use impromptu_room::{endpoint_name, Room, RoomConfig, RoomMessage, WsTransport, WsTransportConfig};

#[derive(Parser, Debug)]
#[command(name = "impromptu", about = "Join an impromptu room")]
struct Cli {
    /// Room to join
    room: String,

    /// Log protocol traffic
    #[arg(long)]
    debug: bool,

    /// Host endpoints listen on and peers dial
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// First port of the endpoint range
    #[arg(long, default_value_t = 43000)]
    base_port: u16,

    /// Number of ports room names are hashed across
    #[arg(long, default_value_t = 1000)]
    port_span: u16,

    /// Endpoint name prefix
    #[arg(long, default_value = "impromptu")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let transport = WsTransport::new(WsTransportConfig {
        host: cli.host.clone(),
        base_port: cli.base_port,
        port_span: cli.port_span,
    });
    info!(
        "Joining room {} via {}",
        cli.room,
        transport.endpoint_addr(&endpoint_name(&cli.namespace, &cli.room))
    );

    let config = RoomConfig {
        namespace: cli.namespace.clone(),
        debug: cli.debug,
        ..RoomConfig::default()
    };
    let room = Arc::new(Room::with_config(Arc::new(transport), cli.room.clone(), config));
    room.connect()
        .await
        .with_context(|| format!("failed to join room {}", cli.room))?;

    info!(
        "Joined {} as {:?} ({})",
        room.room_name(),
        room.role().await,
        room.local_id().map(|id| id.to_string()).unwrap_or_default()
    );
    println!("{HELP}");

    tokio::spawn(print_messages(room.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Some(command)) => {
                if let Err(e) = run_command(&room, command).await {
                    eprintln!("error: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("{e}"),
        }
    }

    info!("Input closed, leaving {}", room.room_name());
    Ok(())
}

async fn run_command(room: &Room, command: Command) -> Result<()> {
    match command {
        Command::Send(message) => room.send(message)?,
        Command::Set { key, value } => room.storage().set(key, value)?,
        Command::Get(key) => match room.storage().get(&key).await {
            Some(value) => println!("{key} = {value}"),
            None => println!("{key} is not set"),
        },
        Command::Store => {
            let snapshot = room.storage().snapshot().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Role => {
            let id = room.local_id().map(|id| id.to_string()).unwrap_or_default();
            println!("{:?} ({id})", room.role().await);
            if let Some(stats) = room.hub_stats() {
                println!(
                    "{} connected, {} relayed, {} store writes",
                    stats.active_connections, stats.messages_relayed, stats.store_writes
                );
            }
        }
        Command::Help => println!("{HELP}"),
    }
    Ok(())
}

async fn print_messages(room: Arc<Room>) {
    let me = room.local_id();
    let mut rx = room.subscribe();
    loop {
        match rx.recv().await {
            Ok(RoomMessage { sender, message }) => {
                let from = match (&sender, &me) {
                    (Some(sender), Some(me)) if sender == me => "me".to_string(),
                    (Some(sender), _) => sender.to_string(),
                    (None, _) => "?".to_string(),
                };
                println!("[{from}] {message}");
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Skipped {skipped} messages");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
