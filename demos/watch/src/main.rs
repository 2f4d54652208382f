//! Follow execution sessions from the terminal.
//!
//! Run with: cargo run -p execlink-watch -- --token <TOKEN> watch
//!
//! Endpoints come from `--config` (TOML) or `EXECLINK_WS_URL` /
//! `EXECLINK_API_URL`.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use execlink_core::{ClientConfig, LogEntry, LogKind, SessionConfig};
use execlink_session::SessionClient;
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "execlink-watch", about = "Follow execution sessions")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Access token for the engine and the directory.
    #[arg(long, env = "EXECLINK_TOKEN")]
    token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sessions.
    List,
    /// Follow a session; without an id, the single running one.
    Watch { session: Option<String> },
    /// Create a session, start it and follow it.
    Run {
        prompt: String,
        /// Agent to include; repeat for several.
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
    },
    /// Cancel a running or paused session.
    Cancel { session: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = ClientConfig::default();
            config.apply_env();
            config
        }
    };

    info!("Engine at {}, directory at {}", config.ws_url, config.api_url);
    let client = SessionClient::from_config(&config, &cli.token);
    let attached = client.init(cli.token.clone()).await?;

    let result = run(&client, cli.command, attached.is_some()).await;

    client.shutdown();
    result
}

async fn run(client: &SessionClient, command: Command, attached: bool) -> anyhow::Result<()> {
    match command {
        Command::List => {
            for s in client.sessions() {
                println!(
                    "{}  {:<9}  {} agent(s)  {}",
                    s.id, s.status.as_str(), s.agent_count, s.prompt
                );
            }
            Ok(())
        }
        Command::Watch { session } => {
            match session {
                Some(id) => {
                    client.load_session(&id).await?;
                }
                None if attached => {}
                None => bail!("no single running session to watch; pass an id"),
            }
            follow(client).await
        }
        Command::Run { prompt, agents } => {
            client.select_agents(agents);
            let session = client
                .create_session(prompt, SessionConfig::default())
                .await?;
            println!("created {}", session.id);
            client.start(&session.id).await?;
            follow(client).await
        }
        Command::Cancel { session } => {
            client.cancel(&session).await?;
            println!("cancelled {session}");
            Ok(())
        }
    }
}

/// Print the current session's timeline until it ends or Ctrl-C.
async fn follow(client: &SessionClient) -> anyhow::Result<()> {
    let mut printed = 0usize;
    let mut tick = tokio::time::interval(Duration::from_millis(500));

    loop {
        let Some(timeline) = client.timeline() else {
            bail!("no session loaded");
        };
        let epoch = timeline.epoch();
        // A resync restarts from the snapshot; skip what was already shown.
        let mut entries = timeline.history_plus_stream().skip(printed);

        loop {
            tokio::select! {
                entry = entries.next() => {
                    let Some(entry) = entry else { break };
                    print_entry(&entry);
                    printed += 1;
                }
                _ = tick.tick() => {
                    if client.timeline().is_some_and(|t| t.epoch() != epoch) {
                        info!("Timeline resynchronized after reconnect");
                        break;
                    }
                    if let Some(session) = client.current_session().filter(|s| s.status.is_terminal()) {
                        println!("session {} {}", session.id, session.status);
                        if let Some(error) = client.error() {
                            println!("error: {}", error.message);
                        }
                        return Ok(());
                    }
                }
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }
}

fn print_entry(entry: &LogEntry) {
    let time = entry.timestamp.format("%H:%M:%S");
    let source = entry.agent_id.as_deref().unwrap_or("-");
    if entry.kind == LogKind::Screenshot {
        let size = entry.decode_screenshot().map_or(0, |bytes| bytes.len());
        println!("[{time}] {source}: <screenshot, {size} bytes>");
    } else {
        println!("[{time}] {:?} {source}: {}", entry.level, entry.message);
    }
}
