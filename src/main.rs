use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use roomrelay::{Config, Result};
use roomrelay::agent::{MessageRouter, SyncGate, TimerRegistry};
use roomrelay::channels::{ChatTransport, MatrixChannel, StatusServer, StatusServerConfig};
use roomrelay::device::{DEFAULT_TRIGGER_ARGUMENT, DeviceTrigger, ParticleClient, create_device_trigger};
use roomrelay::llm::{CompletionClient, create_llm_provider};

const STARTUP_MESSAGE: &str =
    "Bot is now online and ready to chat! I'll only respond to messages sent after this point.";

/// Pause between sync requests. The server-side long poll does the waiting.
const SYNC_POLL_INTERVAL: Duration = Duration::ZERO;

#[derive(Parser, Debug)]
#[command(name = "roomrelay", version, about = "Matrix room relay bot with LLM replies and device timers")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the room and relay messages (default)
    Run,

    /// Send one message through the completion client and print the reply
    Ask {
        /// Message text
        message: String,
    },

    /// Call the device function once and print its return value
    Trigger {
        /// Argument passed to the device function
        #[arg(long, default_value = DEFAULT_TRIGGER_ARGUMENT)]
        arg: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_bot(config).await?,
        Command::Ask { message } => ask(config, &message).await?,
        Command::Trigger { arg } => trigger(config, &arg).await?,
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomrelay=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run_bot(config: Config) -> Result<()> {
    let delay = rand::thread_rng().gen_range(config.startup_delay.clone());
    tracing::info!("Waiting {:.1} seconds before starting to avoid rate limits...", delay);
    tokio::time::sleep(Duration::from_secs_f64(delay)).await;

    let channel = Arc::new(MatrixChannel::new(&config.matrix));
    let transport: Arc<dyn ChatTransport> = channel;

    let bot_user_id = transport
        .login()
        .await
        .inspect_err(|e| tracing::error!("Login failed: {}", e))?;
    tracing::info!("Logged in as {}", bot_user_id);

    let room_id = match transport.join_room(&config.matrix.room_alias).await {
        Ok(room_id) => {
            tracing::info!("Joined room {} ({})", config.matrix.room_alias, room_id);
            Some(room_id)
        }
        Err(e) => {
            tracing::error!("Error joining room: {}", e);
            None
        }
    };

    let provider = create_llm_provider(&config.llm)?;
    let completion =
        CompletionClient::new(provider, config.llm.system_prompt.clone(), &config.rate_limit);
    let device = create_device_trigger(&config.device);
    let timers = Arc::new(TimerRegistry::new(Arc::clone(&transport), device));
    let gate = Arc::new(SyncGate::new());

    let mut status_server = match config.status.port {
        Some(port) => {
            let mut server = StatusServer::new(
                StatusServerConfig {
                    addr: SocketAddr::from(([0, 0, 0, 0], port)),
                },
                Arc::clone(&gate),
                Arc::clone(&timers),
            );
            server.start().await?;
            Some(server)
        }
        None => None,
    };

    let router = Arc::new(MessageRouter::new(
        bot_user_id,
        Arc::clone(&transport),
        completion,
        Arc::clone(&timers),
        Arc::clone(&gate),
    ));

    let events = transport.start(SYNC_POLL_INTERVAL).await?;
    let mut router_task = tokio::spawn(router.run(events));

    tracing::info!("Performing initial sync...");
    if tokio::time::timeout(config.matrix.sync_timeout, gate.wait_live())
        .await
        .is_err()
    {
        tracing::warn!("No sync signal within {:?}, going live now", config.matrix.sync_timeout);
    }
    gate.mark_sync_complete();

    if let Some(room_id) = &room_id {
        match transport.send_message(room_id, STARTUP_MESSAGE).await {
            Ok(()) => tracing::info!("Sent startup message to room"),
            Err(e) => tracing::error!("Error sending startup message: {}", e),
        }
    }

    tokio::select! {
        result = &mut router_task => {
            if let Err(e) = result {
                tracing::error!("Router task failed: {}", e);
            }
            tracing::error!("Matrix sync stopped, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            if let Err(e) = transport.shutdown().await {
                tracing::error!("Error stopping Matrix sync: {}", e);
            }
            router_task.abort();
        }
    }

    timers.shutdown();
    if let Some(server) = status_server.as_mut() {
        server.shutdown().await;
    }
    tracing::info!("Bot stopped");
    Ok(())
}

async fn ask(config: Config, message: &str) -> Result<()> {
    let provider = create_llm_provider(&config.llm)?;
    let client = CompletionClient::new(provider, config.llm.system_prompt, &config.rate_limit);
    println!("{}", client.complete(message).await);
    Ok(())
}

async fn trigger(config: Config, argument: &str) -> Result<()> {
    let client = ParticleClient::new(&config.device)?;
    let value = client.invoke(argument).await?;
    println!("Device returned: {}", value);
    Ok(())
}
