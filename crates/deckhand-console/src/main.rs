//! Line-oriented admin console over deckhand channels.
//!
//! Subscribes to every configured channel and logs state replacements,
//! operation progress and terminal output as they arrive. Mostly a
//! development aid; the product front end consumes `deckhand-client`
//! directly.

use clap::Parser;
use deckhand_client::{config::resolve_socket_dir, ChannelRegistry, ChannelUpdate, RegistryConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "deckhand-console")]
struct Args {
    /// Directory holding one <channel>.sock endpoint per channel.
    /// Falls back to DECKHAND_SOCKET_DIR, then /run/deckhand.
    #[arg(long, default_value = "")]
    socket_dir: String,
    /// Channels to watch.
    #[arg(long, default_values_t = [String::from("service"), String::from("installer")])]
    channel: Vec<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let socket_dir = resolve_socket_dir(&args.socket_dir);
    let config = RegistryConfig::new(socket_dir.clone());
    info!(
        event = "console_start",
        socket_dir = %socket_dir.display(),
        client_id = %config.client_id,
        channels = args.channel.len()
    );

    let registry = ChannelRegistry::new(config);
    let mut watchers = Vec::new();
    for name in &args.channel {
        let handle = registry.get_or_create(name);
        let mut subscription = handle.subscribe();
        let channel = name.clone();
        watchers.push(tokio::spawn(async move {
            while let Some(update) = subscription.recv().await {
                match update {
                    ChannelUpdate::State(state) => {
                        info!(event = "channel_state", channel = %channel, state = %state);
                    }
                    ChannelUpdate::Operation(update) => {
                        info!(
                            event = "operation_state",
                            channel = %channel,
                            operation = update.state.operation.map(|kind| kind.as_str()).unwrap_or("-"),
                            loading = update.state.is_loading,
                            progress = update.state.progress,
                            target = update.target.as_deref().unwrap_or("-"),
                            error = update.state.error.as_deref().unwrap_or("")
                        );
                    }
                    ChannelUpdate::Terminal(line) => {
                        info!(event = "terminal_output", channel = %channel, line = %line);
                    }
                }
            }
        }));
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(event = "signal_error", error = %err);
    }
    info!(event = "console_stop");
    for watcher in watchers {
        watcher.abort();
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("DECKHAND_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
