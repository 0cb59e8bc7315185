/*
[INPUT]:  CLI arguments, optional YAML configuration file, OS shutdown signals
[OUTPUT]: Live order events logged (or printed as JSON) until shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use order_notify_client::{
    ClientStatus, ConnectionState, OrderListener, OrderNotifyClient, Subscription,
};
use order_notify_watch::{EventPrinter, OutputFormat, WatchConfig};

#[derive(Parser, Debug)]
#[command(name = "order-notify-watch", version, about = "Watch live order status notifications")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
    /// Overrides `endpoint` from the config file
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,
    #[arg(long, value_name = "NS")]
    namespace: Option<String>,
    /// Scope id sent on connect, e.g. a restaurant id
    #[arg(long, value_name = "ID")]
    scope: Option<String>,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Print each event as one JSON line on stdout
    #[arg(long)]
    json: bool,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Order ids to watch, merged with `orders` from the config file
    #[arg(value_name = "ORDER_ID")]
    orders: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    let config = resolve_config(&args)?;
    let client_config = config.client_config()?;
    info!(
        endpoint = %client_config.endpoint,
        namespace = %client_config.namespace,
        scope = ?config.scope,
        order_count = config.orders.len(),
        dry_run = args.dry_run,
        "starting order-notify-watch"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let client = OrderNotifyClient::new(client_config).context("build notification client")?;
    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Log
    };
    let printer: Arc<dyn OrderListener> = Arc::new(EventPrinter::new(format));
    let subscriptions: Vec<Subscription> = config
        .orders
        .iter()
        .map(|order_id| client.subscribe_shared(order_id.clone(), printer.clone()))
        .collect();

    let state_logger = spawn_state_logger(client.subscribe_state(), shutdown.clone());

    client
        .connect(config.scope.as_deref())
        .await
        .context("connect to order notification endpoint")?;
    info!(orders = ?config.orders, "watching orders");

    shutdown.cancelled().await;
    let gave_up = client.status() == ClientStatus::Failed;
    info!("shutting down");

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    client.disconnect().await;
    if let Err(err) = state_logger.await {
        warn!(error = %err, "state logger task failed");
    }
    info!("order watcher stopped");

    if gave_up {
        return Err(anyhow!("reconnection attempts exhausted"));
    }
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn resolve_config(args: &Cli) -> Result<WatchConfig> {
    let mut config = match &args.config_path {
        Some(path) => load_config(path)?,
        None => WatchConfig::default(),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if args.scope.is_some() {
        config.scope = args.scope.clone();
    }
    config.merge_orders(args.orders.iter().cloned());

    if config.orders.is_empty() {
        bail!("no order ids to watch; pass ORDER_ID arguments or set `orders` in the config file");
    }
    Ok(config)
}

fn load_config(path: &PathBuf) -> Result<WatchConfig> {
    let path_str = path
        .to_str()
        .context("config path must be valid utf-8")?;
    WatchConfig::from_file(path_str).context("load config")
}

fn spawn_state_logger(
    mut states: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    match state {
                        ConnectionState::Reconnecting { attempt } => {
                            warn!(attempt, "connection lost; reconnecting");
                        }
                        ConnectionState::Failed => {
                            error!("order notification connection failed");
                            shutdown.cancel();
                            break;
                        }
                        other => info!(state = %other, "connection state changed"),
                    }
                }
            }
        }
    })
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
