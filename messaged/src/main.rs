use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use messages_core::{Normalizer, StateStore, load_config};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::info;

use messaged::adapters::gmail::GmailConfig;
use messaged::adapters::{DiscordAdapter, GmailAdapter, SignalAdapter, TelegramAdapter, WhatsappAdapter};
use messaged::{DesktopNotifyAdapter, HealthMonitor, NotificationDispatcher, NotifyAdapter, Orchestrator, PidFile, PlatformAdapter, PlatformManager};

#[derive(Parser, Debug)]
#[command(name = "messaged", version, about = "Unified messaging daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon and block until shutdown.
    Serve(ServeArgs),
    /// Print the effective configuration as JSON.
    PrintConfig(ServeArgs),
    /// Query daemon status over the control socket.
    Status(ClientArgs),
    /// Query daemon health over the control socket.
    Health(ClientArgs),
    /// Ask the running daemon to shut down.
    Stop(ClientArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/messaged.toml")]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
    #[arg(long, default_value = "/tmp/messages-daemon.sock")]
    socket: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/messaged.toml"),
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
        Command::Status(args) => client_request(args, "status").await,
        Command::Health(args) => client_request(args, "health").await,
        Command::Stop(args) => client_request(args, "stop").await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_config(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn client_request(args: ClientArgs, kind: &str) -> anyhow::Result<()> {
    let stream = UnixStream::connect(&args.socket)
        .await
        .with_context(|| format!("failed to connect to {}", args.socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let request = serde_json::json!({ "type": kind });
    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;

    match lines.next_line().await? {
        Some(line) => {
            let value: serde_json::Value = serde_json::from_str(&line)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        None => Err(anyhow!("daemon closed the connection without responding")),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let _pid_file = PidFile::acquire(&config.ipc.pid_file_path)
        .with_context(|| format!("failed to acquire pid file {}", config.ipc.pid_file_path))?;

    let store = Arc::new(
        StateStore::open(&config.storage.state_db_path)
            .with_context(|| format!("failed to open state store at {}", config.storage.state_db_path))?,
    );
    let normalizer = Arc::new(Normalizer::new(store.clone()));

    let desktop: Option<Arc<dyn NotifyAdapter>> = if config.notify.desktop_enabled {
        Some(Arc::new(DesktopNotifyAdapter))
    } else {
        None
    };
    let notify = Arc::new(NotificationDispatcher::new(
        config.notify.log_path.clone(),
        config.notify.dedup_window_ms,
        config.notify.log_rotate_bytes,
        desktop,
    ));

    let (adapter_tx, adapter_rx) = tokio::sync::mpsc::channel(256);
    let manager = Arc::new(PlatformManager::new(
        config.platforms.priority.clone(),
        config.platforms.backoff_schedule_ms.clone(),
        config.platforms.max_reconnect_attempts,
        adapter_tx,
    ));

    register_adapters(&manager, &config.storage.state_dir).await;

    let (health_tx, health_rx) = tokio::sync::mpsc::channel(256);
    let health_monitor = Arc::new(HealthMonitor::new(
        manager.clone(),
        config.health.stale_threshold_ms,
        config.health.error_window_ms,
        config.health.max_errors_before_unhealthy,
        health_tx,
    ));

    let (shutting_down_tx, shutting_down_rx) = tokio::sync::watch::channel(false);

    let orchestrator = Arc::new(Orchestrator::new(
        manager.clone(),
        health_monitor.clone(),
        notify.clone(),
        store.clone(),
        normalizer.clone(),
        std::process::id(),
        shutting_down_tx,
    ));

    orchestrator.start().await;

    let event_loop_orchestrator = orchestrator.clone();
    let event_loop_handle = tokio::spawn(async move {
        event_loop_orchestrator
            .run_event_loop(adapter_rx, health_rx)
            .await;
    });

    let health_check_interval_ms = config.health.check_interval_ms;
    let health_run_rx = shutting_down_rx.clone();
    let health_handle = tokio::spawn(async move {
        health_monitor.run(health_check_interval_ms, health_run_rx).await;
    });

    let ipc_socket = PathBuf::from(&config.ipc.socket_path);
    let ipc_orchestrator = orchestrator.clone();
    let ipc_shutdown_rx = shutting_down_rx.clone();
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = messaged::ipc::serve(ipc_socket, ipc_orchestrator, ipc_shutdown_rx).await {
            tracing::error!(error = %e, "ipc server exited with error");
        }
    });

    info!("messaged started");
    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");

    orchestrator.stop().await;
    let _ = health_handle.await;
    let _ = ipc_handle.await;
    let _ = event_loop_handle.await;

    Ok(())
}

async fn register_adapters(manager: &Arc<PlatformManager>, state_dir: &str) {
    manager
        .register(Arc::new(SignalAdapter::from_env(&format!(
            "{state_dir}/signal-cli.sock"
        ))) as Arc<dyn PlatformAdapter>)
        .await;
    manager
        .register(Arc::new(WhatsappAdapter::new(state_dir)) as Arc<dyn PlatformAdapter>)
        .await;

    if let Some(discord) = DiscordAdapter::from_env() {
        manager.register(Arc::new(discord) as Arc<dyn PlatformAdapter>).await;
    } else {
        tracing::info!("DISCORD_BOT_TOKEN not set, discord adapter disabled");
    }

    if let Some(telegram) = TelegramAdapter::from_env() {
        manager.register(Arc::new(telegram) as Arc<dyn PlatformAdapter>).await;
    } else {
        tracing::info!("TELEGRAM_BOT_TOKEN not set, telegram adapter disabled");
    }

    if let Some(gmail_config) = GmailConfig::from_env() {
        manager
            .register(Arc::new(GmailAdapter::new(gmail_config)) as Arc<dyn PlatformAdapter>)
            .await;
    } else {
        tracing::info!("GMAIL_IMAP_* not set, gmail adapter disabled");
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sighup.recv() => info!("received SIGHUP"),
    }
    Ok(())
}
