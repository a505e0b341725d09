//! tcpf: local single-route TCP forwarder.
//!
//! Listens on a local port and relays every accepted connection to one
//! fixed remote host/port.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tcpf_core::{
    accept_loop, bind_listener, DialFailurePolicy, ForwardResult, Realm, RealmConfig,
};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// tcpf — forward a local TCP port to a remote host
#[derive(Parser, Debug)]
#[command(name = "tcpf", version, about = "Forward a local TCP port to a remote host")]
struct Cli {
    /// Local port to listen on
    local_port: u16,

    /// Remote host to forward to
    remote_host: String,

    /// Remote port to forward to
    remote_port: u16,

    /// Interface to bind the listener on
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// What to do when the remote host cannot be reached
    #[arg(long, value_enum, default_value_t = OnDialFailure::Terminate)]
    on_dial_failure: OnDialFailure,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OnDialFailure {
    /// Exit the process
    Terminate,
    /// Drop the inbound connection and keep serving
    Reject,
}

impl From<OnDialFailure> for DialFailurePolicy {
    fn from(value: OnDialFailure) -> Self {
        match value {
            OnDialFailure::Terminate => DialFailurePolicy::Terminate,
            OnDialFailure::Reject => DialFailurePolicy::Reject,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.log_level) {
        eprintln!("tcpf: {e:#}");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting tcpf on port {} => {}:{}",
        cli.local_port,
        cli.remote_host,
        cli.remote_port
    );

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("tcpf: {e:#}");
        std::process::exit(1);
    }

    info!("tcpf stopped");
}

/// Log to stdout, filtered by `RUST_LOG` when it is set and by
/// `--log-level` otherwise.
fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level '{log_level}'"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RealmConfig::new(
        cli.bind,
        cli.local_port.to_string(),
        cli.remote_host,
        cli.remote_port.to_string(),
    )
    .with_dial_failure_policy(cli.on_dial_failure.into());

    let listener = bind_listener(&config)
        .await
        .context("cannot start listener")?;

    let (realm, handle) = Realm::new(config);
    let mut realm_task = tokio::spawn(realm.run());

    tokio::select! {
        biased;
        result = &mut realm_task => realm_outcome(result),
        result = accept_loop(listener, handle) => {
            // The acceptor only stops once the realm has; the realm knows why.
            if let Err(e) = result {
                debug!(error = %e, "accept loop stopped");
            }
            realm_outcome(realm_task.await)
        }
        signal = shutdown_signal() => {
            info!(signal, "received shutdown signal");
            Ok(())
        }
    }
}

fn realm_outcome(result: Result<ForwardResult<()>, JoinError>) -> anyhow::Result<()> {
    result
        .context("realm task panicked")?
        .context("forwarding stopped")
}

/// Resolve with the name of the first termination signal received.
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "cannot watch SIGTERM, only Ctrl+C will stop tcpf");
            wait_for_ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a handler the forwarder simply runs until killed.
        warn!(error = %e, "cannot watch Ctrl+C");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
