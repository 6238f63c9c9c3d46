mod collectors;
mod config;
mod http;
mod metrics;
mod platform;
mod render;
mod snapshot;
mod state;
mod supervisor;
#[cfg(test)]
mod testing;

use axum::serve;
use clap::Parser;
use config::Config;
use metrics::Metrics;
use platform::Platform;
use snapshot::Snapshot;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "procwarden")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run one restart-eligible round, print the status table and exit.
    #[arg(long)]
    once: bool,
    /// Terminate every configured workload before exiting.
    #[arg(long)]
    stop_all_on_exit: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    info!(
        listen = %cfg.listen,
        workloads = cfg.workloads.len(),
        check_interval = ?cfg.settings.check_interval,
        restart_interval = ?cfg.settings.restart_interval,
        "starting procwarden"
    );

    let listen = cfg.listen.clone();
    let supervisor = Arc::new(Supervisor::new(cfg, Platform::host(), version));

    if cli.once {
        let snapshot = supervisor.tick(true).await;
        print!("{}", render::render_table(&snapshot));
        if cli.stop_all_on_exit {
            stop_all(&supervisor).await;
        }
        return;
    }

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty(version));

    let http_task = {
        let metrics = metrics.clone();
        let supervisor = supervisor.clone();
        let config_path = PathBuf::from(&cli.config);
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, snapshot_rx, supervisor, config_path);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };
            info!(%addr, "HTTP server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let mut supervisor_task = {
        let supervisor = supervisor.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            supervisor
                .run(shutdown, move |snapshot| {
                    metrics.update_from_snapshot(&snapshot);
                    snapshot_tx.send_replace(snapshot);
                })
                .await
        })
    };

    let mut supervisor_done = false;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "failed to wait for Ctrl+C");
            }
            info!("Ctrl+C received, shutting down");
        }
        joined = &mut supervisor_task => {
            supervisor_done = true;
            match joined {
                Ok(Ok(())) => info!("supervisor loop finished"),
                Ok(Err(err)) => error!(error = %err, "supervisor loop refused to start"),
                Err(err) => error!(error = %err, "supervisor task failed"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if !supervisor_done {
        let _ = supervisor_task.await;
    }
    let _ = http_task.await;

    if cli.stop_all_on_exit {
        stop_all(&supervisor).await;
    }
}

async fn stop_all(supervisor: &Supervisor) {
    if let Err(err) = supervisor.stop_all().await {
        warn!(error = %err, "failed to stop every workload on exit");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
