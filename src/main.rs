// Heart broker - Main Entry Point

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use heart::broker::Broker;
use heart::config::{Config, Signal};
use heart::net::listener::TcpServer;
use heart::net::tls;
use heart::pidfile::{self, PidFile, StopOutcome};
use tracing::{error, info};

const APPLICATION_NAME: &str = "heart";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    // Initialize logging
    init_logging(config.debug, config.log_file.as_deref())?;

    let pid_path = config.pid_file();

    if config.signal == Some(Signal::Stop) {
        match pidfile::stop_running(&pid_path, APPLICATION_NAME) {
            Ok(StopOutcome::Stopped(pid)) => info!("Stopping {}: PID {} stopped", APPLICATION_NAME, pid),
            Ok(StopOutcome::StaleRemoved) => info!(
                "{}.pid exists but process isn't running. Removed obsolete PID file",
                APPLICATION_NAME
            ),
            Err(e) => {
                error!("Stopping {}: {}", APPLICATION_NAME, e);
                return Err(e.into());
            }
        }
        return Ok(());
    }

    let _pid_file = PidFile::acquire(&pid_path, APPLICATION_NAME)?;
    info!("{} started", APPLICATION_NAME);

    let acceptor = match config.tls_files() {
        Some((cert, key)) => {
            let acceptor = tls::server_acceptor(cert, key)?;
            info!("TLS enabled with certificate {}", cert.display());
            Some(acceptor)
        }
        None => None,
    };

    let broker = Arc::new(Broker::new());

    if config.status_interval > 0 {
        let interval = Duration::from_secs(config.status_interval);
        tokio::spawn(Arc::clone(&broker).run_status_log(interval));
    }

    let addr = config.listen_addr()?;
    let mut server = TcpServer::start(addr, Arc::clone(&broker), acceptor).await?;
    info!("Broker listening on {}", server.addr());

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    wait_for_shutdown().await?;

    // Graceful shutdown
    info!("Shutting down...");
    server.shutdown().await;
    broker.shutdown();

    // Let connection tasks run their disconnect cascade
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while broker.connection_count().await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    info!("{} closed", APPLICATION_NAME);
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal (Ctrl+C)");
        }
        _ = terminate.recv() => info!("Received shutdown signal (SIGTERM)"),
    }
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(debug: bool, log_file: Option<&Path>) -> std::io::Result<()> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_max_level(if debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_span_events(if debug {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            subscriber
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => subscriber.init(),
    }

    if debug {
        info!("Debug logging enabled (DEBUG level)");
    }
    Ok(())
}
