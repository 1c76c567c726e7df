//! tcp-core: asynchronous TCP session engine
//!
//! Modes:
//! - `server`: chat echo, stress receiver and file receiver on one listener
//! - `client`: chat client sending a greeting per session
//! - `send-file`: send one file and exit when the transfer completes
//! - `stress`: load-test client reporting the server's measurements
//!
//! Configuration via CLI arguments or TOML file.

use std::path::PathBuf;
use std::sync::Arc;
use tcp_core::config::{Config, Mode};
use tcp_core::protocols::chat::ChatClientHandler;
use tcp_core::protocols::stress::StressClientHandler;
use tcp_core::protocols::ServerHandler;
use tcp_core::runtime::{
    self, MemoryPoolManager, PacketSession, Service, ServiceConfig, SessionFactory,
    SessionHandler,
};
use tcp_core::transfer::{FilePacketHandler, FileTransferManager};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.address,
        mode = ?config.mode,
        max_sessions = config.max_sessions,
        recv_buffer_size = config.recv_buffer_size,
        "Starting tcp-core"
    );

    let workers = config.workers.unwrap_or_else(runtime::num_cpus);
    let rt = runtime::run_workers(workers)?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let memory = Arc::new(MemoryPoolManager::new());

    match config.mode {
        Mode::Server => {
            let service = Service::server(
                service_config(&config, config.max_sessions),
                Handle::current(),
                server_factory(&config, memory),
            );
            service.start()?;
            info!(address = ?service.local_addr(), "Listening");
            wait_for_shutdown().await;
            service.close_service();
        }
        Mode::Client => {
            let greeting = config.message.clone();
            let factory: SessionFactory = Arc::new(move || {
                Box::new(PacketSession::new(ChatClientHandler::new(greeting.clone())))
                    as Box<dyn SessionHandler>
            });
            let service = Service::client(
                service_config(&config, config.client_sessions),
                Handle::current(),
                factory,
            );
            service.start()?;
            wait_for_shutdown().await;
            service.close_service();
        }
        Mode::Stress => {
            let (tx, mut results) = mpsc::unbounded_channel();
            let start = config.stress;
            let factory: SessionFactory = Arc::new(move || {
                let handler = StressClientHandler::new(start).with_results(tx.clone());
                Box::new(PacketSession::new(handler)) as Box<dyn SessionHandler>
            });
            let service = Service::client(
                service_config(&config, config.client_sessions),
                Handle::current(),
                factory,
            );
            service.start()?;

            let mut remaining = config.client_sessions;
            while remaining > 0 {
                tokio::select! {
                    outcome = results.recv() => match outcome {
                        Some(Ok(_)) => remaining -= 1,
                        Some(Err(e)) => {
                            warn!(error = %e, "Stress session failed");
                            remaining -= 1;
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            service.close_service();
        }
        Mode::SendFile => {
            let path = config.file.clone().ok_or("send-file mode requires --file")?;
            let (tx, mut done) = mpsc::unbounded_channel();
            let manager = FileTransferManager::with_chunk_delay(memory, config.chunk_delay);
            manager.set_transfer_complete_callback(move |id, success, path| {
                let _ = tx.send((id, success, path.to_path_buf()));
            });

            let receive_dir = config.receive_dir.clone();
            let chunk_size = config.chunk_size;
            let factory: SessionFactory = Arc::new(move || {
                let files = FilePacketHandler::new(Arc::clone(&manager), receive_dir.clone())
                    .with_outgoing(path.clone(), chunk_size);
                Box::new(PacketSession::new(files)) as Box<dyn SessionHandler>
            });
            let service = Service::client(service_config(&config, 1), Handle::current(), factory);
            service.start()?;

            tokio::select! {
                outcome = done.recv() => match outcome {
                    Some((id, true, path)) => info!(transfer = id, path = %path.display(), "File sent"),
                    Some((id, false, path)) => warn!(transfer = id, path = %path.display(), "File transfer failed"),
                    None => {}
                },
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            service.close_service();
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn service_config(config: &Config, max_sessions: usize) -> ServiceConfig {
    ServiceConfig {
        recv_buffer_size: config.recv_buffer_size,
        ..ServiceConfig::new(config.address, max_sessions)
    }
}

/// Each accepted session gets its own transfer manager so peer transfer
/// ids never collide across clients.
fn server_factory(config: &Config, memory: Arc<MemoryPoolManager>) -> SessionFactory {
    let receive_dir: PathBuf = config.receive_dir.clone();
    let chunk_delay = config.chunk_delay;

    Arc::new(move || {
        let manager = FileTransferManager::with_chunk_delay(Arc::clone(&memory), chunk_delay);
        manager.set_transfer_complete_callback(|id, success, path| {
            info!(transfer = id, success, path = %path.display(), "Transfer finished");
        });
        let files = FilePacketHandler::new(manager, receive_dir.clone());
        Box::new(PacketSession::new(ServerHandler::new(files))) as Box<dyn SessionHandler>
    })
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for ctrl-c");
    }
    info!("Shutting down");
}
