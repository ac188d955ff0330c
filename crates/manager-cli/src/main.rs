mod cli;
mod logging;
mod shutdown;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use manager_core::{HttpCatalogPublisher, ManagerRuntime};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Cli::parse().into_manager_config();
    let listen_addr = config.listen_addr;

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|err| anyhow::anyhow!("failed to bind {listen_addr}: {err}"))?;
    tracing::info!(%listen_addr, "manager listening");

    let runtime = ManagerRuntime::new(config, Arc::new(HttpCatalogPublisher::new())).await?;
    let stop_handle = runtime.stop_handle();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    let mut run_handle = tokio::spawn(runtime.run(listener));

    loop {
        tokio::select! {
            event = shutdown_rx.recv() => {
                match event {
                    Some(ShutdownEvent::Graceful) => {
                        tracing::info!("stop requested, draining in-flight tasks and workers");
                        stop_handle.store(true, Ordering::SeqCst);
                    }
                    Some(ShutdownEvent::Immediate) => {
                        tracing::warn!("stop requested again, exiting immediately");
                        std::process::exit(130);
                    }
                    None => {}
                }
            }
            result = &mut run_handle => {
                if let Err(err) = result {
                    if !err.is_cancelled() {
                        return Err(anyhow::anyhow!("manager runtime task panicked: {err}"));
                    }
                }
                break;
            }
        }
    }

    Ok(())
}
