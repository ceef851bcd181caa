//! Run the engine for a controller on the other end of stdio

use anyhow::{Context, Result};
use cli_lib::logging::LogHandle;
use cli_lib::IpcServer;
use tracing::{debug, info};

pub async fn run(log: LogHandle) -> Result<()> {
    // A terminal Ctrl-C reaches the whole process group; the controller
    // decides when this process stops
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt ignored, waiting for controller");
        }
    });

    let server = IpcServer::new().on_debug(move |on| log.set_debug(on));

    info!("serving on stdio (pid {})", std::process::id());
    server
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Engine session ended with an error")?;

    info!("controller disconnected");
    Ok(())
}
