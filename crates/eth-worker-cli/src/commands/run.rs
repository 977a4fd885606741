//! The `run` command: serve requests until stdin closes or Ctrl-C.

use crate::common::GlobalOpts;
use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use eth_worker::api::{TaskRequest, TaskResponse};
use eth_worker::{EthWorker, EthWorkerBuilder};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keep running after stdin closes
    #[arg(long, default_value_t = false)]
    detach_stdin: bool,
}

impl RunArgs {
    pub async fn run(&self, global: &GlobalOpts) -> Result<()> {
        let config = global.load_config()?;
        let worker = EthWorkerBuilder::new(config)
            .build()
            .await
            .context("failed to build worker")?;
        let handle = worker.start()?;

        tokio::select! {
            result = serve_stdin(&worker, self.detach_stdin) => result?,
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        }

        worker.stop()?;
        worker.wait().await?;
        handle.await.context("worker loop panicked")??;
        Ok(())
    }
}

/// Answers one JSON request per stdin line with one JSON response line.
async fn serve_stdin(worker: &EthWorker, detach: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<TaskRequest>(line) {
            Ok(request) => worker.handle_request(request).await,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                TaskResponse::Error {
                    kind: "InvalidRequest".to_string(),
                    message: e.to_string(),
                }
            }
        };
        output::print_json_line(&response)?;
    }

    if detach {
        info!("stdin closed, running until Ctrl-C");
        std::future::pending::<()>().await;
    }
    Ok(())
}
