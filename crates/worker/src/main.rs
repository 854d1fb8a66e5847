use std::sync::Arc;

use anyhow::{Context, Result};
use gha_telemetry_core::{
    config::Config,
    util::{init_tracing, shutdown_signal},
};
use gha_telemetry_jobs::create_worker;
use gha_telemetry_sink::create_sink;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_file(Config::path_from_env())?;
    let queue = gha_telemetry_queue::connect(&config.queue).await?;
    let sink = create_sink(&config.telemetry).context("Failed to create telemetry sink")?;
    let worker = Arc::new(create_worker(&config, queue.clone(), sink));

    let cancel = CancellationToken::new();
    let mut handle = tokio::spawn({
        let worker = worker.clone();
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    #[cfg(target_os = "linux")]
    if let Err(e) = libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Ready]) {
        tracing::warn!("Failed to notify systemd: {e:?}");
    }

    tokio::select! {
        result = &mut handle => {
            result.context("Worker task failed")?;
            tracing::warn!("Worker exited before shutdown was requested");
        }
        () = shutdown_signal() => {
            cancel.cancel();
            #[cfg(target_os = "linux")]
            if let Err(e) =
                libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Stopping])
            {
                tracing::warn!("Failed to notify systemd: {e:?}");
            }
            // Undeleted messages are redelivered after their visibility timeout.
            match tokio::time::timeout(config.worker.shutdown_timeout(), &mut handle).await {
                Ok(result) => result.context("Worker task failed")?,
                Err(_) => {
                    tracing::warn!(
                        "Worker did not stop within {:?}; abandoning in-flight messages",
                        config.worker.shutdown_timeout()
                    );
                    handle.abort();
                }
            }
        }
    }

    queue.close().await;
    tracing::info!("Shut down gracefully");
    Ok(())
}
