mod handlers;

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRef},
    http::{HeaderName, Request, StatusCode},
};
use gha_telemetry_core::{
    config::Config,
    util::{init_tracing, shutdown_signal},
};
use gha_telemetry_jobs::create_worker;
use gha_telemetry_queue::QueueClient;
use gha_telemetry_sink::create_sink;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};

use crate::handlers::build_router;

/// GitHub caps webhook payloads at 25 MB.
const MAX_BODY_SIZE: usize = 25 * 1024 * 1024;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    queue: Arc<dyn QueueClient>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_file(Config::path_from_env())?);
    if config.github.webhook_secret.is_none() {
        tracing::warn!("No webhook secret configured; signatures will not be verified");
    }
    let queue = gha_telemetry_queue::connect(&config.queue).await?;

    // Optionally run the queue worker in this process
    let worker = if config.worker.embedded {
        let sink = create_sink(&config.telemetry).context("Failed to create telemetry sink")?;
        Some(create_worker(&config, queue.clone(), sink))
    } else {
        None
    };

    let state = AppState { config: config.clone(), queue: queue.clone() };
    let router = app(state);

    // Create the listener
    #[allow(unused_mut)]
    let mut listener = None;
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::{FromRawFd, IntoRawFd};
        let fds = libsystemd::activation::receive_descriptors_with_names(false)
            .map_err(|e| anyhow::anyhow!("Failed to receive fds: {e:?}"))?;
        if let Some((fd, name)) = fds.into_iter().next() {
            tracing::info!("Web server: Listening on {}", name);
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd.into_raw_fd()) };
            std_listener.set_nonblocking(true).context("Failed to set non-blocking")?;
            listener = Some(TcpListener::from_std(std_listener).context("Failed to create listener")?);
        }
    }
    let listener = match listener {
        Some(listener) => listener,
        None => {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
            tracing::info!("Web server: Listening on {}", addr);
            TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {addr}"))?
        }
    };

    #[cfg(target_os = "linux")]
    if let Err(e) = libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Ready]) {
        tracing::warn!("Failed to notify systemd: {e:?}");
    }

    // One signal stops both the web server and the worker
    let cancel = CancellationToken::new();
    let web_server = async {
        let cancel = cancel.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                cancel.cancel();
            })
            .await
            .context("Web server error");
        tracing::info!("Web server stopped");
        result
    };
    let queue_worker = async {
        if let Some(worker) = &worker {
            worker.run_until_cancelled(cancel.clone()).await;
        }
        Ok::<_, anyhow::Error>(())
    };

    // Wait for both to complete gracefully (early return on error)
    if let Err(e) = tokio::try_join!(web_server, queue_worker) {
        tracing::error!("{e:?}");
    }

    #[cfg(target_os = "linux")]
    if let Err(e) = libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Stopping])
    {
        tracing::warn!("Failed to notify systemd: {e:?}");
    }

    queue.close().await;
    tracing::info!("Shut down gracefully");
    Ok(())
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![HeaderName::from_static("x-hub-signature-256")].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DeliveryMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ));
    build_router().layer(DefaultBodyLimit::max(MAX_BODY_SIZE)).with_state(state).layer(middleware)
}

/// Request span carrying the GitHub delivery id, so handler logs can be tied to a
/// delivery in GitHub's webhook UI.
#[derive(Debug, Clone)]
pub struct DeliveryMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for DeliveryMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let delivery = request
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let event =
            request.headers().get("X-GitHub-Event").and_then(|v| v.to_str().ok()).unwrap_or("-");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    event = %event,
                    delivery = %delivery,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
