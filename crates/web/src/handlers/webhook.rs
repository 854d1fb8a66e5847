use anyhow::{Context, anyhow};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gha_telemetry_core::{AppError, models::WebhookEnvelope};
use gha_telemetry_github::{EventKind, classify, webhook::WebhookDelivery};

use crate::AppState;

/// Validate a delivery and queue it for the worker. Nothing is processed inline.
pub async fn webhook(
    State(state): State<AppState>,
    delivery: WebhookDelivery,
) -> Result<Response, AppError> {
    let WebhookDelivery { event_type, delivery_id, signature, body } = delivery;
    let response = |status: StatusCode, message: &str| {
        let body = serde_json::json!({
            "message": message,
            "event": event_type.as_str(),
            "delivery": delivery_id,
        });
        (status, Json(body)).into_response()
    };

    match classify(event_type.as_str(), &body) {
        Ok(EventKind::Unsupported) => {
            tracing::info!("Ignoring {} delivery {}", event_type, delivery_id);
            return Ok(response(StatusCode::OK, "Event ignored"));
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!("Rejecting delivery {}: {}", delivery_id, err);
            return Err(AppError::Status(StatusCode::BAD_REQUEST));
        }
    }

    let envelope =
        WebhookEnvelope::new(event_type.clone(), delivery_id.clone(), signature, &body)
            .context("Failed to wrap webhook body")?;
    let message = envelope.to_bytes().context("Failed to serialise envelope")?;
    let timeout = state.config.server.enqueue_timeout();
    let message_id = match tokio::time::timeout(timeout, state.queue.enqueue(&message)).await {
        Ok(Ok(id)) => id,
        Ok(Err(err)) => {
            return Err(AppError::Unavailable(
                anyhow::Error::new(err).context(format!("Failed to enqueue delivery {delivery_id}")),
            ));
        }
        Err(_) => {
            return Err(AppError::Unavailable(anyhow!(
                "Timed out after {:?} enqueueing delivery {}",
                timeout,
                delivery_id
            )));
        }
    };
    tracing::info!("Queued {} delivery {} as message {}", event_type, delivery_id, message_id);
    Ok(response(StatusCode::ACCEPTED, "Event queued"))
}
