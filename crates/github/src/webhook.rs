use std::{fmt::Display, sync::Arc};

use axum::{
    Json,
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use gha_telemetry_core::{config::Config, models::EventType};

use crate::signature;

/// Verify and extract a GitHub webhook delivery.
///
/// The body is left undecoded; only the signature is checked here. When no webhook
/// secret is configured the signature is not checked at all.
#[derive(Clone, Debug)]
#[must_use]
pub struct WebhookDelivery {
    pub event_type: EventType,
    pub delivery_id: String,
    pub signature: Option<String>,
    pub body: Bytes,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

impl<S> FromRequest<S> for WebhookDelivery
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(status: StatusCode, m: impl Display) -> Response {
            tracing::warn!("{m}");
            let message = status.canonical_reason().unwrap_or("Error");
            (status, Json(serde_json::json!({ "message": message }))).into_response()
        }
        let event_type = header(req.headers(), "X-GitHub-Event").unwrap_or_else(|| "unknown".into());
        let delivery_id =
            header(req.headers(), "X-GitHub-Delivery").unwrap_or_else(|| "unknown".into());
        let signature = header(req.headers(), "X-Hub-Signature-256");
        let config = <Arc<Config>>::from_ref(state);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| err(StatusCode::BAD_REQUEST, "error reading body"))?;
        if let Some(secret) = &config.github.webhook_secret {
            let valid = signature
                .as_deref()
                .is_some_and(|header| signature::verify(&body, header, secret.as_bytes()));
            if !valid {
                return Err(err(
                    StatusCode::UNAUTHORIZED,
                    format!("Invalid webhook signature for delivery {delivery_id}"),
                ));
            }
        }
        Ok(WebhookDelivery { event_type: EventType::from(event_type), delivery_id, signature, body })
    }
}
