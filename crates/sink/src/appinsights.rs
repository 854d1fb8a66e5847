//! Application Insights ingestion over HTTP.
//!
//! Each record becomes one custom event posted to the `v2/track` endpoint.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use gha_telemetry_core::models::MetricRecord;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

use crate::{SinkError, TelemetrySink};

const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com";

/// The parts of an Application Insights connection string this sink needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub instrumentation_key: String,
    pub ingestion_endpoint: String,
}

impl ConnectionString {
    /// Parse `Key=Value;Key=Value`. Keys are case-insensitive and unknown keys are
    /// ignored.
    pub fn parse(value: &str) -> Result<Self, SinkError> {
        let mut instrumentation_key = None;
        let mut ingestion_endpoint = None;
        for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(SinkError::Configuration(format!(
                    "Malformed connection string segment: {part}"
                )));
            };
            let value = value.trim();
            if key.trim().eq_ignore_ascii_case("InstrumentationKey") {
                instrumentation_key = Some(value.to_string());
            } else if key.trim().eq_ignore_ascii_case("IngestionEndpoint") {
                ingestion_endpoint = Some(value.trim_end_matches('/').to_string());
            }
        }
        let Some(instrumentation_key) = instrumentation_key.filter(|k| !k.is_empty()) else {
            return Err(SinkError::Configuration(
                "Connection string has no InstrumentationKey".to_string(),
            ));
        };
        Ok(Self {
            instrumentation_key,
            ingestion_endpoint: ingestion_endpoint
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_INGESTION_ENDPOINT.to_string()),
        })
    }

    pub fn track_url(&self) -> String { format!("{}/v2/track", self.ingestion_endpoint) }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    name: String,
    time: String,
    i_key: &'a str,
    tags: BTreeMap<&'static str, &'static str>,
    data: Data<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Data<'a> {
    base_type: &'static str,
    base_data: EventData<'a>,
}

#[derive(Serialize)]
struct EventData<'a> {
    ver: u8,
    name: &'static str,
    properties: &'a BTreeMap<String, String>,
    measurements: &'a BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackResponse {
    #[serde(default)]
    items_received: u64,
    #[serde(default)]
    items_accepted: u64,
}

pub struct AppInsightsSink {
    client: Client,
    connection_string: ConnectionString,
}

impl AppInsightsSink {
    pub fn new(connection_string: ConnectionString, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Configuration(e.to_string()))?;
        Ok(Self { client, connection_string })
    }

    fn envelope<'a>(&'a self, record: &'a MetricRecord) -> Result<Envelope<'a>, SinkError> {
        let key = &self.connection_string.instrumentation_key;
        Ok(Envelope {
            name: format!("Microsoft.ApplicationInsights.{}.Event", key.replace('-', "")),
            time: record
                .timestamp
                .format(&Rfc3339)
                .map_err(|e| SinkError::Rejected(format!("Invalid timestamp: {e}")))?,
            i_key: key,
            tags: BTreeMap::from([("ai.cloud.role", "gha-telemetry")]),
            data: Data {
                base_type: "EventData",
                base_data: EventData {
                    ver: 2,
                    name: record.name.as_str(),
                    properties: &record.properties,
                    measurements: &record.measurements,
                },
            },
        })
    }
}

#[async_trait]
impl TelemetrySink for AppInsightsSink {
    async fn submit(&self, record: &MetricRecord) -> Result<(), SinkError> {
        let envelope = self.envelope(record)?;
        let response = self
            .client
            .post(self.connection_string.track_url())
            .json(&[envelope])
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(SinkError::Unavailable(format!("ingestion returned {status}")));
        }
        if !status.is_success() {
            return Err(SinkError::Rejected(format!("ingestion returned {status}")));
        }
        let body: TrackResponse =
            response.json().await.map_err(|e| SinkError::Unavailable(e.to_string()))?;
        if body.items_accepted == 0 {
            return Err(SinkError::Rejected(format!(
                "ingestion accepted 0 of {} items",
                body.items_received
            )));
        }
        tracing::debug!("Submitted {} record to Application Insights", record.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use gha_telemetry_core::models::MetricName;
    use time::macros::datetime;

    use super::*;

    const KEY: &str = "11111111-2222-3333-4444-555555555555";

    #[test]
    fn test_parse_connection_string() {
        let parsed = ConnectionString::parse(&format!(
            "InstrumentationKey={KEY};IngestionEndpoint=https://westeurope-5.in.applicationinsights.azure.com/;LiveEndpoint=https://westeurope.livediagnostics.monitor.azure.com/"
        ))
        .unwrap();
        assert_eq!(parsed.instrumentation_key, KEY);
        assert_eq!(
            parsed.track_url(),
            "https://westeurope-5.in.applicationinsights.azure.com/v2/track"
        );

        let parsed = ConnectionString::parse(&format!("instrumentationkey={KEY}")).unwrap();
        assert_eq!(parsed.ingestion_endpoint, DEFAULT_INGESTION_ENDPOINT);

        assert!(ConnectionString::parse("").is_err());
        assert!(ConnectionString::parse("InstrumentationKey=").is_err());
        assert!(ConnectionString::parse("garbage").is_err());
    }

    fn record() -> MetricRecord {
        let mut record = MetricRecord::new(MetricName::WorkflowJob, datetime!(2024-01-01 00:08 UTC));
        record.set_property("job_id", 789012);
        record.set_property("conclusion", "success");
        record.set_measurement("duration_seconds", 360.0);
        record
    }

    type Captured = Arc<Mutex<Vec<serde_json::Value>>>;

    /// Serve a fake ingestion endpoint answering every request with `status` and `body`.
    async fn ingestion(status: StatusCode, body: serde_json::Value) -> (String, Captured) {
        let captured = Captured::default();
        let app = Router::new()
            .route(
                "/v2/track",
                post(
                    move |State(captured): State<Captured>, Json(request): Json<serde_json::Value>| {
                        let body = body.clone();
                        async move {
                            captured.lock().unwrap().push(request);
                            (status, Json(body))
                        }
                    },
                ),
            )
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("InstrumentationKey={KEY};IngestionEndpoint=http://{addr}/"), captured)
    }

    fn sink(connection_string: &str) -> AppInsightsSink {
        AppInsightsSink::new(
            ConnectionString::parse(connection_string).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_posts_event_envelope() {
        let (connection_string, captured) = ingestion(
            StatusCode::OK,
            serde_json::json!({ "itemsReceived": 1, "itemsAccepted": 1, "errors": [] }),
        )
        .await;
        sink(&connection_string).submit(&record()).await.unwrap();

        let requests = captured.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let envelope = &requests[0][0];
        assert_eq!(
            envelope["name"],
            "Microsoft.ApplicationInsights.11111111222233334444555555555555.Event"
        );
        assert_eq!(envelope["iKey"], KEY);
        assert_eq!(envelope["time"], "2024-01-01T00:08:00Z");
        assert_eq!(envelope["data"]["baseType"], "EventData");
        let data = &envelope["data"]["baseData"];
        assert_eq!(data["name"], "WorkflowJob");
        assert_eq!(data["properties"]["job_id"], "789012");
        assert_eq!(data["measurements"]["duration_seconds"], 360.0);
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let (connection_string, _) = ingestion(
            StatusCode::OK,
            serde_json::json!({ "itemsReceived": 1, "itemsAccepted": 0, "errors": [] }),
        )
        .await;
        assert!(matches!(
            sink(&connection_string).submit(&record()).await,
            Err(SinkError::Rejected(_))
        ));

        let (connection_string, _) =
            ingestion(StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({})).await;
        assert!(matches!(
            sink(&connection_string).submit(&record()).await,
            Err(SinkError::Unavailable(_))
        ));

        let (connection_string, _) = ingestion(StatusCode::BAD_REQUEST, serde_json::json!({})).await;
        assert!(matches!(
            sink(&connection_string).submit(&record()).await,
            Err(SinkError::Rejected(_))
        ));
    }
}
