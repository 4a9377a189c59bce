//! HTTP receiver for weather stations that push their readings.
//!
//! # Endpoints
//!
//! - `GET /health` - liveness check
//! - `POST /data` - one JSON reading carrying a `sensor_id`
//!
//! Incoming field names are translated through the configured mapping, values
//! outside their configured range are logged but kept, and everything else
//! passes through untouched. The stored payload gains a `received_at` stamp.
//! Only registered weather stations may push; other device kinds are
//! rejected so their upload queues never carry weather payloads.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use fieldgate_store::DeviceStatus;
use fieldgate_types::DeviceKind;

use crate::config::ReceiverConfig;
use crate::state::AppState;
use crate::supervisor::{ServiceError, ServiceResult};

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "weather_receiver";

/// Build the receiver router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/data", post(receive_data))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct DataResponse {
    status: &'static str,
    sensor_id: String,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        timestamp: iso_now(OffsetDateTime::now_utc()),
    })
}

async fn receive_data(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<DataResponse>, ReceiverError> {
    let Json(body) = payload.map_err(|e| ReceiverError::BadRequest(e.body_text()))?;
    let Value::Object(raw) = body else {
        return Err(ReceiverError::BadRequest(
            "Body must be a JSON object".to_string(),
        ));
    };

    let sensor_id = match raw.get("sensor_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => return Err(ReceiverError::BadRequest("Missing sensor_id".to_string())),
    };

    let received_at = OffsetDateTime::now_utc();
    let parsed = map_fields(&state.config.receiver, raw, received_at)?;

    {
        let store = state.store.lock().await;
        match store.get_device(&sensor_id)? {
            None => {
                return Err(ReceiverError::NotFound(format!(
                    "Unknown sensor: {}",
                    sensor_id
                )));
            }
            Some(stored) if stored.device.kind != DeviceKind::WeatherStation => {
                return Err(ReceiverError::BadRequest(format!(
                    "Device {} is a {} device, not a weather station",
                    sensor_id, stored.device.kind
                )));
            }
            Some(_) => {}
        }

        store.insert_payload(&sensor_id, &Value::Object(parsed), received_at)?;
        let status = DeviceStatus {
            online: Some(true),
            last_seen: Some(received_at),
            error_count: Some(0),
        };
        if let Err(e) = store.update_device_status(&sensor_id, &status) {
            warn!(device_id = %sensor_id, "Failed to update device status: {}", e);
        }
    }

    info!(device_id = %sensor_id, "Stored weather data");
    Ok(Json(DataResponse {
        status: "success",
        sensor_id,
        timestamp: iso_now(received_at),
    }))
}

/// Translate one raw reading into the stored payload.
///
/// `field_mapping` maps internal names to the names the station sends.
fn map_fields(
    config: &ReceiverConfig,
    raw: Map<String, Value>,
    received_at: OffsetDateTime,
) -> Result<Map<String, Value>, ReceiverError> {
    for field in &config.required_fields {
        if !raw.contains_key(field) {
            return Err(ReceiverError::BadRequest(format!(
                "Missing required field: {}",
                field
            )));
        }
    }

    let mut parsed = Map::new();
    for (internal, external) in &config.field_mapping {
        let Some(value) = raw.get(external) else {
            continue;
        };
        if let (Some([min, max]), Some(number)) = (config.value_ranges.get(internal), value.as_f64())
            && !(*min..=*max).contains(&number)
        {
            warn!(
                "Value out of range for {}: {} not in [{}, {}]",
                internal, number, min, max
            );
        }
        parsed.insert(internal.clone(), value.clone());
    }

    for (key, value) in raw {
        if !config.field_mapping.values().any(|external| *external == key) {
            parsed.insert(key, value);
        }
    }

    parsed.insert(
        "received_at".to_string(),
        Value::String(iso_now(received_at)),
    );
    debug!("Mapped {} field(s)", parsed.len());
    Ok(parsed)
}

fn iso_now(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

/// Receiver error responses.
#[derive(Debug)]
pub enum ReceiverError {
    BadRequest(String),
    NotFound(String),
    Store(fieldgate_store::Error),
}

impl From<fieldgate_store::Error> for ReceiverError {
    fn from(e: fieldgate_store::Error) -> Self {
        match e {
            fieldgate_store::Error::DeviceNotFound(id) => {
                ReceiverError::NotFound(format!("Unknown sensor: {}", id))
            }
            other => ReceiverError::Store(other),
        }
    }
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ReceiverError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ReceiverError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ReceiverError::Store(e) => {
                warn!("Failed to store weather data: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

/// Supervised entry point: serve until `token` is cancelled.
///
/// An unparsable bind address is fatal; a bind failure is retried.
pub async fn run_service(state: Arc<AppState>, token: CancellationToken) -> ServiceResult {
    let addr: SocketAddr = state
        .config
        .receiver
        .bind
        .parse()
        .map_err(ServiceError::fatal)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::Error::new(e).context(format!("failed to bind {}", addr)))?;
    info!("Weather receiver listening on {}", addr);

    let app = router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| anyhow::Error::new(e).context("weather receiver failed"))?;

    info!("Weather receiver stopped");
    Ok(())
}
