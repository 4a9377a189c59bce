//! Delivery of pending records to the remote endpoint, and retention cleanup.
//!
//! Each cycle makes at most one delivery attempt per device kind. A batch is
//! marked uploaded only after the endpoint answers with HTTP 200; any other
//! outcome leaves every record in the batch pending for the next cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldgate_store::{EventLevel, PendingRecord, RetentionStats, UploadLog, UploadStatus};
use fieldgate_types::DeviceKind;

use crate::config::{RetentionConfig, UploadConfig};
use crate::state::{AppState, SharedStore};
use crate::supervisor::{ServiceError, ServiceResult};

/// Module name recorded in the system log for retention runs.
pub const CLEANUP_MODULE: &str = "db_cleanup";

/// Why a delivery attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Request could not be sent or timed out.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Endpoint answered with something other than 200.
    #[error("Endpoint returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
}

impl DeliveryError {
    /// HTTP status of the failed attempt, when the endpoint answered.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            DeliveryError::Http(e) => e.status().map(|s| s.as_u16()),
            DeliveryError::Status { code, .. } => Some(*code),
        }
    }
}

/// Body posted to the endpoint.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    source: &'a str,
    data_type: &'a str,
    timestamp: String,
    batch_id: &'a str,
    device_count: usize,
    records: &'a [PendingRecord],
}

/// Outcome of one upload cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Pending records seen at the start of the cycle.
    pub pending: u64,
    pub succeeded: Vec<DeviceKind>,
    pub failed: Vec<DeviceKind>,
    /// Present when retention ran in this cycle.
    pub cleanup: Option<CleanupReport>,
}

/// Outcome of a retention pass across every kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub kinds: Vec<RetentionStats>,
    pub total: u64,
    pub days_old: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub newest: Option<OffsetDateTime>,
    pub dry_run: bool,
}

/// Batch id in the form `{kind}_{YYYYmmdd_HHMMSS}`.
pub fn batch_id(kind: DeviceKind, at: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    let stamp = at.format(&format).unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("{}_{}", kind, stamp)
}

/// Delete delivered records older than `days_old` days for every kind.
///
/// A real run that removes anything is recorded in the system log.
pub async fn cleanup(
    store: &SharedStore,
    days_old: u32,
    dry_run: bool,
) -> fieldgate_store::Result<CleanupReport> {
    let store = store.lock().await;

    let mut kinds = Vec::with_capacity(DeviceKind::ALL.len());
    for kind in DeviceKind::ALL {
        kinds.push(store.delete_uploaded_older_than(kind, days_old, dry_run)?);
    }

    let report = CleanupReport {
        total: kinds.iter().map(|s| s.records).sum(),
        oldest: kinds.iter().filter_map(|s| s.oldest).min(),
        newest: kinds.iter().filter_map(|s| s.newest).max(),
        kinds,
        days_old,
        dry_run,
    };

    if dry_run {
        info!(
            "Dry run: {} uploaded record(s) older than {} days would be deleted",
            report.total, days_old
        );
    } else if report.total > 0 {
        info!(
            "Deleted {} uploaded record(s) older than {} days",
            report.total, days_old
        );
        let extra = json!({
            "days_old": days_old,
            "deleted": report.kinds.iter()
                .map(|s| (s.kind.as_str(), s.records))
                .collect::<std::collections::BTreeMap<_, _>>(),
        });
        store.log_event(
            EventLevel::Info,
            CLEANUP_MODULE,
            &format!(
                "Deleted {} uploaded records older than {} days",
                report.total, days_old
            ),
            None,
            Some(&extra),
        )?;
    } else {
        debug!("No uploaded records older than {} days", days_old);
    }

    Ok(report)
}

/// Delivers pending records and runs retention after successful cycles.
pub struct Uploader {
    client: Client,
    config: UploadConfig,
    retention: RetentionConfig,
    store: SharedStore,
}

impl Uploader {
    /// Create an uploader with its own HTTP client.
    pub fn new(
        store: SharedStore,
        config: UploadConfig,
        retention: RetentionConfig,
    ) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            retention,
            store,
        })
    }

    /// Try to deliver one batch of `kind`.
    ///
    /// Returns `true` when nothing was pending or the batch was acknowledged.
    /// Delivery failures are logged to the store and reported as `false`.
    pub async fn upload_pending(&self, kind: DeviceKind) -> fieldgate_store::Result<bool> {
        let records = self
            .store
            .lock()
            .await
            .list_pending(kind, self.config.batch_size)?;
        if records.is_empty() {
            debug!("No pending {} records", kind);
            return Ok(true);
        }

        let now = OffsetDateTime::now_utc();
        let batch_id = batch_id(kind, now);
        let device_count = records
            .iter()
            .map(|r| r.device_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let envelope = Envelope {
            source: &self.config.source,
            data_type: kind.as_str(),
            timestamp: now.format(&Rfc3339).unwrap_or_default(),
            batch_id: &batch_id,
            device_count,
            records: &records,
        };

        debug!(
            batch_id = %batch_id,
            records = records.len(),
            devices = device_count,
            "Uploading {} batch",
            kind
        );
        let result = self.deliver(&envelope).await;

        let store = self.store.lock().await;
        match result {
            Ok(()) => {
                let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
                let marked = store.mark_uploaded(&ids, OffsetDateTime::now_utc())?;
                store.log_upload(&UploadLog {
                    batch_id: batch_id.clone(),
                    data_type: kind.as_str().to_string(),
                    record_count: records.len() as u32,
                    status: UploadStatus::Success,
                    http_status: Some(StatusCode::OK.as_u16()),
                    error_message: None,
                })?;
                info!(
                    batch_id = %batch_id,
                    http_status = 200,
                    "Uploaded {} {} record(s)",
                    marked,
                    kind
                );
                Ok(true)
            }
            Err(e) => {
                warn!(
                    batch_id = %batch_id,
                    http_status = ?e.http_status(),
                    "Upload of {} {} record(s) failed: {}",
                    records.len(),
                    kind,
                    e
                );
                store.log_upload(&UploadLog {
                    batch_id,
                    data_type: kind.as_str().to_string(),
                    record_count: records.len() as u32,
                    status: UploadStatus::Failed,
                    http_status: e.http_status(),
                    error_message: Some(e.to_string()),
                })?;
                Ok(false)
            }
        }
    }

    /// One upload cycle over every kind, followed by retention when allowed.
    pub async fn run_cycle(&self) -> fieldgate_store::Result<CycleReport> {
        let counts = {
            let store = self.store.lock().await;
            let mut counts = Vec::with_capacity(DeviceKind::ALL.len());
            for kind in DeviceKind::ALL {
                counts.push((kind, store.count_pending(Some(kind))?));
            }
            counts
        };

        let mut report = CycleReport {
            pending: counts.iter().map(|(_, n)| n).sum(),
            ..Default::default()
        };

        if report.pending == 0 {
            debug!("Nothing pending, skipping upload");
        } else {
            for (kind, count) in counts {
                if count == 0 {
                    continue;
                }
                match self.upload_pending(kind).await {
                    Ok(true) => report.succeeded.push(kind),
                    Ok(false) => report.failed.push(kind),
                    Err(e) => {
                        warn!("Upload of {} records aborted: {}", kind, e);
                        report.failed.push(kind);
                    }
                }
            }
        }

        let may_clean = report.pending == 0 || !report.succeeded.is_empty();
        if self.retention.enabled && may_clean {
            match cleanup(&self.store, self.retention.days, false).await {
                Ok(cleaned) => report.cleanup = Some(cleaned),
                Err(e) => warn!("Retention cleanup failed: {}", e),
            }
        }

        Ok(report)
    }

    /// Run cycles every `interval_secs` until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> ServiceResult {
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(
            "Starting uploader to {} (interval: {:?}, batch size: {})",
            self.config.url, interval, self.config.batch_size
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if !report.failed.is_empty() => {
                    debug!("Upload cycle finished with failures: {:?}", report.failed);
                }
                Ok(_) => {}
                Err(e) => warn!("Upload cycle failed: {}", e),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Uploader stopped");
        Ok(())
    }

    async fn deliver(&self, envelope: &Envelope<'_>) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                code: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Supervised entry point for the upload loop.
pub async fn run_service(state: Arc<AppState>, token: CancellationToken) -> ServiceResult {
    let uploader = Uploader::new(
        Arc::clone(&state.store),
        state.config.upload.clone(),
        state.config.retention.clone(),
    )
    .map_err(ServiceError::fatal)?;

    uploader.run(token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use axum::Router;
    use axum::http::HeaderMap;
    use axum::http::header::AUTHORIZATION;
    use axum::routing::post;
    use fieldgate_store::Store;
    use fieldgate_types::Device;
    use serde_json::Value;
    use time::Duration as TimeDuration;

    type Seen = Arc<StdMutex<Vec<(Option<String>, Value)>>>;

    /// Endpoint that answers 200, or `failure` for batches of `fail_kind`.
    async fn spawn_endpoint(
        failure: StatusCode,
        fail_kind: Option<&'static str>,
    ) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let captured = Arc::clone(&seen);
        let app = Router::new().route(
            "/ingest",
            post(move |headers: HeaderMap, axum::Json(body): axum::Json<Value>| {
                let captured = Arc::clone(&captured);
                async move {
                    let auth = headers
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let fails = match fail_kind {
                        Some(kind) => body["data_type"] == kind,
                        None => true,
                    };
                    captured.lock().unwrap().push((auth, body));
                    if fails { failure } else { StatusCode::OK }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/ingest", addr), seen)
    }

    fn store() -> SharedStore {
        let store = Store::open_in_memory().unwrap();
        store
            .register_device(&Device::new("pv-01", DeviceKind::Meter, "Array").with_address(1))
            .unwrap();
        store
            .register_device(&Device::new("pv-02", DeviceKind::Meter, "Battery").with_address(2))
            .unwrap();
        store
            .register_device(&Device::new("ws-1", DeviceKind::WeatherStation, "Yard"))
            .unwrap();
        Arc::new(tokio::sync::Mutex::new(store))
    }

    async fn insert(store: &SharedStore, device_id: &str, age: TimeDuration) -> i64 {
        store
            .lock()
            .await
            .insert_payload(
                device_id,
                &json!({ "value": 1 }),
                OffsetDateTime::now_utc() - age,
            )
            .unwrap()
    }

    fn uploader(store: &SharedStore, url: String, batch_size: u32) -> Uploader {
        let config = UploadConfig {
            enabled: true,
            url,
            api_key: "secret".to_string(),
            batch_size,
            timeout_secs: 5,
            ..Default::default()
        };
        Uploader::new(Arc::clone(store), config, RetentionConfig::default()).unwrap()
    }

    #[test]
    fn test_batch_id_format() {
        let at = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        assert_eq!(batch_id(DeviceKind::Meter, at), "meter_20240305_070809");
        assert_eq!(
            batch_id(DeviceKind::WeatherStation, at),
            "weather_20240305_070809"
        );
    }

    #[test]
    fn test_delivery_error_status() {
        let err = DeliveryError::Status {
            code: 503,
            body: "busy".to_string(),
        };
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(err.to_string(), "Endpoint returned HTTP 503: busy");
    }

    #[tokio::test]
    async fn test_success_marks_whole_batch() {
        let store = store();
        for hours in [3, 2, 1] {
            insert(&store, "pv-01", TimeDuration::hours(hours)).await;
        }
        insert(&store, "pv-02", TimeDuration::minutes(30)).await;
        let (url, seen) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR, Some("none")).await;

        let uploader = uploader(&store, url, 100);
        assert!(uploader.upload_pending(DeviceKind::Meter).await.unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
        assert_eq!(body["source"], "fieldgate");
        assert_eq!(body["data_type"], "meter");
        assert_eq!(body["device_count"], 2);
        assert_eq!(body["records"].as_array().unwrap().len(), 4);
        assert!(body["batch_id"].as_str().unwrap().starts_with("meter_"));

        let store = store.lock().await;
        assert_eq!(store.count_pending(Some(DeviceKind::Meter)).unwrap(), 0);
        let logs = store.recent_upload_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log.status, UploadStatus::Success);
        assert_eq!(logs[0].log.record_count, 4);
        assert_eq!(logs[0].log.http_status, Some(200));
    }

    #[tokio::test]
    async fn test_failure_marks_nothing() {
        let store = store();
        for hours in [3, 2, 1] {
            insert(&store, "pv-01", TimeDuration::hours(hours)).await;
        }
        let (url, _seen) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR, None).await;

        let uploader = uploader(&store, url, 100);
        assert!(!uploader.upload_pending(DeviceKind::Meter).await.unwrap());

        let store = store.lock().await;
        assert_eq!(store.count_pending(Some(DeviceKind::Meter)).unwrap(), 3);
        let logs = store.recent_upload_logs(10).unwrap();
        assert_eq!(logs[0].log.status, UploadStatus::Failed);
        assert_eq!(logs[0].log.http_status, Some(500));
        assert!(logs[0].log.error_message.is_some());
    }

    #[tokio::test]
    async fn test_non_200_success_code_is_a_failure() {
        let store = store();
        insert(&store, "pv-01", TimeDuration::hours(1)).await;
        let (url, _seen) = spawn_endpoint(StatusCode::ACCEPTED, None).await;

        let uploader = uploader(&store, url, 100);
        assert!(!uploader.upload_pending(DeviceKind::Meter).await.unwrap());
        assert_eq!(
            store.lock().await.count_pending(Some(DeviceKind::Meter)).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let store = store();
        insert(&store, "pv-01", TimeDuration::hours(1)).await;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let uploader = uploader(&store, format!("http://{}/ingest", addr), 100);
        assert!(!uploader.upload_pending(DeviceKind::Meter).await.unwrap());

        let store = store.lock().await;
        assert_eq!(store.count_pending(None).unwrap(), 1);
        let logs = store.recent_upload_logs(10).unwrap();
        assert_eq!(logs[0].log.status, UploadStatus::Failed);
        assert_eq!(logs[0].log.http_status, None);
    }

    #[tokio::test]
    async fn test_batch_takes_oldest_first() {
        let store = store();
        let newest = insert(&store, "pv-01", TimeDuration::hours(1)).await;
        let oldest = insert(&store, "pv-01", TimeDuration::hours(3)).await;
        let middle = insert(&store, "pv-01", TimeDuration::hours(2)).await;
        let (url, seen) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR, Some("none")).await;

        let uploader = uploader(&store, url, 2);
        assert!(uploader.upload_pending(DeviceKind::Meter).await.unwrap());

        let ids: Vec<i64> = seen.lock().unwrap()[0].1["records"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![oldest, middle]);

        let store = store.lock().await;
        let pending = store.list_pending(DeviceKind::Meter, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, newest);
    }

    #[tokio::test]
    async fn test_cycle_kinds_are_independent() {
        let store = store();
        insert(&store, "pv-01", TimeDuration::hours(1)).await;
        insert(&store, "ws-1", TimeDuration::hours(1)).await;
        let (url, seen) = spawn_endpoint(StatusCode::BAD_GATEWAY, Some("weather")).await;

        let report = uploader(&store, url, 100).run_cycle().await.unwrap();

        assert_eq!(report.pending, 2);
        assert_eq!(report.succeeded, vec![DeviceKind::Meter]);
        assert_eq!(report.failed, vec![DeviceKind::WeatherStation]);
        assert!(report.cleanup.is_some());
        assert_eq!(seen.lock().unwrap().len(), 2);

        let store = store.lock().await;
        assert_eq!(store.count_pending(Some(DeviceKind::Meter)).unwrap(), 0);
        assert_eq!(
            store.count_pending(Some(DeviceKind::WeatherStation)).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_cycle_without_pending_skips_to_cleanup() {
        let store = store();
        let id = insert(&store, "pv-01", TimeDuration::days(10)).await;
        store
            .lock()
            .await
            .mark_uploaded(&[id], OffsetDateTime::now_utc())
            .unwrap();
        let (url, seen) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR, None).await;

        let report = uploader(&store, url, 100).run_cycle().await.unwrap();

        assert_eq!(report.pending, 0);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(report.cleanup.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_skips_cleanup() {
        let store = store();
        let old = insert(&store, "pv-01", TimeDuration::days(10)).await;
        store
            .lock()
            .await
            .mark_uploaded(&[old], OffsetDateTime::now_utc())
            .unwrap();
        insert(&store, "pv-01", TimeDuration::hours(1)).await;
        let (url, _seen) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR, None).await;

        let report = uploader(&store, url, 100).run_cycle().await.unwrap();

        assert_eq!(report.failed, vec![DeviceKind::Meter]);
        assert!(report.cleanup.is_none());
        let store = store.lock().await;
        assert_eq!(store.cleanup_stats().unwrap()[0].uploaded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cycles_until_cancelled() {
        let store = store();
        let old = insert(&store, "pv-01", TimeDuration::days(10)).await;
        store
            .lock()
            .await
            .mark_uploaded(&[old], OffsetDateTime::now_utc())
            .unwrap();
        // nothing is pending, so the endpoint is never contacted
        let uploader = uploader(&store, "http://127.0.0.1:9/ingest".to_string(), 100);
        let token = CancellationToken::new();

        let task = tokio::spawn(uploader.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        task.await.unwrap().unwrap();

        let store = store.lock().await;
        assert_eq!(store.cleanup_stats().unwrap()[0].uploaded, 0);
        assert_eq!(store.recent_system_logs(10).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_cancelled_token_does_nothing() {
        let store = store();
        let old = insert(&store, "pv-01", TimeDuration::days(10)).await;
        store
            .lock()
            .await
            .mark_uploaded(&[old], OffsetDateTime::now_utc())
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();

        uploader(&store, "http://127.0.0.1:9/ingest".to_string(), 100)
            .run(token)
            .await
            .unwrap();

        assert_eq!(store.lock().await.cleanup_stats().unwrap()[0].uploaded, 1);
    }

    #[tokio::test]
    async fn test_cleanup_dry_run_and_real_run() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        let old = insert(&store, "pv-01", TimeDuration::days(10)).await;
        let recent = insert(&store, "pv-01", TimeDuration::days(3)).await;
        let old_weather = insert(&store, "ws-1", TimeDuration::days(12)).await;
        insert(&store, "pv-02", TimeDuration::days(20)).await;
        store
            .lock()
            .await
            .mark_uploaded(&[old, recent, old_weather], now)
            .unwrap();

        let dry = cleanup(&store, 7, true).await.unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.total, 2);
        assert_eq!(store.lock().await.cleanup_stats().unwrap()[0].uploaded, 2);
        assert!(store.lock().await.recent_system_logs(10).unwrap().is_empty());

        let real = cleanup(&store, 7, false).await.unwrap();
        assert_eq!(real.total, dry.total);
        assert!(real.oldest.unwrap() < real.newest.unwrap());

        let store = store.lock().await;
        let stats = store.cleanup_stats().unwrap();
        assert_eq!(stats[0].uploaded, 1);
        // the 20-day-old record was never delivered
        assert_eq!(stats[0].pending, 1);
        assert_eq!(stats[1].uploaded, 0);

        let logs = store.recent_system_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].module, CLEANUP_MODULE);
        assert_eq!(logs[0].level, "INFO");
    }

    #[tokio::test]
    async fn test_cleanup_with_nothing_to_delete_logs_nothing() {
        let store = store();
        insert(&store, "pv-01", TimeDuration::days(30)).await;

        let report = cleanup(&store, 7, false).await.unwrap();

        assert_eq!(report.total, 0);
        assert!(report.oldest.is_none());
        assert!(store.lock().await.recent_system_logs(10).unwrap().is_empty());
    }
}
