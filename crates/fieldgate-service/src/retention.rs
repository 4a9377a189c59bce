//! Periodic retention loop.
//!
//! Runs independently of the upload pipeline so delivered records are
//! reclaimed even while the endpoint is unreachable for long stretches.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::state::{AppState, SharedStore};
use crate::supervisor::ServiceResult;
use crate::uploader::cleanup;

/// Run a real cleanup every `interval_secs` until `token` is cancelled.
pub async fn run(
    store: SharedStore,
    config: RetentionConfig,
    token: CancellationToken,
) -> ServiceResult {
    let interval = Duration::from_secs(config.interval_secs);
    info!(
        "Starting retention loop (keep {} days, interval: {:?})",
        config.days, interval
    );

    let mut runs: u64 = 0;
    loop {
        if token.is_cancelled() {
            break;
        }

        match cleanup(&store, config.days, false).await {
            Ok(report) => {
                runs += 1;
                if report.total > 0 {
                    info!("Retention pass {} removed {} record(s)", runs, report.total);
                }
            }
            Err(e) => warn!("Retention pass failed: {}", e),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Retention loop stopped after {} pass(es)", runs);
    Ok(())
}

/// Supervised entry point for the retention loop.
pub async fn run_service(state: Arc<AppState>, token: CancellationToken) -> ServiceResult {
    run(
        Arc::clone(&state.store),
        state.config.retention.clone(),
        token,
    )
    .await
}
