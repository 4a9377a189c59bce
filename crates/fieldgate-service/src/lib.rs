//! Supervised gateway services for field telemetry.
//!
//! This crate runs the long-lived loops of the gateway:
//! - Polls field-bus meters and aggregates their readings
//! - Receives pushed weather station readings over HTTP
//! - Uploads pending records in batches to a remote endpoint
//! - Deletes delivered records once they pass the retention age
//!
//! Every loop runs under the [`Supervisor`], which restarts it after a
//! recoverable failure and stops it cooperatively on shutdown.
//!
//! # Weather receiver endpoints
//!
//! - `GET /health` - Service health check
//! - `POST /data` - Store one reading for a registered station
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/fieldgate/server.toml`:
//!
//! ```toml
//! [storage]
//! path = "/var/lib/fieldgate/data.db"
//!
//! [meters]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! addresses = [1, 2]
//! aggregation_window_secs = 300
//!
//! [upload]
//! enabled = true
//! url = "https://telemetry.example.com/ingest"
//! api_key = "your-api-key"
//! batch_size = 100
//!
//! [retention]
//! days = 7
//!
//! [receiver]
//! bind = "0.0.0.0:5001"
//! required_fields = ["temp"]
//!
//! [receiver.field_mapping]
//! temperature = "temp"
//! humidity = "hum"
//!
//! [receiver.value_ranges]
//! humidity = [0.0, 100.0]
//! ```

use std::sync::Arc;

pub mod config;
pub mod poller;
pub mod receiver;
pub mod retention;
pub mod state;
pub mod supervisor;
pub mod uploader;

pub use config::{
    Config, ConfigError, MeterConfig, ReceiverConfig, RetentionConfig, StorageConfig,
    SupervisorConfig, UploadConfig, ValidationError,
};
pub use poller::{Poller, PollerStats};
pub use state::{AppState, SharedStore};
pub use supervisor::{
    ServiceError, ServiceOptions, ServiceResult, ServiceStatus, Supervisor, SupervisorError,
};
pub use uploader::{CleanupReport, CycleReport, DeliveryError, Uploader};

/// Service names used for registration and status reporting.
pub mod services {
    pub const POLLER: &str = "meter_poller";
    pub const RECEIVER: &str = "weather_receiver";
    pub const UPLOADER: &str = "uploader";
    pub const RETENTION: &str = "retention";
}

/// Build a supervisor with every service enabled in the configuration.
pub async fn build_supervisor(state: Arc<AppState>) -> Result<Supervisor, SupervisorError> {
    let config = &state.config;
    let options = ServiceOptions::default().restart_delay(config.supervisor.restart_delay());
    let supervisor = Supervisor::new().with_startup_stagger(config.supervisor.startup_stagger());

    if config.meters.enabled {
        let state = Arc::clone(&state);
        supervisor
            .register_service(services::POLLER, options, move |token| {
                poller::run_service(Arc::clone(&state), token)
            })
            .await?;
    }

    if config.receiver.enabled {
        let state = Arc::clone(&state);
        supervisor
            .register_service(services::RECEIVER, options, move |token| {
                receiver::run_service(Arc::clone(&state), token)
            })
            .await?;
    }

    if config.upload.enabled {
        let state = Arc::clone(&state);
        supervisor
            .register_service(services::UPLOADER, options, move |token| {
                uploader::run_service(Arc::clone(&state), token)
            })
            .await?;
    }

    if config.retention.enabled {
        let state = Arc::clone(&state);
        supervisor
            .register_service(services::RETENTION, options, move |token| {
                retention::run_service(Arc::clone(&state), token)
            })
            .await?;
    }

    Ok(supervisor)
}
