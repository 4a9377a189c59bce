//! Local persistence for the fieldgate telemetry gateway.
//!
//! This crate provides SQLite-based storage for the device registry, the
//! records awaiting delivery and the gateway's audit logs.
//!
//! # Features
//!
//! - Device registry with address uniqueness and validation
//! - Pending record queue ordered by timestamp
//! - Transactional upload marking and retention deletion
//! - Upload, system and device error logs
//!
//! # Example
//!
//! ```no_run
//! use fieldgate_store::Store;
//! use fieldgate_types::DeviceKind;
//!
//! let store = Store::open(fieldgate_store::default_db_path())?;
//!
//! let pending = store.list_pending(DeviceKind::Meter, 100)?;
//! println!("{} meter records waiting", pending.len());
//! # Ok::<(), fieldgate_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{
    DeviceStatus, EventLevel, KindStats, PendingRecord, RetentionStats, StoredDevice, SystemLog,
    UploadLog, UploadLogEntry, UploadStatus,
};
pub use queries::RecordQuery;
pub use store::{MAX_ERROR_MESSAGE_LEN, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/fieldgate/data.db`
/// - macOS: `~/Library/Application Support/fieldgate/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\fieldgate\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("fieldgate")
        .join("data.db")
}
