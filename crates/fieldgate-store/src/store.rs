//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use fieldgate_types::{AggregatedRecord, Device, DeviceKind};

use crate::error::{Error, Result};
use crate::models::{
    DeviceStatus, EventLevel, KindStats, PendingRecord, RetentionStats, StoredDevice, SystemLog,
    UploadLog, UploadLogEntry, UploadStatus,
};
use crate::queries::RecordQuery;
use crate::schema;

/// Longest error detail kept in an upload log row.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

const DEVICE_COLUMNS: &str = "id, address, kind, name, model, location, description, enabled, \
                              online, last_seen, error_count";

/// SQLite-based store for gateway devices, records and audit logs.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// === Device registry ===
impl Store {
    /// Register a device, or update an existing registration with the same id.
    ///
    /// The device is validated first, and a protocol address already held by
    /// another device is rejected.
    pub fn register_device(&self, device: &Device) -> Result<()> {
        device.validate()?;

        let tx = self.conn.unchecked_transaction()?;

        if let Some(address) = device.address {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT id FROM devices WHERE address = ?1 AND id != ?2",
                    params![address, device.id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(owner) = owner {
                return Err(Error::InvalidDevice(format!(
                    "protocol address {} is already assigned to '{}'",
                    address, owner
                )));
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        tx.execute(
            "INSERT INTO devices (id, address, kind, name, model, location, description,
                                  enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                kind = excluded.kind,
                name = excluded.name,
                model = excluded.model,
                location = excluded.location,
                description = excluded.description,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                device.id,
                device.address,
                device.kind.as_str(),
                device.name,
                device.model,
                device.location,
                device.description,
                device.enabled,
                now,
            ],
        )?;
        tx.commit()?;

        info!("Registered {} device {}", device.kind, device.id);
        Ok(())
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?");
        let device = self
            .conn
            .query_row(&sql, [device_id], device_from_row)
            .optional()?;
        Ok(device)
    }

    /// Get a device by its protocol address.
    pub fn get_device_by_address(&self, address: u8) -> Result<Option<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE address = ?");
        let device = self
            .conn
            .query_row(&sql, [address], device_from_row)
            .optional()?;
        Ok(device)
    }

    /// List all devices.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY kind, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// List enabled devices, optionally restricted to one kind.
    pub fn list_enabled_devices(&self, kind: Option<DeviceKind>) -> Result<Vec<StoredDevice>> {
        let devices = match kind {
            Some(kind) => {
                let sql = format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices
                     WHERE enabled = 1 AND kind = ? ORDER BY address, id"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                stmt.query_map([kind.as_str()], device_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices WHERE enabled = 1 ORDER BY kind, id"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                stmt.query_map([], device_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(devices)
    }

    /// Apply a partial status update to a device.
    pub fn update_device_status(&self, device_id: &str, status: &DeviceStatus) -> Result<()> {
        let mut updates = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(online) = status.online {
            updates.push("online = ?");
            values.push(Box::new(online));
        }
        if let Some(last_seen) = status.last_seen {
            updates.push("last_seen = ?");
            values.push(Box::new(last_seen.unix_timestamp()));
        }
        if let Some(error_count) = status.error_count {
            updates.push("error_count = ?");
            values.push(Box::new(error_count));
        }

        if updates.is_empty() {
            return Ok(());
        }

        values.push(Box::new(device_id.to_string()));
        let sql = format!("UPDATE devices SET {} WHERE id = ?", updates.join(", "));
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let changed = self.conn.execute(&sql, refs.as_slice())?;
        if changed == 0 {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }
        Ok(())
    }

    fn ensure_device(&self, device_id: &str) -> Result<()> {
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM devices WHERE id = ?",
            [device_id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(Error::DeviceNotFound(device_id.to_string()))
        }
    }
}

// === Records ===
impl Store {
    /// Persist one aggregation window for a device.
    ///
    /// The window end time becomes the record timestamp; the remaining fields
    /// form the payload.
    pub fn insert_sample(&self, device_id: &str, record: &AggregatedRecord) -> Result<i64> {
        let mut payload = serde_json::to_value(record)?;
        if let Some(fields) = payload.as_object_mut() {
            fields.remove("timestamp");
        }
        self.insert_payload(device_id, &payload, record.timestamp)
    }

    /// Persist an arbitrary JSON payload for a registered device.
    pub fn insert_payload(
        &self,
        device_id: &str,
        payload: &serde_json::Value,
        timestamp: OffsetDateTime,
    ) -> Result<i64> {
        self.ensure_device(device_id)?;

        let body = serde_json::to_string(payload)?;
        self.conn.execute(
            "INSERT INTO records (device_id, payload, timestamp) VALUES (?1, ?2, ?3)",
            params![device_id, body, timestamp.unix_timestamp()],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!("Stored record {} for {}", id, device_id);
        Ok(id)
    }

    /// Query records with filters.
    pub fn query_records(&self, query: &RecordQuery) -> Result<Vec<PendingRecord>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_ref.as_slice(), |row| {
                let payload: String = row.get(3)?;
                Ok(PendingRecord {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    kind: kind_from_sql(2, &row.get::<_, String>(2)?)?,
                    payload: serde_json::from_str(&payload).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    timestamp: timestamp_from_sql(4, row.get(4)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Oldest undelivered records of one kind, at most `limit` of them.
    pub fn list_pending(&self, kind: DeviceKind, limit: u32) -> Result<Vec<PendingRecord>> {
        let query = RecordQuery::new()
            .kind(kind)
            .pending()
            .oldest_first()
            .limit(limit);
        self.query_records(&query)
    }

    /// Count undelivered records, optionally for one kind.
    pub fn count_pending(&self, kind: Option<DeviceKind>) -> Result<u64> {
        let count: i64 = match kind {
            Some(kind) => self.conn.query_row(
                "SELECT COUNT(*) FROM records r JOIN devices d ON r.device_id = d.id
                 WHERE r.uploaded = 0 AND d.kind = ?",
                [kind.as_str()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM records WHERE uploaded = 0",
                [],
                |row| row.get(0),
            )?,
        };

        Ok(count as u64)
    }

    /// Mark records delivered.
    ///
    /// Runs in one transaction. Records already marked are left untouched, so
    /// the return value counts only newly marked rows.
    pub fn mark_uploaded(&self, ids: &[i64], uploaded_at: OffsetDateTime) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let at = uploaded_at.unix_timestamp();
        let mut marked = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE records SET uploaded = 1, uploaded_at = ?1
                 WHERE id = ?2 AND uploaded = 0",
            )?;
            for id in ids {
                marked += stmt.execute(params![at, id])?;
            }
        }
        tx.commit()?;

        debug!("Marked {} of {} records uploaded", marked, ids.len());
        Ok(marked)
    }

    /// Delete delivered records of one kind older than `days_old` days.
    ///
    /// The count, the timestamp range and the delete share one transaction.
    /// With `dry_run` nothing is deleted but the same statistics are returned.
    /// Undelivered records are never touched.
    pub fn delete_uploaded_older_than(
        &self,
        kind: DeviceKind,
        days_old: u32,
        dry_run: bool,
    ) -> Result<RetentionStats> {
        let cutoff = (OffsetDateTime::now_utc() - Duration::days(i64::from(days_old)))
            .unix_timestamp();

        let tx = self.conn.unchecked_transaction()?;

        let (count, oldest, newest): (i64, Option<i64>, Option<i64>) = tx.query_row(
            "SELECT COUNT(*), MIN(r.timestamp), MAX(r.timestamp)
             FROM records r JOIN devices d ON r.device_id = d.id
             WHERE d.kind = ?1 AND r.uploaded = 1 AND r.timestamp < ?2",
            params![kind.as_str(), cutoff],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if count > 0 && !dry_run {
            let deleted = tx.execute(
                "DELETE FROM records
                 WHERE uploaded = 1 AND timestamp < ?2
                   AND device_id IN (SELECT id FROM devices WHERE kind = ?1)",
                params![kind.as_str(), cutoff],
            )?;
            info!("Deleted {} uploaded {} records older than {} days", deleted, kind, days_old);
        }
        tx.commit()?;

        Ok(RetentionStats {
            kind,
            records: count as u64,
            days_old,
            oldest: oldest.map(|ts| timestamp_from_sql(1, ts)).transpose()?,
            newest: newest.map(|ts| timestamp_from_sql(2, ts)).transpose()?,
            dry_run,
        })
    }

    /// Delivered and pending volume for every kind.
    pub fn cleanup_stats(&self) -> Result<Vec<KindStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(SUM(r.uploaded = 1), 0),
                    COALESCE(SUM(r.uploaded = 0), 0),
                    MIN(CASE WHEN r.uploaded = 1 THEN r.timestamp END)
             FROM records r JOIN devices d ON r.device_id = d.id
             WHERE d.kind = ?",
        )?;

        let mut stats = Vec::with_capacity(DeviceKind::ALL.len());
        for kind in DeviceKind::ALL {
            let (uploaded, pending, oldest): (i64, i64, Option<i64>) =
                stmt.query_row([kind.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
            stats.push(KindStats {
                kind,
                uploaded: uploaded as u64,
                pending: pending as u64,
                oldest_uploaded: oldest.map(|ts| timestamp_from_sql(2, ts)).transpose()?,
            });
        }
        Ok(stats)
    }
}

// === Audit logs ===
impl Store {
    /// Append a system log event.
    pub fn log_event(
        &self,
        level: EventLevel,
        module: &str,
        message: &str,
        device_id: Option<&str>,
        extra: Option<&serde_json::Value>,
    ) -> Result<()> {
        let extra = extra.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO system_logs (level, module, message, device_id, extra, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                level.as_str(),
                module,
                message,
                device_id,
                extra,
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;
        Ok(())
    }

    /// Append an upload attempt. Error detail is cut to
    /// [`MAX_ERROR_MESSAGE_LEN`] characters.
    pub fn log_upload(&self, log: &UploadLog) -> Result<()> {
        let error_message = log
            .error_message
            .as_deref()
            .map(|msg| msg.chars().take(MAX_ERROR_MESSAGE_LEN).collect::<String>());

        self.conn.execute(
            "INSERT INTO upload_logs (batch_id, data_type, record_count, status, http_status,
                                      error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.batch_id,
                log.data_type,
                log.record_count,
                log.status.as_str(),
                log.http_status,
                error_message,
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;
        Ok(())
    }

    /// Append a per-device failure.
    pub fn log_device_error(
        &self,
        device_id: &str,
        error_type: &str,
        message: &str,
        error_code: Option<i64>,
        extra: Option<&serde_json::Value>,
    ) -> Result<()> {
        let extra = extra.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO device_error_logs (device_id, error_type, error_message, error_code,
                                            extra, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                device_id,
                error_type,
                message,
                error_code,
                extra,
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;
        Ok(())
    }

    /// Most recent upload attempts, newest first.
    pub fn recent_upload_logs(&self, limit: u32) -> Result<Vec<UploadLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, data_type, record_count, status, http_status, error_message,
                    created_at
             FROM upload_logs ORDER BY id DESC LIMIT ?",
        )?;
        let logs = stmt
            .query_map([limit], |row| {
                Ok(UploadLogEntry {
                    log: UploadLog {
                        batch_id: row.get(0)?,
                        data_type: row.get(1)?,
                        record_count: row.get(2)?,
                        status: UploadStatus::from_sql(&row.get::<_, String>(3)?),
                        http_status: row.get(4)?,
                        error_message: row.get(5)?,
                    },
                    created_at: timestamp_from_sql(6, row.get(6)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// Most recent system events, newest first.
    pub fn recent_system_logs(&self, limit: u32) -> Result<Vec<SystemLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT level, module, message, device_id, extra, created_at
             FROM system_logs ORDER BY id DESC LIMIT ?",
        )?;
        let logs = stmt
            .query_map([limit], |row| {
                let extra: Option<String> = row.get(4)?;
                Ok(SystemLog {
                    level: row.get(0)?,
                    module: row.get(1)?,
                    message: row.get(2)?,
                    device_id: row.get(3)?,
                    extra: extra
                        .map(|s| serde_json::from_str(&s))
                        .transpose()
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                4,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?,
                    created_at: timestamp_from_sql(5, row.get(5)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// Count logged failures for a device.
    pub fn count_device_errors(&self, device_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM device_error_logs WHERE device_id = ?",
            [device_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        device: Device {
            id: row.get(0)?,
            address: row.get(1)?,
            kind: kind_from_sql(2, &row.get::<_, String>(2)?)?,
            name: row.get(3)?,
            model: row.get(4)?,
            location: row.get(5)?,
            description: row.get(6)?,
            enabled: row.get(7)?,
        },
        online: row.get(8)?,
        last_seen: row
            .get::<_, Option<i64>>(9)?
            .map(|ts| timestamp_from_sql(9, ts))
            .transpose()?,
        error_count: row.get(10)?,
    })
}

fn kind_from_sql(column: usize, s: &str) -> rusqlite::Result<DeviceKind> {
    s.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn timestamp_from_sql(column: usize, ts: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Integer,
            Box::new(e),
        )
    })
}
