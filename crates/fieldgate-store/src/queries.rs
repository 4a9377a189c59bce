//! Query builder for stored records.
//!
//! [`RecordQuery`] follows the builder pattern for filtering records by
//! device, kind, delivery state and time range.
//!
//! # Example
//!
//! ```
//! use fieldgate_store::{RecordQuery, Store};
//! use fieldgate_types::DeviceKind;
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let yesterday = OffsetDateTime::now_utc() - Duration::hours(24);
//!
//! // Oldest undelivered meter records first, 100 at a time
//! let query = RecordQuery::new()
//!     .kind(DeviceKind::Meter)
//!     .pending()
//!     .since(yesterday)
//!     .oldest_first()
//!     .limit(100);
//!
//! let records = store.query_records(&query)?;
//! # Ok::<(), fieldgate_store::Error>(())
//! ```

use time::OffsetDateTime;

use fieldgate_types::DeviceKind;

/// Fluent query builder for records.
///
/// By default, queries return every record ordered by timestamp descending
/// (newest first).
#[derive(Debug, Default, Clone)]
pub struct RecordQuery {
    /// Filter by device ID.
    pub device_id: Option<String>,
    /// Filter by device kind.
    pub kind: Option<DeviceKind>,
    /// Filter by delivery state.
    pub uploaded: Option<bool>,
    /// Filter records at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Filter records strictly before this time.
    pub before: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Order by timestamp descending (newest first).
    pub newest_first: bool,
}

impl RecordQuery {
    /// Create a new query with default settings.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    /// Filter by device ID.
    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    /// Filter by device kind.
    pub fn kind(mut self, kind: DeviceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Only records not yet delivered.
    pub fn pending(mut self) -> Self {
        self.uploaded = Some(false);
        self
    }

    /// Only records already delivered.
    pub fn uploaded(mut self) -> Self {
        self.uploaded = Some(true);
        self
    }

    /// Filter to records at or after this time.
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Filter to records strictly before this time.
    pub fn before(mut self, time: OffsetDateTime) -> Self {
        self.before = Some(time);
        self
    }

    /// Limit the maximum number of results returned.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Order results by oldest first; ties break on sequence id.
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    ///
    /// Columns are qualified for the `records r JOIN devices d` form.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref device_id) = self.device_id {
            conditions.push("r.device_id = ?");
            params.push(Box::new(device_id.clone()));
        }

        if let Some(kind) = self.kind {
            conditions.push("d.kind = ?");
            params.push(Box::new(kind.as_str()));
        }

        if let Some(uploaded) = self.uploaded {
            conditions.push("r.uploaded = ?");
            params.push(Box::new(uploaded));
        }

        if let Some(since) = self.since {
            conditions.push("r.timestamp >= ?");
            params.push(Box::new(since.unix_timestamp()));
        }

        if let Some(before) = self.before {
            conditions.push("r.timestamp < ?");
            params.push(Box::new(before.unix_timestamp()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT r.id, r.device_id, d.kind, r.payload, r.timestamp \
             FROM records r JOIN devices d ON r.device_id = d.id {} \
             ORDER BY r.timestamp {}, r.id {}",
            where_clause, order, order
        );

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query() {
        let query = RecordQuery::new();
        let (where_clause, params) = query.build_where();

        assert!(where_clause.is_empty());
        assert!(params.is_empty());
        assert!(query.build_sql().contains("ORDER BY r.timestamp DESC, r.id DESC"));
    }

    #[test]
    fn test_pending_by_kind() {
        let query = RecordQuery::new()
            .kind(DeviceKind::WeatherStation)
            .pending()
            .oldest_first()
            .limit(100);
        let (where_clause, params) = query.build_where();

        assert_eq!(where_clause, "WHERE d.kind = ? AND r.uploaded = ?");
        assert_eq!(params.len(), 2);

        let sql = query.build_sql();
        assert!(sql.contains("ORDER BY r.timestamp ASC, r.id ASC"));
        assert!(sql.ends_with("LIMIT 100"));
    }

    #[test]
    fn test_time_range() {
        let now = OffsetDateTime::now_utc();
        let query = RecordQuery::new()
            .device("pv-01")
            .since(now - time::Duration::days(1))
            .before(now);
        let (where_clause, params) = query.build_where();

        assert_eq!(
            where_clause,
            "WHERE r.device_id = ? AND r.timestamp >= ? AND r.timestamp < ?"
        );
        assert_eq!(params.len(), 3);
    }
}
