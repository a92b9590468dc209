//! Read-side access to the heartbeat table.
//!
//! This is the contract the dashboard relies on: rows ordered by
//! `timestamp`, sensor values coerced from text with anything non-numeric
//! treated as absent, one series per device (or per site), relative time
//! windows, and incremental polling by row id.
//!
//! The query side opens its own read-only connection and never writes.

use crate::storage::schema::{TABLE_NAME, quote_ident};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use halo_wire::{SensorField, SensorFields};
use rusqlite::{Connection, OpenFlags, Row, params};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown time window '{0}' (expected 1H, 4H, 12H, 1D or 7D)")]
    InvalidWindow(String),
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One row as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHeartbeat {
    pub id: i64,
    /// The `timestamp` column exactly as stored.
    pub timestamp: String,
    /// `timestamp` parsed; `None` when it is not a recognisable instant.
    pub received_at: Option<DateTime<Utc>>,
    pub mac: String,
    pub name: String,
    pub site: Option<String>,
    pub fields: SensorFields,
}

impl StoredHeartbeat {
    /// Numeric value of `field`, if it holds one.
    pub fn numeric(&self, field: SensorField) -> Option<f64> {
        coerce_numeric(self.fields.get(field))
    }
}

/// Parse a stored timestamp.
///
/// Accepts RFC 3339 and offset-less ISO 8601 (read as UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Text to number; missing, non-numeric and non-finite values become `None`.
pub fn coerce_numeric(value: Option<&str>) -> Option<f64> {
    value?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// Time windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    LastHour,
    Last4Hours,
    Last12Hours,
    LastDay,
    Last7Days,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 5] = [
        TimeWindow::LastHour,
        TimeWindow::Last4Hours,
        TimeWindow::Last12Hours,
        TimeWindow::LastDay,
        TimeWindow::Last7Days,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TimeWindow::LastHour => "1H",
            TimeWindow::Last4Hours => "4H",
            TimeWindow::Last12Hours => "12H",
            TimeWindow::LastDay => "1D",
            TimeWindow::Last7Days => "7D",
        }
    }

    pub fn span(self) -> TimeDelta {
        match self {
            TimeWindow::LastHour => TimeDelta::hours(1),
            TimeWindow::Last4Hours => TimeDelta::hours(4),
            TimeWindow::Last12Hours => TimeDelta::hours(12),
            TimeWindow::LastDay => TimeDelta::days(1),
            TimeWindow::Last7Days => TimeDelta::days(7),
        }
    }

    pub fn cutoff(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.span()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TimeWindow {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeWindow::ALL
            .iter()
            .copied()
            .find(|w| w.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| QueryError::InvalidWindow(s.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Series
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Name,
    Site,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub at: DateTime<Utc>,
    pub value: Option<f64>,
}

/// One time series of `field` per device name or site, ordered by time.
///
/// Rows with an unparseable timestamp are skipped. When grouping by site,
/// rows without a site are skipped too.
pub fn series(
    rows: &[StoredHeartbeat],
    field: SensorField,
    group: GroupBy,
) -> BTreeMap<String, Vec<SeriesPoint>> {
    let mut out: BTreeMap<String, Vec<SeriesPoint>> = BTreeMap::new();
    for row in rows {
        let Some(at) = row.received_at else {
            continue;
        };
        let key = match group {
            GroupBy::Name => row.name.as_str(),
            GroupBy::Site => match row.site.as_deref() {
                Some(site) => site,
                None => continue,
            },
        };
        out.entry(key.to_owned()).or_default().push(SeriesPoint {
            at,
            value: row.numeric(field),
        });
    }
    for points in out.values_mut() {
        points.sort_by_key(|p| p.at);
    }
    out
}

// ---------------------------------------------------------------------------
// HeartbeatQuery
// ---------------------------------------------------------------------------

pub struct HeartbeatQuery {
    conn: Connection,
    select_sql: String,
}

impl HeartbeatQuery {
    /// Open the database read-only.
    pub fn open(path: &Path) -> Result<Self, QueryError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection whose schema is already in place.
    pub fn from_connection(conn: Connection) -> Self {
        let mut columns = vec![
            "id".to_owned(),
            "timestamp".to_owned(),
            "mac".to_owned(),
            "name".to_owned(),
            "site".to_owned(),
        ];
        columns.extend(SensorField::ALL.iter().map(|f| quote_ident(f.key())));
        HeartbeatQuery {
            conn,
            select_sql: format!("SELECT {} FROM {}", columns.join(", "), TABLE_NAME),
        }
    }

    /// Every row, ordered by `timestamp` then `id`.
    pub fn all_ordered(&self) -> Result<Vec<StoredHeartbeat>, QueryError> {
        let sql = format!("{} ORDER BY timestamp ASC, id ASC", self.select_sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Rows received at or after `cutoff`.
    ///
    /// Rows whose timestamp cannot be parsed are excluded.
    pub fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredHeartbeat>, QueryError> {
        let mut rows = self.all_ordered()?;
        rows.retain(|r| r.received_at.is_some_and(|at| at >= cutoff));
        Ok(rows)
    }

    pub fn in_window(
        &self,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredHeartbeat>, QueryError> {
        self.since(window.cutoff(now))
    }

    /// Rows with an id greater than `last_seen_id`, in id order.
    ///
    /// Pollers keep the largest id they have seen and pass it back in.
    pub fn after_id(&self, last_seen_id: i64) -> Result<Vec<StoredHeartbeat>, QueryError> {
        let sql = format!("{} WHERE id > ?1 ORDER BY id ASC", self.select_sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![last_seen_id], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Distinct non-null site labels, sorted.
    pub fn sites(&self) -> Result<Vec<String>, QueryError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT site FROM {} WHERE site IS NOT NULL ORDER BY site",
            TABLE_NAME
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn map_row(row: &Row<'_>) -> Result<StoredHeartbeat, rusqlite::Error> {
    // Tables created by earlier variants allow NULL identity columns.
    let text = |idx: usize| -> Result<String, rusqlite::Error> {
        Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
    };
    let timestamp = text(1)?;
    let mut fields = SensorFields::new();
    for field in SensorField::ALL {
        if let Some(v) = row.get::<_, Option<String>>(5 + field.index())? {
            fields.set(field, v);
        }
    }
    Ok(StoredHeartbeat {
        id: row.get(0)?,
        received_at: parse_timestamp(&timestamp),
        timestamp,
        mac: text(2)?,
        name: text(3)?,
        site: row.get(4)?,
        fields,
    })
}
