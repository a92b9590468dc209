//! Heartbeat table schema.
//!
//! Columns: `id`, `timestamp`, `mac`, `name`, `site`, then one nullable TEXT
//! column per [`SensorField`] in [`SensorField::ALL`] order. Field column
//! names contain `.` and `-`, so every identifier is double-quoted.

use halo_wire::SensorField;
use rusqlite::Connection;
use std::collections::HashSet;

pub const TABLE_NAME: &str = "heartbeats";

/// Nullable columns that may be missing from tables created by earlier
/// schema variants and are therefore added in place.
fn additive_columns() -> impl Iterator<Item = &'static str> {
    std::iter::once("site").chain(SensorField::ALL.iter().map(|f| f.key()))
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_table_sql() -> String {
    let field_columns: Vec<String> = SensorField::ALL
        .iter()
        .map(|f| format!("{} TEXT", quote_ident(f.key())))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
             id        INTEGER PRIMARY KEY AUTOINCREMENT,
             timestamp TEXT NOT NULL,
             mac       TEXT NOT NULL,
             name      TEXT NOT NULL,
             site      TEXT,
             {fields}
         )",
        table = TABLE_NAME,
        fields = field_columns.join(",\n             "),
    )
}

pub fn insert_sql() -> String {
    let mut columns = vec![
        "timestamp".to_owned(),
        "mac".to_owned(),
        "name".to_owned(),
        "site".to_owned(),
    ];
    columns.extend(SensorField::ALL.iter().map(|f| quote_ident(f.key())));
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        TABLE_NAME,
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Create the table and index if absent and add any missing nullable column.
///
/// Idempotent and never destructive.
pub fn apply_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(&create_table_sql())?;

    let existing = existing_columns(conn)?;
    for column in additive_columns() {
        if !existing.contains(column) {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT",
                TABLE_NAME,
                quote_ident(column)
            ))?;
        }
    }

    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {table}_timestamp_idx ON {table} (timestamp)",
        table = TABLE_NAME
    ))?;
    Ok(())
}

pub(crate) fn existing_columns(conn: &Connection) -> Result<HashSet<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", TABLE_NAME))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for r in rows {
        columns.insert(r?);
    }
    Ok(columns)
}
