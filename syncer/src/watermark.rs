use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sync_core::Result;
use tracing::warn;

/// Per-table high-watermark persistence.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Latest successful sync time for `table`, or `None` for a full load.
    async fn get(&self, table: &str) -> Result<Option<DateTime<Utc>>>;

    /// Records `at` as the watermark for `table`. Never moves an existing
    /// watermark backwards.
    async fn advance(&self, table: &str, at: DateTime<Utc>) -> Result<()>;
}

const ALTERNATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"];
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parses a stored watermark. Accepts RFC 3339 / ISO-8601 (`2025-06-30T21:44:04.349447Z`)
/// and the Postgres text form (`2025-06-30 21:44:04.349447+00`, with or without
/// offset). Offset-less values are taken as UTC.
pub fn parse_watermark(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ALTERNATE_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Like [`parse_watermark`], but logs and degrades to a full reload on
/// values it cannot read.
pub fn parse_or_reload(table: &str, raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_watermark(&raw);
    if parsed.is_none() {
        warn!(
            table,
            value = %raw,
            "Failed to parse stored watermark, falling back to a full load"
        );
    }
    parsed
}
