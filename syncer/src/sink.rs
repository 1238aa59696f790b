use crate::model::{LandedRow, RawRecord, UpsertSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use sync_core::Result;

/// Longest identity the warehouse key column accepts.
pub const MAX_IDENTITY_LEN: usize = 255;

const PLACEHOLDER_IDENTITIES: &[&str] = &["null", "none", "nan", "undefined"];

/// Lands batches of raw records into a table keyed by identity.
#[async_trait]
pub trait UpsertSink: Send + Sync {
    /// Inserts or fully overwrites every record with a usable identity, as one
    /// atomic unit. An empty batch is a no-op.
    async fn upsert(
        &self,
        table: &str,
        identity_field: &str,
        records: &[RawRecord],
    ) -> Result<UpsertSummary>;
}

#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub rows: Vec<LandedRow>,
    pub dropped: usize,
    pub duplicates: usize,
}

impl PreparedBatch {
    pub fn summary(&self) -> UpsertSummary {
        UpsertSummary {
            landed: self.rows.len(),
            dropped: self.dropped,
            duplicates: self.duplicates,
        }
    }
}

/// Extracts the record's identity. Strings are used verbatim, numbers in
/// their decimal form. Missing, blank, placeholder, over-long and
/// non-scalar values yield `None`, as do strings holding a NUL, which no
/// Postgres text column can store.
pub fn record_identity(record: &RawRecord, identity_field: &str) -> Option<String> {
    let id = match record.get(identity_field)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty()
                || s.contains('\0')
                || PLACEHOLDER_IDENTITIES
                    .iter()
                    .any(|p| trimmed.eq_ignore_ascii_case(p))
            {
                return None;
            }
            s.clone()
        }
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    (id.len() <= MAX_IDENTITY_LEN).then_some(id)
}

/// Removes NUL characters from every string and object key in `value`.
/// Postgres rejects them in `jsonb`, and one such record would otherwise
/// fail its whole batch on every run.
pub fn strip_nul(value: &mut Value) {
    match value {
        Value::String(s) if s.contains('\0') => s.retain(|c| c != '\0'),
        Value::Array(items) => items.iter_mut().for_each(strip_nul),
        Value::Object(map) if map.keys().any(|k| k.contains('\0')) => {
            *map = std::mem::take(map)
                .into_iter()
                .map(|(mut key, mut item)| {
                    key.retain(|c| c != '\0');
                    strip_nul(&mut item);
                    (key, item)
                })
                .collect();
        }
        Value::Object(map) => map.values_mut().for_each(strip_nul),
        _ => {}
    }
}

pub fn row_id(table: &str, id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(table.as_bytes());
    hasher.update(&[0]);
    hasher.update(id.as_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

pub fn content_hash(id: &str, payload: &RawRecord) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(&[0]);
    // serde_json renders object keys in sorted order, so equal payloads hash equally
    hasher.update(payload.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Turns a raw batch into the rows to land: drops records without a usable
/// identity, keeps only the last occurrence of each identity (in the order
/// of those last occurrences) and stamps capture metadata.
pub fn prepare_batch(
    table: &str,
    identity_field: &str,
    records: &[RawRecord],
    captured_at: DateTime<Utc>,
) -> PreparedBatch {
    let mut dropped = 0;
    let mut keyed = Vec::with_capacity(records.len());
    for record in records {
        match record_identity(record, identity_field) {
            Some(id) => keyed.push((id, record)),
            None => dropped += 1,
        }
    }

    let last_seen: HashMap<&str, usize> = keyed
        .iter()
        .enumerate()
        .map(|(pos, (id, _))| (id.as_str(), pos))
        .collect();

    let rows: Vec<LandedRow> = keyed
        .iter()
        .enumerate()
        .filter(|(pos, (id, _))| last_seen[id.as_str()] == *pos)
        .map(|(_, (id, record))| {
            let mut data = (*record).clone();
            strip_nul(&mut data);
            LandedRow {
                id: id.clone(),
                captured_at,
                ab_id: row_id(table, id),
                hashid: content_hash(id, &data),
                data,
            }
        })
        .collect();

    PreparedBatch {
        duplicates: keyed.len() - rows.len(),
        dropped,
        rows,
    }
}
