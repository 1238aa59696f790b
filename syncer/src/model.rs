use crate::transform::TransformOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// An opaque record exactly as the remote API returned it.
pub type RawRecord = serde_json::Value;

/// One page of a paginated listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<RawRecord>,
    /// Continuation token for the next request; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// The persisted form of a [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandedRow {
    pub id: String,
    pub captured_at: DateTime<Utc>,
    /// Stable per-(table, identity) row id.
    pub ab_id: String,
    /// Content fingerprint of identity + payload.
    pub hashid: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub landed: usize,
    /// Records without a usable identity.
    pub dropped: usize,
    /// Earlier occurrences superseded by a later record with the same identity.
    pub duplicates: usize,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WatermarkEntry {
    pub table_name: String,
    pub watermark: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Pending,
    WatermarkRead,
    Fetching,
    Landing,
    WatermarkAdvanced,
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncState::Pending => "PENDING",
            SyncState::WatermarkRead => "WATERMARK_READ",
            SyncState::Fetching => "FETCHING",
            SyncState::Landing => "LANDING",
            SyncState::WatermarkAdvanced => "WATERMARK_ADVANCED",
            SyncState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Result of syncing one source-table within a run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub table: String,
    pub state: SyncState,
    /// Orchestrator clock at sync start; becomes the new watermark on success.
    pub started_at: DateTime<Utc>,
    pub previous_watermark: Option<DateTime<Utc>>,
    pub batches: usize,
    pub landed: usize,
    pub dropped: usize,
    pub duplicates: usize,
    /// State in which the sync failed, if it did.
    pub failed_in: Option<SyncState>,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn pending(table: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            table: table.into(),
            state: SyncState::Pending,
            started_at,
            previous_watermark: None,
            batches: 0,
            landed: 0,
            dropped: 0,
            duplicates: 0,
            failed_in: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == SyncState::WatermarkAdvanced
    }

    pub fn record_batch(&mut self, summary: &UpsertSummary) {
        self.batches += 1;
        self.landed += summary.landed;
        self.dropped += summary.dropped;
        self.duplicates += summary.duplicates;
    }

    pub fn fail(&mut self, error: &sync_core::Error) {
        self.failed_in = Some(self.state);
        self.state = SyncState::Failed;
        self.error = Some(error.to_string());
    }
}

/// Aggregate of one run across every selected source-table.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<SyncOutcome>,
    /// `None` when the transformation was skipped or disabled.
    pub transform: Option<TransformOutcome>,
}

impl RunReport {
    pub fn sync_succeeded(&self) -> bool {
        self.outcomes.iter().all(SyncOutcome::succeeded)
    }

    pub fn succeeded(&self) -> bool {
        self.sync_succeeded()
            && self
                .transform
                .as_ref()
                .map_or(true, TransformOutcome::succeeded)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.table.as_str())
            .collect()
    }

    pub fn total_landed(&self) -> usize {
        self.outcomes.iter().map(|o| o.landed).sum()
    }

    pub fn total_dropped(&self) -> usize {
        self.outcomes.iter().map(|o| o.dropped).sum()
    }
}
