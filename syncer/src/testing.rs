//! In-memory stand-ins for the remote API, the warehouse and the
//! transformation step.

use crate::model::{LandedRow, Page, RawRecord, UpsertSummary};
use crate::sink::{prepare_batch, UpsertSink};
use crate::source::PageSource;
use crate::transform::{StepOutcome, TransformOutcome, TransformTrigger};
use crate::watermark::WatermarkStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use sync_core::config::SourceConfig;
use sync_core::{Error, Result};

pub fn records(prefix: &str, ids: Range<usize>) -> Vec<RawRecord> {
    ids.map(|i| json!({"id": format!("{prefix}{i}"), "seq": i}))
        .collect()
}

pub fn transient_error() -> Error {
    Error::Database(sqlx::Error::PoolTimedOut)
}

pub fn data_error() -> Error {
    Error::Database(sqlx::Error::ColumnNotFound("data".into()))
}

#[derive(Debug, Clone)]
pub enum ScriptedPage {
    Page(Page),
    ConnectionReset,
    Malformed,
}

/// Serves canned pages keyed by the cursor they answer.
pub struct ScriptedSource {
    descriptor: SourceConfig,
    pages: HashMap<String, ScriptedPage>,
    requests: Mutex<Vec<(String, Option<NaiveDate>)>>,
}

impl ScriptedSource {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: SourceConfig::new(name, "items"),
            pages: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn page(mut self, cursor: &str, items: Vec<RawRecord>, next: Option<&str>) -> Self {
        let page = Page {
            items,
            next_cursor: next.map(str::to_string),
        };
        self.pages.insert(cursor.to_string(), ScriptedPage::Page(page));
        self
    }

    pub fn fail(mut self, cursor: &str, failure: ScriptedPage) -> Self {
        self.pages.insert(cursor.to_string(), failure);
        self
    }

    pub fn requested_cursors(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(cursor, _)| cursor.clone())
            .collect()
    }

    pub fn requested_filters(&self) -> Vec<Option<NaiveDate>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, filter)| *filter)
            .collect()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    fn descriptor(&self) -> &SourceConfig {
        &self.descriptor
    }

    fn initial_cursor(&self) -> String {
        "start".to_string()
    }

    async fn list_page(&self, cursor: &str, updated_since: Option<NaiveDate>) -> Result<Page> {
        self.requests
            .lock()
            .unwrap()
            .push((cursor.to_string(), updated_since));

        match self.pages.get(cursor) {
            Some(ScriptedPage::Page(page)) => Ok(page.clone()),
            Some(ScriptedPage::ConnectionReset) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            Some(ScriptedPage::Malformed) => Err(Error::protocol(
                &self.descriptor.name,
                "expected a JSON object envelope, got an array",
            )),
            None => Err(Error::Internal(format!("no page scripted for cursor {cursor}"))),
        }
    }
}

/// Warehouse held in memory with the same landing rules as Postgres.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, BTreeMap<String, LandedRow>>>,
    watermarks: Mutex<HashMap<String, DateTime<Utc>>>,
    batch_sizes: Mutex<Vec<(String, usize)>>,
    upsert_failures: Mutex<VecDeque<Error>>,
    failing_tables: Mutex<HashSet<String>>,
    upsert_calls: AtomicUsize,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<LandedRow> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<LandedRow> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn watermark(&self, table: &str) -> Option<DateTime<Utc>> {
        self.watermarks.lock().unwrap().get(table).copied()
    }

    pub fn set_watermark(&self, table: &str, at: DateTime<Utc>) {
        self.watermarks.lock().unwrap().insert(table.to_string(), at);
    }

    /// Sizes of the non-empty batches handed to `upsert` for `table`.
    pub fn batch_sizes(&self, table: &str) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, size)| *size)
            .collect()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// The next upserts fail with these errors, in order, before succeeding.
    pub fn fail_next_upserts(&self, errors: impl IntoIterator<Item = Error>) {
        self.upsert_failures.lock().unwrap().extend(errors);
    }

    /// Every upsert into `table` fails with a non-transient error.
    pub fn fail_upserts_for(&self, table: &str) {
        self.failing_tables.lock().unwrap().insert(table.to_string());
    }
}

#[async_trait]
impl WatermarkStore for MemoryWarehouse {
    async fn get(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.watermark(table))
    }

    async fn advance(&self, table: &str, at: DateTime<Utc>) -> Result<()> {
        let mut watermarks = self.watermarks.lock().unwrap();
        let current = watermarks.entry(table.to_string()).or_insert(at);
        *current = (*current).max(at);
        Ok(())
    }
}

#[async_trait]
impl UpsertSink for MemoryWarehouse {
    async fn upsert(
        &self,
        table: &str,
        identity_field: &str,
        records: &[RawRecord],
    ) -> Result<UpsertSummary> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if records.is_empty() {
            return Ok(UpsertSummary::default());
        }

        if let Some(err) = self.upsert_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.failing_tables.lock().unwrap().contains(table) {
            return Err(data_error());
        }

        let prepared = prepare_batch(table, identity_field, records, Utc::now());
        let summary = prepared.summary();

        self.batch_sizes
            .lock()
            .unwrap()
            .push((table.to_string(), records.len()));

        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        for row in prepared.rows {
            rows.insert(row.id.clone(), row);
        }

        Ok(summary)
    }
}

/// Transformation step that reports a fixed result.
pub struct FakeTransform {
    succeed: bool,
    calls: AtomicUsize,
}

impl FakeTransform {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformTrigger for FakeTransform {
    async fn run(&self) -> TransformOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        TransformOutcome {
            steps: vec![StepOutcome {
                step: "run".to_string(),
                success: self.succeed,
                exit_code: Some(if self.succeed { 0 } else { 1 }),
                stdout: String::new(),
                stderr: String::new(),
            }],
        }
    }
}
