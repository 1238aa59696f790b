use crate::fetch::PaginatedFetch;
use crate::model::{RunReport, SyncOutcome, SyncState};
use crate::sink::UpsertSink;
use crate::source::PageSource;
use crate::transform::TransformTrigger;
use crate::watermark::WatermarkStore;
use chrono::Utc;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use sync_core::backoff::retry_transient;
use sync_core::{Result, RetryPolicy};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Drives each source-table through read-watermark → fetch → land →
/// advance-watermark, one table at a time.
pub struct Pipeline {
    watermarks: Arc<dyn WatermarkStore>,
    sink: Arc<dyn UpsertSink>,
    transform: Option<Arc<dyn TransformTrigger>>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(
        watermarks: Arc<dyn WatermarkStore>,
        sink: Arc<dyn UpsertSink>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            watermarks,
            sink,
            transform: None,
            retry,
            batch_size,
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn TransformTrigger>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Syncs every source in order. The transformation runs only when all
    /// of them succeeded.
    pub async fn run(&self, sources: &[Arc<dyn PageSource>]) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id);

        async {
            info!(sources = sources.len(), "Starting sync run");

            let mut outcomes = Vec::with_capacity(sources.len());
            for source in sources {
                outcomes.push(self.sync_source(source.as_ref()).await);
            }

            let mut report = RunReport {
                run_id,
                started_at,
                outcomes,
                transform: None,
            };

            if !report.sync_succeeded() {
                error!(
                    failed = ?report.failed_tables(),
                    "One or more tables failed to sync, skipping transformation"
                );
            } else if let Some(transform) = &self.transform {
                info!("Data ingestion completed successfully, starting transformation");
                let outcome = transform.run().await;
                if outcome.succeeded() {
                    info!("Transformation finished successfully");
                } else {
                    error!(
                        failed_steps = ?outcome.failed_steps(),
                        "Transformation failed, landed data is kept"
                    );
                }
                report.transform = Some(outcome);
            }

            info!(
                succeeded = report.succeeded(),
                landed = report.total_landed(),
                dropped = report.total_dropped(),
                tables = report.outcomes.len(),
                "Sync run finished"
            );

            report
        }
        .instrument(span)
        .await
    }

    /// Syncs a single source-table. Failures are captured in the outcome;
    /// they never touch the table's watermark.
    #[instrument(skip_all, fields(table = %source.table_name()))]
    pub async fn sync_source(&self, source: &dyn PageSource) -> SyncOutcome {
        let table = source.table_name();
        let started = Instant::now();
        let mut outcome = SyncOutcome::pending(&table, Utc::now());

        match self.drive(source, &mut outcome).await {
            Ok(()) => {
                info!(
                    landed = outcome.landed,
                    dropped = outcome.dropped,
                    duplicates = outcome.duplicates,
                    batches = outcome.batches,
                    watermark = %outcome.started_at,
                    "Table synced"
                );
            }
            Err(e) => {
                outcome.fail(&e);
                counter!("sync_table_failures", "table" => table.clone()).increment(1);
                error!(
                    failed_in = ?outcome.failed_in,
                    landed = outcome.landed,
                    transient = e.is_transient(),
                    error = %e,
                    "Table sync failed, watermark left unchanged"
                );
            }
        }

        histogram!("sync_table_duration_ms", "table" => table).record(started.elapsed().as_millis() as f64);
        outcome
    }

    async fn drive(&self, source: &dyn PageSource, outcome: &mut SyncOutcome) -> Result<()> {
        let table = outcome.table.clone();
        let identity_field = source.descriptor().identity_field.clone();
        let sync_started_at = outcome.started_at;

        let watermark = retry_transient(&self.retry, "get_watermark", || {
            self.watermarks.get(&table)
        })
        .await?;
        outcome.previous_watermark = watermark;
        transition(outcome, SyncState::WatermarkRead);

        match watermark {
            Some(since) => info!(since = %since, "Fetching records updated since watermark"),
            None => info!("No watermark, performing a full load"),
        }

        let mut fetch = PaginatedFetch::new(source, watermark, self.batch_size);
        transition(outcome, SyncState::Fetching);

        while let Some(batch) = fetch.next_batch().await? {
            transition(outcome, SyncState::Landing);
            let summary = retry_transient(&self.retry, "upsert", || {
                self.sink.upsert(&table, &identity_field, &batch)
            })
            .await?;
            outcome.record_batch(&summary);
            counter!("sync_batches_landed", "table" => table.clone()).increment(1);
            if summary.dropped > 0 {
                warn!(dropped = summary.dropped, "Dropped records without an identity");
            }
            transition(outcome, SyncState::Fetching);
        }

        debug!(
            pages = fetch.pages_fetched(),
            records = fetch.records_fetched(),
            "Source exhausted"
        );

        // All batches are committed at this point; only now may the watermark move
        retry_transient(&self.retry, "advance_watermark", || {
            self.watermarks.advance(&table, sync_started_at)
        })
        .await?;
        transition(outcome, SyncState::WatermarkAdvanced);

        Ok(())
    }
}

fn transition(outcome: &mut SyncOutcome, to: SyncState) {
    debug!(from = %outcome.state, to = %to, "State transition");
    outcome.state = to;
}
