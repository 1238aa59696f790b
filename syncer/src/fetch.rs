use crate::model::RawRecord;
use crate::source::PageSource;
use chrono::{DateTime, NaiveDate, Utc};
use sync_core::{Error, Result};
use tracing::{debug, info, warn};

/// Lazily walks a source's pages and hands back bounded batches.
///
/// Batches never exceed `batch_size`. A batch is handed out as soon as
/// enough records have accumulated, so callers can land it before the
/// next page is requested. Once [`next_batch`](Self::next_batch) returns
/// `Ok(None)` or an error the walk is over; it cannot be restarted.
pub struct PaginatedFetch<'a> {
    source: &'a dyn PageSource,
    updated_since: Option<NaiveDate>,
    batch_size: usize,
    /// Cursor for the next request; `None` once the last page was seen.
    cursor: Option<String>,
    buffer: Vec<RawRecord>,
    /// Next-cursor returned by the previous page, if that page was empty.
    last_empty_cursor: Option<String>,
    pages: usize,
    records: usize,
}

impl<'a> PaginatedFetch<'a> {
    pub fn new(source: &'a dyn PageSource, watermark: Option<DateTime<Utc>>, batch_size: usize) -> Self {
        Self {
            cursor: Some(source.initial_cursor()),
            source,
            // Server-side filtering is by date only
            updated_since: watermark.map(|ts| ts.date_naive()),
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            last_empty_cursor: None,
            pages: 0,
            records: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn records_fetched(&self) -> usize {
        self.records
    }

    pub async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>> {
        loop {
            if self.buffer.len() >= self.batch_size {
                return Ok(Some(self.buffer.drain(..self.batch_size).collect()));
            }

            let Some(cursor) = self.cursor.take() else {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buffer)));
            };

            if let Err(e) = self.fetch_page(&cursor).await {
                // Unflushed records are abandoned with the walk
                self.buffer.clear();
                return Err(e);
            }
        }
    }

    async fn fetch_page(&mut self, cursor: &str) -> Result<()> {
        let source_name = &self.source.descriptor().name;
        let page = self.source.list_page(cursor, self.updated_since).await?;
        self.pages += 1;

        if page.items.is_empty() {
            match page.next_cursor {
                None => {
                    info!(
                        source = %source_name,
                        pages = self.pages,
                        records = self.records,
                        "No more data to fetch"
                    );
                }
                Some(next) => {
                    warn!(source = %source_name, cursor = %next, "No items returned but cursor exists");
                    if self.last_empty_cursor.as_deref() == Some(next.as_str()) {
                        return Err(Error::PaginationLoop {
                            source_name: source_name.clone(),
                            cursor: next,
                        });
                    }
                    self.last_empty_cursor = Some(next.clone());
                    self.cursor = Some(next);
                }
            }
            return Ok(());
        }

        self.last_empty_cursor = None;
        self.records += page.items.len();
        debug!(
            source = %source_name,
            items = page.items.len(),
            buffered = self.buffer.len() + page.items.len(),
            "Fetched page"
        );
        self.buffer.extend(page.items);
        self.cursor = page.next_cursor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{records, ScriptedPage, ScriptedSource};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    async fn drain(fetch: &mut PaginatedFetch<'_>) -> Result<Vec<usize>> {
        let mut sizes = Vec::new();
        while let Some(batch) = fetch.next_batch().await? {
            sizes.push(batch.len());
        }
        Ok(sizes)
    }

    #[tokio::test]
    async fn batches_are_bounded_by_batch_size() {
        let source = ScriptedSource::new("order")
            .page("start", records("o", 0..1200), Some("c1"))
            .page("c1", records("o", 1200..2000), Some("c2"))
            .page("c2", records("o", 2000..2500), None);

        let mut fetch = PaginatedFetch::new(&source, None, 1000);
        let sizes = drain(&mut fetch).await.unwrap();

        assert_eq!(sizes, [1000, 1000, 500]);
        assert_eq!(fetch.pages_fetched(), 3);
        assert_eq!(fetch.records_fetched(), 2500);
    }

    #[tokio::test]
    async fn full_batch_is_handed_out_before_the_next_request() {
        let source = ScriptedSource::new("order")
            .page("start", records("o", 0..1000), Some("c1"))
            .page("c1", records("o", 1000..1010), None);

        let mut fetch = PaginatedFetch::new(&source, None, 1000);
        let first = fetch.next_batch().await.unwrap().unwrap();

        assert_eq!(first.len(), 1000);
        assert_eq!(source.requested_cursors(), ["start"]);
    }

    #[tokio::test]
    async fn sends_watermark_date_as_filter() {
        let source = ScriptedSource::new("customer").page("start", records("c", 0..3), None);
        let watermark = Utc.with_ymd_and_hms(2025, 6, 30, 21, 44, 4).unwrap();

        let mut fetch = PaginatedFetch::new(&source, Some(watermark), 1000);
        drain(&mut fetch).await.unwrap();

        assert_eq!(
            source.requested_filters(),
            [Some(NaiveDate::from_ymd_opt(2025, 6, 30).unwrap())]
        );
    }

    #[tokio::test]
    async fn empty_source_yields_nothing() {
        let source = ScriptedSource::new("product").page("start", vec![], None);

        let mut fetch = PaginatedFetch::new(&source, None, 1000);

        assert_eq!(drain(&mut fetch).await.unwrap(), Vec::<usize>::new());
        assert!(fetch.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_page_with_new_cursor_keeps_walking() {
        let source = ScriptedSource::new("order")
            .page("start", vec![], Some("c1"))
            .page("c1", records("o", 0..5), None);

        let mut fetch = PaginatedFetch::new(&source, None, 1000);

        assert_eq!(drain(&mut fetch).await.unwrap(), [5]);
    }

    #[tokio::test]
    async fn repeated_cursor_on_empty_pages_is_a_loop() {
        let source = ScriptedSource::new("order")
            .page("start", records("o", 0..3), Some("stuck"))
            .page("stuck", vec![], Some("stuck"));

        let mut fetch = PaginatedFetch::new(&source, None, 1000);
        let err = drain(&mut fetch).await.unwrap_err();

        assert!(
            matches!(&err, Error::PaginationLoop { cursor, .. } if cursor == "stuck"),
            "{err}"
        );
        assert_eq!(source.requested_cursors(), ["start", "stuck", "stuck"]);
        // the walk is over, buffered records are not flushed afterwards
        assert!(fetch.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_failure_keeps_already_emitted_batches() {
        let source = ScriptedSource::new("order")
            .page("start", records("o", 0..1500), Some("c1"))
            .fail("c1", ScriptedPage::ConnectionReset);

        let mut fetch = PaginatedFetch::new(&source, None, 1000);

        let first = fetch.next_batch().await.unwrap().unwrap();
        assert_eq!(first.len(), 1000);

        let err = fetch.next_batch().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
        assert_eq!(source.requested_cursors(), ["start", "c1"]);
    }

    #[tokio::test]
    async fn protocol_error_aborts_the_walk() {
        let source = ScriptedSource::new("order").fail("start", ScriptedPage::Malformed);

        let mut fetch = PaginatedFetch::new(&source, None, 1000);
        let err = fetch.next_batch().await.unwrap_err();

        assert!(matches!(err, Error::Protocol { .. }), "{err}");
    }
}
