pub mod http;

use crate::model::Page;
use async_trait::async_trait;
use chrono::NaiveDate;
use sync_core::config::SourceConfig;
use sync_core::Result;

/// A remote listing endpoint walked one page at a time.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn descriptor(&self) -> &SourceConfig;

    /// Cursor sent with the first request.
    fn initial_cursor(&self) -> String;

    /// Fetch the page at `cursor`, restricted to records modified on or
    /// after `updated_since` when given.
    async fn list_page(&self, cursor: &str, updated_since: Option<NaiveDate>) -> Result<Page>;

    fn table_name(&self) -> String {
        self.descriptor().table_name()
    }
}

pub use http::HttpSource;
