use super::PageSource;
use crate::model::Page;
use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::fmt::Write;
use std::num::NonZeroU32;
use std::time::Duration;
use sync_core::config::{ApiConfig, PaginationStyle, SourceConfig};
use sync_core::{Error, Result};
use tracing::{debug, instrument};

const CURSOR_START: &str = "start";
const FIRST_PAGE: &str = "1";

/// Shared HTTP session carrying the tenant and credentials on every request.
pub fn build_client(api: &ApiConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "tenant",
        HeaderValue::from_str(&api.tenant)
            .map_err(|_| Error::Config("tenant contains invalid header characters".into()))?,
    );
    let mut auth = HeaderValue::from_str(&api.auth_scheme.header_value(&api.auth_token))
        .map_err(|_| Error::Config("auth token contains invalid header characters".into()))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    let client = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(api.request_timeout_secs))
        .build()?;
    Ok(client)
}

/// REST listing endpoint speaking either the cursor or the page-number
/// protocol.
pub struct HttpSource {
    client: reqwest::Client,
    descriptor: SourceConfig,
    url: String,
    filter_param: String,
    filter_format: String,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, api: &ApiConfig, descriptor: SourceConfig) -> Result<Self> {
        // Time and offset specifiers cannot be rendered from a date
        if format_filter(&api.updated_filter_format, NaiveDate::MIN).is_none() {
            return Err(Error::Config(format!(
                "api.updated_filter_format '{}' cannot format a date",
                api.updated_filter_format
            )));
        }

        let base_url = descriptor.base_url.as_deref().unwrap_or(&api.base_url);
        let url = format!("{}/{}", base_url.trim_end_matches('/'), descriptor.name);

        let limiter = NonZeroU32::new(api.requests_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        Ok(Self {
            client,
            descriptor,
            url,
            filter_param: api.updated_filter_param.clone(),
            filter_format: api.updated_filter_format.clone(),
            limiter,
        })
    }

    fn cursor_param(&self) -> &'static str {
        match self.descriptor.pagination {
            PaginationStyle::Cursor => "cursor",
            PaginationStyle::Page => "page",
        }
    }
}

#[async_trait]
impl PageSource for HttpSource {
    fn descriptor(&self) -> &SourceConfig {
        &self.descriptor
    }

    fn initial_cursor(&self) -> String {
        match self.descriptor.pagination {
            PaginationStyle::Cursor => CURSOR_START.to_string(),
            PaginationStyle::Page => FIRST_PAGE.to_string(),
        }
    }

    #[instrument(skip(self), fields(source = %self.descriptor.name))]
    async fn list_page(&self, cursor: &str, updated_since: Option<NaiveDate>) -> Result<Page> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let mut query = vec![(self.cursor_param(), cursor.to_string())];
        if let Some(since) = updated_since {
            let filter = format_filter(&self.filter_format, since).ok_or_else(|| {
                Error::Config(format!("cannot format {} with '{}'", since, self.filter_format))
            })?;
            query.push((self.filter_param.as_str(), filter));
        }

        debug!(url = %self.url, cursor, "Requesting page");

        let response = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;

        let envelope: Value = serde_json::from_slice(&body).map_err(|e| {
            Error::protocol(&self.descriptor.name, format!("response is not valid JSON: {}", e))
        })?;

        let page = parse_envelope(&self.descriptor, cursor, envelope)?;

        debug!(
            items = page.items.len(),
            next_cursor = ?page.next_cursor,
            "Received page"
        );

        Ok(page)
    }
}

/// Renders the updated-since filter value, or `None` when `format` has
/// items a date cannot supply.
pub fn format_filter(format: &str, date: NaiveDate) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", date.format(format)).ok()?;
    Some(out)
}

/// Splits a response envelope into its items and the next cursor.
pub fn parse_envelope(descriptor: &SourceConfig, cursor: &str, envelope: Value) -> Result<Page> {
    let Value::Object(mut body) = envelope else {
        return Err(Error::protocol(
            &descriptor.name,
            format!("expected a JSON object envelope, got {}", kind(&envelope)),
        ));
    };

    let items = match body.remove(&descriptor.response_key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(Error::protocol(
                &descriptor.name,
                format!(
                    "'{}' should be an array, got {}",
                    descriptor.response_key,
                    kind(&other)
                ),
            ))
        }
    };

    let next_cursor = match descriptor.pagination {
        PaginationStyle::Cursor => match body.get("cursor") {
            Some(Value::String(next)) if !next.is_empty() => Some(next.clone()),
            Some(Value::Number(next)) => Some(next.to_string()),
            _ => None,
        },
        PaginationStyle::Page => {
            let current: u64 = cursor.parse().map_err(|_| {
                Error::protocol(&descriptor.name, format!("page cursor '{}' is not a number", cursor))
            })?;
            (!items.is_empty()).then(|| (current + 1).to_string())
        }
    };

    Ok(Page { items, next_cursor })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
