use std::time::Duration;

use reaper_core::{AppError, Credentials, ProgressReporter, SourceAdapter, SourceOutput, SourceRef};
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::guard::validate_url;

/// Source kind handled by [`HttpJsonAdapter`].
pub const HTTP_JSON_KIND: &str = "http_json";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PAGE_PARAM: &str = "page";

/// Per-source settings read from `SourceRef::params`.
///
/// | param           | meaning                                              |
/// |-----------------|------------------------------------------------------|
/// | `url`           | endpoint to fetch (required)                         |
/// | `pages`         | number of pages to request, default 1                |
/// | `page_param`    | query parameter carrying the page number             |
/// | `records_field` | field name or JSON pointer holding the record array  |
/// | `key_header`    | send the API key in this header                      |
/// | `key_param`     | send the API key as this query parameter             |
///
/// With neither `key_header` nor `key_param`, the key is sent as a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpJsonSettings {
    pub url: Url,
    pub pages: u64,
    pub page_param: String,
    pub records_field: Option<String>,
    pub key_header: Option<String>,
    pub key_param: Option<String>,
}

impl HttpJsonSettings {
    pub fn from_source(source: &SourceRef) -> Result<Self, AppError> {
        let raw_url = source.param("url").ok_or_else(|| {
            AppError::ConfigError(format!("Source '{}' has no 'url' parameter", source.name))
        })?;
        let url = Url::parse(raw_url).map_err(|e| {
            AppError::ConfigError(format!("Source '{}' has an invalid url: {e}", source.name))
        })?;

        let pages = match source.param("pages") {
            None => 1,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(AppError::ConfigError(format!(
                        "Invalid pages '{raw}' for source '{}': must be a positive integer",
                        source.name
                    )));
                }
            },
        };

        Ok(Self {
            url,
            pages,
            page_param: source
                .param("page_param")
                .unwrap_or(DEFAULT_PAGE_PARAM)
                .to_string(),
            records_field: source.param("records_field").map(str::to_string),
            key_header: source.param("key_header").map(str::to_string),
            key_param: source.param("key_param").map(str::to_string),
        })
    }

    /// URL for a 1-based page, with the key appended when it travels as a query parameter.
    pub fn page_url(&self, page: u64, credentials: &Credentials) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            if self.pages > 1 {
                query.append_pair(&self.page_param, &page.to_string());
            }
            if let (Some(param), Some(key)) = (&self.key_param, &credentials.api_key) {
                query.append_pair(param, key);
            }
        }
        // query_pairs_mut leaves a dangling '?' when nothing was appended.
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }
}

/// Pull the record list out of a response body.
///
/// `field` is either a top-level key or a JSON pointer (`/data/items`).
/// Without a field, an array body is the record list and any other body
/// is a single record.
pub fn extract_records(body: Value, field: Option<&str>) -> Result<Vec<Value>, AppError> {
    let target = match field {
        None => body,
        Some(pointer) if pointer.starts_with('/') => body
            .pointer(pointer)
            .cloned()
            .ok_or_else(|| AppError::ParseError(format!("Response has no value at {pointer}")))?,
        Some(key) => body
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::ParseError(format!("Response has no field '{key}'")))?,
    };

    match target {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other if field.is_none() => Ok(vec![other]),
        other => Err(AppError::ParseError(format!(
            "Expected an array of records, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Adapter that pages through a JSON HTTP endpoint.
///
/// Requests to private/reserved addresses are blocked by default; use
/// [`allow_private_urls`](Self::allow_private_urls) for local sources.
#[derive(Clone)]
pub struct HttpJsonAdapter {
    client: Client,
    timeout_secs: u64,
    block_private: bool,
}

impl HttpJsonAdapter {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("Reaper/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            block_private: true,
        })
    }

    /// Allow requests to private/reserved addresses.
    pub fn allow_private_urls(mut self) -> Self {
        self.block_private = false;
        self
    }

    async fn fetch_page(
        &self,
        settings: &HttpJsonSettings,
        page: u64,
        credentials: &Credentials,
    ) -> Result<Value, AppError> {
        let url = settings.page_url(page, credentials);
        let mut request = self.client.get(url.clone());
        if settings.key_param.is_none()
            && let Some(key) = &credentials.api_key
        {
            request = match &settings.key_header {
                Some(header) => request.header(header.as_str(), key.as_str()),
                None => request.bearer_auth(key),
            };
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                settings.url
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::ParseError(format!("Invalid JSON from {}: {e}", settings.url)))
    }
}

impl SourceAdapter for HttpJsonAdapter {
    fn describe(&self) -> String {
        "HTTP JSON".to_string()
    }

    async fn run(
        &self,
        source: &SourceRef,
        credentials: &Credentials,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<SourceOutput, AppError> {
        let settings = HttpJsonSettings::from_source(source)?;
        if self.block_private {
            validate_url(&settings.url).await?;
        }

        let mut records = Vec::new();
        for page in 1..=settings.pages {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let body = tokio::select! {
                body = self.fetch_page(&settings, page, credentials) => body?,
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            };
            let page_records = extract_records(body, settings.records_field.as_deref())?;
            tracing::debug!(
                source = %source.name,
                %page,
                records = page_records.len(),
                "Fetched page"
            );

            let exhausted = page_records.is_empty();
            records.extend(page_records);
            progress.report_steps(page, settings.pages);
            if exhausted {
                break;
            }
        }

        Ok(SourceOutput::new(records))
    }
}
