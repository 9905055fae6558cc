//! C3: the upstream reader.
//!
//! Wraps an upstream HTTP search endpoint that accepts JSON parameters via
//! POST and returns JSON `{ result: { fields, records, ... } }`, hiding
//! which of three pagination dialects the endpoint speaks.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::prelude::*;

/// Which pagination dialect an upstream endpoint speaks, discovered from
/// the preflight response's `result._backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Plain `offset`/`limit` paging.
    OffsetLimit,
    /// Solr-style `cursor`/`next_cursor` paging.
    Solr,
    /// CKAN versioned-datastore `after` paging.
    VersionedDatastore,
}

impl Backend {
    fn from_str(s: Option<&str>) -> Backend {
        match s {
            Some("solr") => Backend::Solr,
            Some("versioned-datastore") => Backend::VersionedDatastore,
            _ => Backend::OffsetLimit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: ResultBody,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    #[serde(default)]
    fields: Vec<Value>,
    #[serde(default)]
    records: Vec<Value>,
    #[serde(rename = "_backend", default)]
    backend: Option<String>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    after: Option<String>,
}

/// Merge a caller's overall `(offset, limit)` window with a nested
/// inner window: offsets add, the tighter limit wins. If the inner
/// window starts past the end of an already-limited base window, both
/// the offset and the limit reset to zero rather than the offset
/// surviving a negative limit.
pub fn merge_limits(
    base_offset: u64,
    base_limit: Option<u64>,
    inner_offset: u64,
    inner_limit: Option<u64>,
) -> (u64, Option<u64>) {
    let offset = base_offset + inner_offset;
    let limit = match base_limit {
        None => inner_limit,
        Some(base) => {
            let remaining = base as i64 - inner_offset as i64;
            let limit = match inner_limit {
                None => remaining,
                Some(inner) => remaining.min(inner as i64),
            };
            if limit < 0 {
                return (0, Some(0));
            }
            Some(limit as u64)
        }
    };
    (offset, limit)
}

/// A reader over one upstream search endpoint for the lifetime of one
/// package task.
pub struct UpstreamReader {
    client: reqwest::Client,
    api_url: String,
    key: Option<String>,
    base_params: Map<String, Value>,
    page_size: u64,
    offset: u64,
    limit: Option<u64>,
}

impl UpstreamReader {
    /// Build a reader. `base_params` is the upstream-whitelisted subset of
    /// the request descriptor (filters, q, plain, language, fields, sort);
    /// `offset`/`limit` are the caller's overall window.
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        key: Option<String>,
        base_params: Map<String, Value>,
        page_size: u64,
        offset: u64,
        limit: Option<u64>,
    ) -> UpstreamReader {
        UpstreamReader {
            client,
            api_url,
            key,
            base_params,
            page_size,
            offset,
            limit,
        }
    }

    #[instrument(skip_all, level = "trace")]
    async fn post(&self, params: Map<String, Value>) -> Result<ResultBody> {
        let mut req = self.client.post(&self.api_url).json(&Value::Object(params));
        if let Some(key) = &self.key {
            req = req.header("Authorization", key);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("could not reach upstream {}", self.api_url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format_err!(
                "upstream {} returned status {}",
                self.api_url,
                status
            ));
        }
        let body: SearchResponse = resp
            .json()
            .await
            .with_context(|| format!("could not parse upstream response from {}", self.api_url))?;
        Ok(body.result)
    }

    /// Discover the upstream field list and pagination dialect by posting
    /// an `offset=0,limit=0` preflight request.
    #[instrument(skip_all, level = "trace")]
    pub async fn get_fields_and_backend(&self) -> Result<(Vec<Value>, Backend)> {
        let mut params = self.base_params.clone();
        params.insert("offset".to_owned(), Value::from(0));
        params.insert("limit".to_owned(), Value::from(0));
        let result = self.post(params).await?;
        Ok((result.fields, Backend::from_str(result.backend.as_deref())))
    }

    /// Stream every record from the upstream endpoint, calling `on_record`
    /// once per record in upstream order, up to `self.limit` records if
    /// one was supplied. Pages are fetched lazily: only one page of
    /// records is ever held in memory at a time.
    #[instrument(skip_all, level = "trace")]
    pub async fn for_each_record<F>(&self, backend: Backend, mut on_record: F) -> Result<()>
    where
        F: FnMut(Value) -> Result<()>,
    {
        // A non-zero caller offset forces offset/limit paging regardless
        // of what the preflight reported, since cursor/after dialects
        // can't resume mid-stream.
        let backend = if self.offset != 0 {
            Backend::OffsetLimit
        } else {
            backend
        };

        let mut cursor: Box<dyn PageCursor> = match backend {
            Backend::OffsetLimit => Box::new(OffsetLimitCursor {
                base_offset: self.offset,
                base_limit: self.limit,
                consumed: 0,
            }),
            Backend::Solr => Box::new(SolrCursor {
                cursor: "*".to_owned(),
            }),
            Backend::VersionedDatastore => Box::new(AfterCursor { after: None }),
        };

        let mut yielded: u64 = 0;
        loop {
            let remaining = self.limit.map(|l| l.saturating_sub(yielded));
            if remaining == Some(0) {
                break;
            }
            let page_limit = match remaining {
                Some(r) => r.min(self.page_size),
                None => self.page_size,
            };

            let mut params = self.base_params.clone();
            cursor.apply(page_limit, &mut params);

            let page = self.post(params).await?;
            if page.records.is_empty() {
                break;
            }
            for record in page.records.iter() {
                on_record(record.clone())?;
                yielded += 1;
                if self.limit.map(|l| yielded >= l).unwrap_or(false) {
                    return Ok(());
                }
            }
            cursor.advance(&page);
        }
        Ok(())
    }
}

/// The before/after hooks for one pagination dialect, chosen once at
/// stream start so the read loop never branches on `Backend`. `apply`
/// is responsible for setting both the pagination cursor and `limit`
/// for the upcoming request, given the page size the read loop wants.
trait PageCursor: Send {
    fn apply(&self, page_limit: u64, params: &mut Map<String, Value>);
    fn advance(&mut self, page: &ResultBody);
}

/// Tracks how many records this cursor has already consumed as its own
/// "inner" window, merged via [`merge_limits`] with the reader's base
/// `(offset, limit)` on every request.
struct OffsetLimitCursor {
    base_offset: u64,
    base_limit: Option<u64>,
    consumed: u64,
}

impl PageCursor for OffsetLimitCursor {
    fn apply(&self, page_limit: u64, params: &mut Map<String, Value>) {
        let (offset, limit) =
            merge_limits(self.base_offset, self.base_limit, self.consumed, Some(page_limit));
        params.insert("offset".to_owned(), Value::from(offset));
        params.insert("limit".to_owned(), Value::from(limit.unwrap_or(page_limit)));
    }

    fn advance(&mut self, page: &ResultBody) {
        self.consumed += page.records.len() as u64;
    }
}

struct SolrCursor {
    cursor: String,
}

impl PageCursor for SolrCursor {
    fn apply(&self, page_limit: u64, params: &mut Map<String, Value>) {
        params.remove("offset");
        params.insert("cursor".to_owned(), Value::from(self.cursor.clone()));
        params.insert("limit".to_owned(), Value::from(page_limit));
    }

    fn advance(&mut self, page: &ResultBody) {
        if let Some(next) = &page.next_cursor {
            self.cursor = next.clone();
        }
    }
}

struct AfterCursor {
    after: Option<String>,
}

impl PageCursor for AfterCursor {
    fn apply(&self, page_limit: u64, params: &mut Map<String, Value>) {
        params.remove("offset");
        if let Some(after) = &self.after {
            params.insert("after".to_owned(), Value::from(after.clone()));
        }
        params.insert("limit".to_owned(), Value::from(page_limit));
    }

    fn advance(&mut self, page: &ResultBody) {
        self.after = page.after.clone();
    }
}

/// A reasonable default HTTP timeout for upstream catalog calls; the URL
/// variant uses its own shorter, fixed timeout (see [`crate::task::url`]).
pub fn default_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .context("could not build upstream HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_limits_adds_offsets_and_tightens() {
        assert_eq!(merge_limits(10, Some(50), 5, Some(20)), (15, Some(20)));
        assert_eq!(merge_limits(10, Some(12), 5, Some(20)), (15, Some(7)));
        assert_eq!(merge_limits(0, None, 5, Some(20)), (5, Some(20)));
    }

    #[test]
    fn merge_limits_resets_offset_when_inner_window_exhausts_the_base() {
        assert_eq!(merge_limits(0, Some(5), 10, Some(20)), (0, Some(0)));
    }

    #[test]
    fn backend_from_str_defaults_to_offset_limit() {
        assert_eq!(Backend::from_str(None), Backend::OffsetLimit);
        assert_eq!(Backend::from_str(Some("solr")), Backend::Solr);
        assert_eq!(
            Backend::from_str(Some("versioned-datastore")),
            Backend::VersionedDatastore
        );
        assert_eq!(Backend::from_str(Some("unknown")), Backend::OffsetLimit);
    }
}
