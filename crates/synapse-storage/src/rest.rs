//! PostgREST-dialect table client (`{base}/rest/v1/{table}`).

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE};
use reqwest::{Method, RequestBuilder, Response};
use synapse_core::Record;
use tracing::{debug, info_span, warn, Instrument};

use crate::http::{retry_after, BackoffPolicy, HttpClientConfig, Replay};
use crate::{Filter, Query, TableError, TableStore};

pub struct RestTableStore {
    client: reqwest::Client,
    rest_url: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for RestTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTableStore")
            .field("rest_url", &self.rest_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl RestTableStore {
    /// `api_key` is sent both as `apikey` and as the bearer credential; the
    /// service-role key bypasses row-level policies, the anon key does not.
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            backoff: config.backoff,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// Sends the request built by `build`, retrying what `replay` allows.
    async fn send(
        &self,
        table: &str,
        replay: Replay,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, TableError> {
        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let hint = retry_after(resp.headers());
                    if let Some(wait) =
                        self.backoff
                            .next_delay(replay.status_disposition(status), attempt, hint)
                    {
                        warn!(%status, attempt, ?wait, "retrying table request");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(TableError::Status {
                        status: status.as_u16(),
                        table: table.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if let Some(wait) =
                        self.backoff
                            .next_delay(replay.error_disposition(&err), attempt, None)
                    {
                        warn!(error = %err, attempt, ?wait, "retrying table request");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(TableError::Request(err));
                }
            }
        }
        unreachable!("final attempt always returns")
    }
}

fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::to_query_pair).collect()
}

fn query_pairs(query: &Query) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if !query.columns.is_empty() {
        pairs.push(("select".to_string(), query.columns.join(",")));
    }
    pairs.extend(filter_pairs(&query.filters));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.descending { "desc" } else { "asc" }))
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("order".to_string(), order));
    }
    pairs
}

/// Total from `Content-Range: 0-24/143` or `*/0`.
fn parse_content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok())
}

#[async_trait]
impl TableStore for RestTableStore {
    /// Pages with `offset` until the `Content-Range` total (or an empty page
    /// when the server reports none), so a max-rows cap cannot truncate the read.
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>, TableError> {
        let base = query_pairs(query);
        let span = info_span!("rest_select", table);
        async {
            let mut rows: Vec<Record> = Vec::new();
            loop {
                let remaining = match query.limit {
                    Some(limit) if rows.len() >= limit => break,
                    Some(limit) => Some(limit - rows.len()),
                    None => None,
                };
                let mut pairs = base.clone();
                if let Some(remaining) = remaining {
                    pairs.push(("limit".to_string(), remaining.to_string()));
                }
                if !rows.is_empty() {
                    pairs.push(("offset".to_string(), rows.len().to_string()));
                }

                let resp = self
                    .send(table, Replay::Safe, || {
                        self.request(Method::GET, table)
                            .query(&pairs)
                            .header("Prefer", HeaderValue::from_static("count=exact"))
                    })
                    .await?;
                let total = parse_content_range_total(resp.headers());
                let text = resp.text().await?;
                let page: Vec<Record> =
                    serde_json::from_str(&text).map_err(|err| TableError::Decode {
                        table: table.to_string(),
                        detail: err.to_string(),
                    })?;
                let fetched = page.len();
                rows.extend(page);
                debug!(fetched, rows = rows.len(), ?total, "select page");

                let expected = match (total, query.limit) {
                    (Some(total), Some(limit)) => Some(total.min(limit as u64)),
                    (total, None) => total,
                    (None, Some(_)) => None,
                };
                match expected {
                    Some(expected) if rows.len() as u64 >= expected => break,
                    Some(expected) if fetched == 0 => {
                        return Err(TableError::Decode {
                            table: table.to_string(),
                            detail: format!("read ended at {} of {expected} rows", rows.len()),
                        });
                    }
                    None if fetched == 0 => break,
                    _ => {}
                }
            }
            Ok(rows)
        }
        .instrument(span)
        .await
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, TableError> {
        let pairs = filter_pairs(filters);
        let resp = self
            .send(table, Replay::Safe, || {
                self.request(Method::HEAD, table)
                    .query(&pairs)
                    .header("Prefer", HeaderValue::from_static("count=exact"))
            })
            .await?;
        parse_content_range_total(resp.headers()).ok_or_else(|| TableError::Decode {
            table: table.to_string(),
            detail: "missing or unparsable Content-Range total".to_string(),
        })
    }

    async fn insert(&self, table: &str, rows: &[Record]) -> Result<(), TableError> {
        self.send(table, Replay::Unsafe, || {
            self.request(Method::POST, table)
                .header("Prefer", HeaderValue::from_static("return=minimal"))
                .json(rows)
        })
        .await?;
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Record],
        conflict_key: &[String],
    ) -> Result<(), TableError> {
        let on_conflict = conflict_key.join(",");
        self.send(table, Replay::Safe, || {
            self.request(Method::POST, table)
                .query(&[("on_conflict", on_conflict.as_str())])
                .header(
                    "Prefer",
                    HeaderValue::from_static("resolution=merge-duplicates,return=minimal"),
                )
                .json(rows)
        })
        .await?;
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Record,
    ) -> Result<(), TableError> {
        if filters.is_empty() {
            return Err(TableError::Unfiltered {
                op: "update",
                table: table.to_string(),
            });
        }
        let pairs = filter_pairs(filters);
        self.send(table, Replay::Safe, || {
            self.request(Method::PATCH, table)
                .query(&pairs)
                .header("Prefer", HeaderValue::from_static("return=minimal"))
                .json(patch)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), TableError> {
        if filters.is_empty() {
            return Err(TableError::Unfiltered {
                op: "delete",
                table: table.to_string(),
            });
        }
        let pairs = filter_pairs(filters);
        self.send(table, Replay::Safe, || {
            self.request(Method::DELETE, table).query(&pairs)
        })
            .await?;
        Ok(())
    }
}
