//! Meta-style ad spend from the Graph API account insights edge.

use std::sync::Arc;

use async_trait::async_trait;
use ledgr_core::{AdInsightRow, DateWindow};
use ledgr_storage::{FetchError, HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::json;

use crate::{decode_body, flexible_f64, AdSpendSource, Page, ProviderCredential, SourceError, PROVIDER_META};

pub const DEFAULT_GRAPH_VERSION: &str = "v19.0";
const GRAPH_ROOT: &str = "https://graph.facebook.com";

/// Graph error codes that mean the caller is being throttled.
const THROTTLE_CODES: [i64; 5] = [4, 17, 32, 613, 80004];

#[derive(Debug, Deserialize)]
pub(crate) struct InsightsEnvelope {
    #[serde(default)]
    pub data: Vec<InsightRow>,
    pub paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InsightRow {
    #[serde(default, deserialize_with = "flexible_f64")]
    spend: f64,
    date_start: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Paging {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    error_subcode: Option<i64>,
}

pub(crate) fn rows_from(envelope: InsightsEnvelope) -> Page<AdInsightRow> {
    let items = envelope
        .data
        .into_iter()
        .map(|row| AdInsightRow {
            date: row.date_start,
            timestamp: None,
            spend: row.spend,
        })
        .collect();
    Page {
        items,
        next_cursor: envelope.paging.and_then(|p| p.next),
    }
}

/// Graph failures come back as non-2xx responses with an `error` object in the body.
fn classify_failure(err: FetchError) -> SourceError {
    if let FetchError::HttpStatus { status, body, .. } = &err {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            let graph = envelope.error;
            let status = if THROTTLE_CODES.contains(&graph.code) { 429 } else { *status };
            let code = match graph.error_subcode {
                Some(sub) => format!("{}/{sub}", graph.code),
                None => graph.code.to_string(),
            };
            return SourceError::Api {
                provider: PROVIDER_META.to_string(),
                status,
                code,
                message: graph.message,
            };
        }
    }
    SourceError::from_fetch(PROVIDER_META, err)
}

#[derive(Debug, Clone)]
pub struct MetaAdSpend {
    http: Arc<HttpFetcher>,
    graph_root: String,
    version: String,
}

impl MetaAdSpend {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            graph_root: GRAPH_ROOT.to_string(),
            version: DEFAULT_GRAPH_VERSION.to_string(),
        }
    }

    pub fn with_graph_root(mut self, root: impl Into<String>) -> Self {
        self.graph_root = root.into();
        self
    }

    fn insights_url(&self, account_ref: &str, window: &DateWindow) -> Result<String, SourceError> {
        let account = if account_ref.starts_with("act_") {
            account_ref.to_string()
        } else {
            format!("act_{account_ref}")
        };
        let time_range = json!({ "since": window.start.to_string(), "until": window.end.to_string() });
        let url = reqwest::Url::parse_with_params(
            &format!("{}/{}/{account}/insights", self.graph_root.trim_end_matches('/'), self.version),
            &[
                ("level", "account".to_string()),
                ("time_increment", "1".to_string()),
                ("fields", "spend,date_start".to_string()),
                ("limit", "500".to_string()),
                ("time_range", time_range.to_string()),
            ],
        )
        .map_err(|e| SourceError::decode(PROVIDER_META, format!("building insights url: {e}")))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl AdSpendSource for MetaAdSpend {
    fn provider(&self) -> &'static str {
        PROVIDER_META
    }

    async fn fetch_insights_page(
        &self,
        credential: &ProviderCredential,
        window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<Page<AdInsightRow>, SourceError> {
        let url = match cursor {
            Some(next) => next,
            None => self.insights_url(&credential.account_ref, window)?,
        };
        let request =
            HttpRequest::get(url).header("Authorization", format!("Bearer {}", credential.credential));
        let response = self
            .http
            .fetch(PROVIDER_META, &request)
            .await
            .map_err(classify_failure)?;
        let envelope: InsightsEnvelope = decode_body(PROVIDER_META, &response.body)?;
        Ok(rows_from(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ledgr_storage::HttpClientConfig;

    #[test]
    fn insights_rows_carry_provider_day_and_cursor() {
        let body = br#"{
          "data": [
            {"spend": "12.34", "date_start": "2026-03-01", "date_stop": "2026-03-01"},
            {"spend": "0", "date_start": "2026-03-02", "date_stop": "2026-03-02"}
          ],
          "paging": {"cursors": {"after": "x"}, "next": "https://graph.facebook.com/v19.0/act_1/insights?after=x"}
        }"#;
        let page = rows_from(decode_body(PROVIDER_META, body).unwrap());
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].date.as_deref(), Some("2026-03-01"));
        assert_eq!(page.items[0].spend, 12.34);
        assert!(page.next_cursor.unwrap().contains("after=x"));
    }

    #[test]
    fn last_page_has_no_cursor() {
        let page = rows_from(decode_body(PROVIDER_META, br#"{"data": [], "paging": {"cursors": {}}}"#).unwrap());
        assert!(page.items.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn throttling_error_object_becomes_429() {
        let err = classify_failure(FetchError::HttpStatus {
            status: 400,
            url: "https://graph.facebook.com/x".into(),
            body: r#"{"error": {"message": "User request limit reached", "type": "OAuthException", "code": 17, "error_subcode": 2446079}}"#.into(),
        });
        match err {
            SourceError::Api { status, code, .. } => {
                assert_eq!(status, 429);
                assert_eq!(code, "17/2446079");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_graph_failure_stays_http() {
        let err = classify_failure(FetchError::HttpStatus {
            status: 503,
            url: "https://graph.facebook.com/x".into(),
            body: "<html>unavailable</html>".into(),
        });
        assert!(matches!(err, SourceError::Http { status: 503, .. }));
    }

    #[test]
    fn account_prefix_is_added_once() {
        let source = MetaAdSpend::new(Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()));
        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
        )
        .unwrap();
        let a = source.insights_url("123", &window).unwrap();
        let b = source.insights_url("act_123", &window).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("/act_123/insights?"));
        assert!(a.contains("time_increment=1"));
    }
}
