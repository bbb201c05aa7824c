//! Google-Ads-style spend via the `googleAds:search` GAQL endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use ledgr_core::{AdInsightRow, DateWindow};
use ledgr_storage::{FetchError, HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::json;

use crate::{decode_body, AdSpendSource, Page, ProviderCredential, SourceError, PROVIDER_GOOGLE};

pub const DEFAULT_API_VERSION: &str = "v17";
const API_ROOT: &str = "https://googleads.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SearchEnvelope {
    #[serde(default)]
    pub results: Vec<SearchRow>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchRow {
    segments: Option<Segments>,
    metrics: Option<Metrics>,
}

#[derive(Debug, Deserialize)]
struct Segments {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metrics {
    /// int64 values are serialized as JSON strings.
    #[serde(default)]
    cost_micros: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

fn micros(value: Option<&serde_json::Value>) -> f64 {
    let raw = match value {
        Some(serde_json::Value::String(s)) => s.parse::<i64>().unwrap_or(0),
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    };
    raw as f64 / 1_000_000.0
}

pub(crate) fn rows_from(envelope: SearchEnvelope) -> Page<AdInsightRow> {
    let items = envelope
        .results
        .into_iter()
        .map(|row| AdInsightRow {
            date: row.segments.and_then(|s| s.date),
            timestamp: None,
            spend: micros(row.metrics.as_ref().and_then(|m| m.cost_micros.as_ref())),
        })
        .collect();
    Page {
        items,
        next_cursor: envelope.next_page_token.filter(|t| !t.is_empty()),
    }
}

pub(crate) fn spend_query(window: &DateWindow) -> String {
    format!(
        "SELECT segments.date, metrics.cost_micros FROM customer \
         WHERE segments.date BETWEEN '{}' AND '{}'",
        window.start, window.end
    )
}

fn classify_failure(err: FetchError) -> SourceError {
    if let FetchError::HttpStatus { status, body, .. } = &err {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            let status = if envelope.error.status == "RESOURCE_EXHAUSTED" { 429 } else { *status };
            return SourceError::Api {
                provider: PROVIDER_GOOGLE.to_string(),
                status,
                code: envelope.error.status,
                message: envelope.error.message,
            };
        }
    }
    SourceError::from_fetch(PROVIDER_GOOGLE, err)
}

#[derive(Debug, Clone)]
pub struct GoogleAdsSpend {
    http: Arc<HttpFetcher>,
    developer_token: Option<String>,
    api_root: String,
    version: String,
}

impl GoogleAdsSpend {
    pub fn new(http: Arc<HttpFetcher>, developer_token: Option<String>) -> Self {
        Self {
            http,
            developer_token,
            api_root: API_ROOT.to_string(),
            version: DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn with_api_root(mut self, root: impl Into<String>) -> Self {
        self.api_root = root.into();
        self
    }

    fn search_request(
        &self,
        credential: &ProviderCredential,
        window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<HttpRequest, SourceError> {
        let developer_token = credential
            .extra
            .get("developer_token")
            .or(self.developer_token.as_ref())
            .ok_or_else(|| SourceError::NotConnected {
                provider: PROVIDER_GOOGLE.to_string(),
                reason: "no developer token configured".to_string(),
            })?;
        let customer: String = credential
            .account_ref
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        let url = format!(
            "{}/{}/customers/{customer}/googleAds:search",
            self.api_root.trim_end_matches('/'),
            self.version
        );

        let mut body = json!({ "query": spend_query(window) });
        if let Some(token) = cursor {
            body["pageToken"] = json!(token);
        }
        let mut request = HttpRequest::post_json(url, body)
            .header("Authorization", format!("Bearer {}", credential.credential))
            .header("developer-token", developer_token.as_str());
        if let Some(login) = credential.extra.get("login_customer_id") {
            let login: String = login.chars().filter(char::is_ascii_digit).collect();
            request = request.header("login-customer-id", login);
        }
        Ok(request)
    }
}

#[async_trait]
impl AdSpendSource for GoogleAdsSpend {
    fn provider(&self) -> &'static str {
        PROVIDER_GOOGLE
    }

    async fn fetch_insights_page(
        &self,
        credential: &ProviderCredential,
        window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<Page<AdInsightRow>, SourceError> {
        let request = self.search_request(credential, window, cursor)?;
        let response = self
            .http
            .fetch(PROVIDER_GOOGLE, &request)
            .await
            .map_err(classify_failure)?;
        let envelope: SearchEnvelope = decode_body(PROVIDER_GOOGLE, &response.body)?;
        Ok(rows_from(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ledgr_storage::HttpClientConfig;

    fn window() -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        )
        .unwrap()
    }

    fn source(token: Option<&str>) -> GoogleAdsSpend {
        GoogleAdsSpend::new(
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            token.map(str::to_string),
        )
    }

    #[test]
    fn cost_micros_convert_to_currency_units() {
        let body = br#"{
          "results": [
            {"customer": {"resourceName": "customers/1"}, "segments": {"date": "2026-03-01"}, "metrics": {"costMicros": "12340000"}},
            {"segments": {"date": "2026-03-02"}, "metrics": {}}
          ],
          "nextPageToken": "tok-2"
        }"#;
        let page = rows_from(decode_body(PROVIDER_GOOGLE, body).unwrap());
        assert_eq!(page.items[0].spend, 12.34);
        assert_eq!(page.items[1].spend, 0.0);
        assert_eq!(page.items[1].date.as_deref(), Some("2026-03-02"));
        assert_eq!(page.next_cursor.as_deref(), Some("tok-2"));
    }

    #[test]
    fn request_carries_gaql_cursor_and_headers() {
        let cred = ProviderCredential::new("123-456-7890", "ya29.token").with_extra("login_customer_id", "999-000-1111");
        let request = source(Some("dev-1")).search_request(&cred, &window(), Some("tok-2".into())).unwrap();
        assert!(request.url.ends_with("/customers/1234567890/googleAds:search"));
        let body = request.json_body.unwrap();
        assert_eq!(body["pageToken"], "tok-2");
        assert!(body["query"].as_str().unwrap().contains("BETWEEN '2026-03-01' AND '2026-03-31'"));
        assert!(request.headers.contains(&("developer-token".to_string(), "dev-1".to_string())));
        assert!(request.headers.contains(&("login-customer-id".to_string(), "9990001111".to_string())));
    }

    #[test]
    fn missing_developer_token_is_not_connected() {
        let cred = ProviderCredential::new("1234567890", "ya29.token");
        let err = source(None).search_request(&cred, &window(), None).unwrap_err();
        assert_eq!(err.http_status(), 412);
    }

    #[test]
    fn resource_exhausted_is_rate_limited() {
        let err = classify_failure(FetchError::HttpStatus {
            status: 429,
            url: "u".into(),
            body: r#"{"error": {"code": 429, "message": "Too many requests", "status": "RESOURCE_EXHAUSTED"}}"#.into(),
        });
        assert_eq!(err.http_status(), 429);
        assert!(matches!(err, SourceError::Api { ref code, .. } if code == "RESOURCE_EXHAUSTED"));
    }
}
