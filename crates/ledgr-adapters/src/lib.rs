//! Event-source contracts, credential lookup, cursor pagination and provider implementations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ledgr_core::{AdInsightRow, DateWindow, LedgerError, RawOrder};
use ledgr_storage::FetchError;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

pub mod fixtures;
pub mod google;
pub mod meta;
pub mod shopify;

pub use fixtures::{FixtureAdSpend, FixtureStorefront};
pub use google::GoogleAdsSpend;
pub use meta::MetaAdSpend;
pub use shopify::ShopifyStorefront;

pub const CRATE_NAME: &str = "ledgr-adapters";

pub const PROVIDER_SHOPIFY: &str = "shopify";
pub const PROVIDER_META: &str = "meta";
pub const PROVIDER_GOOGLE: &str = "google";

pub const DEFAULT_MAX_PAGES: usize = 200;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{provider} is not connected: {reason}")]
    NotConnected { provider: String, reason: String },
    #[error("{provider} responded with http {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} api error {code}: {message}")]
    Api {
        provider: String,
        /// HTTP status the error is reported under.
        status: u16,
        code: String,
        message: String,
    },
    #[error("{provider} response could not be decoded: {message}")]
    Decode { provider: String, message: String },
    #[error("{provider} pagination stopped after {pages} pages: {reason}")]
    PaginationLimit {
        provider: String,
        pages: usize,
        reason: String,
    },
    #[error("{provider} transport failure: {message}")]
    Transport { provider: String, message: String },
}

impl SourceError {
    pub fn provider(&self) -> &str {
        match self {
            Self::NotConnected { provider, .. }
            | Self::Http { provider, .. }
            | Self::Api { provider, .. }
            | Self::Decode { provider, .. }
            | Self::PaginationLimit { provider, .. }
            | Self::Transport { provider, .. } => provider,
        }
    }

    /// Status reported for a step that failed with this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotConnected { .. } => 412,
            Self::Http { status, .. } | Self::Api { status, .. } if *status >= 400 => *status,
            _ => 502,
        }
    }

    pub fn decode(provider: &str, err: impl fmt::Display) -> Self {
        Self::Decode {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn from_fetch(provider: &str, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } => Self::Http {
                provider: provider.to_string(),
                status,
                message: body,
            },
            other => Self::Transport {
                provider: provider.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<SourceError> for LedgerError {
    fn from(err: SourceError) -> Self {
        LedgerError::UpstreamFetch {
            provider: err.provider().to_string(),
            status: err.http_status(),
            message: err.to_string(),
        }
    }
}

/// Account reference and secret for one client/provider pair.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderCredential {
    pub account_ref: String,
    pub credential: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ProviderCredential {
    pub fn new(account_ref: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            account_ref: account_ref.into(),
            credential: credential.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("account_ref", &self.account_ref)
            .field("credential", &"<redacted>")
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Per-client, per-provider secret lookup. `Ok(None)` means the client has not connected
/// that provider, which is an expected state.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, client_id: &str, provider: &str) -> Result<Option<ProviderCredential>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    entries: HashMap<(String, String), ProviderCredential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client_id: &str, provider: &str, credential: ProviderCredential) -> Self {
        self.insert(client_id, provider, credential);
        self
    }

    pub fn insert(&mut self, client_id: &str, provider: &str, credential: ProviderCredential) {
        self.entries
            .insert((client_id.to_string(), provider.to_string()), credential);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn lookup(&self, client_id: &str, provider: &str) -> Result<Option<ProviderCredential>> {
        Ok(self
            .entries
            .get(&(client_id.to_string(), provider.to_string()))
            .cloned())
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    clients: BTreeMap<String, BTreeMap<String, ProviderCredential>>,
}

/// Credentials loaded from a `credentials.yaml` file:
///
/// ```yaml
/// clients:
///   acme:
///     shopify: { account_ref: acme.myshopify.com, credential: shpat_... }
///     meta: { account_ref: act_1234, credential: EAAB... }
/// ```
#[derive(Debug, Clone, Default)]
pub struct YamlCredentialStore {
    inner: StaticCredentialStore,
}

impl YamlCredentialStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Like [`load`](Self::load), but a missing file yields an empty store.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no credentials file; every provider is unconnected");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: CredentialsFile = serde_yaml::from_str(raw)?;
        let mut inner = StaticCredentialStore::new();
        for (client_id, providers) in file.clients {
            for (provider, credential) in providers {
                inner.insert(&client_id, &provider, credential);
            }
        }
        Ok(Self { inner })
    }
}

#[async_trait]
impl CredentialStore for YamlCredentialStore {
    async fn lookup(&self, client_id: &str, provider: &str) -> Result<Option<ProviderCredential>> {
        self.inner.lookup(client_id, provider).await
    }
}

/// One page of records plus the cursor for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Follow cursors until a page has none. Hitting `max_pages` with a cursor still pending, or
/// seeing a cursor twice, is an error rather than a silently truncated result.
pub async fn collect_pages<T, F, Fut>(
    provider: &str,
    max_pages: usize,
    mut fetch: F,
) -> Result<Vec<T>, SourceError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, SourceError>>,
{
    let max_pages = max_pages.max(1);
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();

    for page_number in 1..=max_pages {
        let page = fetch(cursor.take()).await?;
        items.extend(page.items);
        match page.next_cursor {
            None => return Ok(items),
            Some(next) => {
                if !seen.insert(next.clone()) {
                    return Err(SourceError::PaginationLimit {
                        provider: provider.to_string(),
                        pages: page_number,
                        reason: "cursor repeated".to_string(),
                    });
                }
                cursor = Some(next);
            }
        }
    }

    Err(SourceError::PaginationLimit {
        provider: provider.to_string(),
        pages: max_pages,
        reason: "page bound reached with a cursor pending".to_string(),
    })
}

#[async_trait]
pub trait StorefrontSource: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Orders relevant to `window`: placed in it, or updated in it (refunds on older orders).
    async fn fetch_orders_page(
        &self,
        credential: &ProviderCredential,
        window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<Page<RawOrder>, SourceError>;

    /// Unit costs keyed by cost-unit id. Ids without a known cost are absent from the result.
    async fn fetch_unit_costs(
        &self,
        credential: &ProviderCredential,
        cost_unit_ids: &[String],
    ) -> Result<BTreeMap<String, f64>, SourceError>;
}

#[async_trait]
pub trait AdSpendSource: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn fetch_insights_page(
        &self,
        credential: &ProviderCredential,
        window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<Page<AdInsightRow>, SourceError>;
}

pub async fn fetch_all_orders(
    source: &dyn StorefrontSource,
    credential: &ProviderCredential,
    window: &DateWindow,
    max_pages: usize,
) -> Result<Vec<RawOrder>, SourceError> {
    collect_pages(source.provider(), max_pages, |cursor| {
        source.fetch_orders_page(credential, window, cursor)
    })
    .await
}

pub async fn fetch_all_insights(
    source: &dyn AdSpendSource,
    credential: &ProviderCredential,
    window: &DateWindow,
    max_pages: usize,
) -> Result<Vec<AdInsightRow>, SourceError> {
    collect_pages(source.provider(), max_pages, |cursor| {
        source.fetch_insights_page(credential, window, cursor)
    })
    .await
}

/// Amounts arrive as decimal strings from some providers and as numbers from others.
pub(crate) fn flexible_f64<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
        Null,
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) if s.trim().is_empty() => Ok(0.0),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Raw::Null => Ok(0.0),
    }
}

/// Identifiers arrive as JSON numbers or strings; both become strings.
pub(crate) fn flexible_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }
    Ok(Option::<Raw>::deserialize(de)?.map(|raw| match raw {
        Raw::Num(n) => n.to_string(),
        Raw::Text(s) => s,
    }))
}

pub(crate) fn decode_body<T: DeserializeOwned>(provider: &str, body: &[u8]) -> Result<T, SourceError> {
    serde_json::from_slice(body).map_err(|e| SourceError::decode(provider, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn pages_are_followed_until_cursor_ends() {
        let items = collect_pages("shopify", 10, |cursor| async move {
            Ok(match cursor.as_deref() {
                None => Page {
                    items: vec![1, 2],
                    next_cursor: Some("b".into()),
                },
                Some("b") => Page {
                    items: vec![3],
                    next_cursor: Some("c".into()),
                },
                _ => Page::last(vec![4]),
            })
        })
        .await
        .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn page_bound_is_an_error_not_a_truncation() {
        let calls = AtomicUsize::new(0);
        let err = collect_pages("meta", 3, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(Page {
                    items: vec![n],
                    next_cursor: Some(format!("c{n}")),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SourceError::PaginationLimit { pages: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn repeated_cursor_is_detected() {
        let err = collect_pages::<u8, _, _>("google", 50, |_| async {
            Ok(Page {
                items: vec![],
                next_cursor: Some("same".into()),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SourceError::PaginationLimit { pages: 2, ref reason, .. } if reason == "cursor repeated"));
    }

    #[tokio::test]
    async fn first_page_error_propagates() {
        let err = collect_pages::<u8, _, _>("shopify", 5, |_| async {
            Err(SourceError::Http {
                provider: "shopify".into(),
                status: 429,
                message: "slow down".into(),
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.http_status(), 429);
    }

    #[test]
    fn source_errors_map_to_step_statuses() {
        let not_connected = SourceError::NotConnected {
            provider: "shopify".into(),
            reason: "no credential".into(),
        };
        assert_eq!(not_connected.http_status(), 412);
        assert_eq!(SourceError::decode("meta", "bad json").http_status(), 502);
        let api_in_ok_body = SourceError::Api {
            provider: "google".into(),
            status: 200,
            code: "X".into(),
            message: "m".into(),
        };
        assert_eq!(api_in_ok_body.http_status(), 502);

        let ledger: LedgerError = SourceError::Http {
            provider: "meta".into(),
            status: 429,
            message: "throttled".into(),
        }
        .into();
        assert_eq!(ledger.http_status(), 429);
    }

    #[test]
    fn credential_debug_never_shows_secret() {
        let cred = ProviderCredential::new("act_1", "super-secret-token").with_extra("login_customer_id", "9");
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("act_1"));
    }

    #[tokio::test]
    async fn yaml_store_resolves_connected_and_absent_providers() {
        let store = YamlCredentialStore::from_yaml(
            "clients:\n  acme:\n    shopify:\n      account_ref: acme.myshopify.com\n      credential: shpat_1\n    google:\n      account_ref: 123-456-7890\n      credential: ya29\n      extra:\n        login_customer_id: \"111\"\n",
        )
        .unwrap();
        let shop = store.lookup("acme", "shopify").await.unwrap().unwrap();
        assert_eq!(shop.account_ref, "acme.myshopify.com");
        let google = store.lookup("acme", "google").await.unwrap().unwrap();
        assert_eq!(google.extra.get("login_customer_id").map(String::as_str), Some("111"));
        assert!(store.lookup("acme", "meta").await.unwrap().is_none());
        assert!(store.lookup("globex", "shopify").await.unwrap().is_none());
    }

    #[test]
    fn missing_credentials_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlCredentialStore::load_or_empty(dir.path().join("credentials.yaml")).unwrap();
        assert!(store.inner.is_empty());
    }
}
