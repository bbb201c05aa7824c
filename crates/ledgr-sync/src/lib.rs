//! Ledger sync pipeline: configuration, steps, orchestration, backfill, reports and scheduling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ledgr_adapters::{
    AdSpendSource, CredentialStore, FixtureAdSpend, FixtureStorefront, GoogleAdsSpend, MetaAdSpend,
    ShopifyStorefront, StorefrontSource, YamlCredentialStore,
};
use ledgr_core::BucketZone;
use ledgr_storage::{HttpClientConfig, HttpFetcher, LedgerStore, MemoryStore, PgLedgerStore};
use tracing::info;

pub mod auth;
pub mod backfill;
pub mod config;
pub mod orchestrator;
pub mod reports;
pub mod scheduler;
pub mod steps;

pub use auth::{AccessGrant, PipelineAuth};
pub use backfill::{BackfillDriver, BackfillReport, ChunkReport};
pub use config::{ClientProfile, ClientRegistry, SourceMode, StoreBackend, SyncConfig};
pub use orchestrator::{SyncOrchestrator, SyncRequest, SyncRunSummary};
pub use reports::{report_recent_markdown, write_run_report};
pub use steps::{
    AdSpendStep, LineItemCogsStep, RecomputeStep, StepDeps, StepOutcome, StepRequest, StepResult,
    StorefrontRevenueStep, SyncStep,
};

pub const CRATE_NAME: &str = "ledgr-sync";

/// Event sources used by one pipeline.
#[derive(Clone)]
pub struct SourceSet {
    pub storefront: Arc<dyn StorefrontSource>,
    /// Optional ad providers; a client without a credential for one is skipped.
    pub ad_spend: Vec<Arc<dyn AdSpendSource>>,
}

impl SourceSet {
    pub fn live(config: &SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        Ok(Self {
            storefront: Arc::new(ShopifyStorefront::new(http.clone())),
            ad_spend: vec![
                Arc::new(MetaAdSpend::new(http.clone())),
                Arc::new(GoogleAdsSpend::new(http, config.google_developer_token.clone())),
            ],
        })
    }

    pub fn fixtures(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            storefront: Arc::new(FixtureStorefront::new(root.clone())),
            ad_spend: vec![
                Arc::new(FixtureAdSpend::meta(root.clone())),
                Arc::new(FixtureAdSpend::google(root)),
            ],
        }
    }
}

/// The standard step order: storefront revenue, each ad provider, line-item COGS, recompute.
pub fn standard_steps(deps: &StepDeps, sources: &SourceSet) -> Vec<Box<dyn SyncStep>> {
    let mut steps: Vec<Box<dyn SyncStep>> = vec![Box::new(StorefrontRevenueStep::new(
        deps.clone(),
        sources.storefront.clone(),
    ))];
    for ads in &sources.ad_spend {
        steps.push(Box::new(AdSpendStep::new(deps.clone(), ads.clone(), false)));
    }
    steps.push(Box::new(LineItemCogsStep::new(deps.clone(), sources.storefront.clone())));
    steps.push(Box::new(RecomputeStep::new(deps.clone())));
    steps
}

pub struct LedgerPipeline {
    config: SyncConfig,
    store: Arc<dyn LedgerStore>,
    registry: ClientRegistry,
    orchestrator: SyncOrchestrator,
}

impl LedgerPipeline {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store: Arc<dyn LedgerStore> = match config.store {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Postgres => Arc::new(
                PgLedgerStore::connect(&config.database_url)
                    .await
                    .context("connecting to ledger database")?,
            ),
        };
        let credentials: Arc<dyn CredentialStore> =
            Arc::new(YamlCredentialStore::load_or_empty(config.credentials_path())?);
        let sources = match config.source_mode {
            SourceMode::Live => SourceSet::live(&config)?,
            SourceMode::Fixtures => SourceSet::fixtures(config.fixtures_root()),
        };
        Self::assemble(config, store, credentials, sources)
    }

    /// Build from explicit collaborators; the client registry is still read from the workspace.
    pub fn assemble(
        config: SyncConfig,
        store: Arc<dyn LedgerStore>,
        credentials: Arc<dyn CredentialStore>,
        sources: SourceSet,
    ) -> Result<Self> {
        let registry = ClientRegistry::load(&config.clients_path())?;
        let deps = StepDeps {
            store: store.clone(),
            credentials,
            max_pages: config.max_pages,
            upsert_max_attempts: config.upsert_max_attempts,
        };
        let orchestrator = SyncOrchestrator::new(
            PipelineAuth::new(config.pipeline_token.as_deref()),
            standard_steps(&deps, &sources),
        );
        info!(
            store = ?config.store,
            sources = ?config.source_mode,
            clients = registry.clients.len(),
            steps = ?orchestrator.step_names(),
            "ledger pipeline ready"
        );
        Ok(Self {
            config,
            store,
            registry,
            orchestrator,
        })
    }

    pub fn with_today(mut self, today: chrono::NaiveDate) -> Self {
        self.orchestrator = self.orchestrator.with_today(today);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    fn client_zone(&self, client_id: &str) -> Result<BucketZone> {
        match self.registry.get(client_id) {
            Some(profile) if profile.enabled => profile.zone(),
            Some(_) => bail!("client {client_id} is disabled in clients.yaml"),
            None => bail!("client {client_id} is not listed in clients.yaml"),
        }
    }

    /// Authorized run for one client; writes the run report whatever the outcome.
    pub async fn sync(
        &self,
        client_id: &str,
        start: Option<&str>,
        end: Option<&str>,
        token: Option<&str>,
    ) -> Result<SyncRunSummary> {
        let request = SyncRequest {
            client_id: client_id.to_string(),
            zone: self.client_zone(client_id)?,
            start: start.map(str::to_string),
            end: end.map(str::to_string),
            token: token.map(str::to_string),
        };
        let summary = self.orchestrator.run(&request).await?;
        self.record(&summary).await?;
        Ok(summary)
    }

    /// Scheduled run over the default window, on the scheduler's own grant.
    pub async fn sync_scheduled(&self, profile: &ClientProfile) -> Result<SyncRunSummary> {
        let grant = PipelineAuth::internal("scheduler");
        let window = self.orchestrator.resolve_window(None, None)?;
        let summary = self
            .orchestrator
            .run_window(&grant, &profile.client_id, profile.zone()?, window)
            .await;
        self.record(&summary).await?;
        Ok(summary)
    }

    pub async fn backfill(
        &self,
        driver: &BackfillDriver,
        client_id: &str,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
        token: Option<&str>,
    ) -> Result<BackfillReport> {
        let zone = self.client_zone(client_id)?;
        let report = driver
            .run(&self.orchestrator, token, client_id, zone, from, to)
            .await?;
        for chunk in &report.chunks {
            self.record(&chunk.summary).await?;
        }
        reports::write_backfill_report(&self.config.reports_root(), &report).await?;
        Ok(report)
    }

    async fn record(&self, summary: &SyncRunSummary) -> Result<()> {
        let dir = write_run_report(&self.config.reports_root(), self.store.as_ref(), summary).await?;
        info!(run_id = %summary.run_id, dir = %dir.display(), "run report written");
        Ok(())
    }
}

pub async fn run_sync_from_env(
    client_id: &str,
    start: Option<&str>,
    end: Option<&str>,
    token: Option<&str>,
) -> Result<SyncRunSummary> {
    let pipeline = LedgerPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.sync(client_id, start, end, token).await
}

/// Apply the embedded migrations to `DATABASE_URL`.
pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let store = PgLedgerStore::connect(&config.database_url)
        .await
        .context("connecting to ledger database")?;
    store.migrate().await.context("running ledger migrations")?;
    Ok(())
}
