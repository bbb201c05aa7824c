use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::LedgerPipeline;

/// Default-window runs for every enabled client. Clients run concurrently; each run is
/// sequential on its own.
pub async fn sync_enabled_clients(pipeline: Arc<LedgerPipeline>) -> usize {
    let mut tasks = JoinSet::new();
    for profile in pipeline.registry().enabled().cloned() {
        let pipeline = pipeline.clone();
        tasks.spawn(async move {
            let result = pipeline.sync_scheduled(&profile).await;
            (profile.client_id, result)
        });
    }

    let mut succeeded = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((client_id, Ok(summary))) if summary.ok => {
                succeeded += 1;
                info!(client_id, run_id = %summary.run_id, "scheduled sync finished");
            }
            Ok((client_id, Ok(summary))) => {
                warn!(client_id, run_id = %summary.run_id, status = summary.status, "scheduled sync failed");
            }
            Ok((client_id, Err(err))) => {
                error!(client_id, error = %format!("{err:#}"), "scheduled sync could not run");
            }
            Err(err) => error!(error = %err, "scheduled sync task panicked"),
        }
    }
    succeeded
}

pub async fn maybe_build_scheduler(pipeline: Arc<LedgerPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let succeeded = sync_enabled_clients(pipeline).await;
            info!(succeeded, "scheduled sync sweep finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Start the scheduler and block until Ctrl-C.
pub async fn run_scheduler_until_shutdown(pipeline: Arc<LedgerPipeline>) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
        anyhow::bail!("scheduler is disabled; set LEDGR_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::SourceSet;
    use ledgr_adapters::{ProviderCredential, StaticCredentialStore};
    use ledgr_storage::MemoryStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("clients.yaml"), "clients: []\n").unwrap();
        let pipeline = LedgerPipeline::assemble(
            SyncConfig::offline(dir.path()),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticCredentialStore::new()),
            SourceSet::fixtures(dir.path().join("fixtures")),
        )
        .unwrap();
        assert!(maybe_build_scheduler(Arc::new(pipeline)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_runs_only_enabled_clients() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("clients.yaml"),
            "clients:\n  - client_id: acme\n  - client_id: globex\n  - client_id: initech\n    enabled: false\n",
        )
        .unwrap();
        let fixtures = dir.path().join("fixtures/shopify");
        std::fs::create_dir_all(&fixtures).unwrap();
        std::fs::write(fixtures.join("acme-shop.json"), r#"{"orders": []}"#).unwrap();

        // globex has no storefront credential, so its run fails at the first step
        let creds = StaticCredentialStore::new()
            .with("acme", "shopify", ProviderCredential::new("acme-shop", "t"))
            .with("initech", "shopify", ProviderCredential::new("acme-shop", "t"));
        let pipeline = LedgerPipeline::assemble(
            SyncConfig::offline(dir.path()),
            Arc::new(MemoryStore::new()),
            Arc::new(creds),
            SourceSet::fixtures(dir.path().join("fixtures")),
        )
        .unwrap();

        assert_eq!(sync_enabled_clients(Arc::new(pipeline)).await, 1);
        let reports = std::fs::read_dir(dir.path().join("reports")).unwrap().count();
        assert_eq!(reports, 2);
    }
}
