//! Month-by-month backfill over a long window, built on the orchestrator.

use chrono::NaiveDate;
use ledgr_core::{BucketZone, DateWindow, LedgerError};
use ledgr_storage::BackoffPolicy;
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::AccessGrant;
use crate::orchestrator::{SyncOrchestrator, SyncRunSummary};

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    pub window: DateWindow,
    pub attempts: usize,
    pub summary: SyncRunSummary,
}

impl ChunkReport {
    pub fn ok(&self) -> bool {
        self.summary.ok
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub client_id: String,
    pub window: DateWindow,
    pub chunks: Vec<ChunkReport>,
    /// Chunks never run because an earlier one exhausted its retries.
    pub skipped_chunks: Vec<DateWindow>,
}

impl BackfillReport {
    pub fn ok(&self) -> bool {
        self.skipped_chunks.is_empty() && self.chunks.iter().all(ChunkReport::ok)
    }

    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkReport> {
        self.chunks.iter().filter(|c| !c.ok())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackfillDriver {
    pub backoff: BackoffPolicy,
    pub stop_on_failure: bool,
}

impl Default for BackfillDriver {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            stop_on_failure: false,
        }
    }
}

/// Statuses that another attempt cannot change.
fn is_permanent(status: u16) -> bool {
    matches!(status, 400 | 401 | 403 | 404 | 412)
}

impl BackfillDriver {
    pub fn new(max_retries: usize) -> Self {
        Self {
            backoff: BackoffPolicy {
                max_retries,
                ..BackoffPolicy::default()
            },
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub async fn run(
        &self,
        orchestrator: &SyncOrchestrator,
        token: Option<&str>,
        client_id: &str,
        zone: BucketZone,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<BackfillReport, LedgerError> {
        let grant = orchestrator.authorize(token)?;
        let window = DateWindow::new(from, to)?;
        Ok(self.run_window(orchestrator, &grant, client_id, zone, window).await)
    }

    pub async fn run_window(
        &self,
        orchestrator: &SyncOrchestrator,
        grant: &AccessGrant,
        client_id: &str,
        zone: BucketZone,
        window: DateWindow,
    ) -> BackfillReport {
        let chunks = window.month_chunks();
        info!(client_id, window = %window, chunks = chunks.len(), "backfill starting");

        let mut reports = Vec::with_capacity(chunks.len());
        let mut pending = chunks.into_iter();
        for chunk in pending.by_ref() {
            let report = self.run_chunk(orchestrator, grant, client_id, zone, chunk).await;
            let failed = !report.ok();
            reports.push(report);
            if failed && self.stop_on_failure {
                break;
            }
        }
        let skipped_chunks: Vec<DateWindow> = pending.collect();

        let report = BackfillReport {
            client_id: client_id.to_string(),
            window,
            chunks: reports,
            skipped_chunks,
        };
        info!(
            client_id,
            ok = report.ok(),
            failed = report.failed_chunks().count(),
            skipped = report.skipped_chunks.len(),
            "backfill finished"
        );
        report
    }

    async fn run_chunk(
        &self,
        orchestrator: &SyncOrchestrator,
        grant: &AccessGrant,
        client_id: &str,
        zone: BucketZone,
        chunk: DateWindow,
    ) -> ChunkReport {
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            let summary = orchestrator.run_window(grant, client_id, zone, chunk).await;
            let retries_used = attempts - 1;
            if summary.ok || is_permanent(summary.status) || retries_used >= self.backoff.max_retries {
                if !summary.ok {
                    warn!(chunk = %chunk, attempts, status = summary.status, "backfill chunk gave up");
                }
                return ChunkReport {
                    window: chunk,
                    attempts,
                    summary,
                };
            }
            let delay = self.backoff.delay_for_attempt(retries_used);
            warn!(chunk = %chunk, attempts, status = summary.status, delay_ms = delay.as_millis() as u64, "backfill chunk failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PipelineAuth;
    use crate::steps::{StepRequest, StepResult, SyncStep};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fails the first `failures` calls for windows starting in `month`, with `status`.
    struct Flaky {
        month: u32,
        status: u16,
        failures: usize,
        seen: Arc<Mutex<Vec<DateWindow>>>,
    }

    #[async_trait]
    impl SyncStep for Flaky {
        fn name(&self) -> String {
            "flaky".into()
        }

        async fn run(&self, request: &StepRequest) -> Result<StepResult, LedgerError> {
            use chrono::Datelike;
            let mut seen = self.seen.lock().unwrap();
            seen.push(request.window);
            let calls_for_month = seen
                .iter()
                .filter(|w| w.start.month() == self.month)
                .count();
            if request.window.start.month() == self.month && calls_for_month <= self.failures {
                return Err(LedgerError::UpstreamFetch {
                    provider: "shopify".into(),
                    status: self.status,
                    message: "flaky".into(),
                });
            }
            Ok(StepResult::Done {
                count: request.window.len_days() as usize,
            })
        }
    }

    fn setup(month: u32, status: u16, failures: usize) -> (SyncOrchestrator, Arc<Mutex<Vec<DateWindow>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let step = Flaky {
            month,
            status,
            failures,
            seen: seen.clone(),
        };
        (
            SyncOrchestrator::new(PipelineAuth::new(Some("tok")), vec![Box::new(step)]),
            seen,
        )
    }

    fn fast(max_retries: usize) -> BackfillDriver {
        BackfillDriver::new(max_retries).with_backoff(BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        })
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn splits_into_months_and_retries_transient_failures() {
        let (orch, seen) = setup(2, 503, 2);
        let report = fast(3)
            .run(&orch, Some("tok"), "acme", BucketZone::Utc, d(2026, 1, 15), d(2026, 3, 10))
            .await
            .unwrap();
        assert!(report.ok());
        let windows: Vec<_> = report.chunks.iter().map(|c| c.window).collect();
        assert_eq!(
            windows,
            vec![
                DateWindow::new(d(2026, 1, 15), d(2026, 1, 31)).unwrap(),
                DateWindow::new(d(2026, 2, 1), d(2026, 2, 28)).unwrap(),
                DateWindow::new(d(2026, 3, 1), d(2026, 3, 10)).unwrap(),
            ]
        );
        assert_eq!(report.chunks[1].attempts, 3);
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn exhausted_chunk_stops_the_backfill_when_asked() {
        let (orch, _) = setup(1, 500, 10);
        let report = fast(1)
            .stop_on_failure(true)
            .run(&orch, Some("tok"), "acme", BucketZone::Utc, d(2026, 1, 1), d(2026, 3, 31))
            .await
            .unwrap();
        assert!(!report.ok());
        assert_eq!(report.chunks.len(), 1);
        assert_eq!(report.chunks[0].attempts, 2);
        assert_eq!(report.skipped_chunks.len(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (orch, _) = setup(1, 412, 10);
        let report = fast(5)
            .run(&orch, Some("tok"), "acme", BucketZone::Utc, d(2026, 1, 1), d(2026, 2, 10))
            .await
            .unwrap();
        assert_eq!(report.chunks[0].attempts, 1);
        assert!(report.chunks[1].ok());
        assert_eq!(report.failed_chunks().count(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_token_and_inverted_range() {
        let (orch, seen) = setup(1, 500, 0);
        let driver = fast(0);
        assert!(matches!(
            driver.run(&orch, None, "acme", BucketZone::Utc, d(2026, 1, 1), d(2026, 1, 2)).await,
            Err(LedgerError::Unauthorized(_))
        ));
        assert!(matches!(
            driver.run(&orch, Some("tok"), "acme", BucketZone::Utc, d(2026, 2, 1), d(2026, 1, 2)).await,
            Err(LedgerError::InvalidWindow(_))
        ));
        assert!(seen.lock().unwrap().is_empty());
    }
}
