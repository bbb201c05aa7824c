use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use ledgr_core::{BucketZone, DateWindow, LedgerError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::auth::{AccessGrant, PipelineAuth};
use crate::steps::{StepOutcome, StepRequest, SyncStep};

/// One pipeline invocation as presented by a caller.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub client_id: String,
    pub zone: BucketZone,
    pub start: Option<String>,
    pub end: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub client_id: String,
    pub window: DateWindow,
    pub ok: bool,
    /// Status of the failing step, or 200 when every step succeeded.
    pub status: u16,
    pub steps: Vec<StepOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncRunSummary {
    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| !s.ok)
    }
}

type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Runs the step list in order for one (client, window), halting at the first failed step.
pub struct SyncOrchestrator {
    auth: PipelineAuth,
    steps: Vec<Box<dyn SyncStep>>,
    today: Clock,
}

impl SyncOrchestrator {
    pub fn new(auth: PipelineAuth, steps: Vec<Box<dyn SyncStep>>) -> Self {
        Self {
            auth,
            steps,
            today: Arc::new(|| Utc::now().date_naive()),
        }
    }

    /// Pin "today" for window defaulting.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Arc::new(move || today);
        self
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn authorize(&self, token: Option<&str>) -> Result<AccessGrant, LedgerError> {
        self.auth.verify(token)
    }

    pub fn resolve_window(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<DateWindow, LedgerError> {
        DateWindow::resolve(start, end, (self.today)())
    }

    /// Caller errors (bad token, bad window) are returned before any step runs. Step failures
    /// are reported inside the summary.
    pub async fn run(&self, request: &SyncRequest) -> Result<SyncRunSummary, LedgerError> {
        let grant = self.authorize(request.token.as_deref())?;
        let window = self.resolve_window(request.start.as_deref(), request.end.as_deref())?;
        Ok(self
            .run_window(&grant, &request.client_id, request.zone, window)
            .await)
    }

    pub async fn run_window(
        &self,
        grant: &AccessGrant,
        client_id: &str,
        zone: BucketZone,
        window: DateWindow,
    ) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            run_id = %run_id,
            client_id,
            window = %window,
            subject = grant.subject()
        );
        self.run_steps(run_id, grant, client_id, zone, window)
            .instrument(span)
            .await
    }

    async fn run_steps(
        &self,
        run_id: Uuid,
        grant: &AccessGrant,
        client_id: &str,
        zone: BucketZone,
        window: DateWindow,
    ) -> SyncRunSummary {
        let started_at = Utc::now();
        let request = StepRequest {
            run_id,
            client_id: client_id.to_string(),
            window,
            zone,
            grant: grant.clone(),
        };

        let mut outcomes = Vec::with_capacity(self.steps.len());
        let mut status = 200;
        for step in &self.steps {
            let name = step.name();
            let result = step
                .run(&request)
                .instrument(info_span!("sync_step", step = %name))
                .await;
            let outcome = StepOutcome::from_result(&name, result);
            if outcome.ok {
                info!(step = %name, status = outcome.status, count = outcome.count, skipped = outcome.skipped, "step finished");
                outcomes.push(outcome);
                continue;
            }
            error!(
                step = %name,
                status = outcome.status,
                error = outcome.error.as_deref().unwrap_or_default(),
                "step failed; halting run"
            );
            status = outcome.status;
            outcomes.push(outcome);
            break;
        }

        let ok = outcomes.iter().all(|o| o.ok);
        info!(ok, status, steps = outcomes.len(), "sync run finished");
        SyncRunSummary {
            run_id,
            client_id: client_id.to_string(),
            window,
            ok,
            status,
            steps: outcomes,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        fail_with: Option<LedgerError>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SyncStep for Scripted {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn run(&self, _request: &StepRequest) -> Result<StepResult, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(StepResult::Done { count: 1 }),
            }
        }
    }

    fn orchestrator(fail_at: Option<usize>, calls: &Arc<AtomicUsize>) -> SyncOrchestrator {
        let names = ["a", "b", "c", "d", "e"];
        let steps = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Box::new(Scripted {
                    name: *name,
                    fail_with: (Some(i) == fail_at).then(|| LedgerError::UpstreamFetch {
                        provider: "meta".into(),
                        status: 429,
                        message: "throttled".into(),
                    }),
                    calls: calls.clone(),
                }) as Box<dyn SyncStep>
            })
            .collect();
        SyncOrchestrator::new(PipelineAuth::new(Some("tok")), steps)
            .with_today(NaiveDate::from_ymd_opt(2026, 4, 15).unwrap())
    }

    fn request() -> SyncRequest {
        SyncRequest {
            client_id: "acme".into(),
            token: Some("tok".into()),
            ..SyncRequest::default()
        }
    }

    #[tokio::test]
    async fn halts_at_first_failed_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let summary = orchestrator(Some(1), &calls).run(&request()).await.unwrap();
        assert!(!summary.ok);
        assert_eq!(summary.status, 429);
        assert_eq!(summary.steps.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.failed_step().unwrap().step, "b");
    }

    #[tokio::test]
    async fn default_window_is_thirty_days_ending_yesterday() {
        let calls = Arc::new(AtomicUsize::new(0));
        let summary = orchestrator(None, &calls).run(&request()).await.unwrap();
        assert!(summary.ok);
        assert_eq!(summary.status, 200);
        assert_eq!(summary.steps.len(), 5);
        assert_eq!(summary.window.end, NaiveDate::from_ymd_opt(2026, 4, 14).unwrap());
        assert_eq!(summary.window.len_days(), 30);
    }

    #[tokio::test]
    async fn caller_errors_run_no_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(None, &calls);

        let mut bad_token = request();
        bad_token.token = Some("nope".into());
        assert_eq!(orch.run(&bad_token).await.unwrap_err().http_status(), 401);

        let mut inverted = request();
        inverted.start = Some("2026-03-10".into());
        inverted.end = Some("2026-03-01".into());
        assert_eq!(orch.run(&inverted).await.unwrap_err().http_status(), 400);

        let mut malformed = request();
        malformed.end = Some("03/01/2026".into());
        assert!(matches!(orch.run(&malformed).await, Err(LedgerError::InvalidWindow(_))));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
