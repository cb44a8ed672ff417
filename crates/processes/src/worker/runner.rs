//! Polling worker loop

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::poller::{PollBackoff, PollerConfig};
use crate::engine::{EngineError, PassSummary, ProcessExecutionService};
use crate::persistence::ProcessStore;

/// Totals over the lifetime of a worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub passes: u64,
    pub steps_executed: u64,
    pub conflicts: u64,
    pub errors: u64,
}

impl WorkerStats {
    fn record(&mut self, summary: &PassSummary) {
        self.passes += 1;
        self.steps_executed += summary.steps_executed as u64;
        self.conflicts += (summary.conflicts + summary.skipped) as u64;
        self.errors += summary.errors as u64;
    }
}

/// Long-running process worker
///
/// Repeats engine passes until cancelled, backing off while no step
/// progresses.
///
/// # Example
///
/// ```ignore
/// let worker = ProcessWorker::new("worker-1", Arc::new(service), PollerConfig::default());
/// let cancel = CancellationToken::new();
/// worker.run(cancel.clone()).await?;
/// ```
pub struct ProcessWorker<S: ProcessStore> {
    worker_id: String,
    service: Arc<ProcessExecutionService<S>>,
    poller_config: PollerConfig,
}

impl<S: ProcessStore> ProcessWorker<S> {
    pub fn new(
        worker_id: impl Into<String>,
        service: Arc<ProcessExecutionService<S>>,
        poller_config: PollerConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            service,
            poller_config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run passes until `cancel` fires
    ///
    /// Store errors are logged and backed off; fatal engine errors end the
    /// loop and are returned.
    #[instrument(skip(self, cancel), fields(worker_id = %self.worker_id))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<WorkerStats, EngineError> {
        let mut backoff = PollBackoff::new(self.poller_config.clone());
        let mut stats = WorkerStats::default();
        info!("process worker started");

        while !cancel.is_cancelled() {
            match self.service.run_pass(&cancel).await {
                Ok(summary) => {
                    stats.record(&summary);
                    // Retrying steps alone must not keep the interval at its minimum
                    if summary.made_progress() {
                        backoff.reset();
                    } else {
                        backoff.increase();
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal engine error, stopping worker");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "engine pass failed");
                    stats.errors += 1;
                    backoff.increase();
                }
            }

            if !backoff.wait(&cancel).await {
                break;
            }
        }

        info!(
            passes = stats.passes,
            steps = stats.steps_executed,
            "process worker stopped"
        );
        Ok(stats)
    }

    /// Single pass, for cron-style deployments
    #[instrument(skip(self, cancel), fields(worker_id = %self.worker_id))]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<PassSummary, EngineError> {
        self.service.run_pass(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::engine::EngineConfig;
    use crate::executor::ProcessTypeExecutorRegistry;
    use crate::persistence::InMemoryProcessStore;

    fn idle_worker() -> ProcessWorker<InMemoryProcessStore> {
        let service = ProcessExecutionService::new(
            Arc::new(InMemoryProcessStore::new()),
            ProcessTypeExecutorRegistry::new(),
            EngineConfig::default(),
        );
        ProcessWorker::new(
            "test-worker",
            Arc::new(service),
            PollerConfig::new()
                .with_min_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let worker = idle_worker();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let stats = worker.run(cancel).await.expect("worker should stop cleanly");
        assert!(stats.passes >= 1);
        assert_eq!(stats.steps_executed, 0);
    }

    #[tokio::test]
    async fn test_run_once_on_empty_store() {
        let worker = idle_worker();
        let summary = worker
            .run_once(&CancellationToken::new())
            .await
            .expect("pass should succeed");
        assert!(!summary.found_work());
    }
}
