//! Process claiming benchmark
//!
//! Benchmarks the critical path: discover due process → claim → commit step
//! → release, on the in-memory store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use uuid::Uuid;

use portal_processes::prelude::*;

/// Executor completing every SEND_MAIL step immediately
struct NoopMailer {
    classification: ErrorClassification,
}

#[async_trait]
impl ProcessTypeExecutor for NoopMailer {
    const PROCESS_TYPE_ID: ProcessTypeId = ProcessTypeId::Mailing;
    type Context = ();

    fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
        BTreeSet::from([ProcessStepTypeId::SendMail])
    }

    fn is_lock_requested(&self, _step_type_id: ProcessStepTypeId) -> bool {
        false
    }

    fn error_classification(&self) -> &ErrorClassification {
        &self.classification
    }

    async fn initialize_process(
        &self,
        _process_id: Uuid,
        _step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<((), InitializationResult), ProcessError> {
        Ok(((), InitializationResult::unmodified()))
    }

    async fn execute_process_step(
        &self,
        _context: &mut (),
        _step_type_id: ProcessStepTypeId,
        _step_type_ids: &BTreeSet<ProcessStepTypeId>,
        _cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, ProcessError> {
        Ok(StepExecutionResult::done())
    }
}

async fn seeded_service(process_count: u64, config: EngineConfig) -> ProcessExecutionService<InMemoryProcessStore> {
    let store = Arc::new(InMemoryProcessStore::new());
    for _ in 0..process_count {
        start_process(store.as_ref(), ProcessTypeId::Mailing, [ProcessStepTypeId::SendMail])
            .await
            .unwrap();
    }

    let mut registry = ProcessTypeExecutorRegistry::new();
    registry
        .register(NoopMailer {
            classification: ErrorClassification::new(ProcessTypeId::Mailing),
        })
        .unwrap();
    ProcessExecutionService::new(store, registry, config)
}

/// Benchmark raw claim throughput on the store
fn bench_claim(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("process_claiming/claim");
    group.throughput(Throughput::Elements(1));

    group.bench_function("try_claim_release", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = InMemoryProcessStore::new();
            let process = store.create_process(ProcessTypeId::Mailing).await.unwrap();
            let mut version = process.version;

            let start = Instant::now();
            for _ in 0..iters {
                assert!(store.try_claim_process(process.id, version, None).await.unwrap());
                assert!(store.release_process(process.id, version + 1).await.unwrap());
                version += 2;
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark full engine passes draining seeded processes
fn bench_pass(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("process_claiming/pass");
    group.throughput(Throughput::Elements(1));

    for concurrency in [1, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("concurrency", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let config = EngineConfig::new()
                        .with_batch_size(50)
                        .with_max_concurrent_processes(concurrency);
                    let service = seeded_service(iters.max(1), config).await;
                    let cancel = CancellationToken::new();

                    let start = Instant::now();
                    loop {
                        let summary = service.run_pass(&cancel).await.unwrap();
                        if !summary.found_work() {
                            break;
                        }
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_claim, bench_pass);
criterion_main!(benches);
