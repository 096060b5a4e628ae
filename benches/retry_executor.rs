use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use realtime_voice_engine::clock::TokioClock;
use realtime_voice_engine::error::{EngineError, ErrorCode, FaultDomain};
use realtime_voice_engine::retry::{NoopObserver, RetryContext, RetryEnvelope, RetryExecutor, RetryPolicy};

fn bench_immediate_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor: RetryExecutor<TokioClock> = RetryExecutor::new(Arc::new(TokioClock));
    let envelope = RetryEnvelope {
        policy: RetryPolicy::None,
        ..RetryEnvelope::default()
    };

    c.bench_function("retry_executor_immediate_success", |b| {
        b.to_async(&rt).iter(|| {
            let executor = executor.clone();
            let envelope = envelope;
            async move {
                let ctx = RetryContext {
                    correlation_id: "bench-correlation".into(),
                    session_id: None,
                    operation_name: "bench-op".into(),
                };
                executor
                    .execute(FaultDomain::Infrastructure, &envelope, ctx, || async { Ok::<_, EngineError>(()) }, &NoopObserver)
                    .await
                    .unwrap();
            }
        });
    });
}

fn bench_exponential_with_retries(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor: RetryExecutor<TokioClock> = RetryExecutor::new(Arc::new(TokioClock));
    let envelope = RetryEnvelope {
        policy: RetryPolicy::Exponential,
        initial_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 8,
        max_attempts: 4,
        ..RetryEnvelope::default()
    };

    c.bench_function("retry_executor_exponential_eventual_success", |b| {
        b.to_async(&rt).iter(|| {
            let executor = executor.clone();
            let envelope = envelope;
            let attempts = Arc::new(AtomicU32::new(0));
            async move {
                let ctx = RetryContext {
                    correlation_id: "bench-correlation".into(),
                    session_id: None,
                    operation_name: "bench-op".into(),
                };
                let attempts = attempts.clone();
                let _ = executor
                    .execute(
                        FaultDomain::Infrastructure,
                        &envelope,
                        ctx,
                        || {
                            let attempts = attempts.clone();
                            async move {
                                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                    Err(EngineError::new(FaultDomain::Infrastructure, ErrorCode::NetworkTimeout, "bench failure"))
                                } else {
                                    Ok::<_, EngineError>(())
                                }
                            }
                        },
                        &NoopObserver,
                    )
                    .await;
            }
        });
    });
}

criterion_group!(benches, bench_immediate_success, bench_exponential_with_retries);
criterion_main!(benches);
