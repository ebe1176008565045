//! End-to-end flows: batches whose items retry through named circuits

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breakwater_resilience::prelude::*;
use thiserror::Error;

const EMBEDDINGS: CircuitName = CircuitName::from_static("embeddings");

#[derive(Debug, Clone, PartialEq)]
struct Document {
    id: u32,
    text: &'static str,
}

#[derive(Debug, Clone, PartialEq, Error)]
enum UpstreamError {
    #[error("503 service unavailable")]
    Unavailable,
    #[error("400 bad request")]
    BadRequest,
}

fn documents() -> Vec<Document> {
    vec![
        Document { id: 1, text: "alpha" },
        Document { id: 2, text: "" },
        Document { id: 3, text: "gamma" },
        Document { id: 4, text: "delta" },
        Document { id: 5, text: "reject me" },
    ]
}

fn fast_batches() -> BatchConfig {
    BatchConfig::new()
        .with_max_concurrency(2)
        .with_batch_size(2)
        .with_rate_limit_delay(Duration::from_millis(5))
        .with_retry_attempts(3)
}

#[test_log::test(tokio::test)]
async fn test_batch_with_retry_and_circuit() {
    let circuits = Arc::new(CircuitRegistry::in_memory(CircuitBreakerConfig::default()));
    let retry = RetryExecutor::new(circuits.clone());
    let config = fast_batches();
    let options = config
        .retry_options::<UpstreamError>()
        .with_circuit(EMBEDDINGS)
        .with_delay(|_| Duration::from_millis(1))
        .retry_if(|err| *err == UpstreamError::Unavailable);

    // Document 3 fails once before succeeding; document 5 is permanently rejected
    let flaky_calls = Arc::new(AtomicU32::new(0));

    let result = BatchProcessor::new(config)
        .batch(documents())
        .validate(|doc| !doc.text.is_empty())
        .process(|doc, _index| {
            let retry = retry.clone();
            let options = options.clone();
            let flaky_calls = flaky_calls.clone();
            async move {
                retry
                    .with_retry(&options, || {
                        let doc = doc.clone();
                        let flaky_calls = flaky_calls.clone();
                        async move {
                            match doc.id {
                                3 if flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 => {
                                    Err(UpstreamError::Unavailable)
                                }
                                5 => Err(UpstreamError::BadRequest),
                                _ => Ok(doc.text.len()),
                            }
                        }
                    })
                    .await
            }
        })
        .await;

    assert_eq!(result.total, 5);
    assert_eq!(result.succeeded, vec![5, 5, 5]);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.failed_indices(), vec![4]);
    assert_eq!(
        result.failed[0].error.processor_error().and_then(|e| e.operation()),
        Some(&UpstreamError::BadRequest)
    );
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);

    // One transient failure, one permanent failure; both counted, neither opened the circuit
    let record = circuits.status(&EMBEDDINGS).await.unwrap().unwrap();
    assert_eq!(record.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_open_circuit_fails_remaining_items_fast() {
    let circuits = Arc::new(CircuitRegistry::in_memory(
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_recovery_timeout(Duration::from_secs(60)),
    ));
    let retry = RetryExecutor::new(circuits.clone());
    let options = RetryOptions::new(RetryPolicy::fixed(Duration::from_millis(1), 2))
        .with_circuit(EMBEDDINGS);
    let upstream_calls = Arc::new(AtomicU32::new(0));

    let result = BatchProcessor::new(
        BatchConfig::new()
            .with_max_concurrency(1)
            .with_batch_size(10)
            .with_rate_limit_delay(Duration::ZERO),
    )
    .batch((0..6u32).collect())
    .process(|_, _| {
        let retry = retry.clone();
        let options = options.clone();
        let upstream_calls = upstream_calls.clone();
        async move {
            retry
                .with_retry(&options, || {
                    upstream_calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(UpstreamError::Unavailable) }
                })
                .await
        }
    })
    .await;

    assert_eq!(result.failure_count(), 6);
    // The first item exhausts its two attempts and opens the circuit
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 2);

    let rejected = result
        .failed
        .iter()
        .filter(|failure| {
            failure
                .error
                .processor_error()
                .is_some_and(ExecutionError::is_circuit_open)
        })
        .count();
    assert_eq!(rejected, 5);
}

#[tokio::test]
async fn test_grouped_flow_with_rate_limiter() {
    let limiter = RateLimiter::in_memory();
    let quota = RateLimitConfig::per_minute(2);

    let requests = vec![("u-1", "/scan"), ("u-2", "/scan"), ("u-1", "/scan"), ("u-1", "/scan")];

    let result = BatchProcessor::new(fast_batches().with_max_concurrency(1))
        .process_grouped(
            requests,
            |(user, _)| *user,
            |user, group| {
                let limiter = limiter.clone();
                let quota = quota.clone();
                async move {
                    let mut decisions = Vec::new();
                    for (_, route) in group {
                        decisions.push(limiter.check_rate_limit(&user_key(user, route), &quota).await);
                    }
                    Ok::<_, anyhow::Error>(decisions.into_iter().map(|d| d.allowed).collect::<Vec<_>>())
                }
            },
        )
        .await;

    assert_eq!(result.succeeded, vec![vec![true, true, false], vec![true]]);
}

const HANGING: CircuitName = CircuitName::from_static("hanging-upstream");

async fn run_hanging_batch(
    circuits: Arc<CircuitRegistry>,
    config: BatchConfig,
    options: RetryOptions<UpstreamError>,
) -> BatchResult<u32, (), ExecutionError<UpstreamError>> {
    let retry = RetryExecutor::new(circuits);
    let result = BatchProcessor::new(config)
        .batch((0..3u32).collect())
        .process(|_, _| {
            let retry = retry.clone();
            let options = options.clone();
            async move {
                retry
                    .with_retry(&options, || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<_, UpstreamError>(())
                    })
                    .await
            }
        })
        .await;

    // Let abandoned permits finish reporting
    tokio::time::sleep(Duration::from_millis(1)).await;
    result
}

fn hanging_circuits() -> Arc<CircuitRegistry> {
    Arc::new(CircuitRegistry::in_memory(
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(60)),
    ))
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_item_deadline_counts_against_circuit() {
    let circuits = hanging_circuits();
    let config = BatchConfig::new()
        .with_max_concurrency(3)
        .with_rate_limit_delay(Duration::ZERO)
        .with_timeout(Duration::from_millis(50));
    // No attempt deadline: only the item deadline cancels the call
    let options = RetryOptions::new(RetryPolicy::no_retry()).with_circuit(HANGING);

    let result = run_hanging_batch(circuits.clone(), config, options).await;

    assert_eq!(result.failure_count(), 3);
    assert!(result.failed.iter().all(|failure| failure.error.is_timeout()));

    let record = circuits.status(&HANGING).await.unwrap().unwrap();
    assert_eq!(record.state, CircuitState::Open);
    assert_eq!(record.failure_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_batch_retry_options_report_hung_attempts() {
    let circuits = hanging_circuits();
    let config = BatchConfig::new()
        .with_max_concurrency(3)
        .with_rate_limit_delay(Duration::ZERO)
        .with_retry_attempts(1)
        .with_timeout(Duration::from_millis(50));
    let options = config.retry_options::<UpstreamError>().with_circuit(HANGING);

    let result = run_hanging_batch(circuits.clone(), config, options).await;

    assert_eq!(result.failure_count(), 3);
    let record = circuits.status(&HANGING).await.unwrap().unwrap();
    assert_eq!(record.state, CircuitState::Open);
    assert!(record.failure_count >= 1);
}
