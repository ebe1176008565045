//! Bounded-concurrency batch execution

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info};

use super::config::BatchConfig;
use super::result::{BatchFailure, BatchItemError, BatchResult};
use crate::reliability::run_with_deadline;

type Validator<'a, T> = Box<dyn Fn(&T) -> bool + Send + Sync + 'a>;
type ProgressFn<'a> = Box<dyn FnMut(usize, usize) + Send + 'a>;
type ErrorFn<'a, T, E> = Box<dyn Fn(&T, &BatchItemError<E>) + Send + Sync + 'a>;

/// Runs many independent operations under a concurrency cap
///
/// Items are split into chunks of `batch_size`. Within a chunk at most
/// `max_concurrency` items are in flight; a slot frees only when an in-flight
/// item settles. Chunks run one after another with `rate_limit_delay` between
/// them. All futures are polled on the caller's task.
///
/// # Example
///
/// ```
/// use breakwater_resilience::{BatchConfig, BatchProcessor};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let processor = BatchProcessor::new(
///     BatchConfig::default().with_rate_limit_delay(Duration::ZERO),
/// );
///
/// let result = processor
///     .batch(vec![1, 2, 3, 4])
///     .validate(|n| *n != 3)
///     .process(|n, _index| async move {
///         if n == 4 { Err("too big") } else { Ok(n * 10) }
///     })
///     .await;
///
/// assert_eq!(result.succeeded, vec![10, 20]);
/// assert_eq!(result.skipped, vec![3]);
/// assert_eq!(result.failed[0].index, 3);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Processor configured from `BATCH_*` environment variables
    pub fn from_env() -> Self {
        Self::new(BatchConfig::from_env())
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Start describing a batch over `items`
    pub fn batch<'a, T, E>(&self, items: Vec<T>) -> BatchJob<'a, T, E> {
        BatchJob {
            items,
            config: self.config.clone(),
            validator: None,
            on_progress: None,
            on_error: None,
        }
    }
}

/// A batch waiting to be processed
///
/// Built by [`BatchProcessor::batch`]; finished by [`process`](Self::process).
#[must_use = "a batch does nothing until process() is awaited"]
pub struct BatchJob<'a, T, E> {
    items: Vec<T>,
    config: BatchConfig,
    validator: Option<Validator<'a, T>>,
    on_progress: Option<ProgressFn<'a>>,
    on_error: Option<ErrorFn<'a, T, E>>,
}

impl<'a, T, E> BatchJob<'a, T, E> {
    /// Route items failing `validator` to `skipped` without processing them
    pub fn validate(mut self, validator: impl Fn(&T) -> bool + Send + Sync + 'a) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Called after every chunk with `(processed, total)`; `processed` includes skipped items
    pub fn on_progress(mut self, on_progress: impl FnMut(usize, usize) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(on_progress));
        self
    }

    /// Called for every failed item as soon as it settles
    pub fn on_error(
        mut self,
        on_error: impl Fn(&T, &BatchItemError<E>) + Send + Sync + 'a,
    ) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Replace the processor's configuration for this batch only
    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `processor(item, index)` for every valid item
    ///
    /// Never fails: each item's outcome is recorded in the returned
    /// [`BatchResult`].
    pub async fn process<R, F, Fut>(self, mut processor: F) -> BatchResult<T, R, E>
    where
        T: Clone,
        F: FnMut(T, usize) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let started = Instant::now();
        let BatchJob {
            items,
            config,
            validator,
            mut on_progress,
            on_error,
        } = self;

        let total = items.len();
        let max_concurrency = config.max_concurrency.max(1);
        let batch_size = config.batch_size.max(1);

        let mut valid = Vec::with_capacity(total);
        let mut skipped = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            match &validator {
                Some(is_valid) if !is_valid(&item) => skipped.push(item),
                _ => valid.push((index, item)),
            }
        }

        if !skipped.is_empty() {
            debug!(skipped = skipped.len(), "Skipped items that failed validation");
        }

        let mut processed = skipped.len();
        let mut succeeded: Vec<(usize, R)> = Vec::with_capacity(valid.len());
        let mut failed: Vec<BatchFailure<T, E>> = Vec::new();
        let mut chunks_run = 0usize;

        let mut pending = valid.into_iter().peekable();
        while pending.peek().is_some() {
            if chunks_run > 0 && !config.rate_limit_delay.is_zero() {
                tokio::time::sleep(config.rate_limit_delay).await;
            }

            let chunk: Vec<(usize, T)> = pending.by_ref().take(batch_size).collect();
            let chunk_len = chunk.len();
            debug!(chunk = chunks_run, items = chunk_len, "Starting chunk");

            let mut queued = chunk.into_iter();
            let mut in_flight = FuturesUnordered::new();
            loop {
                while in_flight.len() < max_concurrency {
                    let Some((index, item)) = queued.next() else {
                        break;
                    };
                    let work = processor(item.clone(), index);
                    let deadline = config.timeout;
                    in_flight.push(async move {
                        let outcome = run_with_deadline(deadline, work).await;
                        (index, item, outcome)
                    });
                }

                let Some((index, item, outcome)) = in_flight.next().await else {
                    break;
                };

                let error = match outcome {
                    Ok(Ok(value)) => {
                        succeeded.push((index, value));
                        continue;
                    }
                    Ok(Err(err)) => BatchItemError::Failed(err),
                    Err(expired) => BatchItemError::Timeout(expired.limit),
                };

                debug!(index, timeout = error.is_timeout(), "Batch item failed");
                if let Some(on_error) = &on_error {
                    on_error(&item, &error);
                }
                failed.push(BatchFailure { index, item, error });
            }

            chunks_run += 1;
            processed += chunk_len;
            if let Some(on_progress) = on_progress.as_mut() {
                on_progress(processed, total);
            }
        }

        // Every item was skipped: still report completion once
        if chunks_run == 0 && total > 0 {
            if let Some(on_progress) = on_progress.as_mut() {
                on_progress(processed, total);
            }
        }

        succeeded.sort_unstable_by_key(|(index, _)| *index);
        failed.sort_unstable_by_key(|failure| failure.index);

        let result = BatchResult {
            succeeded: succeeded.into_iter().map(|(_, value)| value).collect(),
            failed,
            skipped,
            total,
            duration: started.elapsed(),
        };

        info!(
            total = result.total,
            succeeded = result.success_count(),
            failed = result.failure_count(),
            skipped = result.skipped_count(),
            chunks = chunks_run,
            duration_ms = result.duration_ms(),
            "Batch completed"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> BatchConfig {
        BatchConfig::new()
            .with_max_concurrency(3)
            .with_batch_size(5)
            .with_rate_limit_delay(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_twelve_items_one_failure() {
        let origin = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_log = progress.clone();

        let result = BatchProcessor::new(config())
            .batch((0..12u32).collect())
            .on_progress(move |done, total| progress_log.lock().push((done, total)))
            .process(|item, index| {
                starts.lock().push((index, origin.elapsed()));
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if item == 7 {
                        Err(format!("item {item} rejected"))
                    } else {
                        Ok(item)
                    }
                }
            })
            .await;

        assert_eq!(result.total, 12);
        assert_eq!(result.success_count(), 11);
        assert_eq!(result.failed_indices(), vec![7]);
        assert_eq!(result.failed[0].item, 7);
        assert!(result.skipped.is_empty());
        assert_eq!(
            result.succeeded,
            vec![0, 1, 2, 3, 4, 5, 6, 8, 9, 10, 11]
        );

        assert_eq!(*progress.lock(), vec![(5, 12), (10, 12), (12, 12)]);

        let starts = starts.lock();
        let start_of = |index: usize| {
            starts
                .iter()
                .find(|(i, _)| *i == index)
                .map(|(_, at)| *at)
                .unwrap()
        };
        // Chunks 0..5, 5..10, 10..12 separated by the one second delay
        assert!(start_of(0) < Duration::from_millis(10));
        assert!(start_of(5) >= Duration::from_millis(1200));
        assert!(start_of(5) < Duration::from_millis(1300));
        assert!(start_of(10) >= Duration::from_millis(2400));
        assert!(start_of(10) < Duration::from_millis(2500));
        // Within a chunk the fourth item waits for a free slot
        assert!(start_of(3) >= Duration::from_millis(100));
    }

    async fn peak_concurrency(max_concurrency: usize, batch_size: usize) -> usize {
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let config = BatchConfig::new()
            .with_max_concurrency(max_concurrency)
            .with_batch_size(batch_size)
            .with_rate_limit_delay(Duration::ZERO);

        let result = BatchProcessor::new(config)
            .batch((0..20u64).collect())
            .process(|item, _| {
                let current = &current;
                let peak = &peak;
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10 + item % 3)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(item)
                }
            })
            .await;

        assert_eq!(result.success_count(), 20);
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_large_chunks() {
        assert_eq!(peak_concurrency(4, 20).await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_small_chunks() {
        assert_eq!(peak_concurrency(4, 2).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_and_progress() {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_log = progress.clone();

        let result = BatchProcessor::new(
            BatchConfig::new()
                .with_batch_size(4)
                .with_rate_limit_delay(Duration::ZERO),
        )
        .batch((0..10u32).collect())
        .validate(|n| n % 5 != 0)
        .on_progress(move |done, total| progress_log.lock().push((done, total)))
        .process(|n, _| async move { Ok::<_, String>(n) })
        .await;

        assert_eq!(result.skipped, vec![0, 5]);
        assert_eq!(result.succeeded, vec![1, 2, 3, 4, 6, 7, 8, 9]);
        assert_eq!(
            result.success_count() + result.failure_count() + result.skipped_count(),
            result.total
        );
        assert_eq!(*progress.lock(), vec![(6, 10), (10, 10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indices_refer_to_input_positions() {
        let result = BatchProcessor::new(config().with_rate_limit_delay(Duration::ZERO))
            .batch(vec!["", "a", "", "b"])
            .validate(|s| !s.is_empty())
            .process(|s, index| async move { Err::<(), _>(format!("{s}@{index}")) })
            .await;

        assert_eq!(result.failed_indices(), vec![1, 3]);
        let errors: Vec<String> = result
            .failed
            .iter()
            .map(|failure| failure.error.to_string())
            .collect();
        assert_eq!(errors, vec!["a@1", "b@3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_timeout() {
        let seen = Mutex::new(Vec::new());

        let result = BatchProcessor::new(
            config()
                .with_rate_limit_delay(Duration::ZERO)
                .with_timeout(Duration::from_millis(50)),
        )
        .batch(vec![10u64, 5_000, 20])
        .on_error(|item, error| seen.lock().push((*item, error.is_timeout())))
        .process(|ms, _| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .await;

        assert_eq!(result.succeeded, vec![10, 20]);
        assert_eq!(result.failed.len(), 1);
        assert!(matches!(
            result.failed[0].error,
            BatchItemError::Timeout(limit) if limit == Duration::from_millis(50)
        ));
        assert_eq!(*seen.lock(), vec![(5_000, true)]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let calls = AtomicUsize::new(0);
        let result = BatchProcessor::default()
            .batch(Vec::<u8>::new())
            .on_progress(|_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .process(|n, _| async move { Ok::<_, String>(n) })
            .await;

        assert_eq!(result.total, 0);
        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_skipped_reports_progress_once() {
        let progress = Mutex::new(Vec::new());
        let result = BatchProcessor::default()
            .batch(vec![1, 2, 3])
            .validate(|_| false)
            .on_progress(|done, total| progress.lock().push((done, total)))
            .process(|n, _| async move { Ok::<_, String>(n) })
            .await;

        assert_eq!(result.skipped_count(), 3);
        assert_eq!(*progress.lock(), vec![(3, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_after_last_chunk() {
        let started = Instant::now();
        BatchProcessor::new(
            BatchConfig::new()
                .with_batch_size(2)
                .with_rate_limit_delay(Duration::from_secs(10)),
        )
        .batch(vec![1, 2, 3, 4])
        .process(|n, _| async move { Ok::<_, String>(n) })
        .await;

        // One delay between two chunks, none after the last
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(20));
    }
}
