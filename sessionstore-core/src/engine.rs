//! Adaptive bulk upsert engine.
//!
//! Walks the input in windows of `batch_size`, writing each window through a
//! [`BatchLoader`] as a single transaction. A failed window is halved and
//! retried from the same cursor until it commits, hits `min_batch_size`, or
//! uses up `max_retries` attempts. Windows are written strictly in order and
//! never concurrently within one call.
//!
//! Per window: size it, then loop `Writing → {Committed | Retrying | Exhausted}`
//! where `Retrying` re-enters `Writing` with the halved size.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::backend::{write_window, BatchLoader};
use crate::backends::with_deadline;
use crate::config::BatchConfig;
use crate::error::StoreError;
use crate::models::SessionRecord;

/// Outcome of a successful `upsert_many` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkUpsertReport {
    pub records: usize,
    pub windows: usize,
    pub attempts: usize,
    pub shrinks: usize,
    pub elapsed: Duration,
}

/// Where a window goes after one write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Committed { size: usize },
    /// Retry the same cursor with `next_size` records as attempt `attempt`.
    Retrying { next_size: usize, attempt: u32 },
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct BulkUpsertEngine {
    config: BatchConfig,
}

impl Default for BulkUpsertEngine {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}

impl BulkUpsertEngine {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Starting size for a window: `batch_size`, capped by what is left.
    pub fn initial_size(&self, remaining: usize) -> usize {
        self.config.batch_size.min(remaining)
    }

    pub fn transition(
        &self,
        size: usize,
        attempt: u32,
        outcome: Result<(), &StoreError>,
    ) -> WindowState {
        let err = match outcome {
            Ok(()) => return WindowState::Committed { size },
            Err(e) => e,
        };

        if !err.is_retryable()
            || attempt >= self.config.max_retries
            || size <= self.config.min_batch_size
        {
            return WindowState::Exhausted;
        }

        let next_size = (size / 2).max(self.config.min_batch_size);
        if next_size >= size {
            return WindowState::Exhausted;
        }

        WindowState::Retrying {
            next_size,
            attempt: attempt + 1,
        }
    }

    pub async fn upsert_many(
        &self,
        loader: &dyn BatchLoader,
        records: &[SessionRecord],
        preserve_updated_at: bool,
    ) -> Result<BulkUpsertReport, StoreError> {
        self.upsert_many_cancellable(
            loader,
            records,
            preserve_updated_at,
            &CancellationToken::new(),
        )
        .await
    }

    /// Like [`upsert_many`](Self::upsert_many), but once `cancel` fires the
    /// in-flight window is abandoned (rolled back) and no further window
    /// starts. Windows committed before that point stay committed.
    pub async fn upsert_many_cancellable(
        &self,
        loader: &dyn BatchLoader,
        records: &[SessionRecord],
        preserve_updated_at: bool,
        cancel: &CancellationToken,
    ) -> Result<BulkUpsertReport, StoreError> {
        let mut report = BulkUpsertReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        for record in records {
            record.validate()?;
        }

        let started = Instant::now();
        let mut cursor = 0;

        while cursor < records.len() {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let mut size = self.initial_size(records.len() - cursor);
            let mut attempt = 1;

            let committed = loop {
                report.attempts += 1;
                let window = &records[cursor..cursor + size];
                let outcome = self
                    .attempt_window(loader, window, preserve_updated_at, cancel)
                    .await;

                let err = match outcome {
                    Ok(_) => break size,
                    Err(e) => e,
                };

                match self.transition(size, attempt, Err(&err)) {
                    WindowState::Retrying {
                        next_size,
                        attempt: next_attempt,
                    } => {
                        tracing::warn!(
                            window_start = cursor,
                            window_size = size,
                            next_size,
                            attempt,
                            error = %err,
                            "Window write failed, shrinking and retrying"
                        );
                        report.shrinks += 1;
                        size = next_size;
                        attempt = next_attempt;
                    }
                    _ => {
                        tracing::error!(
                            window_start = cursor,
                            window_size = size,
                            attempt,
                            committed_records = cursor,
                            error = %err,
                            "Window write exhausted retries"
                        );
                        return Err(err);
                    }
                }
            };

            tracing::debug!(window_start = cursor, window_size = committed, "Window committed");
            cursor += committed;
            report.records += committed;
            report.windows += 1;

            if cursor < records.len() {
                self.throttle(cancel).await?;
            }
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            records = report.records,
            windows = report.windows,
            attempts = report.attempts,
            shrinks = report.shrinks,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Bulk upsert complete"
        );
        Ok(report)
    }

    async fn attempt_window(
        &self,
        loader: &dyn BatchLoader,
        window: &[SessionRecord],
        preserve_updated_at: bool,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let deadline = self.config.attempt_timeout();
        let write = with_deadline(
            deadline,
            write_window(loader, window, preserve_updated_at, deadline),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            res = write => res,
        }
    }

    async fn throttle(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let Some(pause) = self.config.throttle() else {
            return Ok(());
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            _ = tokio::time::sleep(pause) => Ok(()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StagedWindow;
    use crate::models::WindowStamp;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // ------------------------------------------------------------------
    // Mock loader: records every attempt, fails according to a policy
    // keyed on (attempt number, window size).
    // ------------------------------------------------------------------

    type FailPolicy = Box<dyn Fn(usize, usize) -> Option<StoreError> + Send + Sync>;

    struct Shared {
        fail: FailPolicy,
        delay: Option<Duration>,
        attempts: AtomicUsize,
        deadlines: Mutex<Vec<Option<Duration>>>,
        sizes: Mutex<Vec<usize>>,
        committed: Mutex<Vec<String>>,
    }

    struct MockLoader {
        shared: Arc<Shared>,
    }

    impl MockLoader {
        fn new(fail: impl Fn(usize, usize) -> Option<StoreError> + Send + Sync + 'static) -> Self {
            Self::build(Box::new(fail), None)
        }

        fn always_ok() -> Self {
            Self::new(|_, _| None)
        }

        fn slow(delay: Duration) -> Self {
            Self::build(Box::new(|_, _| None), Some(delay))
        }

        fn build(fail: FailPolicy, delay: Option<Duration>) -> Self {
            Self {
                shared: Arc::new(Shared {
                    fail,
                    delay,
                    attempts: AtomicUsize::new(0),
                    deadlines: Mutex::new(Vec::new()),
                    sizes: Mutex::new(Vec::new()),
                    committed: Mutex::new(Vec::new()),
                }),
            }
        }

        fn calls(&self) -> usize {
            self.shared.attempts.load(Ordering::SeqCst)
        }

        fn sizes(&self) -> Vec<usize> {
            self.shared.sizes.lock().unwrap().clone()
        }

        fn committed(&self) -> Vec<String> {
            self.shared.committed.lock().unwrap().clone()
        }

        fn deadlines(&self) -> Vec<Option<Duration>> {
            self.shared.deadlines.lock().unwrap().clone()
        }
    }

    struct MockWindow {
        shared: Arc<Shared>,
        attempt: usize,
        staged: Vec<String>,
        pending_error: Option<StoreError>,
    }

    #[async_trait]
    impl BatchLoader for MockLoader {
        async fn begin(
            &self,
            deadline: Option<Duration>,
        ) -> Result<Box<dyn StagedWindow>, StoreError> {
            let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.deadlines.lock().unwrap().push(deadline);
            Ok(Box::new(MockWindow {
                shared: self.shared.clone(),
                attempt,
                staged: Vec::new(),
                pending_error: None,
            }))
        }
    }

    #[async_trait]
    impl StagedWindow for MockWindow {
        async fn create_staging(&mut self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn bulk_load(
            &mut self,
            rows: &[SessionRecord],
            _stamp: &WindowStamp,
        ) -> Result<u64, StoreError> {
            self.shared.sizes.lock().unwrap().push(rows.len());
            self.pending_error = (self.shared.fail)(self.attempt, rows.len());
            self.staged = rows.iter().map(|r| r.session_id.clone()).collect();
            Ok(rows.len() as u64)
        }

        async fn merge(&mut self, _stamp: &WindowStamp) -> Result<u64, StoreError> {
            if let Some(delay) = self.shared.delay {
                tokio::time::sleep(delay).await;
            }
            match self.pending_error.take() {
                Some(e) => Err(e),
                None => Ok(self.staged.len() as u64),
            }
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.shared.committed.lock().unwrap().extend(self.staged);
            Ok(())
        }

        async fn cleanup(self: Box<Self>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn records(n: usize) -> Vec<SessionRecord> {
        (0..n)
            .map(|i| SessionRecord::new(format!("s-{i:04}")).with_agent("agent"))
            .collect()
    }

    fn transient() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }

    fn config(batch_size: usize, min_batch_size: usize, max_retries: u32) -> BatchConfig {
        BatchConfig {
            batch_size,
            min_batch_size,
            max_retries,
            timeout_seconds: 0,
            throttle_interval_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_empty_input_never_touches_storage() {
        let loader = MockLoader::always_ok();
        let engine = BulkUpsertEngine::default();

        let report = engine.upsert_many(&loader, &[], false).await.unwrap();

        assert_eq!(report, BulkUpsertReport::default());
        assert_eq!(loader.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_window_when_batch_covers_input() {
        let loader = MockLoader::always_ok();
        let engine = BulkUpsertEngine::new(config(100, 1, 3));

        let report = engine.upsert_many(&loader, &records(40), false).await.unwrap();

        assert_eq!(loader.calls(), 1, "exactly one window write");
        assert_eq!(report.windows, 1);
        assert_eq!(report.records, 40);
        assert_eq!(loader.committed().len(), 40);
    }

    #[tokio::test]
    async fn test_windows_follow_input_order() {
        let loader = MockLoader::always_ok();
        let engine = BulkUpsertEngine::new(config(4, 1, 3));
        let input = records(10);

        let report = engine.upsert_many(&loader, &input, false).await.unwrap();

        assert_eq!(loader.sizes(), vec![4, 4, 2]);
        assert_eq!(report.windows, 3);
        let expected: Vec<String> = input.iter().map(|r| r.session_id.clone()).collect();
        assert_eq!(loader.committed(), expected);
    }

    #[tokio::test]
    async fn test_shrink_and_retry_commits_whole_window() {
        // First attempt at full size fails, everything after succeeds.
        let loader = MockLoader::new(|attempt, _| (attempt == 1).then(transient));
        let engine = BulkUpsertEngine::new(config(8, 1, 3));

        let report = engine.upsert_many(&loader, &records(8), false).await.unwrap();

        assert_eq!(loader.sizes(), vec![8, 4, 4]);
        assert_eq!(report.shrinks, 1);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.windows, 2);
        assert_eq!(loader.committed().len(), 8, "all records committed");
    }

    #[tokio::test]
    async fn test_next_window_resets_to_batch_size_after_shrink() {
        let loader = MockLoader::new(|_, size| (size == 10).then(transient));
        let engine = BulkUpsertEngine::new(config(10, 1, 3));

        engine.upsert_many(&loader, &records(25), false).await.unwrap();

        // 10 fails -> 5 ok -> next window tries 10 again (and shrinks again)
        assert_eq!(loader.sizes(), vec![10, 5, 10, 5, 10, 5, 10, 5, 5]);
        assert_eq!(loader.committed().len(), 25);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_prior_windows_committed() {
        // Everything after the first window fails.
        let loader = MockLoader::new(|attempt, _| (attempt >= 2).then(transient));
        let engine = BulkUpsertEngine::new(config(4, 1, 3));
        let input = records(12);

        let err = engine.upsert_many(&loader, &input, false).await.unwrap_err();

        assert!(matches!(err, StoreError::Database(_)));
        assert_eq!(
            loader.sizes(),
            vec![4, 4, 2, 1],
            "max_retries bounds total attempts per window"
        );
        let committed = loader.committed();
        assert_eq!(committed.len(), 4);
        assert_eq!(committed.first().map(String::as_str), Some("s-0000"));
        assert_eq!(committed.last().map(String::as_str), Some("s-0003"));
    }

    #[tokio::test]
    async fn test_stops_at_min_batch_size() {
        let loader = MockLoader::new(|_, _| Some(transient()));
        let engine = BulkUpsertEngine::new(config(8, 4, 10));

        let err = engine.upsert_many(&loader, &records(8), false).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(loader.sizes(), vec![8, 4]);
        assert!(loader.committed().is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let loader = MockLoader::new(|_, _| Some(StoreError::Decode("bad document".into())));
        let engine = BulkUpsertEngine::new(config(8, 1, 3));

        let err = engine.upsert_many(&loader, &records(8), false).await.unwrap_err();

        assert!(matches!(err, StoreError::Decode(_)));
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_record_rejected_before_any_write() {
        let loader = MockLoader::always_ok();
        let engine = BulkUpsertEngine::default();
        let mut input = records(3);
        input.push(SessionRecord::new(""));

        let err = engine.upsert_many(&loader, &input, false).await.unwrap_err();

        assert!(matches!(err, StoreError::InvalidRecord(_)));
        assert_eq!(loader.calls(), 0);
    }

    #[tokio::test]
    async fn test_attempt_deadline_is_a_retryable_failure() {
        let loader = MockLoader::slow(Duration::from_millis(1_500));
        let engine = BulkUpsertEngine::new(BatchConfig {
            timeout_seconds: 1,
            ..config(2, 1, 2)
        });

        let err = engine.upsert_many(&loader, &records(2), false).await.unwrap_err();

        assert!(matches!(err, StoreError::Timeout { millis: 1000 }));
        assert_eq!(loader.sizes(), vec![2, 1], "timed-out window was shrunk and retried");
        assert!(loader.committed().is_empty());
    }

    #[tokio::test]
    async fn test_loader_receives_attempt_deadline() {
        let loader = MockLoader::always_ok();
        let bounded = BulkUpsertEngine::new(BatchConfig {
            timeout_seconds: 7,
            ..config(2, 1, 3)
        });
        bounded.upsert_many(&loader, &records(4), false).await.unwrap();

        let unbounded = BulkUpsertEngine::new(config(4, 1, 3));
        unbounded.upsert_many(&loader, &records(4), false).await.unwrap();

        assert_eq!(
            loader.deadlines(),
            vec![
                Some(Duration::from_secs(7)),
                Some(Duration::from_secs(7)),
                None
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_prevents_further_windows() {
        let loader = MockLoader::always_ok();
        let engine = BulkUpsertEngine::new(config(2, 1, 3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .upsert_many_cancellable(&loader, &records(4), false, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(loader.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_throttle_keeps_committed_prefix() {
        let loader = MockLoader::always_ok();
        let engine = BulkUpsertEngine::new(BatchConfig {
            throttle_interval_ms: 10_000,
            ..config(2, 1, 3)
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = engine
            .upsert_many_cancellable(&loader, &records(6), false, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(loader.committed().len(), 2, "first window stays committed");
        assert_eq!(loader.calls(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let engine = BulkUpsertEngine::new(config(100, 10, 3));
        let err = transient();

        assert_eq!(
            engine.transition(100, 1, Ok(())),
            WindowState::Committed { size: 100 }
        );
        assert_eq!(
            engine.transition(100, 1, Err(&err)),
            WindowState::Retrying {
                next_size: 50,
                attempt: 2
            }
        );
        assert_eq!(
            engine.transition(15, 2, Err(&err)),
            WindowState::Retrying {
                next_size: 10,
                attempt: 3
            },
            "never shrinks below min_batch_size"
        );
        assert_eq!(engine.transition(50, 3, Err(&err)), WindowState::Exhausted);
        assert_eq!(engine.transition(10, 1, Err(&err)), WindowState::Exhausted);
        assert_eq!(
            engine.transition(100, 1, Err(&StoreError::Cancelled)),
            WindowState::Exhausted
        );
        assert_eq!(engine.initial_size(7), 7);
        assert_eq!(engine.initial_size(700), 100);
    }
}
