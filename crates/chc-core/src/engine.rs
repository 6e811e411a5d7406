//! Bulk deletion loop.
//!
//! A run probes message ids downward from `boundary - 1` to `1`, deleting each
//! one through the [`ChannelService`]. Every candidate is attempted exactly once
//! and the boundary message itself is never touched. Ids that no longer exist
//! are counted as skips; other failures are counted as skips too, but also feed
//! the consecutive-failure ceiling and trigger a backoff pause.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelService, DeleteOutcome},
    domain::{ChatId, MessageId},
    Error,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minimum spacing between two delete attempts, whatever their outcome.
    pub request_delay: Duration,
    /// Pause after a non-skip failure (replaces `request_delay` when longer).
    pub failure_backoff: Duration,
    /// Uninterrupted non-skip failures that abort the run.
    pub max_consecutive_failures: u32,
    /// Progress is reported every `progress_every` successful deletions.
    pub progress_every: u64,
    /// Upper bound for a single delete call; `None` waits forever.
    pub delete_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(100),
            failure_backoff: Duration::from_millis(1000),
            max_consecutive_failures: 10,
            progress_every: 20,
            delete_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    AbortedTooManyFailures,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunResult {
    pub deleted: u64,
    pub skipped: u64,
    pub outcome: RunOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunProgress {
    pub deleted: u64,
    pub skipped: u64,
}

/// Receives incremental counts while a run is in flight.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, progress: RunProgress);
}

/// Classified result of one delete attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    Deleted,
    /// Message already absent. Not a failure.
    Skipped,
    /// Any other error (rate limit, permission, timeout, transport).
    Failed,
}

/// What one delete call produced before accounting.
enum Call {
    Done(Attempt),
    /// Rate limited; the remote wants this much quiet time first.
    RetryAfter(Duration),
}

/// Loop state of one run: cursor plus run-scoped counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunState {
    pub channel_id: ChatId,
    pub boundary: MessageId,
    cursor: i32,
    pub deleted: u64,
    pub skipped: u64,
    pub consecutive_failures: u32,
}

impl RunState {
    pub fn new(channel_id: ChatId, boundary: MessageId) -> Self {
        Self {
            channel_id,
            boundary,
            cursor: boundary.0.saturating_sub(1),
            deleted: 0,
            skipped: 0,
            consecutive_failures: 0,
        }
    }

    /// Next id to attempt, or `None` once the sweep reached the lower bound.
    pub fn next_candidate(&self) -> Option<MessageId> {
        (self.cursor >= 1).then_some(MessageId(self.cursor))
    }

    /// Account for the attempt on the current candidate and move the cursor down.
    pub fn record(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::Deleted => {
                self.deleted += 1;
                self.consecutive_failures = 0;
            }
            Attempt::Skipped => self.skipped += 1,
            Attempt::Failed => {
                self.skipped += 1;
                self.consecutive_failures += 1;
            }
        }
        self.cursor -= 1;
    }

    pub fn ceiling_reached(&self, ceiling: u32) -> bool {
        self.consecutive_failures >= ceiling
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            deleted: self.deleted,
            skipped: self.skipped,
        }
    }

    pub fn finish(&self, outcome: RunOutcome) -> RunResult {
        RunResult {
            deleted: self.deleted,
            skipped: self.skipped,
            outcome,
        }
    }
}

#[derive(Clone)]
pub struct DeletionEngine {
    channels: Arc<dyn ChannelService>,
    cfg: EngineConfig,
}

impl DeletionEngine {
    pub fn new(channels: Arc<dyn ChannelService>, cfg: EngineConfig) -> Self {
        Self { channels, cfg }
    }

    /// Delete every message strictly older than `boundary` in `channel_id`.
    ///
    /// `cancel` is checked before each attempt and interrupts the pauses between
    /// attempts; an in-flight delete call is always allowed to finish. A rate
    /// limited attempt is retried once after the requested wait; a second rate
    /// limit counts as a failure and stretches the following pause.
    pub async fn run(
        &self,
        channel_id: ChatId,
        boundary: MessageId,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> RunResult {
        let mut st = RunState::new(channel_id, boundary);
        info!(
            channel_id = channel_id.0,
            boundary = boundary.0,
            "deletion run started"
        );

        let outcome = loop {
            let Some(message_id) = st.next_candidate() else {
                break RunOutcome::Completed;
            };
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }

            let mut call = self.attempt(channel_id, message_id).await;
            if let Call::RetryAfter(wait) = call {
                pause(cancel, wait).await;
                if cancel.is_cancelled() {
                    break RunOutcome::Cancelled;
                }
                call = self.attempt(channel_id, message_id).await;
            }
            let (attempt, retry_after) = match call {
                Call::Done(attempt) => (attempt, Duration::ZERO),
                Call::RetryAfter(wait) => (Attempt::Failed, wait),
            };
            st.record(attempt);

            if attempt == Attempt::Deleted && st.deleted % self.cfg.progress_every.max(1) == 0 {
                progress.on_progress(st.progress()).await;
            }

            if st.ceiling_reached(self.cfg.max_consecutive_failures) {
                break RunOutcome::AbortedTooManyFailures;
            }

            if st.next_candidate().is_some() {
                pause(cancel, self.delay_after(attempt).max(retry_after)).await;
            }
        };

        let result = st.finish(outcome);
        info!(
            channel_id = channel_id.0,
            boundary = boundary.0,
            deleted = result.deleted,
            skipped = result.skipped,
            outcome = ?result.outcome,
            "deletion run finished"
        );
        result
    }

    async fn attempt(&self, channel_id: ChatId, message_id: MessageId) -> Call {
        let call = self.channels.delete_message(channel_id, message_id);
        let res = match self.cfg.delete_timeout {
            Some(limit) => timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(limit))),
            None => call.await,
        };

        match res {
            Ok(DeleteOutcome::Deleted) => {
                debug!(message_id = message_id.0, "deleted");
                Call::Done(Attempt::Deleted)
            }
            Ok(DeleteOutcome::NotFound) => {
                debug!(message_id = message_id.0, "not found, skipping");
                Call::Done(Attempt::Skipped)
            }
            Err(Error::RateLimited(wait)) => {
                debug!(message_id = message_id.0, wait = ?wait, "rate limited");
                Call::RetryAfter(wait)
            }
            Err(e) => {
                warn!(
                    channel_id = channel_id.0,
                    message_id = message_id.0,
                    error = %e,
                    "failed to delete message"
                );
                Call::Done(Attempt::Failed)
            }
        }
    }

    fn delay_after(&self, attempt: Attempt) -> Duration {
        match attempt {
            Attempt::Failed => self.cfg.request_delay.max(self.cfg.failure_backoff),
            Attempt::Deleted | Attempt::Skipped => self.cfg.request_delay,
        }
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = sleep(delay) => {}
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Membership, MemberRole},
        domain::UserId,
        Result,
    };
    use std::sync::Mutex;
    use tokio::time::Instant;

    type Script = Box<dyn Fn(i32) -> Result<DeleteOutcome> + Send + Sync>;

    struct FakeChannel {
        script: Script,
        attempts: Mutex<Vec<i32>>,
        cancel_after_deletes: Option<(usize, CancellationToken)>,
        deletes: Mutex<usize>,
    }

    impl FakeChannel {
        fn new(script: impl Fn(i32) -> Result<DeleteOutcome> + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                attempts: Mutex::new(Vec::new()),
                cancel_after_deletes: None,
                deletes: Mutex::new(0),
            }
        }

        fn attempts(&self) -> Vec<i32> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelService for FakeChannel {
        async fn owner(&self, _channel_id: ChatId) -> Result<Option<UserId>> {
            Ok(None)
        }

        async fn membership(&self, _channel_id: ChatId, _user_id: UserId) -> Result<Membership> {
            Ok(Membership {
                role: MemberRole::Member,
                can_delete_messages: false,
            })
        }

        async fn delete_message(
            &self,
            _channel_id: ChatId,
            message_id: MessageId,
        ) -> Result<DeleteOutcome> {
            self.attempts.lock().unwrap().push(message_id.0);
            let out = (self.script)(message_id.0);
            if matches!(out, Ok(DeleteOutcome::Deleted)) {
                let mut n = self.deletes.lock().unwrap();
                *n += 1;
                if let Some((limit, token)) = &self.cancel_after_deletes {
                    if *n == *limit {
                        token.cancel();
                    }
                }
            }
            out
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<RunProgress>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn on_progress(&self, progress: RunProgress) {
            self.seen.lock().unwrap().push(progress);
        }
    }

    fn cfg() -> EngineConfig {
        EngineConfig {
            request_delay: Duration::from_millis(100),
            failure_backoff: Duration::from_millis(1000),
            max_consecutive_failures: 10,
            progress_every: 10,
            delete_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn fail() -> Result<DeleteOutcome> {
        Err(Error::External("Too Many Requests".to_string()))
    }

    const CHANNEL: ChatId = ChatId(-1001);

    async fn run_with(channel: Arc<FakeChannel>, boundary: i32) -> (RunResult, RecordingSink) {
        let engine = DeletionEngine::new(channel, cfg());
        let sink = RecordingSink::default();
        let res = engine
            .run(CHANNEL, MessageId(boundary), &CancellationToken::new(), &sink)
            .await;
        (res, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn boundary_at_or_below_one_does_no_work() {
        for b in [1, 0, -5, i32::MIN] {
            let ch = Arc::new(FakeChannel::new(|_| Ok(DeleteOutcome::Deleted)));
            let (res, _) = run_with(ch.clone(), b).await;
            assert_eq!(
                res,
                RunResult {
                    deleted: 0,
                    skipped: 0,
                    outcome: RunOutcome::Completed
                }
            );
            assert!(ch.attempts().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_everything_below_boundary_in_decreasing_order() {
        let ch = Arc::new(FakeChannel::new(|_| Ok(DeleteOutcome::Deleted)));
        let (res, sink) = run_with(ch.clone(), 50).await;

        assert_eq!(res.deleted, 49);
        assert_eq!(res.skipped, 0);
        assert_eq!(res.outcome, RunOutcome::Completed);

        let attempts = ch.attempts();
        assert_eq!(attempts, (1..=49).rev().collect::<Vec<_>>());
        assert!(!attempts.contains(&50));

        let seen: Vec<u64> = sink.seen.lock().unwrap().iter().map(|p| p.deleted).collect();
        assert_eq!(seen, vec![10, 20, 30, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn already_deleted_messages_are_skips_without_backoff() {
        let ch = Arc::new(FakeChannel::new(|_| Ok(DeleteOutcome::NotFound)));
        let engine = DeletionEngine::new(
            ch.clone(),
            EngineConfig {
                request_delay: Duration::ZERO,
                failure_backoff: Duration::from_secs(5),
                max_consecutive_failures: 3,
                ..cfg()
            },
        );
        let start = Instant::now();
        let res = engine
            .run(
                CHANNEL,
                MessageId(10),
                &CancellationToken::new(),
                &RecordingSink::default(),
            )
            .await;

        assert_eq!(
            res,
            RunResult {
                deleted: 0,
                skipped: 9,
                outcome: RunOutcome::Completed
            }
        );
        // More skips than the ceiling, and no backoff was ever slept.
        assert_eq!(Instant::now() - start, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_abort_at_ceiling() {
        let ch = Arc::new(FakeChannel::new(|_| fail()));
        let (res, sink) = run_with(ch.clone(), 21).await;

        assert_eq!(
            res,
            RunResult {
                deleted: 0,
                skipped: 10,
                outcome: RunOutcome::AbortedTooManyFailures
            }
        );
        assert_eq!(ch.attempts().len(), 10);
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_before_next_attempt() {
        let ch = Arc::new(FakeChannel::new(|id| {
            if id == 3 {
                fail()
            } else {
                Ok(DeleteOutcome::Deleted)
            }
        }));
        let start = Instant::now();
        let (res, _) = run_with(ch, 4).await;

        assert_eq!(res.deleted, 2);
        assert_eq!(res.skipped, 1);
        // 3 fails -> 1000ms backoff, 2 ok -> 100ms, 1 is last -> no pause.
        assert_eq!(Instant::now() - start, Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn a_single_success_resets_the_failure_counter() {
        // 30..=22 fail (9), 21 ok, 20..=12 fail (9), the rest ok.
        let ch = Arc::new(FakeChannel::new(|id| match id {
            22..=30 | 12..=20 => fail(),
            _ => Ok(DeleteOutcome::Deleted),
        }));
        let (res, _) = run_with(ch.clone(), 31).await;

        assert_eq!(res.outcome, RunOutcome::Completed);
        assert_eq!(res.skipped, 18);
        assert_eq!(res.deleted, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_do_not_reset_or_grow_the_failure_counter() {
        let mut st = RunState::new(CHANNEL, MessageId(100));
        for _ in 0..4 {
            st.record(Attempt::Failed);
        }
        st.record(Attempt::Skipped);
        assert_eq!(st.consecutive_failures, 4);
        st.record(Attempt::Deleted);
        assert_eq!(st.consecutive_failures, 0);
        assert_eq!(st.next_candidate(), Some(MessageId(93)));
    }

    #[tokio::test(start_paused = true)]
    async fn counts_always_match_attempts() {
        let scripts: Vec<fn(i32) -> Result<DeleteOutcome>> = vec![
            |id| match id % 3 {
                0 => Ok(DeleteOutcome::Deleted),
                1 => Ok(DeleteOutcome::NotFound),
                _ => fail(),
            },
            |id| if id % 7 == 0 { fail() } else { Ok(DeleteOutcome::NotFound) },
            |id| if id < 30 { fail() } else { Ok(DeleteOutcome::Deleted) },
        ];
        for script in scripts {
            let ch = Arc::new(FakeChannel::new(script));
            let (res, _) = run_with(ch.clone(), 60).await;
            assert_eq!(res.deleted + res.skipped, ch.attempts().len() as u64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_next_attempt() {
        let token = CancellationToken::new();
        let mut ch = FakeChannel::new(|_| Ok(DeleteOutcome::Deleted));
        ch.cancel_after_deletes = Some((5, token.clone()));
        let ch = Arc::new(ch);

        let engine = DeletionEngine::new(ch.clone(), cfg());
        let res = engine
            .run(CHANNEL, MessageId(100), &token, &RecordingSink::default())
            .await;

        assert_eq!(
            res,
            RunResult {
                deleted: 5,
                skipped: 0,
                outcome: RunOutcome::Cancelled
            }
        );
        assert_eq!(ch.attempts(), vec![99, 98, 97, 96, 95]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_pause() {
        let ch = Arc::new(FakeChannel::new(|_| Ok(DeleteOutcome::Deleted)));
        let engine = DeletionEngine::new(
            ch.clone(),
            EngineConfig {
                request_delay: Duration::from_secs(1),
                ..cfg()
            },
        );
        let token = CancellationToken::new();
        let start = Instant::now();

        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                engine
                    .run(CHANNEL, MessageId(100), &token, &RecordingSink::default())
                    .await
            })
        };

        sleep(Duration::from_millis(2500)).await;
        token.cancel();
        let res = handle.await.unwrap();

        assert_eq!(res.outcome, RunOutcome::Cancelled);
        // Attempts at t=0s, 1s, 2s; the pause towards 3s is cut short.
        assert_eq!(res.deleted, 3);
        assert_eq!(Instant::now() - start, Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_attempt_is_retried_after_the_wait() {
        let limited = std::sync::atomic::AtomicBool::new(false);
        let ch = Arc::new(FakeChannel::new(move |id| {
            if id == 3 && !limited.swap(true, std::sync::atomic::Ordering::SeqCst) {
                Err(Error::RateLimited(Duration::from_secs(30)))
            } else {
                Ok(DeleteOutcome::Deleted)
            }
        }));
        let start = Instant::now();
        let (res, _) = run_with(ch.clone(), 4).await;

        assert_eq!(res.deleted, 3);
        assert_eq!(res.skipped, 0);
        assert_eq!(ch.attempts(), vec![3, 3, 2, 1]);
        assert_eq!(Instant::now() - start, Duration::from_millis(30_200));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_rate_limit_counts_as_failure_and_stretches_the_pause() {
        let ch = Arc::new(FakeChannel::new(|id| {
            if id == 3 {
                Err(Error::RateLimited(Duration::from_secs(5)))
            } else {
                Ok(DeleteOutcome::Deleted)
            }
        }));
        let start = Instant::now();
        let (res, _) = run_with(ch.clone(), 4).await;

        assert_eq!(res.deleted, 2);
        assert_eq!(res.skipped, 1);
        assert_eq!(ch.attempts(), vec![3, 3, 2, 1]);
        // 5s retry wait, then 5s instead of the 1s backoff, then 100ms.
        assert_eq!(Instant::now() - start, Duration::from_millis(10_100));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_seen_during_a_rate_limit_wait() {
        let ch = Arc::new(FakeChannel::new(|_| {
            Err(Error::RateLimited(Duration::from_secs(60)))
        }));
        let engine = DeletionEngine::new(ch.clone(), cfg());
        let token = CancellationToken::new();
        let start = Instant::now();

        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                engine
                    .run(CHANNEL, MessageId(100), &token, &RecordingSink::default())
                    .await
            })
        };

        sleep(Duration::from_millis(500)).await;
        token.cancel();
        let res = handle.await.unwrap();

        assert_eq!(
            res,
            RunResult {
                deleted: 0,
                skipped: 0,
                outcome: RunOutcome::Cancelled
            }
        );
        assert_eq!(ch.attempts(), vec![99]);
        assert_eq!(Instant::now() - start, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_delete_calls_time_out_as_failures() {
        struct Stalled;

        #[async_trait]
        impl ChannelService for Stalled {
            async fn owner(&self, _c: ChatId) -> Result<Option<UserId>> {
                Ok(None)
            }
            async fn membership(&self, _c: ChatId, _u: UserId) -> Result<Membership> {
                Err(Error::External("unused".to_string()))
            }
            async fn delete_message(&self, _c: ChatId, _m: MessageId) -> Result<DeleteOutcome> {
                std::future::pending().await
            }
        }

        let engine = DeletionEngine::new(
            Arc::new(Stalled),
            EngineConfig {
                max_consecutive_failures: 2,
                ..cfg()
            },
        );
        let res = engine
            .run(
                CHANNEL,
                MessageId(10),
                &CancellationToken::new(),
                &RecordingSink::default(),
            )
            .await;

        assert_eq!(res.outcome, RunOutcome::AbortedTooManyFailures);
        assert_eq!(res.skipped, 2);
    }
}
