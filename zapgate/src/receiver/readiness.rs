//! Readiness checker: prove the receiver is tuned and delivering.
//!
//! Polls the status endpoint with a jittered interval until the ready
//! predicate holds for a debounce window. Concurrent waiters for the same
//! service share one poll loop; a caller's cancel surfaces only to that
//! caller while the shared loop keeps running for the others.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{StatusSource, TunerStatus};
use crate::config::ReadinessConfig;
use crate::utils::time::jittered;
use crate::{Error, Result};

/// Terminal outcome of a readiness wait, used as a metric label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    Timeout,
    /// Timed out while the tuner sat on a different service.
    TimeoutRefMismatch,
    /// The caller cancelled; the shared poll may still be running.
    Cancelled,
    Error(String),
}

impl ReadinessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReadinessOutcome::Ready => "ready",
            ReadinessOutcome::Timeout => "timeout",
            ReadinessOutcome::TimeoutRefMismatch => "timeout_ref_mismatch",
            ReadinessOutcome::Cancelled => "cancelled",
            ReadinessOutcome::Error(_) => "error",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Ready)
    }
}

type SharedResult = watch::Receiver<Option<ReadinessOutcome>>;

/// Readiness checker with per-service singleflight.
pub struct ReadinessChecker<S: StatusSource> {
    source: Arc<S>,
    config: ReadinessConfig,
    in_flight: Arc<DashMap<String, Arc<OnceCell<SharedResult>>>>,
}

impl<S: StatusSource> ReadinessChecker<S> {
    pub fn new(source: Arc<S>, config: ReadinessConfig) -> Self {
        Self {
            source,
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Wait until the receiver is tuned to `service_ref` and ready.
    ///
    /// `cancel` belongs to the caller: cancelling it returns `Cancelled`
    /// here without touching the shared poll loop other waiters hang on.
    pub async fn wait_ready(
        &self,
        service_ref: &str,
        cancel: &CancellationToken,
    ) -> ReadinessOutcome {
        let cell = self
            .in_flight
            .entry(service_ref.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut rx = cell
            .get_or_init(|| async { self.spawn_poll(service_ref.to_string()) })
            .await
            .clone();

        tokio::select! {
            _ = cancel.cancelled() => ReadinessOutcome::Cancelled,
            result = rx.wait_for(|v| v.is_some()) => match result {
                Ok(guard) => guard.clone().expect("guarded by wait_for"),
                Err(_) => ReadinessOutcome::Error("poll task dropped".into()),
            },
        }
    }

    /// Spawn the shared poll loop; its lifetime is bounded by the poll
    /// budget alone, never by any caller.
    fn spawn_poll(&self, service_ref: String) -> SharedResult {
        let (tx, rx) = watch::channel(None);
        let source = self.source.clone();
        let config = self.config.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let outcome = poll_until_ready(&*source, &service_ref, &config).await;
            debug!(service_ref = %service_ref, outcome = outcome.label(), "readiness poll finished");
            let _ = tx.send(Some(outcome));
            in_flight.remove(&service_ref);
        });

        rx
    }

    /// One-shot verification that the receiver still serves `service_ref`.
    ///
    /// Run after readiness, before the transcoder spawns: a drifted tuner
    /// here means another zap raced ours and the session must fail fast.
    pub async fn check_invariant(&self, service_ref: &str) -> Result<()> {
        let status = self.source.status().await?;

        if status.current_ref != service_ref {
            return Err(Error::RefMismatch {
                expected: service_ref.to_string(),
                actual: status.current_ref,
            });
        }

        Ok(())
    }
}

/// The ready predicate; all conditions must hold in the same poll.
fn ready_predicate(status: &TunerStatus, service_ref: &str) -> bool {
    status.current_ref == service_ref
        && status.snr > 0
        && !status.standby
        && status.video_pid > 0
        && status.pmt_pid > 0
}

async fn poll_until_ready<S: StatusSource>(
    source: &S,
    service_ref: &str,
    config: &ReadinessConfig,
) -> ReadinessOutcome {
    let mut consecutive = 0u32;
    let mut last_ref = String::new();
    let mut last_error: Option<String> = None;

    for poll in 0..config.max_polls {
        match source.status().await {
            Ok(status) => {
                last_ref = status.current_ref.clone();
                last_error = None;

                if ready_predicate(&status, service_ref) {
                    consecutive += 1;
                    if consecutive >= config.debounce_polls {
                        return ReadinessOutcome::Ready;
                    }
                } else {
                    consecutive = 0;
                }
            }
            Err(e) => {
                consecutive = 0;
                last_error = Some(e.to_string());
            }
        }

        if poll + 1 < config.max_polls {
            tokio::time::sleep(jittered(config.poll_interval, config.poll_jitter)).await;
        }
    }

    if let Some(error) = last_error {
        return ReadinessOutcome::Error(error);
    }

    if !last_ref.is_empty() && last_ref != service_ref {
        ReadinessOutcome::TimeoutRefMismatch
    } else {
        ReadinessOutcome::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const SERVICE: &str = "1:0:19:132F:3EF:1:C00000:0:0:0:";

    fn ready_status() -> TunerStatus {
        TunerStatus {
            current_ref: SERVICE.to_string(),
            snr: 68,
            standby: false,
            video_pid: 1101,
            pmt_pid: 110,
        }
    }

    /// Replays a scripted sequence; repeats the last element forever.
    struct ScriptedSource {
        script: Mutex<VecDeque<TunerStatus>>,
        last: Mutex<Option<TunerStatus>>,
        polls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(script: Vec<TunerStatus>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                polls: AtomicU32::new(0),
            })
        }

        fn poll_count(&self) -> u32 {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn status(&self) -> Result<TunerStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(status) => {
                    *self.last.lock() = Some(status.clone());
                    Ok(status)
                }
                None => self
                    .last
                    .lock()
                    .clone()
                    .ok_or_else(|| Error::upstream("no status scripted")),
            }
        }
    }

    fn fast_config(max_polls: u32) -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: Duration::from_millis(5),
            poll_jitter: Duration::from_millis(1),
            max_polls,
            debounce_polls: 2,
        }
    }

    #[tokio::test]
    async fn becomes_ready_after_debounce() {
        let source = ScriptedSource::new(vec![ready_status(), ready_status()]);
        let checker = ReadinessChecker::new(source.clone(), fast_config(10));

        let outcome = checker.wait_ready(SERVICE, &CancellationToken::new()).await;
        assert!(outcome.is_ready());
        assert_eq!(source.poll_count(), 2, "two consecutive polls suffice");
    }

    #[tokio::test]
    async fn single_good_poll_is_not_enough() {
        // One good poll, then the tuner regresses: debounce must hold it back.
        let mut bad = ready_status();
        bad.snr = 0;
        let source = ScriptedSource::new(vec![ready_status(), bad]);
        let checker = ReadinessChecker::new(source, fast_config(6));

        let outcome = checker.wait_ready(SERVICE, &CancellationToken::new()).await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome, ReadinessOutcome::Timeout);
    }

    #[tokio::test]
    async fn standby_and_missing_pids_block_readiness() {
        let mut standby = ready_status();
        standby.standby = true;
        let source = ScriptedSource::new(vec![standby]);
        let checker = ReadinessChecker::new(source, fast_config(3));
        assert!(!checker.wait_ready(SERVICE, &CancellationToken::new()).await.is_ready());

        let mut no_pid = ready_status();
        no_pid.video_pid = 0;
        let source = ScriptedSource::new(vec![no_pid]);
        let checker = ReadinessChecker::new(source, fast_config(3));
        assert!(!checker.wait_ready(SERVICE, &CancellationToken::new()).await.is_ready());
    }

    #[tokio::test]
    async fn mismatch_gets_its_own_timeout_label() {
        let mut elsewhere = ready_status();
        elsewhere.current_ref = "1:0:19:FFFF:3EF:1:C00000:0:0:0:".into();
        let source = ScriptedSource::new(vec![elsewhere]);
        let checker = ReadinessChecker::new(source, fast_config(3));

        let outcome = checker.wait_ready(SERVICE, &CancellationToken::new()).await;
        assert_eq!(outcome, ReadinessOutcome::TimeoutRefMismatch);
        assert_eq!(outcome.label(), "timeout_ref_mismatch");
    }

    #[tokio::test]
    async fn concurrent_waiters_share_one_poll_loop() {
        let source = ScriptedSource::new(vec![ready_status(), ready_status()]);
        let checker = Arc::new(ReadinessChecker::new(source.clone(), fast_config(10)));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let checker = checker.clone();
            handles.push(tokio::spawn(async move {
                checker.wait_ready(SERVICE, &CancellationToken::new()).await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ready());
        }
        assert_eq!(source.poll_count(), 2, "singleflight shares the poll");
    }

    #[tokio::test]
    async fn caller_cancel_is_local_to_the_caller() {
        // Script never becomes ready within the first polls, so the loop
        // is still running when the first caller cancels.
        let mut bad = ready_status();
        bad.snr = 0;
        let mut script = vec![bad; 8];
        script.push(ready_status());
        script.push(ready_status());
        let source = ScriptedSource::new(script);
        let checker = Arc::new(ReadinessChecker::new(source, fast_config(30)));

        let cancelled_caller = CancellationToken::new();
        cancelled_caller.cancel();
        let outcome = checker.wait_ready(SERVICE, &cancelled_caller).await;
        assert_eq!(outcome, ReadinessOutcome::Cancelled);

        // The shared loop keeps polling and serves the second caller.
        let outcome = checker.wait_ready(SERVICE, &CancellationToken::new()).await;
        assert!(outcome.is_ready());
    }

    #[tokio::test]
    async fn check_invariant_detects_drift() {
        let source = ScriptedSource::new(vec![ready_status()]);
        let checker = ReadinessChecker::new(source, fast_config(3));
        assert!(checker.check_invariant(SERVICE).await.is_ok());

        let mut drifted = ready_status();
        drifted.current_ref = "1:0:19:AAAA".into();
        let source = ScriptedSource::new(vec![drifted]);
        let checker = ReadinessChecker::new(source, fast_config(3));
        assert!(matches!(
            checker.check_invariant(SERVICE).await,
            Err(Error::RefMismatch { .. })
        ));
    }
}
