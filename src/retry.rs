//! Bounded retry for backend calls.
//!
//! Each call is a small state machine:
//!
//! ```text
//! Attempt(n) ──ok──────────────────────────────▶ Succeeded
//!     │
//!     ├─transient, n <= max_retries─▶ wait backoff(n) ─▶ Attempt(n + 1)
//!     ├─transient, n >  max_retries─▶ Failed
//!     └─permanent / unsupported─────▶ Failed
//! ```
//!
//! Backoff doubles from `base_delay` (1x, 2x, 4x, ... capped at 32x). A
//! permit from the run-wide limiter is held only while a call is in flight,
//! never while waiting out a backoff.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{AnalysisBackend, BackendRequest};
use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before the attempt following attempt `n` (1-based).
    pub fn backoff(&self, n: u32) -> Duration {
        self.base_delay * (1u32 << n.saturating_sub(1).min(5))
    }

    /// Decide what follows a failed attempt `n`.
    pub fn on_failure(&self, n: u32, error: &BackendError) -> Transition {
        if error.is_transient() && n <= self.max_retries {
            Transition::Retry {
                next: n + 1,
                delay: self.backoff(n),
            }
        } else {
            Transition::GiveUp
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Retry { next: u32, delay: Duration },
    GiveUp,
}

/// Final result of a call and how many attempts it took.
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<Value, BackendError>,
    pub attempts: u32,
}

impl CallOutcome {
    /// False when cancellation arrived before the first attempt started.
    pub fn was_dispatched(&self) -> bool {
        self.attempts > 0
    }
}

/// Shared per-run resources every call draws on.
pub struct CallContext<'a> {
    pub policy: RetryPolicy,
    pub limiter: &'a Semaphore,
    pub cancel: &'a CancellationToken,
    pub calls: &'a AtomicU64,
}

/// Run `request` against `backend`, retrying transient failures.
///
/// Cancellation stops further retries; an attempt already in flight is
/// allowed to finish.
pub async fn call_with_retry(
    backend: &dyn AnalysisBackend,
    request: &BackendRequest,
    ctx: &CallContext<'_>,
) -> CallOutcome {
    let mut attempt = 1;
    let mut last_error: Option<BackendError> = None;
    loop {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            permit = ctx.limiter.acquire() => permit.ok(),
        };
        let result = match permit {
            Some(_permit) => {
                ctx.calls.fetch_add(1, Ordering::Relaxed);
                backend.analyze(request).await
            }
            None => {
                return CallOutcome {
                    result: Err(last_error
                        .unwrap_or_else(|| BackendError::permanent("cancelled before dispatch"))),
                    attempts: attempt - 1,
                }
            }
        };

        let error = match result {
            Ok(value) => {
                return CallOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(error) => error,
        };

        match ctx.policy.on_failure(attempt, &error) {
            Transition::Retry { next, delay } if !ctx.cancel.is_cancelled() => {
                warn!(
                    backend = backend.id(),
                    path = %request.file.path,
                    kind = %request.kind,
                    attempt,
                    error = %error,
                    "transient backend failure, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        return CallOutcome { result: Err(error), attempts: attempt };
                    }
                }
                last_error = Some(error);
                attempt = next;
            }
            _ => {
                debug!(backend = backend.id(), attempt, error = %error, "giving up");
                return CallOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileMeta;
    use crate::models::{TaskKind, Unit};
    use crate::source::Language;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays a fixed sequence of outcomes.
    struct Scripted {
        outcomes: Mutex<Vec<Result<Value, BackendError>>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<Value, BackendError>>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl AnalysisBackend for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }
        fn task_kinds(&self) -> &[TaskKind] {
            &[TaskKind::Analysis]
        }
        async fn analyze(&self, _request: &BackendRequest) -> Result<Value, BackendError> {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(BackendError::permanent("script exhausted")))
        }
    }

    fn request() -> BackendRequest {
        BackendRequest {
            kind: TaskKind::Analysis,
            unit: Unit::WholeFile,
            text: String::new(),
            file: FileMeta {
                path: "a.py".to_string(),
                source_path: "a.py".to_string(),
                language: Language::Python,
                size: 0,
                chunk_count: 0,
            },
            context: None,
        }
    }

    async fn run(backend: &Scripted, max_retries: u32) -> (CallOutcome, u64) {
        let limiter = Semaphore::new(1);
        let cancel = CancellationToken::new();
        let calls = AtomicU64::new(0);
        let ctx = CallContext {
            policy: RetryPolicy::new(max_retries, Duration::ZERO),
            limiter: &limiter,
            cancel: &cancel,
            calls: &calls,
        };
        let outcome = call_with_retry(backend, &request(), &ctx).await;
        (outcome, calls.load(Ordering::Relaxed))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(9), Duration::from_millis(3200));
    }

    #[test]
    fn transitions() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let transient = BackendError::transient("timeout");
        assert_eq!(
            policy.on_failure(1, &transient),
            Transition::Retry {
                next: 2,
                delay: Duration::from_millis(10)
            }
        );
        assert!(matches!(policy.on_failure(2, &transient), Transition::Retry { next: 3, .. }));
        assert_eq!(policy.on_failure(3, &transient), Transition::GiveUp);
        assert_eq!(
            policy.on_failure(1, &BackendError::permanent("bad input")),
            Transition::GiveUp
        );
    }

    #[tokio::test]
    async fn transient_then_success() {
        let backend = Scripted::new(vec![
            Err(BackendError::transient("429")),
            Err(BackendError::transient("reset")),
            Ok(json!({ "ok": true })),
        ]);
        let (outcome, calls) = run(&backend, 3).await;
        assert_eq!(outcome.result.unwrap(), json!({ "ok": true }));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn transient_exhausts_retries() {
        let backend = Scripted::new(vec![Err(BackendError::transient("timeout")); 5]);
        let (outcome, calls) = run(&backend, 2).await;
        assert!(outcome.result.unwrap_err().is_transient());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_makes_no_call() {
        let backend = Scripted::new(vec![Ok(json!({}))]);
        let limiter = Semaphore::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU64::new(0);
        let ctx = CallContext {
            policy: RetryPolicy::new(3, Duration::ZERO),
            limiter: &limiter,
            cancel: &cancel,
            calls: &calls,
        };
        let outcome = call_with_retry(&backend, &request(), &ctx).await;
        assert!(!outcome.was_dispatched());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn permanent_is_not_retried() {
        let backend = Scripted::new(vec![
            Err(BackendError::permanent("invalid")),
            Ok(json!({})),
        ]);
        let (outcome, calls) = run(&backend, 5).await;
        assert!(matches!(outcome.result, Err(BackendError::Permanent(_))));
        assert_eq!(calls, 1);
    }
}
