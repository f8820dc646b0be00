//! Per-provider priority queue with deadline-bound admission.
//!
//! Each provider gets a stable priority queue (higher priority first, FIFO
//! among equals) and, while it has work, one tokio task draining it. The
//! drain task waits out the provider's delay before every dispatch and never
//! starts a job whose caller has given up or whose deadline has passed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::debug;
use tokio::sync::oneshot;

use super::limiter::RateLimiter;
use crate::errors::{Failure, ResilienceError};
use crate::runtime::{lock_or_recover, saturating_after};

/// A type-erased queued call. Returns `None` when the caller stopped waiting.
type Job = Box<dyn FnOnce(Arc<RateLimiter>) -> Option<BoxFuture<'static, ()>> + Send>;

struct QueuedJob {
    priority: i32,
    sequence: u64,
    deadline: DateTime<Utc>,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher priority first, then lower sequence (older) first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    draining: bool,
}

/// One provider's pending calls.
#[derive(Default)]
pub(crate) struct ProviderQueue {
    state: Mutex<QueueState>,
}

impl ProviderQueue {
    /// Push a job. Returns true when the caller must start a drain task.
    fn push(&self, job: QueuedJob) -> bool {
        let mut state = lock_or_recover(&self.state, "Provider queue");
        state.heap.push(job);
        if state.draining {
            false
        } else {
            state.draining = true;
            true
        }
    }

    fn pop(&self) -> Option<QueuedJob> {
        lock_or_recover(&self.state, "Provider queue").heap.pop()
    }

    /// Mark the drain task finished if there is nothing left to do.
    fn finish_if_empty(&self) -> bool {
        let mut state = lock_or_recover(&self.state, "Provider queue");
        if state.heap.is_empty() {
            state.draining = false;
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock_or_recover(&self.state, "Provider queue").heap.len()
    }

    pub(crate) fn is_draining(&self) -> bool {
        lock_or_recover(&self.state, "Provider queue").draining
    }
}

async fn drain(limiter: Arc<RateLimiter>, provider: String, queue: Arc<ProviderQueue>) {
    debug!("Rate limiter: drain started for '{}'", provider);

    loop {
        if queue.finish_if_empty() {
            break;
        }

        let delay = limiter.compute_delay(&provider);
        if !delay.is_zero() {
            debug!(
                "Rate limiter: queue for '{}' waiting {:?}",
                provider, delay
            );
            limiter.sleeper.sleep(delay).await;
        }

        // Popped after the wait so late high-priority arrivals go first.
        let Some(queued) = queue.pop() else {
            continue;
        };

        if limiter.clock.now() > queued.deadline {
            debug!(
                "Rate limiter: dropping expired request #{} for '{}'",
                queued.sequence, provider
            );
            continue;
        }

        match (queued.job)(limiter.clone()) {
            Some(run) => run.await,
            None => debug!(
                "Rate limiter: caller for request #{} on '{}' stopped waiting",
                queued.sequence, provider
            ),
        }
    }

    debug!("Rate limiter: drain finished for '{}'", provider);
}

impl RateLimiter {
    /// Queue `operation` for `provider` and wait for its result.
    ///
    /// Higher `priority` runs first; equal priorities run in submission order.
    /// If the call has not started within `max_wait` it is rejected with
    /// [`ResilienceError::QueueTimeout`] and will never start. Once started it
    /// runs to completion under the same rules as
    /// [`execute_with_rate_limit`](Self::execute_with_rate_limit).
    ///
    /// Must be called from within a tokio runtime.
    pub async fn enqueue<T, F, Fut>(
        self: &Arc<Self>,
        provider: &str,
        priority: i32,
        max_wait: Duration,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let (start_tx, mut start_rx) = oneshot::channel::<()>();
        let (result_tx, result_rx) = oneshot::channel::<Result<T, ResilienceError>>();

        let provider_id = provider.to_string();
        let job: Job = Box::new(move |limiter: Arc<RateLimiter>| {
            if start_tx.send(()).is_err() {
                return None;
            }
            let run: BoxFuture<'static, ()> = Box::pin(async move {
                let result = limiter.run_limited(&provider_id, operation, false).await;
                let _ = result_tx.send(result);
            });
            Some(run)
        });

        let deadline = saturating_after(self.clock.now(), max_wait);
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let queue = self
            .queues
            .entry(provider.to_string())
            .or_default()
            .clone();

        let start_worker = queue.push(QueuedJob {
            priority,
            sequence,
            deadline,
            job,
        });
        debug!(
            "Rate limiter: queued request #{} for '{}' (priority {})",
            sequence, provider, priority
        );
        if start_worker {
            tokio::spawn(drain(self.clone(), provider.to_string(), queue));
        }

        let (started, timed_out) = match tokio::time::timeout(max_wait, &mut start_rx).await {
            Ok(Ok(())) => (true, false),
            // The worker dropped the job, normally because its deadline passed.
            Ok(Err(_)) => (false, false),
            Err(_) => {
                // Close first so the worker can no longer start it, then pick
                // up a start signal that raced with the timeout.
                start_rx.close();
                (start_rx.try_recv().is_ok(), true)
            }
        };

        if !started {
            if timed_out || self.clock.now() >= deadline {
                debug!(
                    "Rate limiter: request #{} for '{}' timed out in queue",
                    sequence, provider
                );
                return Err(ResilienceError::QueueTimeout {
                    provider: provider.to_string(),
                    waited: max_wait,
                });
            }
            return Err(ResilienceError::QueueClosed {
                provider: provider.to_string(),
            });
        }

        result_rx.await.unwrap_or_else(|_| {
            Err(ResilienceError::QueueClosed {
                provider: provider.to_string(),
            })
        })
    }

    /// Requests waiting (not yet started) for `provider`.
    pub fn queue_len(&self, provider: &str) -> usize {
        self.queues
            .get(provider)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiterConfig;
    use crate::runtime::ManualClock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use tokio::sync::Notify;

    fn limiter(clock: &Arc<ManualClock>) -> Arc<RateLimiter> {
        Arc::new(
            RateLimiter::with_runtime(RateLimiterConfig::default(), clock.clone(), clock.clone())
                .unwrap(),
        )
    }

    fn gated(gate: Arc<Notify>) -> impl FnMut() -> BoxFuture<'static, Result<(), Failure>> {
        move || {
            let gate = gate.clone();
            Box::pin(async move {
                gate.notified().await;
                Ok(())
            })
        }
    }

    /// Wait until the drain task has taken every queued job off the heap.
    async fn wait_until_taken(limiter: &RateLimiter, provider: &str) {
        while !limiter.queues.contains_key(provider) || limiter.queue_len(provider) > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_heap_order_is_stable_priority() {
        let now = Utc::now();
        let mut heap = BinaryHeap::new();
        for (sequence, priority) in [(0, 1), (1, 5), (2, 1), (3, 5)] {
            heap.push(QueuedJob {
                priority,
                sequence,
                deadline: now,
                job: Box::new(|_: Arc<RateLimiter>| None::<BoxFuture<'static, ()>>),
            });
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|j| j.sequence)).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[tokio::test]
    async fn test_enqueue_runs_operation() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(&clock);

        let result = limiter
            .enqueue("openai", 0, Duration::from_secs(5), || async {
                Ok::<_, Failure>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(limiter.queue_len("openai"), 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(&clock);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupies the drain task until the gate opens.
        let blocker = tokio::spawn({
            let limiter = limiter.clone();
            let gate = gate.clone();
            async move {
                limiter
                    .enqueue("p", 0, Duration::from_secs(60), gated(gate))
                    .await
            }
        });
        wait_until_taken(&limiter, "p").await;

        let mut handles = Vec::new();
        for (label, priority) in [("low-1", 1), ("high", 9), ("low-2", 1)] {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .enqueue("p", priority, Duration::from_secs(60), move || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(label);
                            Ok::<_, Failure>(())
                        }
                    })
                    .await
            }));
        }
        while limiter.queue_len("p") < 3 {
            tokio::task::yield_now().await;
        }

        gate.notify_one();
        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["high", "low-1", "low-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_never_starts() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(&clock);
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicBool::new(false));

        let blocker = tokio::spawn({
            let limiter = limiter.clone();
            let gate = gate.clone();
            async move {
                limiter
                    .enqueue("p", 0, Duration::from_secs(60), gated(gate))
                    .await
            }
        });
        wait_until_taken(&limiter, "p").await;

        let result = limiter
            .enqueue("p", 0, Duration::from_millis(50), {
                let ran = ran.clone();
                move || {
                    ran.store(true, AtomicOrdering::SeqCst);
                    async { Ok::<_, Failure>(()) }
                }
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::QueueTimeout { .. })));

        gate.notify_one();
        blocker.await.unwrap().unwrap();
        wait_until_taken(&limiter, "p").await;
        tokio::task::yield_now().await;

        assert!(!ran.load(AtomicOrdering::SeqCst));
    }

    #[tokio::test]
    async fn test_expired_by_clock_is_rejected() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(&clock);
        limiter.record_limit_headers(
            "p",
            &HashMap::from([
                ("x-ratelimit-limit".to_string(), "10".to_string()),
                ("x-ratelimit-remaining".to_string(), "0".to_string()),
                ("x-ratelimit-reset".to_string(), "10".to_string()),
            ]),
        );

        let result = limiter
            .enqueue("p", 0, Duration::from_secs(1), || async { Ok::<_, Failure>(()) })
            .await;

        assert!(matches!(result, Err(ResilienceError::QueueTimeout { .. })));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn test_status_reports_queue_length() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(&clock);
        let gate = Arc::new(Notify::new());

        let blocker = tokio::spawn({
            let limiter = limiter.clone();
            let gate = gate.clone();
            async move {
                limiter
                    .enqueue("p", 0, Duration::from_secs(60), gated(gate))
                    .await
            }
        });
        wait_until_taken(&limiter, "p").await;

        let waiting = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                limiter
                    .enqueue("p", 0, Duration::from_secs(60), || async {
                        Ok::<_, Failure>(())
                    })
                    .await
            }
        });
        while limiter.queue_len("p") < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.status("p").queued, 1);

        gate.notify_one();
        blocker.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();
        assert_eq!(limiter.status("p").queued, 0);
    }

    #[tokio::test]
    async fn test_forget_keeps_a_draining_queue() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(&clock);
        let gate = Arc::new(Notify::new());

        let blocker = tokio::spawn({
            let limiter = limiter.clone();
            let gate = gate.clone();
            async move {
                limiter
                    .enqueue("p", 0, Duration::from_secs(60), gated(gate))
                    .await
            }
        });
        wait_until_taken(&limiter, "p").await;

        limiter.forget("p");
        assert!(limiter.queues.contains_key("p"));

        gate.notify_one();
        blocker.await.unwrap().unwrap();
        let queue = limiter.queues.get("p").map(|entry| entry.clone()).unwrap();
        while queue.is_draining() {
            tokio::task::yield_now().await;
        }

        assert!(limiter.forget("p"));
        assert!(!limiter.queues.contains_key("p"));
    }
}
