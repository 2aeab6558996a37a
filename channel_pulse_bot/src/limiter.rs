use std::{
    collections::VecDeque,
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{sync::oneshot, time::Instant};

/// Telegram allows roughly 30 requests per second per bot token.
/// Spacing dispatches 35ms apart keeps us at ~28 per second.
pub const MIN_INTERVAL: Duration = Duration::from_millis(35);

/// A queued unit of work, type-erased. Running it performs the call and
/// routes the outcome to the submitter's channel.
type Job = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

enum JobOutcome {
    Completed,
    /// The work overran its deadline and was left running detached.
    Abandoned,
}

/// Why a submitted call never produced a result.
///
/// The work function's own errors are not represented here; they come back
/// untouched inside the submitted call's return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The item was dropped from the queue before dispatch, or the work
    /// panicked mid-flight.
    Cancelled,
    /// The work did not settle within the deadline given to
    /// [`RateLimiter::submit_with_timeout`].
    TimedOut,
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Cancelled => write!(f, "queued call was cancelled before completing"),
            SubmitError::TimedOut => write!(f, "queued call timed out"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Serializes outbound Telegram Bot API calls into a single FIFO lane with
/// enforced minimum spacing between dispatches.
///
/// Construct one per bot token and pass the [`Arc`] around; independent
/// instances know nothing about each other.
pub struct RateLimiter {
    queue: Mutex<VecDeque<Job>>,
    /// Guards against two concurrent drains.
    draining: AtomicBool,
    last_dispatch: Mutex<Option<Instant>>,
    min_interval: Duration,
    abandoned: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Arc<Self> {
        Self::with_interval(MIN_INTERVAL)
    }

    pub fn with_interval(min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            last_dispatch: Mutex::new(None),
            min_interval,
            abandoned: AtomicU64::new(0),
        })
    }

    /// Queue `work` for rate-limited execution and wait for its result.
    ///
    /// The item enters the queue immediately, before the returned future is
    /// first polled. Dispatch order is strict submission order. If `work`
    /// returns an error type, it comes back untouched inside `Ok`; the
    /// queue keeps going regardless.
    pub fn submit<T, F, Fut>(
        self: &Arc<Self>,
        work: F,
    ) -> impl Future<Output = Result<T, SubmitError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.enqueue(work, None);
        async move { rx.await.unwrap_or(Err(SubmitError::Cancelled)) }
    }

    /// Like [`Self::submit`], but if the dispatched work does not settle
    /// within `limit`, the caller gets [`SubmitError::TimedOut`] and the
    /// queue moves on. The stalled work keeps running detached; see
    /// [`Self::abandoned_count`].
    ///
    /// The clock starts at dispatch, not at submission: a queued item has
    /// not consumed any of the external quota yet.
    pub fn submit_with_timeout<T, F, Fut>(
        self: &Arc<Self>,
        work: F,
        limit: Duration,
    ) -> impl Future<Output = Result<T, SubmitError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.enqueue(work, Some(limit));
        async move { rx.await.unwrap_or(Err(SubmitError::Cancelled)) }
    }

    fn enqueue<T, F, Fut>(
        self: &Arc<Self>,
        work: F,
        limit: Option<Duration>,
    ) -> oneshot::Receiver<Result<T, SubmitError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let job: Job = Box::pin(async move {
            // The work runs as its own task so that an overrun deadline
            // leaves it running detached instead of wedging the drain loop,
            // and so a panic inside it cannot take the drain loop down.
            let mut handle = tokio::spawn(work());

            match limit {
                None => {
                    match (&mut handle).await {
                        Ok(value) => {
                            let _ = tx.send(Ok(value));
                        }
                        // The work panicked. The submitter observes this
                        // as a cancellation.
                        Err(_panicked) => drop(tx),
                    }
                    JobOutcome::Completed
                }
                Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                    Ok(Ok(value)) => {
                        let _ = tx.send(Ok(value));
                        JobOutcome::Completed
                    }
                    Ok(Err(_panicked)) => {
                        drop(tx);
                        JobOutcome::Completed
                    }
                    Err(_elapsed) => {
                        let _ = tx.send(Err(SubmitError::TimedOut));
                        JobOutcome::Abandoned
                    }
                },
            }
        });

        self.queue
            .lock()
            .expect("Rate limiter queue lock poisoned!")
            .push_back(job);
        self.ensure_draining();

        rx
    }

    fn ensure_draining(self: &Arc<Self>) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            tokio::spawn(Arc::clone(self).drain());
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            if self
                .queue
                .lock()
                .expect("Rate limiter queue lock poisoned!")
                .is_empty()
            {
                self.draining.store(false, Ordering::SeqCst);

                // A submit may have slipped in between the emptiness check
                // and the flag reset; if so, and nobody else picked the
                // flag back up, this drain keeps going.
                if self
                    .queue
                    .lock()
                    .expect("Rate limiter queue lock poisoned!")
                    .is_empty()
                    || self.draining.swap(true, Ordering::SeqCst)
                {
                    return;
                }
                continue;
            }

            let wait = {
                let last_dispatch = self
                    .last_dispatch
                    .lock()
                    .expect("Rate limiter dispatch lock poisoned!");
                match *last_dispatch {
                    Some(at) => self.min_interval.saturating_sub(at.elapsed()),
                    None => Duration::ZERO,
                }
            };

            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            // The queue may have been cleared while we slept.
            let Some(job) = self
                .queue
                .lock()
                .expect("Rate limiter queue lock poisoned!")
                .pop_front()
            else {
                continue;
            };

            *self
                .last_dispatch
                .lock()
                .expect("Rate limiter dispatch lock poisoned!") = Some(Instant::now());

            if let JobOutcome::Abandoned = job.await {
                let total = self.abandoned.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("Abandoned a stalled queued call ({} so far)", total);
            }
        }
    }

    /// Current queue depth. Diagnostic only; the value may be stale by the
    /// time you look at it.
    pub fn size(&self) -> usize {
        self.queue
            .lock()
            .expect("Rate limiter queue lock poisoned!")
            .len()
    }

    /// How many dispatched items have overrun their deadline and been left
    /// running detached.
    pub fn abandoned_count(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Drop every not-yet-dispatched item. Their submitters settle with
    /// [`SubmitError::Cancelled`]. Work already in flight is unaffected.
    pub fn clear(&self) {
        self.queue
            .lock()
            .expect("Rate limiter queue lock poisoned!")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dispatches_are_spaced_and_fifo() {
        let limiter = RateLimiter::new();
        let dispatched: Arc<Mutex<Vec<(usize, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

        let futures: Vec<_> = (0..5)
            .map(|i| {
                let dispatched = dispatched.clone();
                limiter.submit(move || async move {
                    dispatched.lock().unwrap().push((i, Instant::now()));
                    i
                })
            })
            .collect();

        for (i, fut) in futures.into_iter().enumerate() {
            assert_eq!(fut.await, Ok(i));
        }

        let dispatched = dispatched.lock().unwrap();
        assert_eq!(
            dispatched.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        for pair in dispatched.windows(2) {
            let gap = pair[1].1.duration_since(pair[0].1);
            assert!(gap >= MIN_INTERVAL, "gap was only {:?}", gap);
        }

        assert_eq!(limiter.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_pass_through_without_halting() {
        let limiter = RateLimiter::new();

        let first = limiter.submit(|| async { Err::<u32, _>("boom") });
        let second = limiter.submit(|| async { Ok::<_, &str>(5) });

        assert_eq!(first.await, Ok(Err("boom")));
        assert_eq!(second.await, Ok(Ok(5)));
        assert_eq!(limiter.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_work_is_abandoned_and_queue_advances() {
        let limiter = RateLimiter::new();

        let stalled = limiter.submit_with_timeout(
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                1
            },
            Duration::from_millis(100),
        );
        let after = limiter.submit(|| async { 2 });

        assert_eq!(stalled.await, Err(SubmitError::TimedOut));
        assert_eq!(after.await, Ok(2));
        assert_eq!(limiter.abandoned_count(), 1);
        assert_eq!(limiter.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_pending_submitters() {
        let limiter = RateLimiter::new();

        let futures: Vec<_> = (0..3)
            .map(|i| limiter.submit(move || async move { i }))
            .collect();
        assert_eq!(limiter.size(), 3);

        limiter.clear();

        for fut in futures {
            assert_eq!(fut.await, Err(SubmitError::Cancelled));
        }
        assert_eq!(limiter.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn work_runs_immediately_when_queue_was_idle() {
        let limiter = RateLimiter::new();

        let started = Instant::now();
        assert_eq!(limiter.submit(|| async { 7 }).await, Ok(7));
        // No artificial delay before the first dispatch.
        assert!(started.elapsed() < MIN_INTERVAL);

        // And after the queue went idle, the next submission still honors
        // the spacing against the previous dispatch.
        let again = limiter.submit(|| async { Instant::now() });
        let at = again.await.unwrap();
        assert!(at.duration_since(started) >= MIN_INTERVAL);
    }
}
