//! Fixed-interval polling of an async fetch function.
//!
//! A [`Poller`] owns one recurring timer task. Every tick dispatches the fetch
//! as its own detached task, so a slow fetch never delays the next tick and
//! overlapping fetches race: whichever settles last owns the result slot.
//! Disabling cancels the timer only; fetches already in flight still settle
//! and still write their outcome.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub type FetchFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type FetchFn<T, E> = Arc<dyn Fn() -> FetchFuture<T, E> + Send + Sync>;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Latest observable state of a poller.
#[derive(Debug)]
pub struct PollResult<T, E> {
    /// Most recent successful snapshot; kept when later fetches fail.
    pub data: Option<T>,
    /// Failure of the most recent failed fetch, cleared by the next success.
    pub error: Option<Arc<E>>,
    pub is_loading: bool,
    /// Bumped on every successful write to `data`.
    pub data_version: u64,
}

impl<T, E> Default for PollResult<T, E> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            data_version: 0,
        }
    }
}

impl<T: Clone, E> Clone for PollResult<T, E> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: self.is_loading,
            data_version: self.data_version,
        }
    }
}

pub struct Poller<T, E> {
    fetch: FetchFn<T, E>,
    interval: Duration,
    state: Arc<watch::Sender<PollResult<T, E>>>,
    timer: Option<JoinHandle<()>>,
}

impl<T, E> Poller<T, E>
where
    T: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
{
    pub fn new<F, Fut>(fetch: F, interval: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let fetch: FetchFn<T, E> = Arc::new(move || Box::pin(fetch()));
        let (state, _) = watch::channel(PollResult::default());

        Self {
            fetch,
            interval: interval.max(MIN_INTERVAL),
            state: Arc::new(state),
            timer: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        self.timer.as_ref().is_some_and(|timer| !timer.is_finished())
    }

    /// Enabling fetches immediately, then once per interval. Must be called
    /// from within a tokio runtime.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.start();
        } else {
            self.stop();
        }
    }

    /// Runs one fetch inline and waits for it to settle.
    pub async fn refetch(&self) {
        run_fetch(Arc::clone(&self.fetch), Arc::clone(&self.state)).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<PollResult<T, E>> {
        self.state.subscribe()
    }

    fn start(&mut self) {
        if self.is_enabled() {
            return;
        }

        let fetch = Arc::clone(&self.fetch);
        let state = Arc::clone(&self.state);
        let interval = self.interval;

        debug!(
            interval_ms = interval.as_millis() as u64,
            "polling enabled"
        );

        self.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tokio::spawn(run_fetch(Arc::clone(&fetch), Arc::clone(&state)));
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            debug!("polling disabled; recurring timer cancelled");
        }
    }
}

impl<T: Clone, E> Poller<T, E> {
    pub fn result(&self) -> PollResult<T, E> {
        self.state.borrow().clone()
    }
}

impl<T, E> Drop for Poller<T, E> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

async fn run_fetch<T, E: Display>(fetch: FetchFn<T, E>, state: Arc<watch::Sender<PollResult<T, E>>>) {
    state.send_modify(|result| result.is_loading = true);

    let outcome = fetch().await;

    state.send_modify(|result| {
        match outcome {
            Ok(data) => {
                result.data = Some(data);
                result.error = None;
                result.data_version += 1;
                debug!(data_version = result.data_version, "poll fetch succeeded");
            }
            Err(err) => {
                warn!(error = %err, "poll fetch failed; keeping previous data");
                result.error = Some(Arc::new(err));
            }
        }
        result.is_loading = false;
    });
}
