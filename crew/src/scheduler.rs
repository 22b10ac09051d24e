//! Bounded-concurrency task queue with cooperative cancellation.
//!
//! Jobs start in submission order and at most `max_concurrency` run at once.
//! Each job receives a [`CancellationToken`]; [`TaskQueue::cancel_all`] trips
//! every token and settles every outstanding handle immediately, whether or
//! not the job itself notices.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ConfigError;

/// Error shared between every handle settled by the same cause.
pub type SharedError = Arc<anyhow::Error>;

type Outcome<T> = Result<T, SharedError>;
type BoxedJob<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

struct Pending<T> {
    id: u64,
    job: BoxedJob<T>,
    token: CancellationToken,
    settle: oneshot::Sender<Outcome<T>>,
}

struct Active<T> {
    token: CancellationToken,
    settle: oneshot::Sender<Outcome<T>>,
}

struct State<T> {
    max: usize,
    active: HashMap<u64, Active<T>>,
    pending: VecDeque<Pending<T>>,
    next_id: u64,
}

pub struct TaskQueue<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TaskQueue")
            .field("max", &state.max)
            .field("active", &state.active.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new(max_concurrency: usize) -> Result<Self, ConfigError> {
        if max_concurrency < 1 {
            return Err(ConfigError::InvalidConcurrency(max_concurrency));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(State {
                max: max_concurrency,
                active: HashMap::new(),
                pending: VecDeque::new(),
                next_id: 0,
            })),
        })
    }

    /// Queue a job. Must be called from within a tokio runtime.
    pub fn push<F, Fut>(&self, job: F) -> TaskHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = CancellationToken::new();
        let job: BoxedJob<T> = Box::new(move |token| job(token).boxed());
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push_back(Pending {
            id,
            job,
            token: token.clone(),
            settle: tx,
        });
        admit(&self.state, &mut state);
        TaskHandle { rx, token }
    }

    /// Settle every active and pending handle with `reason` and trip their tokens.
    ///
    /// Returns how many handles were settled. Running jobs are not awaited.
    pub fn cancel_all(&self, reason: anyhow::Error) -> usize {
        let reason: SharedError = Arc::new(reason);
        let mut state = self.lock();
        let mut settled = 0;
        for (_, active) in state.active.drain() {
            active.token.cancel();
            let _ = active.settle.send(Err(Arc::clone(&reason)));
            settled += 1;
        }
        for pending in state.pending.drain(..) {
            pending.token.cancel();
            let _ = pending.settle.send(Err(Arc::clone(&reason)));
            settled += 1;
        }
        debug!(settled, reason = %reason, "cancelled all tasks");
        settled
    }
}

impl<T> TaskQueue<T> {
    pub fn max_concurrency(&self) -> usize {
        self.lock().max
    }

    pub fn active_size(&self) -> usize {
        self.lock().active.len()
    }

    pub fn pending_size(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Start pending jobs while slots are free. Called with the state lock held.
fn admit<T: Send + 'static>(shared: &Arc<Mutex<State<T>>>, state: &mut State<T>) {
    while state.active.len() < state.max {
        let Some(next) = state.pending.pop_front() else {
            break;
        };
        let Pending {
            id,
            job,
            token,
            settle,
        } = next;
        state.active.insert(
            id,
            Active {
                token: token.clone(),
                settle,
            },
        );
        debug!(id, active = state.active.len(), "task admitted");

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(async move { job(token).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Arc::new(err)),
                Err(_) => Err(Arc::new(anyhow!("task panicked"))),
            };
            complete(&shared, id, outcome);
        });
    }
}

fn complete<T: Send + 'static>(shared: &Arc<Mutex<State<T>>>, id: u64, outcome: Outcome<T>) {
    let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
    match state.active.remove(&id) {
        Some(active) => {
            let _ = active.settle.send(outcome);
        }
        // Settled earlier by cancel_all.
        None => debug!(id, "late completion ignored"),
    }
    admit(shared, &mut state);
}

/// Resolves once the job finishes, fails, panics, or is cancelled.
#[must_use = "a task handle does nothing unless awaited"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Outcome<T>>,
    token: CancellationToken,
}

impl<T> TaskHandle<T> {
    /// The token handed to the job; tripped by [`TaskQueue::cancel_all`].
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Arc::new(anyhow!("task queue shut down")))),
            Poll::Pending => Poll::Pending,
        }
    }
}
