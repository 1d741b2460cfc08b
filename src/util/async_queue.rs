//! Serialized work queue that owns the client state.
//!
//! Every operation runs to completion against `&mut S` before the next one
//! starts, so the state needs no locking. Operations are submitted from any
//! thread and their results come back through oneshot channels.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::select;

use crate::firestore::error::{cancelled, failed_precondition, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

/// Unit of work run against the queue's state.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Identifies the kind of a delayed operation, so tests can find and run it
/// early and owners can reason about which timer fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    /// Fires when the first watch stream has not reached the backend in time.
    OnlineStateTimeout,
    AsyncQueueRetry,
}

impl Display for TimerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TimerId::ListenStreamIdle => "listen_stream_idle",
            TimerId::ListenStreamConnectionBackoff => "listen_stream_connection_backoff",
            TimerId::WriteStreamIdle => "write_stream_idle",
            TimerId::WriteStreamConnectionBackoff => "write_stream_connection_backoff",
            TimerId::OnlineStateTimeout => "online_state_timeout",
            TimerId::AsyncQueueRetry => "async_queue_retry",
        };
        f.write_str(label)
    }
}

struct PendingTimer {
    timer_id: TimerId,
    trigger: oneshot::Sender<()>,
}

struct QueueShared {
    restricted: AtomicBool,
    next_timer_seq: AtomicU64,
    timers: Mutex<BTreeMap<u64, PendingTimer>>,
}

impl QueueShared {
    fn timers(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, PendingTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone, Debug)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct AsyncQueue<S> {
    sender: Sender<Task<S>>,
    shared: Arc<QueueShared>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Moves `state` onto a background worker and returns the queue feeding it.
    pub fn start(state: S) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        runtime::spawn_detached(run_worker(state, receiver));
        Self {
            sender,
            shared: Arc::new(QueueShared {
                restricted: AtomicBool::new(false),
                next_timer_seq: AtomicU64::new(0),
                timers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.shared.restricted.load(Ordering::SeqCst)
    }

    /// From now on only operations submitted through
    /// [`enqueue_even_while_restricted`](Self::enqueue_even_while_restricted)
    /// are accepted.
    pub fn enter_restricted_mode(&self) {
        self.shared.restricted.store(true, Ordering::SeqCst);
    }

    /// Runs `operation` after everything queued before it and resolves with
    /// its result.
    pub fn enqueue<R, F>(&self, operation: F) -> impl Future<Output = FirestoreResult<R>> + Send
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> FirestoreResult<R> + Send + 'static,
    {
        let submitted = if self.is_restricted() {
            Err(failed_precondition(
                "The client has already been terminated.",
            ))
        } else {
            Ok(self.submit(operation))
        };
        async move {
            match submitted {
                Ok(receiver) => receiver
                    .await
                    .unwrap_or_else(|_| Err(cancelled("The operation queue was shut down"))),
                Err(err) => Err(err),
            }
        }
    }

    /// Like [`enqueue`](Self::enqueue), but accepted while restricted. Used
    /// for teardown.
    pub fn enqueue_even_while_restricted<R, F>(
        &self,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<R>> + Send
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> FirestoreResult<R> + Send + 'static,
    {
        let receiver = self.submit(operation);
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(cancelled("The operation queue was shut down")))
        }
    }

    /// Fire-and-forget variant of [`enqueue`](Self::enqueue). Failures are
    /// logged.
    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: FnOnce(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        if self.is_restricted() {
            log::debug!(target: "firestore::async_queue", "Dropping operation submitted after shutdown");
            return;
        }
        self.push(Box::new(move |state| {
            if let Err(err) = operation(state) {
                log::error!(target: "firestore::async_queue", "Operation failed: {err}");
            }
        }));
    }

    /// Schedules `operation` to run after `delay`. The returned handle cancels
    /// it; cancelled operations never run.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, operation: F) -> DelayedOperation
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.schedule(timer_id, delay, Box::new(operation))
    }

    /// Runs `operation`, retrying it with backoff while it fails with
    /// `unavailable`, up to `max_attempts` runs in total.
    pub fn enqueue_retryable<F>(
        &self,
        max_attempts: u32,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<()>> + Send
    where
        F: FnMut(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        if self.is_restricted() {
            let _ = done.send(Err(failed_precondition(
                "The client has already been terminated.",
            )));
        } else {
            let backoff = ExponentialBackoff::new(BackoffConfig::default());
            self.push(retry_task(
                self.clone(),
                Box::new(operation),
                1,
                max_attempts.max(1),
                backoff,
                done,
            ));
        }
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(cancelled("The operation queue was shut down")))
        }
    }

    /// Whether a delayed operation with `timer_id` is still pending.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.shared
            .timers()
            .values()
            .any(|timer| timer.timer_id == timer_id)
    }

    /// Fires every pending delayed operation with `timer_id` now.
    pub fn run_delayed_operations_early(&self, timer_id: TimerId) {
        let mut timers = self.shared.timers();
        let due: Vec<u64> = timers
            .iter()
            .filter(|(_, timer)| timer.timer_id == timer_id)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in due {
            if let Some(timer) = timers.remove(&seq) {
                let _ = timer.trigger.send(());
            }
        }
    }

    /// Stops accepting work once the already queued operations ran.
    pub fn close(&self) {
        self.sender.close();
    }

    fn submit<R, F>(&self, operation: F) -> oneshot::Receiver<FirestoreResult<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> FirestoreResult<R> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.push(Box::new(move |state| {
            let _ = sender.send(operation(state));
        }));
        receiver
    }

    fn push(&self, task: Task<S>) {
        if self.sender.try_send(task).is_err() {
            log::debug!(target: "firestore::async_queue", "Operation queue is closed");
        }
    }

    fn schedule(&self, timer_id: TimerId, delay: Duration, task: Task<S>) -> DelayedOperation {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = DelayedOperation {
            timer_id,
            cancelled: Arc::clone(&cancelled),
        };

        let (trigger, triggered) = oneshot::channel();
        let seq = self.shared.next_timer_seq.fetch_add(1, Ordering::SeqCst);
        self.shared
            .timers()
            .insert(seq, PendingTimer { timer_id, trigger });

        let queue = self.clone();
        runtime::spawn_detached(async move {
            // Either the delay elapsed or the timer was fired early.
            let _ = select(Box::pin(runtime::sleep(delay)), triggered).await;
            queue.shared.timers().remove(&seq);
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            log::debug!(target: "firestore::async_queue", "Running delayed operation {timer_id}");
            queue.push(Box::new(move |state| {
                if !cancelled.load(Ordering::SeqCst) {
                    task(state);
                }
            }));
        });
        handle
    }
}

async fn run_worker<S>(mut state: S, receiver: Receiver<Task<S>>) {
    while let Ok(task) = receiver.recv().await {
        task(&mut state);
    }
    log::debug!(target: "firestore::async_queue", "Operation queue drained");
}

type RetryableOperation<S> = Box<dyn FnMut(&mut S) -> FirestoreResult<()> + Send>;

fn retry_task<S: Send + 'static>(
    queue: AsyncQueue<S>,
    mut operation: RetryableOperation<S>,
    attempt: u32,
    max_attempts: u32,
    mut backoff: ExponentialBackoff,
    done: oneshot::Sender<FirestoreResult<()>>,
) -> Task<S> {
    Box::new(move |state| match operation(state) {
        Err(err) if err.code == FirestoreErrorCode::Unavailable && attempt < max_attempts => {
            let delay = backoff.next_delay();
            log::debug!(
                target: "firestore::async_queue",
                "Retrying operation (attempt {attempt} of {max_attempts} failed): {err}"
            );
            let next = retry_task(
                queue.clone(),
                operation,
                attempt + 1,
                max_attempts,
                backoff,
                done,
            );
            queue.schedule(TimerId::AsyncQueueRetry, delay, next);
        }
        result => {
            let _ = done.send(result);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    #[tokio::test]
    async fn runs_operations_in_order() {
        let queue = AsyncQueue::start(Vec::<u32>::new());
        for value in 0..5 {
            queue.enqueue_and_forget(move |log| {
                log.push(value);
                Ok(())
            });
        }
        let seen = queue.enqueue(|log| Ok(log.clone())).await.unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn restricted_mode_rejects_new_work() {
        let queue = AsyncQueue::start(0u32);
        queue.enter_restricted_mode();
        let err = queue.enqueue(|_| Ok(())).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        let value = queue
            .enqueue_even_while_restricted(|count| {
                *count += 1;
                Ok(*count)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::start(0u32);
        let op = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(60), |count| {
            *count += 1;
        });
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        op.cancel();
        queue.run_delayed_operations_early(TimerId::ListenStreamIdle);
        runtime::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.enqueue(|count| Ok(*count)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_operation_runs_early_on_request() {
        let queue = AsyncQueue::start(0u32);
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(600), |count| {
            *count += 1;
        });
        queue.run_delayed_operations_early(TimerId::OnlineStateTimeout);
        for _ in 0..50 {
            if queue.enqueue(|count| Ok(*count)).await.unwrap() == 1 {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("delayed operation did not run");
    }

    #[tokio::test]
    async fn retryable_operation_retries_unavailable() {
        let queue = AsyncQueue::start(0u32);
        let result = queue
            .enqueue_retryable(3, |attempts| {
                *attempts += 1;
                if *attempts < 2 {
                    Err(unavailable("busy"))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(queue.enqueue(|attempts| Ok(*attempts)).await.unwrap(), 2);
    }
}
