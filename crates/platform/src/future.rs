//! Single-shot completion cells and composable graceful close.
//!
//! Every long-lived object in Keel (session, channel, stream, subsystem)
//! signals lifecycle events through [`Completion`] cells: a slot holding
//! `Pending | Done(value) | Failed(error)` plus waiter notification.
//! Callers observe a cell with [`Completion::verify`], which waits up to a
//! deadline, or poll it with [`Completion::is_complete`].
//!
//! Graceful close is a small algebra over such cells: a [`Closer`] is built
//! from sequential groups, parallel groups and plain actions, and walks the
//! resulting tree exactly once when triggered. Closing again is a no-op
//! that returns the same completion.

use crate::{KeelError, KeelResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

enum CellState<T> {
    Pending,
    Done(T),
    Failed(KeelError),
}

struct CompletionInner<T> {
    state: Mutex<CellState<T>>,
    notify: Notify,
}

/// A single-shot completion cell.
///
/// Cloning yields another handle onto the same cell. The first
/// [`set`](Completion::set) or [`fail`](Completion::fail) wins; later
/// completions are ignored and reported via the returned boolean.
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Creates a new pending cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                state: Mutex::new(CellState::Pending),
                notify: Notify::new(),
            }),
        }
    }

    /// Completes the cell with a value. Returns false if it was already
    /// complete.
    pub fn set(&self, value: T) -> bool {
        let mut state = self.inner.state.lock().expect("completion poisoned");
        if !matches!(*state, CellState::Pending) {
            return false;
        }
        *state = CellState::Done(value);
        drop(state);
        self.inner.notify.notify_waiters();
        true
    }

    /// Completes the cell exceptionally. Returns false if it was already
    /// complete.
    pub fn fail(&self, err: KeelError) -> bool {
        let mut state = self.inner.state.lock().expect("completion poisoned");
        if !matches!(*state, CellState::Pending) {
            return false;
        }
        *state = CellState::Failed(err);
        drop(state);
        self.inner.notify.notify_waiters();
        true
    }

    /// Returns true once the cell holds a value or an error.
    pub fn is_complete(&self) -> bool {
        !matches!(
            *self.inner.state.lock().expect("completion poisoned"),
            CellState::Pending
        )
    }

    /// Returns true if the cell completed exceptionally.
    pub fn is_failed(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("completion poisoned"),
            CellState::Failed(_)
        )
    }

    /// Waits for completion without a deadline.
    pub async fn wait(&self) -> KeelResult<T>
    where
        T: Clone,
    {
        loop {
            let notified = self.inner.notify.notified();
            {
                let state = self.inner.state.lock().expect("completion poisoned");
                match &*state {
                    CellState::Pending => {}
                    CellState::Done(v) => return Ok(v.clone()),
                    CellState::Failed(e) => return Err(e.duplicate()),
                }
            }
            notified.await;
        }
    }

    /// Waits for completion up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Timeout`] when the deadline elapses before the
    /// cell completes, or the cell's own error when it completed
    /// exceptionally.
    pub async fn verify(&self, timeout: Duration) -> KeelResult<T>
    where
        T: Clone,
    {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(KeelError::Timeout(format!(
                "completion not signalled within {:?}",
                timeout
            ))),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("completion poisoned");
        let label = match &*state {
            CellState::Pending => "pending",
            CellState::Done(_) => "done",
            CellState::Failed(_) => "failed",
        };
        f.debug_struct("Completion").field("state", &label).finish()
    }
}

/// A close future: completion of a graceful shutdown.
pub type CloseFuture = Completion<()>;

/// One unit of close work. Receives the `immediate` flag: true means skip
/// draining and tear down as fast as possible.
pub type CloseFn =
    Box<dyn FnOnce(bool) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static>;

enum CloseStep {
    Sequential(Vec<CloseFn>),
    Parallel(Vec<CloseFn>),
    Run(CloseFn),
}

/// Builder producing a [`Closer`] tree.
#[derive(Default)]
pub struct CloserBuilder {
    steps: Vec<CloseStep>,
}

impl CloserBuilder {
    /// Appends a group closed one after another, in order.
    pub fn sequential(mut self, group: Vec<CloseFn>) -> Self {
        if !group.is_empty() {
            self.steps.push(CloseStep::Sequential(group));
        }
        self
    }

    /// Appends a group closed concurrently; the step completes when every
    /// member has.
    pub fn parallel(mut self, group: Vec<CloseFn>) -> Self {
        if !group.is_empty() {
            self.steps.push(CloseStep::Parallel(group));
        }
        self
    }

    /// Appends a single close action.
    pub fn run(mut self, action: CloseFn) -> Self {
        self.steps.push(CloseStep::Run(action));
        self
    }

    /// Finalizes the tree.
    pub fn build(self) -> Closer {
        Closer {
            steps: Mutex::new(Some(self.steps)),
            done: CloseFuture::new(),
        }
    }
}

/// Ordered/parallel graceful-close composition.
///
/// The step list is taken on the first [`close`](Closer::close); calling
/// close on an already-closing or closed tree performs no I/O and returns
/// the same [`CloseFuture`].
pub struct Closer {
    steps: Mutex<Option<Vec<CloseStep>>>,
    done: CloseFuture,
}

impl Closer {
    /// Creates a builder.
    pub fn builder() -> CloserBuilder {
        CloserBuilder::default()
    }

    /// An already-completed closer, for objects with nothing to tear down.
    pub fn closed() -> Self {
        let closer = CloserBuilder::default().build();
        closer.done.set(());
        closer.steps.lock().expect("closer poisoned").take();
        closer
    }

    /// Returns the close future. Complete once every step has run.
    pub fn future(&self) -> &CloseFuture {
        &self.done
    }

    /// Returns true once close has been requested (steps consumed).
    pub fn is_closing(&self) -> bool {
        self.steps.lock().expect("closer poisoned").is_none()
    }

    /// Walks the tree. The first caller drives the steps; everyone else
    /// gets the shared future back immediately.
    pub async fn close(&self, immediate: bool) -> CloseFuture {
        let steps = self.steps.lock().expect("closer poisoned").take();
        let Some(steps) = steps else {
            return self.done.clone();
        };

        for step in steps {
            match step {
                CloseStep::Sequential(group) => {
                    for unit in group {
                        unit(immediate).await;
                    }
                }
                CloseStep::Parallel(group) => {
                    let handles: Vec<_> = group
                        .into_iter()
                        .map(|unit| tokio::spawn(unit(immediate)))
                        .collect();
                    for handle in handles {
                        // A panicked close unit must not wedge the rest of
                        // the teardown.
                        let _ = handle.await;
                    }
                }
                CloseStep::Run(unit) => {
                    unit(immediate).await;
                }
            }
        }

        self.done.set(());
        self.done.clone()
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("closing", &self.is_closing())
            .field("done", &self.done.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_completion_set_and_wait() {
        let cell: Completion<u32> = Completion::new();
        assert!(!cell.is_complete());

        let waiter = cell.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        assert!(cell.set(7));
        assert_eq!(handle.await.unwrap().unwrap(), 7);
        assert!(cell.is_complete());
    }

    #[tokio::test]
    async fn test_completion_single_shot() {
        let cell: Completion<u32> = Completion::new();
        assert!(cell.set(1));
        assert!(!cell.set(2));
        assert!(!cell.fail(KeelError::Channel("late".into())));
        assert_eq!(cell.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completion_failure() {
        let cell: Completion<()> = Completion::new();
        cell.fail(KeelError::Channel("torn down".into()));
        assert!(cell.is_failed());
        let err = cell.wait().await.unwrap_err();
        assert!(matches!(err, KeelError::Channel(_)));
    }

    #[tokio::test]
    async fn test_verify_timeout() {
        let cell: Completion<()> = Completion::new();
        let err = cell.verify(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, KeelError::Timeout(_)));
    }

    fn counting_unit(counter: Arc<AtomicUsize>) -> CloseFn {
        Box::new(move |_immediate| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_closer_runs_every_step() {
        let counter = Arc::new(AtomicUsize::new(0));
        let closer = Closer::builder()
            .sequential(vec![
                counting_unit(counter.clone()),
                counting_unit(counter.clone()),
            ])
            .parallel(vec![
                counting_unit(counter.clone()),
                counting_unit(counter.clone()),
                counting_unit(counter.clone()),
            ])
            .run(counting_unit(counter.clone()))
            .build();

        let future = closer.close(false).await;
        assert!(future.is_complete());
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_closer_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let closer = Closer::builder()
            .run(counting_unit(counter.clone()))
            .build();

        closer.close(false).await;
        // Second close (graceful-then-immediate) must not rerun any step.
        closer.close(true).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(closer.future().is_complete());
    }

    #[tokio::test]
    async fn test_closer_closed() {
        let closer = Closer::closed();
        assert!(closer.is_closing());
        assert!(closer.future().is_complete());
    }
}
