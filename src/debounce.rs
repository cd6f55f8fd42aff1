//! Coalescing scheduler for persistence writes.
//!
//! Every [`DebounceHandle::emit`] restarts the quiet window; when the window
//! elapses only the most recent action runs. The store flusher built on top
//! writes on the blocking pool without holding the store lock, and rolls the
//! working set back when the write fails.
use crate::errors::StoreError;
use crate::metrics;
use crate::store::{SharedStore, Store};
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

enum DebounceCommand<T> {
    Emit(T),
    /// Run the pending action now (if any) and ack.
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct DebounceHandle<T> {
    tx: mpsc::UnboundedSender<DebounceCommand<T>>,
}

impl<T> Clone for DebounceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for DebounceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceHandle").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> DebounceHandle<T> {
    /// Replace the pending action and restart the window.
    pub fn emit(&self, action: T) {
        let _ = self.tx.send(DebounceCommand::Emit(action));
    }

    /// Run whatever is pending without waiting for the window.
    pub async fn flush_now(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(DebounceCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Run the pending action, then stop the task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(DebounceCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

pub fn start_debounce<T, F, Fut>(window: Duration, mut run: F) -> DebounceHandle<T>
where
    T: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<DebounceCommand<T>>();

    tokio::spawn(async move {
        let mut pending: Option<T> = None;
        let mut deadline: Option<Instant> = None;
        loop {
            let wake = deadline;
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(DebounceCommand::Emit(action)) => {
                            pending = Some(action);
                            deadline = Some(Instant::now() + window);
                        }
                        Some(DebounceCommand::Flush(ack)) => {
                            deadline = None;
                            if let Some(action) = pending.take() {
                                run(action).await;
                            }
                            let _ = ack.send(());
                        }
                        Some(DebounceCommand::Shutdown(ack)) => {
                            if let Some(action) = pending.take() {
                                run(action).await;
                            }
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            if let Some(action) = pending.take() {
                                run(action).await;
                            }
                            break;
                        }
                    }
                }
                _ = async move { if let Some(d) = wake { sleep_until(d).await } }, if wake.is_some() => {
                    deadline = None;
                    if let Some(action) = pending.take() {
                        run(action).await;
                    }
                }
            }
        }
        debug!("debounce task stopped");
    });

    DebounceHandle { tx }
}

/// Debounced `flush` for a shared store. Emit `()` after each mutation.
pub fn start_store_flusher<S: Store>(window: Duration, store: SharedStore<S>) -> DebounceHandle<()> {
    start_debounce(window, move |()| {
        let store = store.clone();
        async move {
            let joined = tokio::task::spawn_blocking(move || flush_or_rollback(&store)).await;
            if let Err(e) = joined {
                warn!("store flush worker failed: {}", e);
                metrics::inc_flush_failures();
            }
        }
    })
}

/// Flush the store; on failure roll the working set back instead of retrying.
///
/// The lock is held only to capture and to settle; the write itself runs
/// unlocked so dispatch keeps mutating the working set meanwhile.
pub fn flush_or_rollback<S: Store>(store: &SharedStore<S>) -> Result<(), StoreError> {
    let ticket = {
        let mut guard = lock_store(store)?;
        match guard.begin_flush() {
            Some(ticket) => ticket,
            None => return Ok(()),
        }
    };

    let written = S::persist(&ticket.snapshot);

    let mut guard = lock_store(store)?;
    match written {
        Ok(()) => {
            guard.commit_flush(ticket);
            metrics::inc_flushes();
            Ok(())
        }
        Err(e) => {
            if guard.abort_flush(ticket.generation) {
                warn!("store flush failed, rolling back pending changes: {}", e);
            } else {
                warn!("store flush failed, newer changes kept for the next flush: {}", e);
            }
            metrics::inc_flush_failures();
            Err(e)
        }
    }
}

fn lock_store<S: Store>(store: &SharedStore<S>) -> Result<std::sync::MutexGuard<'_, S>, StoreError> {
    store
        .lock()
        .map_err(|_| StoreError::Internal("store mutex poisoned".into()))
}
