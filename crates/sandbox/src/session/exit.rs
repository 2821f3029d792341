//! Exit coordination for a session.
//!
//! A session exits in two stages. First the exit is *signalled*, either by the
//! sandbox's exit event or locally by [`ExitCoordinator::trigger_exit`]. Then
//! the exit handler task closes the session's subscriptions, runs the user's
//! `on_exit` callback and only then marks the session *finished*, which is
//! what `wait()` observes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::callback::{guarded, ExitCallback};
use super::output::{OutputBuffer, SessionOutput};
use super::subscription::SubscriptionSet;
use super::SessionId;
use crate::transport::Transport;

/// State of a [`Deferred`] cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredState<T> {
    Unresolved,
    Resolved(T),
    Cancelled,
}

/// A value that becomes available once, observable by any number of waiters.
///
/// Only the first `resolve` or `cancel` takes effect.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: Arc<watch::Sender<DeferredState<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DeferredState::Unresolved);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` if this call resolved the cell.
    pub fn resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(|state| match state {
            DeferredState::Unresolved => {
                *state = DeferredState::Resolved(value);
                true
            }
            _ => false,
        })
    }

    /// Returns `true` if this call cancelled the cell.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|state| match state {
            DeferredState::Unresolved => {
                *state = DeferredState::Cancelled;
                true
            }
            _ => false,
        })
    }

    pub fn state(&self) -> DeferredState<T> {
        self.tx.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.tx.borrow(), DeferredState::Unresolved)
    }

    /// Waits until the cell is settled. `None` means it was cancelled.
    pub async fn wait(&self) -> Option<T> {
        let mut rx = self.tx.subscribe();
        let settled = rx
            .wait_for(|state| !matches!(state, DeferredState::Unresolved))
            .await;
        match settled {
            Ok(state) => match &*state {
                DeferredState::Resolved(value) => Some(value.clone()),
                _ => None,
            },
            Err(_) => None,
        }
    }
}

/// Lifecycle phase of a session's exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPhase {
    /// Running, no exit seen yet.
    Pending,
    /// Exit event received or exit triggered locally.
    ExitSignaled,
    /// Exit handler is closing the subscriptions.
    Unsubscribing,
    /// `on_exit` has run (or there was none).
    HandlerRan,
    /// `wait()` callers have been released with the final output.
    Finished,
    /// Torn down without finishing.
    Cancelled,
}

struct Inner {
    session_id: SessionId,
    exit: Deferred<Option<i32>>,
    handled: Deferred<SessionOutput>,
    phase: Mutex<ExitPhase>,
    task: Mutex<Option<JoinHandle<()>>>,
    kill_requested: AtomicBool,
}

impl Inner {
    fn phase(&self) -> MutexGuard<'_, ExitPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves forward to `next`. Terminal phases are never left.
    fn advance(&self, next: ExitPhase) {
        let mut phase = self.phase();
        if !matches!(*phase, ExitPhase::Finished | ExitPhase::Cancelled) {
            *phase = next;
        }
    }
}

/// Two-stage exit synchronisation for one session. Clones share state.
#[derive(Clone)]
pub struct ExitCoordinator {
    inner: Arc<Inner>,
}

impl ExitCoordinator {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id: session_id.into(),
                exit: Deferred::new(),
                handled: Deferred::new(),
                phase: Mutex::new(ExitPhase::Pending),
                task: Mutex::new(None),
                kill_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn phase(&self) -> ExitPhase {
        *self.inner.phase()
    }

    /// Records the sandbox's exit event. Returns `false` if the exit had
    /// already been signalled.
    pub fn signal_exit(&self, exit_code: Option<i32>) -> bool {
        if !self.inner.exit.resolve(exit_code) {
            return false;
        }
        self.inner.advance(ExitPhase::ExitSignaled);
        tracing::debug!(session_id = %self.inner.session_id, ?exit_code, "Exit signalled");
        true
    }

    /// Signals exit locally, without an exit code. Idempotent.
    pub fn trigger_exit(&self) -> bool {
        if !self.inner.exit.resolve(None) {
            return false;
        }
        self.inner.advance(ExitPhase::ExitSignaled);
        tracing::debug!(session_id = %self.inner.session_id, "Exit triggered locally");
        true
    }

    pub fn exit_signaled(&self) -> bool {
        !self.inner.exit.is_pending()
    }

    /// Claims the right to send the session's kill request. Only the first
    /// caller gets `true`.
    pub fn claim_kill(&self) -> bool {
        !self.inner.kill_requested.swap(true, Ordering::SeqCst)
    }

    /// Abandons a session whose handler was never spawned.
    pub fn cancel(&self) {
        self.inner.exit.cancel();
        self.inner.handled.cancel();
        *self.inner.phase() = ExitPhase::Cancelled;
    }

    /// Waits until the session is finished. `None` if it was cancelled.
    pub async fn wait(&self) -> Option<SessionOutput> {
        self.inner.handled.wait().await
    }

    /// The final output, if the session has finished.
    pub fn finished_output(&self) -> Option<SessionOutput> {
        match self.inner.handled.state() {
            DeferredState::Resolved(output) => Some(output),
            _ => None,
        }
    }

    /// True once `wait()` would return without blocking.
    pub fn is_settled(&self) -> bool {
        !self.inner.handled.is_pending()
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == ExitPhase::Finished
    }

    /// Stops the exit handler task and releases every waiter.
    ///
    /// Waiters observe cancellation unless the handler already finished.
    pub fn force_finish(&self) {
        self.trigger_exit();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        if self.inner.handled.cancel() {
            *self.inner.phase() = ExitPhase::Cancelled;
            tracing::warn!(session_id = %self.inner.session_id, "Session force-finished");
        }
    }

    /// True if both handles coordinate the same session.
    pub fn same_as(&self, other: &ExitCoordinator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Spawns the exit handler task on `runtime`.
    ///
    /// Once exit is signalled the task closes `subscriptions`, runs `on_exit`
    /// with a snapshot of `output`, calls `on_finished` and releases waiters.
    /// `on_exit` runs on the runtime's blocking pool, so a callback that
    /// blocks never stalls the runtime's workers.
    pub fn spawn_handler<T, F>(
        &self,
        runtime: &Handle,
        subscriptions: Arc<SubscriptionSet<T>>,
        output: OutputBuffer,
        on_exit: Option<ExitCallback>,
        on_finished: F,
    ) where
        T: Transport,
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let blocking = runtime.clone();
        let task = runtime.spawn(async move {
            if inner.exit.wait().await.is_none() {
                subscriptions.close().await;
                on_finished();
                return;
            }

            inner.advance(ExitPhase::Unsubscribing);
            subscriptions.close().await;

            let snapshot = output.snapshot();
            if let Some(on_exit) = on_exit {
                let session_id = inner.session_id.clone();
                let final_output = snapshot.clone();
                let callback = blocking.spawn_blocking(move || {
                    guarded(&session_id, "on_exit", || on_exit(&final_output));
                });
                if let Err(e) = callback.await {
                    tracing::warn!(session_id = %inner.session_id, error = %e, "Exit callback task failed");
                }
            }
            inner.advance(ExitPhase::HandlerRan);

            on_finished();

            let exit_code = snapshot.exit_code();
            if inner.handled.resolve(snapshot) {
                inner.advance(ExitPhase::Finished);
                tracing::info!(session_id = %inner.session_id, ?exit_code, "Session finished");
            }
        });
        *self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

impl std::fmt::Debug for ExitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitCoordinator")
            .field("session_id", &self.inner.session_id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::output::OutputLine;
    use crate::testing::MockTransport;
    use protocol::{EventKind, Service};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open_set(transport: &Arc<MockTransport>) -> Arc<SubscriptionSet<MockTransport>> {
        let handlers: Vec<(EventKind, crate::transport::EventHandler)> = vec![
            (EventKind::Stdout, Arc::new(|_| {})),
            (EventKind::Exit, Arc::new(|_| {})),
        ];
        Arc::new(
            SubscriptionSet::open(Arc::clone(transport), Service::Process, "abc", handlers)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_deferred_resolves_once() {
        let cell = Deferred::new();
        assert!(cell.is_pending());
        assert!(cell.resolve(1));
        assert!(!cell.resolve(2));
        assert!(!cell.cancel());
        assert_eq!(cell.state(), DeferredState::Resolved(1));
        assert_eq!(cell.wait().await, Some(1));
    }

    #[tokio::test]
    async fn test_deferred_cancel_releases_waiters() {
        let cell: Deferred<u8> = Deferred::new();
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(cell.cancel());
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!cell.resolve(5));
    }

    #[tokio::test]
    async fn test_signal_exit_is_idempotent() {
        let coordinator = ExitCoordinator::new("abc");
        assert_eq!(coordinator.phase(), ExitPhase::Pending);
        assert!(coordinator.signal_exit(Some(0)));
        assert!(!coordinator.signal_exit(Some(1)));
        assert!(!coordinator.trigger_exit());
        assert!(coordinator.exit_signaled());
        assert_eq!(coordinator.phase(), ExitPhase::ExitSignaled);
    }

    #[tokio::test]
    async fn test_handler_closes_subscriptions_before_on_exit() {
        let transport = Arc::new(MockTransport::new());
        let subscriptions = open_set(&transport).await;
        let coordinator = ExitCoordinator::new("abc");
        let output = OutputBuffer::new();
        output.append(OutputLine::new("hi", false, 100));
        output.set_exit_code(Some(0));

        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let finished = Arc::new(AtomicUsize::new(0));
        let on_exit: ExitCallback = {
            let transport = Arc::clone(&transport);
            let seen = Arc::clone(&seen);
            Box::new(move |output: &SessionOutput| {
                assert_eq!(output.stdout(), "hi");
                seen.store(transport.active_subscriptions(), Ordering::SeqCst);
                Ok(())
            })
        };
        let on_finished = {
            let finished = Arc::clone(&finished);
            move || {
                finished.fetch_add(1, Ordering::SeqCst);
            }
        };

        coordinator.spawn_handler(
            &Handle::current(),
            Arc::clone(&subscriptions),
            output,
            Some(on_exit),
            on_finished,
        );
        coordinator.signal_exit(Some(0));

        let output = timeout(Duration::from_secs(2), coordinator.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.exit_code(), Some(0));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(subscriptions.is_closed());
        assert!(coordinator.is_finished());
        assert_eq!(coordinator.finished_output(), Some(output));
    }

    #[tokio::test]
    async fn test_failing_on_exit_still_finishes() {
        let transport = Arc::new(MockTransport::new());
        let subscriptions = open_set(&transport).await;
        let coordinator = ExitCoordinator::new("abc");

        coordinator.spawn_handler(
            &Handle::current(),
            subscriptions,
            OutputBuffer::new(),
            Some(Box::new(|_: &SessionOutput| -> anyhow::Result<()> {
                panic!("user code")
            })),
            || {},
        );
        coordinator.trigger_exit();

        let output = timeout(Duration::from_secs(2), coordinator.wait())
            .await
            .unwrap();
        assert!(output.is_some());
        assert_eq!(coordinator.phase(), ExitPhase::Finished);
    }

    #[tokio::test]
    async fn test_blocking_on_exit_does_not_stall_runtime() {
        let transport = Arc::new(MockTransport::new());
        let subscriptions = open_set(&transport).await;
        let coordinator = ExitCoordinator::new("abc");
        let entered = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let on_exit: ExitCallback = {
            let entered = Arc::clone(&entered);
            let released = Arc::clone(&released);
            Box::new(move |_: &SessionOutput| {
                entered.store(true, Ordering::SeqCst);
                let ok = release_rx.recv_timeout(Duration::from_secs(5)).is_ok();
                released.store(ok, Ordering::SeqCst);
                Ok(())
            })
        };
        coordinator.spawn_handler(
            &Handle::current(),
            subscriptions,
            OutputBuffer::new(),
            Some(on_exit),
            || {},
        );
        coordinator.trigger_exit();

        // This test runs on a current-thread runtime; it only makes progress
        // while `on_exit` blocks if the callback is off the runtime thread.
        timeout(Duration::from_secs(2), async {
            while !entered.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(coordinator.phase(), ExitPhase::Unsubscribing);
        release_tx.send(()).unwrap();

        timeout(Duration::from_secs(2), coordinator.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert!(coordinator.is_finished());
    }

    #[test]
    fn test_claim_kill_once() {
        let coordinator = ExitCoordinator::new("abc");
        let other = coordinator.clone();
        assert!(coordinator.claim_kill());
        assert!(!other.claim_kill());
        assert!(!coordinator.claim_kill());
    }

    #[tokio::test]
    async fn test_force_finish_releases_waiters() {
        let coordinator = ExitCoordinator::new("abc");
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait().await })
        };

        coordinator.force_finish();
        let result = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(result, None);
        assert_eq!(coordinator.phase(), ExitPhase::Cancelled);
        assert!(coordinator.is_settled());
        assert!(!coordinator.is_finished());
    }

    #[tokio::test]
    async fn test_force_finish_after_finish_keeps_output() {
        let transport = Arc::new(MockTransport::new());
        let subscriptions = open_set(&transport).await;
        let coordinator = ExitCoordinator::new("abc");
        coordinator.spawn_handler(
            &Handle::current(),
            subscriptions,
            OutputBuffer::new(),
            None,
            || {},
        );
        coordinator.signal_exit(Some(3));
        timeout(Duration::from_secs(2), coordinator.wait())
            .await
            .unwrap()
            .unwrap();

        coordinator.force_finish();
        assert!(coordinator.is_finished());
        assert!(coordinator.finished_output().is_some());
    }

    #[test]
    fn test_cancel_before_spawn() {
        let coordinator = ExitCoordinator::new("abc");
        coordinator.cancel();
        assert_eq!(coordinator.phase(), ExitPhase::Cancelled);
        assert!(coordinator.is_settled());
        assert_eq!(coordinator.finished_output(), None);
    }

    #[test]
    fn test_same_as() {
        let a = ExitCoordinator::new("abc");
        let b = a.clone();
        let c = ExitCoordinator::new("abc");
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }
}
