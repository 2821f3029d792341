//! A connection to one sandbox and the sessions running in it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinSet;

use crate::config::SdkConfig;
use crate::session::manager::SessionContext;
use crate::session::registry::SessionRegistry;
use crate::session::{ProcessManager, TerminalManager};
use crate::transport::Transport;

/// Entry point of the SDK.
///
/// Exit handler tasks of every session run on the runtime passed in at
/// construction. If the transport loses its connection, the sandbox closes
/// itself the same way [`Sandbox::close`] does.
pub struct Sandbox<T: Transport> {
    ctx: SessionContext<T>,
}

impl<T: Transport> Sandbox<T> {
    pub fn connect(transport: T, config: SdkConfig, runtime: Handle) -> Self {
        Self::with_shared_transport(Arc::new(transport), config, runtime)
    }

    /// Like [`Sandbox::connect`] for a transport the caller keeps a handle to.
    pub fn with_shared_transport(transport: Arc<T>, config: SdkConfig, runtime: Handle) -> Self {
        let ctx = SessionContext {
            transport,
            config: Arc::new(config),
            runtime,
            registry: Arc::new(SessionRegistry::new()),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let connection_lost = ctx.transport.closed();
        let watched = ctx.clone();
        ctx.runtime.spawn(async move {
            connection_lost.await;
            if teardown(&watched).await {
                tracing::warn!("Sandbox connection lost, sessions torn down");
            }
        });

        Self { ctx }
    }

    pub fn processes(&self) -> ProcessManager<T> {
        ProcessManager::new(self.ctx.clone())
    }

    pub fn terminals(&self) -> TerminalManager<T> {
        TerminalManager::new(self.ctx.clone())
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.ctx.transport
    }

    pub fn config(&self) -> &SdkConfig {
        &self.ctx.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.ctx.runtime
    }

    /// Number of sessions that are starting or running.
    pub fn active_sessions(&self) -> usize {
        self.ctx.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.closed.load(Ordering::SeqCst)
    }

    /// Tears down every session and shuts the transport down.
    ///
    /// Each session gets the configured grace period to finish its exit
    /// handling. After that its handler is aborted and pending `wait()` calls
    /// return [`SessionError::Closed`](crate::SessionError::Closed). No kill
    /// requests are sent. Calling this more than once is a no-op.
    pub async fn close(&self) {
        if teardown(&self.ctx).await {
            tracing::info!("Sandbox closed");
        }
    }
}

/// Finishes every session and shuts the transport down. Returns `false` if
/// the sandbox was already closed.
async fn teardown<T: Transport>(ctx: &SessionContext<T>) -> bool {
    if ctx.closed.swap(true, Ordering::SeqCst) {
        return false;
    }

    let entries = ctx.registry.snapshot();
    tracing::info!(sessions = entries.len(), "Closing sandbox");

    let grace = ctx.config.timeouts.close_grace();
    let request_timeout = ctx.request_timeout();
    let mut teardown = JoinSet::new();

    for entry in entries {
        entry.abort.cancel();
        let registry = Arc::clone(&ctx.registry);
        teardown.spawn(async move {
            let session = entry.session;
            session.coordinator.trigger_exit();
            if tokio::time::timeout(grace, session.coordinator.wait())
                .await
                .is_ok()
            {
                return;
            }

            tracing::warn!(
                session_id = %session.id,
                service = %session.service,
                ?grace,
                "Session did not finish in time, forcing teardown"
            );
            session.coordinator.force_finish();
            if let Some(subscriptions) = entry.subscriptions {
                if tokio::time::timeout(request_timeout, subscriptions.close())
                    .await
                    .is_err()
                {
                    tracing::warn!(session_id = %session.id, "Timed out closing subscriptions");
                }
            }
            registry.remove(session.service, &session.id, &session.coordinator);
        });
    }

    while let Some(result) = teardown.join_next().await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Session teardown task failed");
        }
    }

    ctx.transport.shutdown();
    true
}
