//! Session launch shared by processes and terminals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::{Event, EventKind, Method, RpcError, Service};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::callback::{guarded, DataCallback, ExitCallback, LineCallback};
use super::exit::ExitCoordinator;
use super::output::{OutputBuffer, OutputLine, SessionOutput};
use super::registry::SessionRegistry;
use super::subscription::SubscriptionSet;
use super::SessionId;
use crate::config::SdkConfig;
use crate::error::{Result, SessionError};
use crate::transport::{EventHandler, Transport};

/// Error message fragments that identify a missing working directory.
const MISSING_DIRECTORY_MARKERS: &[&str] = &["no such file or directory", "does not exist"];

/// Everything a manager needs from its sandbox.
pub(crate) struct SessionContext<T: Transport> {
    pub transport: Arc<T>,
    pub config: Arc<SdkConfig>,
    pub runtime: Handle,
    pub registry: Arc<SessionRegistry<T>>,
    pub closed: Arc<AtomicBool>,
}

impl<T: Transport> Clone for SessionContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            runtime: self.runtime.clone(),
            registry: Arc::clone(&self.registry),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<T: Transport> SessionContext<T> {
    pub fn request_timeout(&self) -> Duration {
        self.config.timeouts.request()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A call that is not tied to a tracked session.
    pub async fn call(&self, service: Service, method: Method, args: Vec<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(SessionError::SandboxClosed);
        }
        self.transport
            .call(service, method, args, self.request_timeout())
            .await
            .map_err(|e| rpc_error(service, e))
    }

    /// Merges env vars: sandbox config, then `manager`, then `call`. Later wins.
    pub fn merge_env(
        &self,
        manager: &BTreeMap<String, String>,
        call: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut merged = self.config.sandbox.env_vars.clone();
        merged.extend(manager.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(call.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Picks the working directory: `cwd`, then the deprecated `rootdir`,
    /// then the sandbox default.
    pub fn resolve_cwd(&self, cwd: Option<String>, rootdir: Option<String>) -> Option<String> {
        if cwd.is_some() {
            return cwd;
        }
        if let Some(rootdir) = rootdir {
            tracing::warn!("`rootdir` is deprecated, use `cwd` instead");
            return Some(rootdir);
        }
        self.config.sandbox.cwd.clone()
    }
}

/// A running session as seen by its handle and by the registry.
pub(crate) struct Session<T: Transport> {
    pub id: SessionId,
    pub service: Service,
    pub transport: Arc<T>,
    pub output: OutputBuffer,
    pub coordinator: ExitCoordinator,
    pub request_timeout: Duration,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            service: self.service,
            transport: Arc::clone(&self.transport),
            output: self.output.clone(),
            coordinator: self.coordinator.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<T: Transport> Session<T> {
    /// Calls `method` with the session id prepended to `args`.
    pub async fn call(&self, method: Method, args: Vec<Value>) -> Result<Value> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::from(self.id.as_str()));
        full.extend(args);
        self.transport
            .call(self.service, method, full, self.request_timeout)
            .await
            .map_err(|e| rpc_error(self.service, e))
    }

    fn kill_method(&self) -> Method {
        kill_method(self.service)
    }

    /// Kills the session and waits for it to finish.
    ///
    /// No RPC is sent once the exit has been signalled or another kill is in
    /// flight; a finished session returns its output immediately.
    pub async fn kill(&self) -> Result<SessionOutput> {
        if let Some(output) = self.coordinator.finished_output() {
            return Ok(output);
        }

        let mut failure = None;
        if !self.coordinator.exit_signaled() && self.coordinator.claim_kill() {
            if let Err(e) = self.call(self.kill_method(), Vec::new()).await {
                tracing::warn!(session_id = %self.id, error = %e, "Kill request failed");
                failure = Some(e);
            }
        }

        let forced = self.coordinator.trigger_exit();
        let output = self.wait().await?;
        match failure {
            // The sandbox never confirmed the exit, so the remote side may
            // still be running.
            Some(e) if forced => Err(e),
            _ => Ok(output),
        }
    }

    /// Best-effort kill that only logs failures.
    async fn kill_quietly(&self) {
        if !self.coordinator.claim_kill() {
            return;
        }
        if let Err(e) = self.call(self.kill_method(), Vec::new()).await {
            tracing::debug!(session_id = %self.id, error = %e, "Best-effort kill failed");
        }
    }

    pub async fn wait(&self) -> Result<SessionOutput> {
        self.coordinator
            .wait()
            .await
            .ok_or_else(|| SessionError::Closed {
                id: self.id.clone(),
            })
    }
}

/// Per-stream user callbacks.
#[derive(Default)]
pub(crate) struct OutputCallbacks {
    pub on_stdout: Option<LineCallback>,
    pub on_stderr: Option<LineCallback>,
    pub on_data: Option<DataCallback>,
}

/// Parameters of one `start` call.
pub(crate) struct Launch {
    pub service: Service,
    pub id: SessionId,
    pub cwd: Option<String>,
    pub args: Vec<Value>,
    pub timeout: Duration,
    pub callbacks: OutputCallbacks,
    pub on_exit: Option<ExitCallback>,
}

enum StartOutcome {
    Replied(std::result::Result<Value, RpcError>),
    TimedOut,
    /// `started` is false when the `start` call was never sent.
    Aborted { started: bool },
}

/// Event streams each service is subscribed to, in subscription order.
pub(crate) fn session_events(service: Service) -> &'static [EventKind] {
    match service {
        Service::Process => &[EventKind::Stdout, EventKind::Stderr, EventKind::Exit],
        Service::Terminal => &[EventKind::Data, EventKind::Exit],
    }
}

pub(crate) fn kill_method(service: Service) -> Method {
    match service {
        Service::Process => Method::Kill,
        Service::Terminal => Method::Destroy,
    }
}

pub(crate) fn rpc_error(service: Service, error: RpcError) -> SessionError {
    match service {
        Service::Process => SessionError::Execution {
            message: error.message,
        },
        Service::Terminal => SessionError::Terminal {
            message: error.message,
        },
    }
}

/// Classifies a failed `start` call.
///
/// Only a failure whose message names a missing file or directory, on a start
/// that requested a working directory, becomes
/// [`SessionError::WorkingDirectory`]. Remote messages are free text, so this
/// stays deliberately narrow: everything else is a plain RPC failure.
pub(crate) fn classify_start_error(
    service: Service,
    cwd: Option<&str>,
    error: RpcError,
) -> SessionError {
    if let Some(path) = cwd {
        let message = error.message.to_lowercase();
        if MISSING_DIRECTORY_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            return SessionError::WorkingDirectory {
                path: path.to_string(),
                message: error.message,
            };
        }
    }
    rpc_error(service, error)
}

/// Builds the handler shared by all of a session's subscriptions.
fn event_handler(
    session_id: SessionId,
    output: OutputBuffer,
    coordinator: ExitCoordinator,
    callbacks: OutputCallbacks,
) -> EventHandler {
    Arc::new(move |event| match event {
        Event::Stdout(e) => {
            let line = OutputLine::new(e.line, false, e.timestamp);
            output.append(line.clone());
            if let Some(callback) = &callbacks.on_stdout {
                guarded(&session_id, "on_stdout", || callback(&line));
            }
        }
        Event::Stderr(e) => {
            let line = OutputLine::new(e.line, true, e.timestamp);
            output.append(line.clone());
            if let Some(callback) = &callbacks.on_stderr {
                guarded(&session_id, "on_stderr", || callback(&line));
            }
        }
        Event::Exit(e) => {
            output.set_exit_code(e.exit_code);
            coordinator.signal_exit(e.exit_code);
        }
        Event::Data(e) => {
            let text = String::from_utf8_lossy(&e.data).into_owned();
            output.append(OutputLine::new(text, false, e.timestamp));
            if let Some(callback) = &callbacks.on_data {
                guarded(&session_id, "on_data", || callback(&e.data));
            }
        }
    })
}

/// Starts a session: reserve the id, subscribe, spawn the exit handler and
/// issue the `start` call.
///
/// The work runs as a task on the sandbox runtime. Dropping the returned
/// future aborts the start; the task then tears the session down on its own,
/// like on every other failure path.
pub(crate) async fn launch<T: Transport>(
    ctx: &SessionContext<T>,
    launch: Launch,
) -> Result<Session<T>> {
    if ctx.is_closed() {
        return Err(SessionError::SandboxClosed);
    }

    let id = launch.id.clone();
    let abort = CancellationToken::new();
    let task = ctx
        .runtime
        .spawn(run_launch(ctx.clone(), launch, abort.clone()));
    let guard = abort.drop_guard();
    let result = task.await;
    let _ = guard.disarm();

    match result {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            tracing::warn!(session_id = %id, error = %e, "Start task did not complete");
            Err(SessionError::Aborted { id })
        }
    }
}

async fn run_launch<T: Transport>(
    ctx: SessionContext<T>,
    launch: Launch,
    abort: CancellationToken,
) -> Result<Session<T>> {
    if ctx.is_closed() {
        return Err(SessionError::SandboxClosed);
    }

    let Launch {
        service,
        id,
        cwd,
        args,
        timeout,
        callbacks,
        on_exit,
    } = launch;

    let session = Session {
        id: id.clone(),
        service,
        transport: Arc::clone(&ctx.transport),
        output: OutputBuffer::new(),
        coordinator: ExitCoordinator::new(id.clone()),
        request_timeout: ctx.request_timeout(),
    };
    ctx.registry.reserve(session.clone(), abort.clone())?;

    let handler = event_handler(
        id.clone(),
        session.output.clone(),
        session.coordinator.clone(),
        callbacks,
    );
    let handlers = session_events(service)
        .iter()
        .map(|event| (*event, Arc::clone(&handler)))
        .collect();

    let subscriptions =
        match SubscriptionSet::open(Arc::clone(&ctx.transport), service, &id, handlers).await {
            Ok(subscriptions) => Arc::new(subscriptions),
            Err(e) => {
                tracing::warn!(session_id = %id, service = %service, error = %e, "Failed to open session subscriptions");
                session.coordinator.cancel();
                ctx.registry.remove(service, &id, &session.coordinator);
                return Err(e.into());
            }
        };
    ctx.registry
        .attach_subscriptions(service, &id, Arc::clone(&subscriptions));

    let on_finished = {
        let registry = Arc::clone(&ctx.registry);
        let coordinator = session.coordinator.clone();
        let id = id.clone();
        move || {
            registry.remove(service, &id, &coordinator);
        }
    };
    session.coordinator.spawn_handler(
        &ctx.runtime,
        subscriptions,
        session.output.clone(),
        on_exit,
        on_finished,
    );

    let outcome = if abort.is_cancelled() {
        StartOutcome::Aborted { started: false }
    } else {
        tracing::debug!(session_id = %id, service = %service, "Starting session");
        let start = ctx.transport.call(service, Method::Start, args, timeout);
        tokio::select! {
            biased;
            _ = abort.cancelled() => StartOutcome::Aborted { started: true },
            result = tokio::time::timeout(timeout, start) => match result {
                Ok(Err(e)) if e.is_timeout() => StartOutcome::TimedOut,
                Ok(reply) => StartOutcome::Replied(reply),
                Err(_) => StartOutcome::TimedOut,
            },
        }
    };

    match outcome {
        StartOutcome::Replied(Ok(_)) => {
            tracing::info!(session_id = %id, service = %service, "Session started");
            Ok(session)
        }
        StartOutcome::Replied(Err(e)) => {
            tracing::warn!(session_id = %id, service = %service, error = %e, "Session failed to start");
            session.coordinator.trigger_exit();
            let _ = session.wait().await;
            Err(classify_start_error(service, cwd.as_deref(), e))
        }
        StartOutcome::TimedOut => {
            tracing::warn!(session_id = %id, service = %service, ?timeout, "Session start timed out");
            session.coordinator.trigger_exit();
            session.kill_quietly().await;
            let _ = session.wait().await;
            Err(SessionError::StartTimeout { id, timeout })
        }
        StartOutcome::Aborted { started } => {
            tracing::info!(session_id = %id, service = %service, "Session start aborted");
            // Sandbox close is a local teardown and sends no kill.
            if started && !ctx.is_closed() {
                session.kill_quietly().await;
            }
            session.coordinator.trigger_exit();
            let _ = session.wait().await;
            if ctx.is_closed() {
                Err(SessionError::SandboxClosed)
            } else {
                Err(SessionError::Aborted { id })
            }
        }
    }
}

/// Env vars as a JSON object argument.
pub(crate) fn env_value(env: BTreeMap<String, String>) -> Value {
    Value::Object(env.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

pub(crate) fn optional_string(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}
