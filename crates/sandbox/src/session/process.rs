//! Remote processes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Method, Service};
use serde_json::Value;

use super::callback::{ExitCallback, LineCallback};
use super::id::generate_id;
use super::manager::{self, Launch, OutputCallbacks, Session, SessionContext};
use super::output::{OutputLine, SessionOutput};
use super::SessionId;
use crate::error::Result;
use crate::transport::Transport;

/// Options for [`ProcessManager::start`].
pub struct ProcessOptions {
    cmd: String,
    env_vars: BTreeMap<String, String>,
    cwd: Option<String>,
    rootdir: Option<String>,
    id: Option<SessionId>,
    timeout: Option<Duration>,
    on_stdout: Option<LineCallback>,
    on_stderr: Option<LineCallback>,
    on_exit: Option<ExitCallback>,
}

impl ProcessOptions {
    /// Runs `cmd` through the sandbox's shell.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            env_vars: BTreeMap::new(),
            cwd: None,
            rootdir: None,
            id: None,
            timeout: None,
            on_stdout: None,
            on_stderr: None,
            on_exit: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[deprecated(note = "use `cwd` instead")]
    pub fn rootdir(mut self, rootdir: impl Into<String>) -> Self {
        self.rootdir = Some(rootdir.into());
        self
    }

    /// Uses a caller-chosen id instead of a random one.
    pub fn id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Overrides the configured start timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_stdout<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputLine) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_stdout = Some(Arc::new(f));
        self
    }

    pub fn on_stderr<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputLine) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_stderr = Some(Arc::new(f));
        self
    }

    /// Runs once with the final output, after the subscriptions are closed
    /// and before `wait()` returns.
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&SessionOutput) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_exit = Some(Box::new(f));
        self
    }
}

/// Starts and controls processes in a sandbox.
pub struct ProcessManager<T: Transport> {
    ctx: SessionContext<T>,
    env_vars: BTreeMap<String, String>,
}

impl<T: Transport> Clone for ProcessManager<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            env_vars: self.env_vars.clone(),
        }
    }
}

impl<T: Transport> ProcessManager<T> {
    pub(crate) fn new(ctx: SessionContext<T>) -> Self {
        Self {
            ctx,
            env_vars: BTreeMap::new(),
        }
    }

    /// Adds a default env var for every process this manager starts.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    /// Starts a process. Returns once the sandbox confirmed the start.
    pub async fn start(&self, options: ProcessOptions) -> Result<Process<T>> {
        let ProcessOptions {
            cmd,
            env_vars,
            cwd,
            rootdir,
            id,
            timeout,
            on_stdout,
            on_stderr,
            on_exit,
        } = options;

        let id = id.unwrap_or_else(generate_id);
        let cwd = self.ctx.resolve_cwd(cwd, rootdir);
        let env = self.ctx.merge_env(&self.env_vars, &env_vars);
        let args = vec![
            Value::from(id.as_str()),
            Value::String(cmd),
            manager::env_value(env),
            manager::optional_string(cwd.clone()),
        ];

        let session = manager::launch(
            &self.ctx,
            Launch {
                service: Service::Process,
                id,
                cwd,
                args,
                timeout: timeout.unwrap_or_else(|| self.ctx.config.timeouts.start()),
                callbacks: OutputCallbacks {
                    on_stdout,
                    on_stderr,
                    on_data: None,
                },
                on_exit,
            },
        )
        .await?;
        Ok(Process { session })
    }

    /// Starts a process and waits for it to finish.
    pub async fn start_and_wait(&self, options: ProcessOptions) -> Result<SessionOutput> {
        self.start(options).await?.wait().await
    }

    /// Kills a process by id.
    ///
    /// A process started through this sandbox is torn down locally as well and
    /// its final output returned. Other ids only get the kill request.
    pub async fn kill(&self, id: &str) -> Result<Option<SessionOutput>> {
        match self.ctx.registry.get(Service::Process, id) {
            Some(entry) => {
                entry.abort.cancel();
                entry.session.kill().await.map(Some)
            }
            None => {
                self.ctx
                    .call(Service::Process, Method::Kill, vec![Value::from(id)])
                    .await?;
                Ok(None)
            }
        }
    }

    /// Writes `data` to the stdin of process `id`.
    pub async fn send_stdin(&self, id: &str, data: impl Into<String>) -> Result<()> {
        self.ctx
            .call(
                Service::Process,
                Method::Stdin,
                vec![Value::from(id), Value::String(data.into())],
            )
            .await?;
        Ok(())
    }
}

/// Handle to a started process.
pub struct Process<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> Clone for Process<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

impl<T: Transport> Process<T> {
    pub fn id(&self) -> &str {
        &self.session.id
    }

    /// Snapshot of the output received so far.
    pub fn output(&self) -> SessionOutput {
        self.session.output.snapshot()
    }

    pub fn stdout(&self) -> String {
        self.session.output.stdout()
    }

    pub fn stderr(&self) -> String {
        self.session.output.stderr()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.session.output.exit_code()
    }

    pub fn is_finished(&self) -> bool {
        self.session.coordinator.is_finished()
    }

    pub async fn send_stdin(&self, data: impl Into<String>) -> Result<()> {
        self.session
            .call(Method::Stdin, vec![Value::String(data.into())])
            .await?;
        Ok(())
    }

    /// Kills the process and returns its final output.
    pub async fn kill(&self) -> Result<SessionOutput> {
        self.session.kill().await
    }

    /// Waits for the process to exit and its `on_exit` callback to run.
    pub async fn wait(&self) -> Result<SessionOutput> {
        self.session.wait().await
    }
}

impl<T: Transport> std::fmt::Debug for Process<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.session.id)
            .field("coordinator", &self.session.coordinator)
            .finish()
    }
}
