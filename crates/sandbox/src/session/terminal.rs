//! Remote pseudo-terminals.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Method, Service};
use serde_json::Value;

use super::callback::{DataCallback, ExitCallback};
use super::id::generate_id;
use super::manager::{self, Launch, OutputCallbacks, Session, SessionContext};
use super::output::SessionOutput;
use super::SessionId;
use crate::error::Result;
use crate::transport::Transport;

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Options for [`TerminalManager::start`].
pub struct TerminalOptions {
    cols: u16,
    rows: u16,
    cmd: Option<String>,
    env_vars: BTreeMap<String, String>,
    cwd: Option<String>,
    rootdir: Option<String>,
    id: Option<SessionId>,
    timeout: Option<Duration>,
    on_data: Option<DataCallback>,
    on_exit: Option<ExitCallback>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

impl TerminalOptions {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            cmd: None,
            env_vars: BTreeMap::new(),
            cwd: None,
            rootdir: None,
            id: None,
            timeout: None,
            on_data: None,
            on_exit: None,
        }
    }

    /// Runs `cmd` instead of the default shell.
    pub fn cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = Some(cmd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
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

    pub fn id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Called with every raw output chunk.
    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&SessionOutput) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_exit = Some(Box::new(f));
        self
    }
}

/// Starts and controls terminals in a sandbox.
pub struct TerminalManager<T: Transport> {
    ctx: SessionContext<T>,
    env_vars: BTreeMap<String, String>,
}

impl<T: Transport> Clone for TerminalManager<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            env_vars: self.env_vars.clone(),
        }
    }
}

impl<T: Transport> TerminalManager<T> {
    pub(crate) fn new(ctx: SessionContext<T>) -> Self {
        Self {
            ctx,
            env_vars: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub async fn start(&self, options: TerminalOptions) -> Result<Terminal<T>> {
        let TerminalOptions {
            cols,
            rows,
            cmd,
            env_vars,
            cwd,
            rootdir,
            id,
            timeout,
            on_data,
            on_exit,
        } = options;

        let id = id.unwrap_or_else(generate_id);
        let cwd = self.ctx.resolve_cwd(cwd, rootdir);
        let env = self.ctx.merge_env(&self.env_vars, &env_vars);
        let args = vec![
            Value::from(id.as_str()),
            Value::from(cols),
            Value::from(rows),
            manager::env_value(env),
            manager::optional_string(cmd),
            manager::optional_string(cwd.clone()),
        ];

        let session = manager::launch(
            &self.ctx,
            Launch {
                service: Service::Terminal,
                id,
                cwd,
                args,
                timeout: timeout.unwrap_or_else(|| self.ctx.config.timeouts.start()),
                callbacks: OutputCallbacks {
                    on_data,
                    ..OutputCallbacks::default()
                },
                on_exit,
            },
        )
        .await?;
        Ok(Terminal { session })
    }

    /// Destroys a terminal by id. See [`ProcessManager::kill`].
    ///
    /// [`ProcessManager::kill`]: super::process::ProcessManager::kill
    pub async fn kill(&self, id: &str) -> Result<Option<SessionOutput>> {
        match self.ctx.registry.get(Service::Terminal, id) {
            Some(entry) => {
                entry.abort.cancel();
                entry.session.kill().await.map(Some)
            }
            None => {
                self.ctx
                    .call(Service::Terminal, Method::Destroy, vec![Value::from(id)])
                    .await?;
                Ok(None)
            }
        }
    }

    pub async fn send_data(&self, id: &str, data: impl Into<String>) -> Result<()> {
        self.ctx
            .call(
                Service::Terminal,
                Method::Data,
                vec![Value::from(id), Value::String(data.into())],
            )
            .await?;
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        self.ctx
            .call(
                Service::Terminal,
                Method::Resize,
                vec![Value::from(id), Value::from(cols), Value::from(rows)],
            )
            .await?;
        Ok(())
    }
}

/// Handle to a started terminal.
pub struct Terminal<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> Clone for Terminal<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

impl<T: Transport> Terminal<T> {
    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn output(&self) -> SessionOutput {
        self.session.output.snapshot()
    }

    /// Everything the terminal printed so far.
    pub fn data(&self) -> String {
        self.session.output.data()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.session.output.exit_code()
    }

    pub fn is_finished(&self) -> bool {
        self.session.coordinator.is_finished()
    }

    /// Sends keystrokes to the terminal.
    pub async fn send_data(&self, data: impl Into<String>) -> Result<()> {
        self.session
            .call(Method::Data, vec![Value::String(data.into())])
            .await?;
        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.session
            .call(Method::Resize, vec![Value::from(cols), Value::from(rows)])
            .await?;
        Ok(())
    }

    /// Destroys the terminal and returns its final output.
    pub async fn kill(&self) -> Result<SessionOutput> {
        self.session.kill().await
    }

    pub async fn wait(&self) -> Result<SessionOutput> {
        self.session.wait().await
    }
}

impl<T: Transport> std::fmt::Debug for Terminal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.session.id)
            .field("coordinator", &self.session.coordinator)
            .finish()
    }
}
