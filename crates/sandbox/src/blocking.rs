//! Blocking API for callers without an async runtime.
//!
//! [`BlockingSandbox`] owns a multi-threaded tokio runtime. The transport's
//! dispatch loop and every exit handler run on it, while the calling thread
//! blocks on each operation.

use std::net::ToSocketAddrs;

use anyhow::Context;
use tokio::runtime::{Handle, Runtime};

use crate::config::SdkConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;
use crate::session::{
    Process, ProcessOptions, SessionOutput, Terminal, TerminalOptions,
};
use crate::transport::{FramedTransport, Transport};

/// Blocking counterpart of [`Sandbox`].
pub struct BlockingSandbox<T: Transport> {
    sandbox: Sandbox<T>,
    runtime: Runtime,
}

impl BlockingSandbox<FramedTransport> {
    /// Connects to a sandbox over TCP.
    pub fn connect_tcp<A>(addr: A, config: SdkConfig) -> anyhow::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let addr = addr
            .to_socket_addrs()
            .context("Failed to resolve sandbox address")?
            .next()
            .context("Sandbox address resolved to nothing")?;
        let runtime = build_runtime()?;
        let transport = runtime
            .block_on(FramedTransport::connect_tcp_with(
                addr,
                config.timeouts.request(),
            ))
            .with_context(|| format!("Failed to connect to sandbox at {}", addr))?;
        let sandbox = Sandbox::connect(transport, config, runtime.handle().clone());
        Ok(Self { sandbox, runtime })
    }
}

impl<T: Transport> BlockingSandbox<T> {
    /// Builds the transport inside the runtime, so it can spawn its tasks.
    pub fn new<F>(config: SdkConfig, make_transport: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> T,
    {
        let runtime = build_runtime()?;
        let transport = {
            let _guard = runtime.enter();
            make_transport()
        };
        let sandbox = Sandbox::connect(transport, config, runtime.handle().clone());
        Ok(Self { sandbox, runtime })
    }

    /// The async sandbox behind this one.
    pub fn sandbox(&self) -> &Sandbox<T> {
        &self.sandbox
    }

    pub fn start_process(&self, options: ProcessOptions) -> Result<BlockingProcess<T>> {
        let process = self
            .runtime
            .block_on(self.sandbox.processes().start(options))?;
        Ok(BlockingProcess {
            process,
            handle: self.runtime.handle().clone(),
        })
    }

    /// Starts a process and blocks until it finished.
    pub fn run(&self, options: ProcessOptions) -> Result<SessionOutput> {
        self.runtime
            .block_on(self.sandbox.processes().start_and_wait(options))
    }

    pub fn kill_process(&self, id: &str) -> Result<Option<SessionOutput>> {
        self.runtime.block_on(self.sandbox.processes().kill(id))
    }

    pub fn start_terminal(&self, options: TerminalOptions) -> Result<BlockingTerminal<T>> {
        let terminal = self
            .runtime
            .block_on(self.sandbox.terminals().start(options))?;
        Ok(BlockingTerminal {
            terminal,
            handle: self.runtime.handle().clone(),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.sandbox.active_sessions()
    }

    pub fn close(&self) {
        self.runtime.block_on(self.sandbox.close());
    }
}

fn build_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("sandbox-sdk")
        .enable_all()
        .build()
}

/// Blocking counterpart of [`Process`].
pub struct BlockingProcess<T: Transport> {
    process: Process<T>,
    handle: Handle,
}

impl<T: Transport> BlockingProcess<T> {
    pub fn id(&self) -> &str {
        self.process.id()
    }

    pub fn output(&self) -> SessionOutput {
        self.process.output()
    }

    pub fn stdout(&self) -> String {
        self.process.stdout()
    }

    pub fn stderr(&self) -> String {
        self.process.stderr()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.process.exit_code()
    }

    pub fn is_finished(&self) -> bool {
        self.process.is_finished()
    }

    pub fn send_stdin(&self, data: impl Into<String>) -> Result<()> {
        self.handle.block_on(self.process.send_stdin(data))
    }

    pub fn kill(&self) -> Result<SessionOutput> {
        self.handle.block_on(self.process.kill())
    }

    pub fn wait(&self) -> Result<SessionOutput> {
        self.handle.block_on(self.process.wait())
    }

    /// The async handle behind this one.
    pub fn inner(&self) -> &Process<T> {
        &self.process
    }
}

/// Blocking counterpart of [`Terminal`].
pub struct BlockingTerminal<T: Transport> {
    terminal: Terminal<T>,
    handle: Handle,
}

impl<T: Transport> BlockingTerminal<T> {
    pub fn id(&self) -> &str {
        self.terminal.id()
    }

    pub fn output(&self) -> SessionOutput {
        self.terminal.output()
    }

    pub fn data(&self) -> String {
        self.terminal.data()
    }

    pub fn send_data(&self, data: impl Into<String>) -> Result<()> {
        self.handle.block_on(self.terminal.send_data(data))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.handle.block_on(self.terminal.resize(cols, rows))
    }

    pub fn kill(&self) -> Result<SessionOutput> {
        self.handle.block_on(self.terminal.kill())
    }

    pub fn wait(&self) -> Result<SessionOutput> {
        self.handle.block_on(self.terminal.wait())
    }

    pub fn inner(&self) -> &Terminal<T> {
        &self.terminal
    }
}
