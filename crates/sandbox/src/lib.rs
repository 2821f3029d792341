//! # Sandbox SDK
//!
//! Client library for running processes and terminals inside a remote
//! sandbox.
//!
//! ## Overview
//!
//! - **Sessions**: start a process or terminal, stream its output, wait for it
//!   or kill it
//! - **Ordered output**: stdout and stderr arrive independently and are merged
//!   into one timeline by capture timestamp
//! - **Exit coordination**: subscriptions are closed and `on_exit` has run
//!   before `wait()` returns, exactly once per session
//! - **Sandbox teardown**: [`Sandbox::close`] finishes or cancels every
//!   session, so no caller blocks forever
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │        Process / Terminal handles  (blocking façade)     │
//! ├──────────────────────────────────────────────────────────┤
//! │  ProcessManager / TerminalManager        Sandbox::close  │
//! ├──────────────────┬───────────────────┬───────────────────┤
//! │  OutputBuffer    │  SubscriptionSet  │  ExitCoordinator  │
//! ├──────────────────┴───────────────────┴───────────────────┤
//! │        Transport  (FramedTransport over TCP / duplex)    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sandbox_sdk::{FramedTransport, ProcessOptions, Sandbox, SdkConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SdkConfig::load_default()?;
//!     let transport =
//!         FramedTransport::connect_tcp_with("127.0.0.1:49983", config.timeouts.request()).await?;
//!     let sandbox = Sandbox::connect(transport, config, tokio::runtime::Handle::current());
//!
//!     let process = sandbox
//!         .processes()
//!         .start(ProcessOptions::new("echo hi"))
//!         .await?;
//!     let output = process.wait().await?;
//!     assert_eq!(output.stdout(), "hi");
//!
//!     sandbox.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: output buffering, subscriptions, exit coordination, handles
//! - [`transport`]: the RPC transport trait and its framed implementation
//! - [`sandbox`]: the per-connection entry point
//! - [`blocking`]: synchronous wrappers
//! - [`config`]: configuration loading and defaults

pub mod blocking;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export protocol for convenience
pub use protocol;

pub use blocking::{BlockingProcess, BlockingSandbox, BlockingTerminal};
pub use config::{ConfigError, SdkConfig};
pub use error::{Result, SessionError};
pub use sandbox::Sandbox;
pub use session::{
    OutputLine, Process, ProcessManager, ProcessOptions, SessionId, SessionOutput,
    SubscriptionError, Terminal, TerminalManager, TerminalOptions,
};
pub use transport::{EventHandler, FramedTransport, Transport};
