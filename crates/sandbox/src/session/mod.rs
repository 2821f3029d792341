//! Session lifecycle.
//!
//! A session is one remote process or terminal. Its output arrives as push
//! notifications, is merged into a [`SessionOutput`], and its exit is
//! coordinated so that subscriptions are closed and `on_exit` has run before
//! `wait()` returns.

pub mod callback;
pub mod exit;
pub mod id;
pub(crate) mod manager;
pub mod output;
pub mod process;
pub(crate) mod registry;
pub mod subscription;
pub mod terminal;

pub use callback::{DataCallback, ExitCallback, LineCallback};
pub use exit::{Deferred, DeferredState, ExitCoordinator, ExitPhase};
pub use id::{generate_id, SessionId};
pub use output::{OutputBuffer, OutputLine, SessionOutput, LINE_DELIMITER};
pub use process::{Process, ProcessManager, ProcessOptions};
pub use subscription::{SubscriptionError, SubscriptionSet};
pub use terminal::{Terminal, TerminalManager, TerminalOptions};
