//! User callbacks and the guard that keeps their failures contained.
//!
//! Callbacks run on the transport's dispatch context (output) or on the exit
//! handler task (`on_exit`). An error or panic from user code is logged and
//! never reaches the session machinery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::output::{OutputLine, SessionOutput};

/// Called for every stdout or stderr line as it arrives.
pub type LineCallback = Arc<dyn Fn(&OutputLine) -> anyhow::Result<()> + Send + Sync>;

/// Called for every raw terminal chunk as it arrives.
pub type DataCallback = Arc<dyn Fn(&[u8]) -> anyhow::Result<()> + Send + Sync>;

/// Called once with the final output after the session's subscriptions closed.
pub type ExitCallback = Box<dyn FnOnce(&SessionOutput) -> anyhow::Result<()> + Send>;

/// Runs a user callback, logging instead of propagating errors and panics.
///
/// Returns `true` when the callback completed successfully.
pub(crate) fn guarded<F>(session_id: &str, callback: &'static str, f: F) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(session_id = %session_id, callback, error = %e, "Callback returned an error");
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!(session_id = %session_id, callback, panic = %message, "Callback panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_success() {
        assert!(guarded("abc", "on_stdout", || Ok(())));
    }

    #[test]
    fn test_guarded_swallows_error() {
        assert!(!guarded("abc", "on_stdout", || anyhow::bail!("boom")));
    }

    #[test]
    fn test_guarded_swallows_panic() {
        assert!(!guarded("abc", "on_exit", || panic!("callback exploded")));
    }
}
