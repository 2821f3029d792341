//! Session identifiers.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Identifier of a process or terminal session, unique per service.
pub type SessionId = String;

/// Length of generated session ids.
pub const SESSION_ID_LEN: usize = 12;

/// Generates a random alphanumeric session id.
pub fn generate_id() -> SessionId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}
