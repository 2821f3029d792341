//! Error types for the protocol crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised while encoding, decoding or moving frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame has invalid magic bytes.
    #[error("invalid frame magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidFrameMagic {
        /// Expected magic value.
        expected: u32,
        /// Actual magic value received.
        got: u32,
    },

    /// Envelope carries a protocol version this build does not speak.
    #[error("unsupported protocol version {got} (expected {expected})")]
    UnsupportedVersion {
        /// Version this build speaks.
        expected: u8,
        /// Version found on the wire.
        got: u8,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error returned by the remote side of an RPC call or subscription.
///
/// The sandbox reports failures as a numeric code plus a free-form message.
/// Locally generated failures (timeouts, a dropped connection) reuse the same
/// shape with reserved negative codes so callers only ever match one type.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    /// Numeric error code.
    pub code: i32,
    /// Human readable message, as sent by the remote.
    pub message: String,
}

impl RpcError {
    /// Generic remote failure.
    pub const INTERNAL: i32 = -32603;
    /// The call did not complete within its timeout.
    pub const TIMEOUT: i32 = -32001;
    /// The connection went away before a reply arrived.
    pub const CONNECTION_CLOSED: i32 = -32002;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Self::TIMEOUT, message)
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(Self::CONNECTION_CLOSED, message)
    }

    /// Returns true if this error was produced by a local call timeout.
    pub fn is_timeout(&self) -> bool {
        self.code == Self::TIMEOUT
    }

    /// Returns true if the connection dropped underneath the call.
    pub fn is_connection_closed(&self) -> bool {
        self.code == Self::CONNECTION_CLOSED
    }
}

/// A request that could not be encoded fails locally as an internal error.
impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        RpcError::internal(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_invalid_frame_magic_error_display() {
        let err = ProtocolError::InvalidFrameMagic {
            expected: 0x5342_5852,
            got: 0xDEAD_BEEF,
        };
        assert_eq!(
            err.to_string(),
            "invalid frame magic: expected 0x53425852, got 0xdeadbeef"
        );
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::new(404, "process not found");
        assert_eq!(err.to_string(), "rpc error 404: process not found");
    }

    #[test]
    fn test_rpc_error_kinds() {
        assert!(RpcError::timeout("slow").is_timeout());
        assert!(RpcError::connection_closed("gone").is_connection_closed());
        assert!(!RpcError::internal("boom").is_timeout());
    }

    #[test]
    fn test_protocol_error_into_rpc_error() {
        let rpc: RpcError = ProtocolError::Serialization("bad map key".to_string()).into();
        assert_eq!(rpc.code, RpcError::INTERNAL);
        assert_eq!(rpc.message, "serialization failed: bad map key");
        assert!(!rpc.is_timeout());
        assert!(!rpc.is_connection_closed());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
        assert_send_sync::<RpcError>();
    }
}
