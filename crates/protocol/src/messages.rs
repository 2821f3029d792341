//! Protocol message definitions for the sandbox RPC channel.
//!
//! A connection carries [`Envelope`]s in both directions. The client issues
//! calls and subscriptions; the sandbox answers with replies or faults that
//! reuse the request's sequence number, and pushes [`Event`]s for active
//! subscriptions as notifications. All messages are serialized using
//! MessagePack.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, RpcError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifier of one subscription.
///
/// The client picks it when subscribing so it can register the handler before
/// the first notification can possibly arrive.
pub type SubscriptionId = String;

/// Remote service a call or subscription is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Process,
    Terminal,
}

impl Service {
    /// Wire name of the service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Process => "process",
            Service::Terminal => "terminal",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RPC method names understood by the process and terminal services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Launch a process or terminal.
    Start,
    /// Write to a process's stdin.
    Stdin,
    /// Kill a process.
    Kill,
    /// Destroy a terminal.
    Destroy,
    /// Resize a terminal.
    Resize,
    /// Write input to a terminal.
    Data,
}

impl Method {
    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Start => "start",
            Method::Stdin => "stdin",
            Method::Kill => "kill",
            Method::Destroy => "destroy",
            Method::Resize => "resize",
            Method::Data => "data",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named event streams a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "onStdout")]
    Stdout,
    #[serde(rename = "onStderr")]
    Stderr,
    #[serde(rename = "onExit")]
    Exit,
    #[serde(rename = "onData")]
    Data,
}

impl EventKind {
    /// Wire name of the event stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Stdout => "onStdout",
            EventKind::Stderr => "onStderr",
            EventKind::Exit => "onExit",
            EventKind::Data => "onData",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Line contents, without the trailing newline.
    pub line: String,
    /// Unix epoch nanoseconds at which the sandbox captured the line.
    pub timestamp: i64,
}

/// Session exit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent {
    /// Exit code. Terminals and signalled processes may not report one.
    pub exit_code: Option<i32>,
}

/// Raw terminal output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Unix epoch nanoseconds at which the sandbox captured the chunk.
    pub timestamp: i64,
}

/// A pushed session event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    Stdout(OutputEvent),
    Stderr(OutputEvent),
    Exit(ExitEvent),
    Data(DataEvent),
}

impl Event {
    /// The stream this event belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Stdout(_) => EventKind::Stdout,
            Event::Stderr(_) => EventKind::Stderr,
            Event::Exit(_) => EventKind::Exit,
            Event::Data(_) => EventKind::Data,
        }
    }
}

/// Envelope wrapper for all protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Request sequence number; replies and faults echo it back.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes, rejecting unknown versions.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = rmp_serde::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                got: envelope.version,
            });
        }
        Ok(envelope)
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// Invoke a method on a remote service.
    Call(Call),
    /// Open a subscription on an event stream.
    Subscribe(Subscribe),
    /// Cancel a subscription.
    Unsubscribe(Unsubscribe),
    /// Successful answer to a call, subscribe or unsubscribe.
    Reply(Reply),
    /// Failed answer to a call, subscribe or unsubscribe.
    Fault(RpcError),
    /// Event pushed for an active subscription.
    Notify(Notify),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub service: Service,
    pub method: Method,
    /// Positional arguments.
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub subscription: SubscriptionId,
    pub service: Service,
    pub event: EventKind,
    /// Correlation parameters, usually the session id.
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub subscription: SubscriptionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Call result, `null` for subscribe and unsubscribe.
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub subscription: SubscriptionId,
    pub event: Event,
}
