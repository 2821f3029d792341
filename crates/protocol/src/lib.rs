//! # Sandbox Protocol Library
//!
//! Wire vocabulary shared by the sandbox SDK and anything that speaks to it.
//!
//! ## Overview
//!
//! - **Message Definitions**: calls, subscriptions, replies, faults and pushed
//!   session events
//! - **Frame Codec**: length-prefixed framing with optional LZ4 compression
//! - **Errors**: codec failures and the remote [`RpcError`] shape
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Envelope (Call / Notify / ...)     │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │     Byte stream (TCP, Unix socket)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, FrameCodec, Message, Method, Service};
//! use protocol::messages::Call;
//!
//! let call = Message::Call(Call {
//!     service: Service::Process,
//!     method: Method::Kill,
//!     args: vec![serde_json::json!("a1b2c3d4e5f6")],
//! });
//! let codec = FrameCodec::new();
//! let bytes = codec.encode_envelope(&Envelope::new(1, call)).unwrap();
//! let (decoded, _) = codec.try_decode_envelope(&bytes).unwrap().unwrap();
//! assert_eq!(decoded.sequence, 1);
//! ```

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result, RpcError};
pub use framing::{
    Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{
    DataEvent, Envelope, Event, EventKind, ExitEvent, Message, Method, OutputEvent, Service,
    SubscriptionId, PROTOCOL_VERSION,
};
