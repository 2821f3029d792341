//! RPC transport abstraction.
//!
//! The transport is the only component that performs network I/O. Sessions
//! use it to issue calls and to register event handlers; the transport
//! invokes those handlers from its own dispatch context.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Event, EventKind, Method, RpcError, Service, SubscriptionId};
use serde_json::Value;

pub mod framed;

pub use framed::FramedTransport;

/// Callback invoked for every event pushed on a subscription.
///
/// Handlers run on the transport's dispatch context and must not block.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Request/response calls plus push subscriptions against a sandbox.
pub trait Transport: Send + Sync + 'static {
    /// Invoke `method` on `service` with positional arguments.
    fn call(
        &self,
        service: Service,
        method: Method,
        args: Vec<Value>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;

    /// Register `handler` for `event` on `service`, correlated by `params`.
    fn subscribe(
        &self,
        service: Service,
        event: EventKind,
        params: Vec<Value>,
        handler: EventHandler,
    ) -> impl Future<Output = Result<SubscriptionId, RpcError>> + Send;

    /// Cancel a subscription. No further events reach its handler once this
    /// is called, even if the remote acknowledgement fails.
    fn unsubscribe(
        &self,
        subscription: SubscriptionId,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Release the underlying connection. Called by `Sandbox::close`.
    fn shutdown(&self) {}

    /// Resolves once the connection is gone, closed by either side. The
    /// default never resolves, for transports that cannot lose their peer.
    fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        std::future::pending()
    }
}

impl<T: Transport> Transport for Arc<T> {
    fn call(
        &self,
        service: Service,
        method: Method,
        args: Vec<Value>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send {
        (**self).call(service, method, args, timeout)
    }

    fn subscribe(
        &self,
        service: Service,
        event: EventKind,
        params: Vec<Value>,
        handler: EventHandler,
    ) -> impl Future<Output = Result<SubscriptionId, RpcError>> + Send {
        (**self).subscribe(service, event, params, handler)
    }

    fn unsubscribe(
        &self,
        subscription: SubscriptionId,
    ) -> impl Future<Output = Result<(), RpcError>> + Send {
        (**self).unsubscribe(subscription)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        (**self).closed()
    }
}
