//! Transport over a framed MessagePack byte stream.
//!
//! One writer task drains an outbound queue onto the stream. One reader task
//! decodes frames and is the single dispatch context of the connection:
//! replies complete pending calls, notifications invoke subscription handlers
//! inline, in the order the sandbox sent them.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::messages::{Call, Notify, Subscribe, Unsubscribe};
use protocol::{
    Envelope, EventKind, FrameCodec, Message, Method, RpcError, Service, SubscriptionId,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{EventHandler, Transport};

/// Default timeout for subscribe/unsubscribe round trips.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for reading from the stream.
const READ_BUFFER_SIZE: usize = 8192;

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

struct Shared {
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: DashMap<u64, PendingReply>,
    handlers: DashMap<SubscriptionId, EventHandler>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    request_timeout: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    fn dispatch(&self, envelope: Envelope) {
        match envelope.payload {
            Message::Reply(reply) => self.complete(envelope.sequence, Ok(reply.result)),
            Message::Fault(error) => self.complete(envelope.sequence, Err(error)),
            Message::Notify(Notify {
                subscription,
                event,
            }) => {
                // Clone out of the map so a handler may unsubscribe itself.
                let handler = self
                    .handlers
                    .get(&subscription)
                    .map(|entry| Arc::clone(entry.value()));
                match handler {
                    Some(handler) => handler(event),
                    None => tracing::trace!(
                        subscription = %subscription,
                        "Dropping event for inactive subscription"
                    ),
                }
            }
            other => {
                tracing::warn!(message = ?other, "Unexpected message from sandbox");
            }
        }
    }

    fn complete(&self, sequence: u64, result: Result<Value, RpcError>) {
        match self.pending.remove(&sequence) {
            Some((_, reply)) => {
                // The caller may have timed out and gone away.
                let _ = reply.send(result);
            }
            None => tracing::debug!(sequence, "Reply for unknown or expired request"),
        }
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        // Dropping the senders fails every in-flight call.
        self.pending.clear();
        self.handlers.clear();
        tracing::info!(reason, "Sandbox connection closed");
    }
}

/// [`Transport`] implementation over any async byte stream.
#[derive(Clone)]
pub struct FramedTransport {
    shared: Arc<Shared>,
}

impl FramedTransport {
    /// Wraps `stream` and spawns the reader and writer tasks on the current
    /// tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_options(stream, FrameCodec::new(), DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_options<S>(stream: S, codec: FrameCodec, request_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound,
            pending: DashMap::new(),
            handlers: DashMap::new(),
            sequence: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
            request_timeout,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(write_loop(writer, rx, Arc::clone(&shared), codec.clone()));
        tokio::spawn(read_loop(reader, Arc::clone(&shared), codec));

        Self { shared }
    }

    /// Connects to a sandbox over TCP.
    pub async fn connect_tcp<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        Self::connect_tcp_with(addr, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Connects over TCP with `request_timeout` bounding subscribe and
    /// unsubscribe round trips.
    pub async fn connect_tcp_with<A: ToSocketAddrs>(
        addr: A,
        request_timeout: Duration,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::with_options(stream, FrameCodec::new(), request_timeout))
    }

    /// Returns whether the connection has been closed, locally or remotely.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Closes the connection and fails all in-flight calls.
    pub fn close(&self) {
        self.shared.close("closed by client");
    }

    /// Number of calls awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    async fn request(&self, payload: Message, timeout: Duration) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::connection_closed("connection is closed"));
        }

        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(sequence, tx);

        // close() may have drained `pending` between the check above and the insert.
        if self.is_closed() || self.shared.outbound.send(Envelope::new(sequence, payload)).is_err() {
            self.shared.pending.remove(&sequence);
            return Err(RpcError::connection_closed("connection is closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::connection_closed(
                "connection closed before reply",
            )),
            Err(_) => {
                self.shared.pending.remove(&sequence);
                Err(RpcError::timeout(format!("no reply within {:?}", timeout)))
            }
        }
    }
}

impl Transport for FramedTransport {
    async fn call(
        &self,
        service: Service,
        method: Method,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        tracing::trace!(service = %service, method = %method, "Sending call");
        self.request(
            Message::Call(Call {
                service,
                method,
                args,
            }),
            timeout,
        )
        .await
    }

    async fn subscribe(
        &self,
        service: Service,
        event: EventKind,
        params: Vec<Value>,
        handler: EventHandler,
    ) -> Result<SubscriptionId, RpcError> {
        let subscription = format!(
            "sub-{}",
            self.shared.next_subscription.fetch_add(1, Ordering::Relaxed) + 1
        );
        // Registered first: the sandbox may push before our task sees the reply.
        self.shared
            .handlers
            .insert(subscription.clone(), handler);

        let result = self
            .request(
                Message::Subscribe(Subscribe {
                    subscription: subscription.clone(),
                    service,
                    event,
                    params,
                }),
                self.shared.request_timeout,
            )
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(subscription = %subscription, service = %service, event = %event, "Subscribed");
                Ok(subscription)
            }
            Err(error) => {
                self.shared.handlers.remove(&subscription);
                Err(error)
            }
        }
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), RpcError> {
        self.shared.handlers.remove(&subscription);
        self.request(
            Message::Unsubscribe(Unsubscribe {
                subscription: subscription.clone(),
            }),
            self.shared.request_timeout,
        )
        .await?;
        tracing::debug!(subscription = %subscription, "Unsubscribed");
        Ok(())
    }

    fn shutdown(&self) {
        self.close();
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let shutdown = self.shared.shutdown.clone();
        async move { shutdown.cancelled().await }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
    codec: FrameCodec,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let envelope = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let bytes = match codec.encode_envelope(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, sequence = envelope.sequence, "Failed to encode request");
                shared.complete(envelope.sequence, Err(e.into()));
                continue;
            }
        };

        if let Err(e) = writer.write_all(&bytes).await {
            shared.close(&format!("write failed: {}", e));
            break;
        }
        if let Err(e) = writer.flush().await {
            shared.close(&format!("flush failed: {}", e));
            break;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!("Writer loop ended");
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, codec: FrameCodec)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];

    let reason = 'outer: loop {
        loop {
            match codec.try_decode_envelope(&buffer) {
                Ok(Some((envelope, consumed))) => {
                    buffer.drain(..consumed);
                    shared.dispatch(envelope);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to decode frame from sandbox");
                    break 'outer format!("protocol error: {}", e);
                }
            }
        }

        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break 'outer "shutdown".to_string(),
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break "remote closed the connection".to_string(),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) => break format!("read failed: {}", e),
        }
    };

    shared.close(&reason);
    tracing::debug!("Reader loop ended");
}
