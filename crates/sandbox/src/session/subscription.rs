//! All-or-nothing group of event subscriptions for one session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use protocol::{EventKind, RpcError, Service, SubscriptionId};
use serde_json::Value;

use super::SessionId;
use crate::transport::{EventHandler, Transport};

/// Opening a subscription set failed.
///
/// `causes` holds the subscribe failure first, followed by any failures hit
/// while rolling back the subscriptions that had already succeeded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "failed to subscribe to {service} {event} for session {session_id}: {}",
    join_causes(causes)
)]
pub struct SubscriptionError {
    pub service: Service,
    pub session_id: SessionId,
    pub event: EventKind,
    pub causes: Vec<RpcError>,
}

fn join_causes(causes: &[RpcError]) -> String {
    causes
        .iter()
        .map(RpcError::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The event subscriptions of one session, opened and closed as a unit.
pub struct SubscriptionSet<T: Transport> {
    transport: Arc<T>,
    service: Service,
    session_id: SessionId,
    subscriptions: Mutex<Vec<(EventKind, SubscriptionId)>>,
    closed: AtomicBool,
}

impl<T: Transport> SubscriptionSet<T> {
    /// Subscribes to each event in order, passing `[session_id]` as params.
    ///
    /// If any subscription fails, every one opened before it is cancelled and
    /// a single error carrying all causes is returned.
    pub async fn open(
        transport: Arc<T>,
        service: Service,
        session_id: &str,
        handlers: Vec<(EventKind, EventHandler)>,
    ) -> Result<Self, SubscriptionError> {
        let mut opened = Vec::with_capacity(handlers.len());

        for (event, handler) in handlers {
            let params = vec![Value::from(session_id)];
            match transport.subscribe(service, event, params, handler).await {
                Ok(subscription) => {
                    tracing::debug!(
                        session_id = %session_id,
                        service = %service,
                        event = %event,
                        "Subscribed to session events"
                    );
                    opened.push((event, subscription));
                }
                Err(cause) => {
                    tracing::debug!(
                        session_id = %session_id,
                        event = %event,
                        error = %cause,
                        "Subscription failed, rolling back {} subscription(s)",
                        opened.len()
                    );
                    let mut causes = vec![cause];
                    for (_, subscription) in opened {
                        if let Err(e) = transport.unsubscribe(subscription).await {
                            causes.push(e);
                        }
                    }
                    return Err(SubscriptionError {
                        service,
                        session_id: session_id.to_string(),
                        event,
                        causes,
                    });
                }
            }
        }

        Ok(Self {
            transport,
            service,
            session_id: session_id.to_string(),
            subscriptions: Mutex::new(opened),
            closed: AtomicBool::new(false),
        })
    }

    /// Cancels every subscription. Only the first call does anything;
    /// unsubscribe failures are logged.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for (event, subscription) in subscriptions {
            if let Err(e) = self.transport.unsubscribe(subscription).await {
                tracing::warn!(
                    session_id = %self.session_id,
                    service = %self.service,
                    event = %event,
                    error = %e,
                    "Failed to unsubscribe"
                );
            }
        }
        tracing::debug!(session_id = %self.session_id, "Session subscriptions closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of subscriptions still open.
    pub fn len(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn noop() -> EventHandler {
        Arc::new(|_| {})
    }

    fn process_handlers() -> Vec<(EventKind, EventHandler)> {
        vec![
            (EventKind::Stdout, noop()),
            (EventKind::Stderr, noop()),
            (EventKind::Exit, noop()),
        ]
    }

    #[tokio::test]
    async fn test_open_all_and_close() {
        let transport = Arc::new(MockTransport::new());
        let set = SubscriptionSet::open(
            Arc::clone(&transport),
            Service::Process,
            "abc",
            process_handlers(),
        )
        .await
        .unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(transport.active_subscriptions(), 3);
        assert_eq!(
            transport.subscribe_attempts(),
            vec![EventKind::Stdout, EventKind::Stderr, EventKind::Exit]
        );

        set.close().await;
        assert!(set.is_closed());
        assert!(set.is_empty());
        assert_eq!(transport.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_second_failure_rolls_back_first() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_subscribe(EventKind::Stderr, RpcError::new(1, "stderr unavailable"));

        let err = SubscriptionSet::open(
            Arc::clone(&transport),
            Service::Process,
            "abc",
            process_handlers(),
        )
        .await
        .err()
        .unwrap();

        assert_eq!(err.event, EventKind::Stderr);
        assert_eq!(err.causes, vec![RpcError::new(1, "stderr unavailable")]);
        // The third subscription is never attempted.
        assert_eq!(
            transport.subscribe_attempts(),
            vec![EventKind::Stdout, EventKind::Stderr]
        );
        assert_eq!(transport.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_rollback_failures_are_aggregated() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_subscribe(EventKind::Exit, RpcError::new(1, "exit unavailable"));
        transport.fail_unsubscribe(EventKind::Stdout, RpcError::new(2, "stdout stuck"));

        let err = SubscriptionSet::open(
            Arc::clone(&transport),
            Service::Process,
            "abc",
            process_handlers(),
        )
        .await
        .err()
        .unwrap();

        assert_eq!(
            err.causes,
            vec![
                RpcError::new(1, "exit unavailable"),
                RpcError::new(2, "stdout stuck"),
            ]
        );
        assert_eq!(
            err.to_string(),
            "failed to subscribe to process onExit for session abc: \
             rpc error 1: exit unavailable; rpc error 2: stdout stuck"
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let set = SubscriptionSet::open(
            Arc::clone(&transport),
            Service::Terminal,
            "term",
            vec![(EventKind::Data, noop()), (EventKind::Exit, noop())],
        )
        .await
        .unwrap();

        set.close().await;
        set.close().await;
        assert!(set.is_closed());
        assert_eq!(transport.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_close_swallows_unsubscribe_errors() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_unsubscribe(EventKind::Exit, RpcError::new(3, "gone"));
        let set = SubscriptionSet::open(
            Arc::clone(&transport),
            Service::Process,
            "abc",
            process_handlers(),
        )
        .await
        .unwrap();

        set.close().await;
        assert!(set.is_closed());
        assert_eq!(transport.active_subscriptions(), 0);
    }
}
