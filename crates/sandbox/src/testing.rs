//! In-memory transport for unit tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::{Event, EventKind, Method, RpcError, Service, SubscriptionId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::transport::{EventHandler, Transport};

/// How the mock answers a call.
#[derive(Clone)]
pub(crate) enum Response {
    Reply(Value),
    Fail(RpcError),
    /// Never answers; the call times out after its deadline.
    Hang,
    /// Pushes events for the called session, then replies `null`.
    Emit(Vec<Event>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub service: Service,
    pub method: Method,
    pub args: Vec<Value>,
}

struct MockSubscription {
    service: Service,
    event: EventKind,
    params: Vec<Value>,
    handler: EventHandler,
}

#[derive(Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    responses: HashMap<(Service, Method), Response>,
    subscribe_failures: HashMap<EventKind, RpcError>,
    unsubscribe_failures: HashMap<EventKind, RpcError>,
    subscriptions: HashMap<SubscriptionId, MockSubscription>,
    subscribe_attempts: Vec<EventKind>,
    next_subscription: u64,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
    shutdowns: AtomicUsize,
    connection: CancellationToken,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, service: Service, method: Method, response: Response) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert((service, method), response);
    }

    pub fn fail_subscribe(&self, event: EventKind, error: RpcError) {
        self.state
            .lock()
            .unwrap()
            .subscribe_failures
            .insert(event, error);
    }

    pub fn fail_unsubscribe(&self, event: EventKind, error: RpcError) {
        self.state
            .lock()
            .unwrap()
            .unsubscribe_failures
            .insert(event, error);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, service: Service, method: Method) -> Vec<Vec<Value>> {
        self.calls()
            .into_iter()
            .filter(|call| call.service == service && call.method == method)
            .map(|call| call.args)
            .collect()
    }

    pub fn subscribe_attempts(&self) -> Vec<EventKind> {
        self.state.lock().unwrap().subscribe_attempts.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Simulates the sandbox going away.
    pub fn drop_connection(&self) {
        self.connection.cancel();
    }

    /// Delivers `event` to every subscription of `service` opened for
    /// `session_id`. Returns how many handlers ran.
    pub fn emit(&self, service: Service, session_id: &str, event: Event) -> usize {
        let handlers: Vec<EventHandler> = {
            let state = self.state.lock().unwrap();
            state
                .subscriptions
                .values()
                .filter(|sub| {
                    sub.service == service
                        && sub.event == event.kind()
                        && sub.params.first().and_then(Value::as_str) == Some(session_id)
                })
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };
        for handler in &handlers {
            handler(event.clone());
        }
        handlers.len()
    }
}

impl Transport for MockTransport {
    async fn call(
        &self,
        service: Service,
        method: Method,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let session_id = args.first().and_then(Value::as_str).map(str::to_string);
        let response = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(RecordedCall {
                service,
                method,
                args,
            });
            state
                .responses
                .get(&(service, method))
                .cloned()
                .unwrap_or(Response::Reply(Value::Null))
        };

        match response {
            Response::Reply(value) => Ok(value),
            Response::Fail(error) => Err(error),
            Response::Hang => {
                tokio::time::sleep(timeout).await;
                Err(RpcError::timeout("mock call hung"))
            }
            Response::Emit(events) => {
                if let Some(id) = session_id {
                    for event in events {
                        self.emit(service, &id, event);
                    }
                }
                Ok(Value::Null)
            }
        }
    }

    async fn subscribe(
        &self,
        service: Service,
        event: EventKind,
        params: Vec<Value>,
        handler: EventHandler,
    ) -> Result<SubscriptionId, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.subscribe_attempts.push(event);
        if let Some(error) = state.subscribe_failures.get(&event) {
            return Err(error.clone());
        }
        state.next_subscription += 1;
        let id = format!("sub-{}", state.next_subscription);
        state.subscriptions.insert(
            id.clone(),
            MockSubscription {
                service,
                event,
                params,
                handler,
            },
        );
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), RpcError> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .subscriptions
            .remove(&subscription)
            .ok_or_else(|| RpcError::internal("unknown subscription"))?;
        match state.unsubscribe_failures.get(&removed.event) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.connection.cancel();
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let connection = self.connection.clone();
        async move { connection.cancelled().await }
    }
}
