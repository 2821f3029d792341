//! Per-sandbox registry of live sessions.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::Service;
use tokio_util::sync::CancellationToken;

use super::exit::ExitCoordinator;
use super::manager::Session;
use super::subscription::SubscriptionSet;
use super::SessionId;
use crate::error::{Result, SessionError};
use crate::transport::Transport;

/// A tracked session.
pub(crate) struct RegistryEntry<T: Transport> {
    pub session: Session<T>,
    /// Cancelled to abort a session that is still starting.
    pub abort: CancellationToken,
    /// Set once the subscriptions are open.
    pub subscriptions: Option<Arc<SubscriptionSet<T>>>,
}

impl<T: Transport> Clone for RegistryEntry<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            abort: self.abort.clone(),
            subscriptions: self.subscriptions.clone(),
        }
    }
}

/// Live sessions keyed by service and id.
pub(crate) struct SessionRegistry<T: Transport> {
    entries: DashMap<(Service, SessionId), RegistryEntry<T>>,
}

impl<T: Transport> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T: Transport> SessionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session, failing if its id is taken on that service.
    pub fn reserve(&self, session: Session<T>, abort: CancellationToken) -> Result<()> {
        match self.entries.entry((session.service, session.id.clone())) {
            Entry::Occupied(_) => Err(SessionError::IdConflict {
                id: session.id.clone(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(RegistryEntry {
                    session,
                    abort,
                    subscriptions: None,
                });
                Ok(())
            }
        }
    }

    pub fn attach_subscriptions(
        &self,
        service: Service,
        id: &str,
        subscriptions: Arc<SubscriptionSet<T>>,
    ) {
        if let Some(mut entry) = self.entries.get_mut(&(service, id.to_string())) {
            entry.subscriptions = Some(subscriptions);
        }
    }

    /// Removes the entry, but only if it still belongs to `coordinator`'s
    /// session and not to a newer session that reused the id.
    pub fn remove(&self, service: Service, id: &str, coordinator: &ExitCoordinator) -> bool {
        self.entries
            .remove_if(&(service, id.to_string()), |_, entry| {
                entry.session.coordinator.same_as(coordinator)
            })
            .is_some()
    }

    pub fn get(&self, service: Service, id: &str) -> Option<RegistryEntry<T>> {
        self.entries
            .get(&(service, id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<RegistryEntry<T>> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::output::OutputBuffer;
    use crate::testing::MockTransport;
    use std::time::Duration;

    fn session(transport: &Arc<MockTransport>, service: Service, id: &str) -> Session<MockTransport> {
        Session {
            id: id.to_string(),
            service,
            transport: Arc::clone(transport),
            output: OutputBuffer::new(),
            coordinator: ExitCoordinator::new(id),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_duplicate_id_conflicts_per_service() {
        let transport = Arc::new(MockTransport::new());
        let registry = SessionRegistry::new();

        registry
            .reserve(session(&transport, Service::Process, "a"), CancellationToken::new())
            .unwrap();
        let err = registry
            .reserve(session(&transport, Service::Process, "a"), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::IdConflict { id } if id == "a"));

        // Same id on the other service is fine.
        registry
            .reserve(session(&transport, Service::Terminal, "a"), CancellationToken::new())
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_checks_owner() {
        let transport = Arc::new(MockTransport::new());
        let registry = SessionRegistry::new();
        let first = session(&transport, Service::Process, "a");
        let stale = ExitCoordinator::new("a");

        registry
            .reserve(first.clone(), CancellationToken::new())
            .unwrap();
        assert!(!registry.remove(Service::Process, "a", &stale));
        assert!(registry.get(Service::Process, "a").is_some());

        assert!(registry.remove(Service::Process, "a", &first.coordinator));
        assert!(registry.is_empty());
    }
}
