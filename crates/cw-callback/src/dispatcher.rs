//! Event dispatch
//!
//! Handlers are looked up by (tenant, class), then by class alone. Events nobody
//! handles are acknowledged and dropped. `suite_ticket` always feeds the
//! credential store before any registered handler runs. A handler that
//! outlives the handler timeout is abandoned so the acknowledgement still
//! reaches the platform inside its five-second reply window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cw_common::TenantId;
use cw_credential::CredentialStore;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::event::{DecodedEvent, EventKind};

/// Handler for decoded callback events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DecodedEvent) -> anyhow::Result<()>;
}

/// Which handler, if any, received an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    TenantHandler,
    GlobalHandler,
    Discarded,
}

/// Default cap on one handler run
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(3);

pub struct EventDispatcher {
    store: CredentialStore,
    handler_timeout: Duration,
    tenant_handlers: DashMap<(TenantId, EventKind), Arc<dyn EventHandler>>,
    global_handlers: DashMap<EventKind, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            tenant_handlers: DashMap::new(),
            global_handlers: DashMap::new(),
        }
    }

    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    /// Register a handler for one class across all tenants, replacing any previous one
    pub fn register_global(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        info!(event_class = %kind, "Registered global event handler");
        self.global_handlers.insert(kind, handler);
    }

    /// Register a handler for one class of one tenant, replacing any previous one
    pub fn register_for_tenant(&self, tenant_id: impl Into<TenantId>, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let tenant_id = tenant_id.into();
        info!(tenant_id = %tenant_id, event_class = %kind, "Registered tenant event handler");
        self.tenant_handlers.insert((tenant_id, kind), handler);
    }

    fn resolve(&self, event: &DecodedEvent) -> Option<(Arc<dyn EventHandler>, DispatchOutcome)> {
        let key = (event.tenant_id.clone(), event.kind.clone());
        if let Some(handler) = self.tenant_handlers.get(&key) {
            return Some((Arc::clone(handler.value()), DispatchOutcome::TenantHandler));
        }
        self.global_handlers
            .get(&event.kind)
            .map(|handler| (Arc::clone(handler.value()), DispatchOutcome::GlobalHandler))
    }

    /// Route one event. Never fails: the delivery is acknowledged whatever happens here.
    pub async fn dispatch(&self, event: &DecodedEvent) -> DispatchOutcome {
        if let Some(ticket) = event.suite_ticket() {
            match self.store.update(&event.tenant_id, ticket) {
                Ok(()) => info!(tenant_id = %event.tenant_id, "Suite ticket rotated"),
                Err(e) => warn!(tenant_id = %event.tenant_id, error = %e, "Failed to apply suite ticket"),
            }
        }

        let Some((handler, outcome)) = self.resolve(event) else {
            debug!(
                tenant_id = %event.tenant_id,
                channel = %event.channel,
                event_class = %event.kind,
                recognized = event.kind.is_recognized(),
                "No handler for callback event, discarding"
            );
            return DispatchOutcome::Discarded;
        };

        match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                tenant_id = %event.tenant_id,
                event_class = %event.kind,
                error = %e,
                "Event handler failed"
            ),
            Err(_) => warn!(
                tenant_id = %event.tenant_id,
                event_class = %event.kind,
                timeout_ms = self.handler_timeout.as_millis() as u64,
                "Event handler timed out, abandoning it"
            ),
        }
        outcome
    }
}
