//! CredentialStore - per-tenant credential slots
//!
//! Each tenant owns one slot guarded by its own mutex; there is no global lock.
//! - A cached credential is handed out only while its remaining lifetime exceeds the safety margin
//! - Refresh is single-flight: the first caller spawns it, later callers await the same shared future
//! - Seed updates that race with an in-flight refresh are parked and promoted when it completes
//! - Waiters bound their own wait; giving up never cancels the refresh for others

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cw_common::{Clock, CredentialKind, Tenant, TenantDirectory, TenantId};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{Credential, CredentialError, RefreshRequest, Result, TokenSource};

type RefreshOutcome = Result<Arc<Credential>>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Credential cache policy
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Minimum remaining lifetime for a cached credential to be handed out
    pub safety_margin: Duration,
    /// Service-level cap on one refresh call, whoever is waiting on it
    pub refresh_timeout: Duration,
    /// Wait bound used by `get`
    pub wait_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Non-secret view of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub has_credential: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_in_flight: bool,
    pub has_seed: bool,
    pub seed_pending: bool,
    pub seed_version: u64,
    pub refreshes_started: u64,
}

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

#[derive(Default)]
struct SlotState {
    credential: Option<Arc<Credential>>,
    in_flight: Option<InFlight>,
    /// Seed the next refresh will use
    seed: Option<String>,
    /// Seed received while a refresh was in flight
    pending_seed: Option<String>,
    seed_version: u64,
    refreshes_started: u64,
}

struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(initial_seed: Option<String>) -> Self {
        let seed_version = u64::from(initial_seed.is_some());
        Self {
            state: Mutex::new(SlotState {
                seed: initial_seed,
                seed_version,
                ..Default::default()
            }),
        }
    }
}

/// Per-tenant credential cache with single-flight refresh
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    directory: Arc<dyn TenantDirectory>,
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    slots: DashMap<TenantId, Arc<Slot>>,
}

impl CredentialStore {
    pub fn new(
        config: StoreConfig,
        directory: Arc<dyn TenantDirectory>,
        source: Arc<dyn TokenSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                directory,
                source,
                clock,
                slots: DashMap::new(),
            }),
        }
    }

    /// Get a live credential, waiting at most the configured wait timeout
    pub async fn get(&self, tenant_id: &str) -> Result<Arc<Credential>> {
        self.inner.get_with_deadline(tenant_id, self.inner.config.wait_timeout).await
    }

    /// Get a live credential, waiting at most `deadline` for a refresh
    pub async fn get_with_deadline(&self, tenant_id: &str, deadline: Duration) -> Result<Arc<Credential>> {
        self.inner.get_with_deadline(tenant_id, deadline).await
    }

    /// Drop the cached credential so the next `get` refreshes
    pub fn invalidate(&self, tenant_id: &str) {
        if let Some(slot) = self.inner.existing_slot(tenant_id) {
            slot.state.lock().credential = None;
            info!(tenant_id = %tenant_id, "Invalidated cached credential");
        }
    }

    /// Drop the cached credential only if it is still `token`.
    /// Returns whether anything was dropped.
    pub fn invalidate_token(&self, tenant_id: &str, token: &str) -> bool {
        let Some(slot) = self.inner.existing_slot(tenant_id) else {
            return false;
        };

        let mut state = slot.state.lock();
        let matches = state
            .credential
            .as_ref()
            .map(|current| current.token == token)
            .unwrap_or(false);

        if matches {
            state.credential = None;
            info!(tenant_id = %tenant_id, "Invalidated rejected credential");
        } else {
            debug!(tenant_id = %tenant_id, "Rejected credential already replaced");
        }
        matches
    }

    /// Install a platform-pushed seed for future refreshes.
    ///
    /// Never affects a refresh that is already running: a seed arriving mid-refresh
    /// is applied as soon as that refresh completes. The latest seed wins.
    pub fn update(&self, tenant_id: &str, seed: impl Into<String>) -> Result<()> {
        let tenant = self
            .inner
            .directory
            .get(tenant_id)
            .ok_or_else(|| CredentialError::fatal(tenant_id, "unknown tenant"))?;

        let slot = self.inner.slot(&tenant);
        let mut state = slot.state.lock();
        if state.in_flight.is_some() {
            state.pending_seed = Some(seed.into());
            info!(tenant_id = %tenant_id, "Seed received during refresh, queued for the next one");
        } else {
            state.seed = Some(seed.into());
            state.seed_version += 1;
            info!(tenant_id = %tenant_id, seed_version = state.seed_version, "Seed updated");
        }
        Ok(())
    }

    pub fn snapshot(&self, tenant_id: &str) -> Option<SlotSnapshot> {
        let slot = self.inner.existing_slot(tenant_id)?;
        let state = slot.state.lock();
        Some(SlotSnapshot {
            has_credential: state.credential.is_some(),
            expires_at: state.credential.as_ref().map(|c| c.expires_at),
            refresh_in_flight: state.in_flight.is_some(),
            has_seed: state.seed.is_some(),
            seed_pending: state.pending_seed.is_some(),
            seed_version: state.seed_version,
            refreshes_started: state.refreshes_started,
        })
    }
}

impl StoreInner {
    fn existing_slot(&self, tenant_id: &str) -> Option<Arc<Slot>> {
        self.slots.get(tenant_id).map(|slot| Arc::clone(slot.value()))
    }

    fn slot(&self, tenant: &Tenant) -> Arc<Slot> {
        if let Some(slot) = self.existing_slot(&tenant.id) {
            return slot;
        }
        let slot = self
            .slots
            .entry(tenant.id.clone())
            .or_insert_with(|| Arc::new(Slot::new(tenant.initial_seed.clone())));
        Arc::clone(slot.value())
    }

    fn is_fresh(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::milliseconds(self.config.safety_margin.as_millis() as i64);
        credential.remaining(now) > margin
    }

    async fn get_with_deadline(self: &Arc<Self>, tenant_id: &str, deadline: Duration) -> RefreshOutcome {
        let tenant = self
            .directory
            .resolve_active(tenant_id)
            .map_err(|e| CredentialError::from_lookup(tenant_id, e))?;
        let slot = self.slot(&tenant);

        let refresh = {
            let mut state = slot.state.lock();
            let now = self.clock.now();

            if let Some(credential) = state.credential.clone() {
                if self.is_fresh(&credential, now) {
                    return Ok(credential);
                }
                if credential.is_expired(now) {
                    debug!(tenant_id = %tenant_id, "Cached credential expired");
                    state.credential = None;
                }
            }

            let joined = state.in_flight.as_ref().map(|in_flight| in_flight.future.clone());
            match joined {
                Some(future) => {
                    debug!(tenant_id = %tenant_id, "Joining in-flight refresh");
                    future
                }
                None => self.start_refresh(tenant, Arc::clone(&slot), &mut state),
            }
        };

        let credential = match tokio::time::timeout(deadline, refresh).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!(
                    tenant_id = %tenant_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Gave up waiting for credential refresh"
                );
                return Err(CredentialError::transient(
                    tenant_id,
                    "deadline elapsed while waiting for refresh",
                ));
            }
        };

        if !self.is_fresh(&credential, self.clock.now()) {
            return Err(CredentialError::transient(
                tenant_id,
                "refreshed credential does not outlive the safety margin",
            ));
        }
        Ok(credential)
    }

    /// Spawn the refresh and publish it in the slot. Called with the slot lock held,
    /// so the refresh cannot complete before it is visible to other callers.
    fn start_refresh(self: &Arc<Self>, tenant: Arc<Tenant>, slot: Arc<Slot>, state: &mut SlotState) -> SharedRefresh {
        state.refreshes_started += 1;
        let refresh_id = state.refreshes_started;
        let seed = if tenant.credential.uses_seed() {
            state.seed.clone()
        } else {
            None
        };

        info!(
            tenant_id = %tenant.id,
            refresh_id = refresh_id,
            seed_version = state.seed_version,
            "Starting credential refresh"
        );

        let tenant_id = tenant.id.clone();
        let task_inner = Arc::clone(self);
        let task_slot = Arc::clone(&slot);
        let handle = tokio::spawn(async move {
            // One cap for the whole refresh, suite credential wait included
            let refresh = task_inner.refresh(&tenant, seed);
            let outcome = match tokio::time::timeout(task_inner.config.refresh_timeout, refresh).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CredentialError::transient(tenant.id.as_str(), "refresh timed out")),
            };
            task_inner.complete(&task_slot, refresh_id, &tenant.id, outcome)
        });

        let inner = Arc::clone(self);
        let future = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let error = CredentialError::transient(
                        tenant_id.as_str(),
                        format!("refresh task aborted: {}", join_error),
                    );
                    inner.complete(&slot, refresh_id, &tenant_id, Err(error))
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            id: refresh_id,
            future: future.clone(),
        });
        future
    }

    async fn refresh(self: &Arc<Self>, tenant: &Tenant, seed: Option<String>) -> RefreshOutcome {
        let upstream = match &tenant.credential {
            CredentialKind::AuthorizedCorp { suite, .. } => {
                let suite_credential: BoxFuture<'_, RefreshOutcome> =
                    Box::pin(self.get_with_deadline(suite, self.config.refresh_timeout));
                Some(
                    suite_credential
                        .await
                        .map_err(|e| CredentialError::upstream(&tenant.id, e))?,
                )
            }
            CredentialKind::CorpSecret { .. } | CredentialKind::SuiteTicket { .. } => None,
        };

        let request = RefreshRequest {
            tenant,
            seed: seed.as_deref(),
            upstream: upstream.as_deref(),
        };

        let issued = self.source.fetch(request).await?;

        let expires_at = i64::try_from(issued.expires_in.as_secs())
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
            .ok_or_else(|| CredentialError::transient(tenant.id.as_str(), "malformed expires_in"))?;

        Ok(Arc::new(Credential {
            tenant_id: tenant.id.clone(),
            token: issued.token,
            expires_at,
            token_param: tenant.credential.token_param(),
        }))
    }

    fn complete(&self, slot: &Slot, refresh_id: u64, tenant_id: &str, outcome: RefreshOutcome) -> RefreshOutcome {
        let mut state = slot.state.lock();

        let is_current = state.in_flight.as_ref().map(|f| f.id) == Some(refresh_id);
        if !is_current {
            return outcome;
        }
        state.in_flight = None;

        if let Some(seed) = state.pending_seed.take() {
            state.seed = Some(seed);
            state.seed_version += 1;
            info!(
                tenant_id = %tenant_id,
                seed_version = state.seed_version,
                "Applied seed queued during refresh"
            );
        }

        match &outcome {
            Ok(credential) => {
                state.credential = Some(Arc::clone(credential));
                info!(
                    tenant_id = %tenant_id,
                    refresh_id = refresh_id,
                    expires_at = %credential.expires_at,
                    "Credential refreshed"
                );
            }
            Err(e) => {
                // The previous credential stays in place; it is still never handed out past its margin
                warn!(tenant_id = %tenant_id, refresh_id = refresh_id, error = %e, "Credential refresh failed");
            }
        }
        outcome
    }
}
