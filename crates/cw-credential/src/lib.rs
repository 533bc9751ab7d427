//! CorpWire Credential Store
//!
//! Per-tenant cache of short-lived platform bearer credentials:
//! - CredentialStore: keyed slots with single-flight refresh and queued seed rotation
//! - TokenSource: capability that performs the actual refresh call
//! - PlatformTokenSource: HTTP implementation against the platform token endpoints

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cw_common::{CommonError, Tenant, TenantId};
use thiserror::Error;

pub mod http_source;
pub mod store;

pub use http_source::{PlatformTokenSource, TokenSourceConfig};
pub use store::{CredentialStore, SlotSnapshot, StoreConfig};

/// Refresh failure, shared verbatim with every caller waiting on the same refresh
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Worth retrying on the next natural access
    #[error("Transient credential failure for tenant {tenant_id}: {message}")]
    Transient { tenant_id: String, message: String },

    /// Will not heal by retrying (unknown or deactivated tenant, rejected secret)
    #[error("Fatal credential failure for tenant {tenant_id}: {message}")]
    Fatal { tenant_id: String, message: String },
}

impl CredentialError {
    pub fn transient(tenant_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            tenant_id: tenant_id.into(),
            message: message.into(),
        }
    }

    pub fn fatal(tenant_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            tenant_id: tenant_id.into(),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CredentialError::Fatal { .. })
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            CredentialError::Transient { tenant_id, .. } | CredentialError::Fatal { tenant_id, .. } => tenant_id,
        }
    }

    /// Re-attribute an upstream (suite) failure to the dependent tenant, keeping its class
    pub(crate) fn upstream(tenant_id: &str, cause: CredentialError) -> Self {
        let message = format!("upstream credential unavailable: {}", cause);
        match cause {
            CredentialError::Transient { .. } => Self::transient(tenant_id, message),
            CredentialError::Fatal { .. } => Self::fatal(tenant_id, message),
        }
    }

    pub(crate) fn from_lookup(tenant_id: &str, error: CommonError) -> Self {
        Self::fatal(tenant_id, error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// A live bearer credential. Never mutated; replaced on refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub tenant_id: TenantId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Query parameter the platform expects the token in
    pub token_param: &'static str,
}

impl Credential {
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("tenant_id", &self.tenant_id)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Raw result of a refresh call, before the store stamps an absolute expiry
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

impl IssuedToken {
    pub fn new(token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            token: token.into(),
            expires_in,
        }
    }
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Everything a refresh needs for one tenant
#[derive(Debug, Clone, Copy)]
pub struct RefreshRequest<'a> {
    pub tenant: &'a Tenant,
    /// Latest platform-pushed seed (suite ticket), if any
    pub seed: Option<&'a str>,
    /// Credential of the suite an authorized corp is exchanged through
    pub upstream: Option<&'a Credential>,
}

/// Performs the platform refresh call for a tenant
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, request: RefreshRequest<'_>) -> Result<IssuedToken>;
}
