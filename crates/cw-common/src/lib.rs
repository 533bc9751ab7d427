//! CorpWire shared types
//!
//! Everything the callback, credential and client crates agree on:
//! - Tenant model and the read-mostly `TenantDirectory` capability
//! - Injected `Clock` so credential expiry can be tested deterministically
//! - The platform's uniform `{errcode, errmsg}` response shape

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub mod tenant;

pub use tenant::{
    CallbackKey, CredentialKind, InMemoryTenantDirectory, Tenant, TenantDirectory, TenantId,
};

// ============================================================================
// Clock
// ============================================================================

/// Source of wall-clock time for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Platform Response Shape
// ============================================================================

/// Error code used for failures that never reached the platform
/// (validation, transport, decoding).
pub const LOCAL_ERROR_CODE: i64 = 500;

/// Business status carried by every platform response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BizResponse {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}

impl BizResponse {
    pub fn error(errcode: i64, errmsg: impl Into<String>) -> Self {
        Self {
            errcode,
            errmsg: errmsg.into(),
        }
    }

    pub fn local_error(errmsg: impl Into<String>) -> Self {
        Self::error(LOCAL_ERROR_CODE, errmsg)
    }

    pub fn is_ok(&self) -> bool {
        self.errcode == 0
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommonError {
    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Tenant is deactivated: {0}")]
    TenantInactive(String),

    #[error("Invalid callback key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CommonError>;
