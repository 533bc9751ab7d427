//! Tenant model
//!
//! A tenant ("corp") is configured outside the core and is read-only to it.
//! Tenants are never removed while running, only deactivated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use parking_lot::RwLock;
use tracing::info;

use crate::{CommonError, Result};

pub type TenantId = String;

/// Length of the platform-issued `EncodingAESKey`
pub const ENCODING_AES_KEY_LEN: usize = 43;

/// The platform's key strings carry two unused trailing bits that are not always zero.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// AES-256 key used for the callback envelope
#[derive(Clone, PartialEq, Eq)]
pub struct CallbackKey([u8; 32]);

impl CallbackKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse the 43-character `EncodingAESKey` published in the platform console
    pub fn from_encoding_aes_key(encoded: &str) -> Result<Self> {
        if encoded.len() != ENCODING_AES_KEY_LEN {
            return Err(CommonError::InvalidKey(format!(
                "expected {} characters, got {}",
                ENCODING_AES_KEY_LEN,
                encoded.len()
            )));
        }

        let decoded = KEY_ENGINE
            .decode(format!("{}=", encoded))
            .map_err(|e| CommonError::InvalidKey(e.to_string()))?;

        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| CommonError::InvalidKey("decoded key is not 32 bytes".to_string()))?;

        Ok(Self(bytes))
    }

    /// Encode back into the console representation
    pub fn to_encoding_aes_key(&self) -> String {
        let mut encoded = KEY_ENGINE.encode(self.0);
        encoded.truncate(ENCODING_AES_KEY_LEN);
        encoded
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// CBC initialisation vector: the first 16 key bytes
    pub fn iv(&self) -> &[u8] {
        &self.0[..16]
    }
}

impl fmt::Debug for CallbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackKey(<redacted>)")
    }
}

/// How a tenant obtains its outbound bearer credential
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialKind {
    /// Self-built application: corp id + application secret
    CorpSecret { corp_id: String, secret: String },
    /// Suite (third-party application): secret plus the rotating ticket pushed by the platform
    SuiteTicket { suite_id: String, suite_secret: String },
    /// Corp that authorized a suite: exchanged through the suite's own credential
    AuthorizedCorp {
        suite: TenantId,
        auth_corp_id: String,
        permanent_code: String,
    },
}

impl CredentialKind {
    /// Query parameter the platform expects the bearer value in
    pub fn token_param(&self) -> &'static str {
        match self {
            CredentialKind::SuiteTicket { .. } => "suite_access_token",
            CredentialKind::CorpSecret { .. } | CredentialKind::AuthorizedCorp { .. } => "access_token",
        }
    }

    /// Whether refreshes consume a platform-pushed seed
    pub fn uses_seed(&self) -> bool {
        matches!(self, CredentialKind::SuiteTicket { .. })
    }

    /// Identity marker the platform appends to encrypted callbacks for this kind.
    /// Authorized corps are addressed by their suite id, which only the
    /// tenant configuration knows; callers override it with `with_receive_id`.
    pub fn default_receive_id(&self) -> &str {
        match self {
            CredentialKind::CorpSecret { corp_id, .. } => corp_id,
            CredentialKind::SuiteTicket { suite_id, .. } => suite_id,
            CredentialKind::AuthorizedCorp { auth_corp_id, .. } => auth_corp_id,
        }
    }
}

impl fmt::Debug for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::CorpSecret { corp_id, .. } => f
                .debug_struct("CorpSecret")
                .field("corp_id", corp_id)
                .finish_non_exhaustive(),
            CredentialKind::SuiteTicket { suite_id, .. } => f
                .debug_struct("SuiteTicket")
                .field("suite_id", suite_id)
                .finish_non_exhaustive(),
            CredentialKind::AuthorizedCorp { suite, auth_corp_id, .. } => f
                .debug_struct("AuthorizedCorp")
                .field("suite", suite)
                .field("auth_corp_id", auth_corp_id)
                .finish_non_exhaustive(),
        }
    }
}

/// An independently configured customer organization
#[derive(Clone)]
pub struct Tenant {
    pub id: TenantId,
    /// Identity marker expected at the end of every decrypted callback
    pub receive_id: String,
    /// Callback signature token
    pub token: String,
    pub aes_key: CallbackKey,
    pub credential: CredentialKind,
    /// Seed to use before the platform pushes one (e.g. a ticket captured by another instance)
    pub initial_seed: Option<String>,
    pub active: bool,
}

impl Tenant {
    pub fn new(
        id: impl Into<String>,
        token: impl Into<String>,
        aes_key: CallbackKey,
        credential: CredentialKind,
    ) -> Self {
        let receive_id = credential.default_receive_id().to_string();
        Self {
            id: id.into(),
            receive_id,
            token: token.into(),
            aes_key,
            credential,
            initial_seed: None,
            active: true,
        }
    }

    pub fn with_receive_id(mut self, receive_id: impl Into<String>) -> Self {
        self.receive_id = receive_id.into();
        self
    }

    pub fn with_initial_seed(mut self, seed: impl Into<String>) -> Self {
        self.initial_seed = Some(seed.into());
        self
    }
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("receive_id", &self.receive_id)
            .field("credential", &self.credential)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Read-mostly lookup of tenant configuration by id
pub trait TenantDirectory: Send + Sync {
    /// Get a tenant regardless of its active flag
    fn get(&self, tenant_id: &str) -> Option<Arc<Tenant>>;

    /// Get a tenant that is allowed to take part in callbacks and outbound calls
    fn resolve_active(&self, tenant_id: &str) -> Result<Arc<Tenant>> {
        let tenant = self
            .get(tenant_id)
            .ok_or_else(|| CommonError::UnknownTenant(tenant_id.to_string()))?;
        if !tenant.active {
            return Err(CommonError::TenantInactive(tenant_id.to_string()));
        }
        Ok(tenant)
    }
}

/// Tenant directory held in memory, populated from configuration
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<HashMap<TenantId, Arc<Tenant>>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        let directory = Self::new();
        for tenant in tenants {
            directory.upsert(tenant);
        }
        directory
    }

    /// Insert or replace a tenant
    pub fn upsert(&self, tenant: Tenant) {
        info!(tenant_id = %tenant.id, active = tenant.active, "Registered tenant");
        self.tenants.write().insert(tenant.id.clone(), Arc::new(tenant));
    }

    /// Mark a tenant inactive. Returns false if the tenant is unknown.
    pub fn deactivate(&self, tenant_id: &str) -> bool {
        let mut tenants = self.tenants.write();
        match tenants.get(tenant_id) {
            Some(current) => {
                let mut updated = Tenant::clone(current);
                updated.active = false;
                tenants.insert(tenant_id.to_string(), Arc::new(updated));
                info!(tenant_id = %tenant_id, "Deactivated tenant");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.read().is_empty()
    }
}

impl TenantDirectory for InMemoryTenantDirectory {
    fn get(&self, tenant_id: &str) -> Option<Arc<Tenant>> {
        self.tenants.read().get(tenant_id).cloned()
    }
}
