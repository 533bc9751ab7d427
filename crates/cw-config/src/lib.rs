//! CorpWire configuration
//!
//! Loads the gateway configuration from a TOML file, applies environment
//! overrides and validates tenant secret material before anything starts.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:8080"
//!
//! [[tenants]]
//! id = "suite"
//! token = "callback-token"
//! encoding_aes_key = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2D"
//!
//! [tenants.credential]
//! kind = "suite_ticket"
//! suite_id = "ww-suite"
//! suite_secret = "..."
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cw_common::{CallbackKey, CredentialKind, Tenant};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Cap on one event handler run before the delivery is acknowledged
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_handler_timeout_ms() -> u64 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plain,
            filter: default_log_filter(),
        }
    }
}

/// Outbound platform connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_request_timeout_ms() -> u64 { 10_000 }

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl PlatformConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Credential cache policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// A cached credential is only handed out while it has more than this left
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    /// Service-level cap on a single refresh call
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
    /// Default time a caller waits for a credential
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Token endpoint error codes that will not heal by retrying
    #[serde(default = "default_fatal_codes")]
    pub fatal_codes: Vec<i64>,
}

fn default_safety_margin_secs() -> u64 { 60 }
fn default_refresh_timeout_secs() -> u64 { 10 }
fn default_wait_timeout_secs() -> u64 { 10 }
fn default_fatal_codes() -> Vec<i64> { vec![40001, 40013] }

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            fatal_codes: default_fatal_codes(),
        }
    }
}

impl CredentialsConfig {
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Outbound call policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Business codes meaning "credential rejected"
    #[serde(default = "default_rejection_codes")]
    pub rejection_codes: Vec<i64>,
    #[serde(default = "default_max_transport_attempts")]
    pub max_transport_attempts: u32,
    #[serde(default = "default_transport_backoff_ms")]
    pub transport_backoff_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_rejection_codes() -> Vec<i64> { vec![40014, 42001, 42009, 40082] }
fn default_max_transport_attempts() -> u32 { 2 }
fn default_transport_backoff_ms() -> u64 { 200 }
fn default_call_timeout_secs() -> u64 { 30 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            rejection_codes: default_rejection_codes(),
            max_transport_attempts: default_max_transport_attempts(),
            transport_backoff_ms: default_transport_backoff_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn transport_backoff(&self) -> Duration {
        Duration::from_millis(self.transport_backoff_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// One configured tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    /// Overrides the identity marker derived from the credential kind.
    /// Authorized corps default to their suite's `suite_id`.
    #[serde(default)]
    pub receive_id: Option<String>,
    pub token: String,
    pub encoding_aes_key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub credential: CredentialConfig,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialConfig {
    CorpSecret {
        corp_id: String,
        secret: String,
    },
    SuiteTicket {
        suite_id: String,
        suite_secret: String,
        #[serde(default)]
        initial_ticket: Option<String>,
    },
    AuthorizedCorp {
        suite: String,
        auth_corp_id: String,
        permanent_code: String,
    },
}

impl TenantConfig {
    /// Build the runtime tenant, parsing key material
    pub fn to_tenant(&self) -> Result<Tenant> {
        let aes_key = CallbackKey::from_encoding_aes_key(&self.encoding_aes_key)
            .map_err(|e| ConfigError::invalid(format!("tenant {}: {}", self.id, e)))?;

        let (credential, initial_seed) = match &self.credential {
            CredentialConfig::CorpSecret { corp_id, secret } => (
                CredentialKind::CorpSecret {
                    corp_id: corp_id.clone(),
                    secret: secret.clone(),
                },
                None,
            ),
            CredentialConfig::SuiteTicket { suite_id, suite_secret, initial_ticket } => (
                CredentialKind::SuiteTicket {
                    suite_id: suite_id.clone(),
                    suite_secret: suite_secret.clone(),
                },
                initial_ticket.clone(),
            ),
            CredentialConfig::AuthorizedCorp { suite, auth_corp_id, permanent_code } => (
                CredentialKind::AuthorizedCorp {
                    suite: suite.clone(),
                    auth_corp_id: auth_corp_id.clone(),
                    permanent_code: permanent_code.clone(),
                },
                None,
            ),
        };

        let mut tenant = Tenant::new(self.id.clone(), self.token.clone(), aes_key, credential);
        if let Some(receive_id) = &self.receive_id {
            tenant = tenant.with_receive_id(receive_id.clone());
        }
        tenant.initial_seed = initial_seed;
        tenant.active = self.active;
        Ok(tenant)
    }
}

impl GatewayConfig {
    /// Load, apply env overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;

        info!(
            path = %path.display(),
            tenants = config.tenants.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Environment variables win over the file
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("CW_BIND_ADDR") {
            debug!(bind_addr = %addr, "Bind address overridden from environment");
            self.server.bind_addr = addr;
        }
        if let Some(url) = lookup("CW_PLATFORM_BASE_URL") {
            debug!(base_url = %url, "Platform base URL overridden from environment");
            self.platform.base_url = url;
        }
        if let Some(format) = lookup("CW_LOG_FORMAT") {
            match format.to_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "plain" => self.logging.format = LogFormat::Plain,
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.max_transport_attempts == 0 {
            return Err(ConfigError::invalid("executor.max_transport_attempts must be at least 1"));
        }
        if self.server.handler_timeout_ms == 0 {
            return Err(ConfigError::invalid("server.handler_timeout_ms must be positive"));
        }
        if self.credentials.refresh_timeout_secs == 0 {
            return Err(ConfigError::invalid("credentials.refresh_timeout_secs must be positive"));
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.trim().is_empty() {
                return Err(ConfigError::invalid("tenant id must not be empty"));
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate tenant id: {}", tenant.id)));
            }
            if tenant.token.is_empty() {
                return Err(ConfigError::invalid(format!("tenant {}: token must not be empty", tenant.id)));
            }
            tenant.to_tenant()?;
        }

        for tenant in &self.tenants {
            if let CredentialConfig::AuthorizedCorp { suite, .. } = &tenant.credential {
                let upstream = self.tenants.iter().find(|t| &t.id == suite).ok_or_else(|| {
                    ConfigError::invalid(format!("tenant {}: unknown suite tenant {}", tenant.id, suite))
                })?;
                if !matches!(upstream.credential, CredentialConfig::SuiteTicket { .. }) {
                    return Err(ConfigError::invalid(format!(
                        "tenant {}: {} is not a suite_ticket tenant",
                        tenant.id, suite
                    )));
                }
            }
        }

        Ok(())
    }

    /// Runtime tenants for the directory.
    ///
    /// Authorized corps without an explicit `receive_id` take their suite's
    /// `suite_id`, which is what the platform appends to their callbacks.
    pub fn build_tenants(&self) -> Result<Vec<Tenant>> {
        self.tenants
            .iter()
            .map(|config| {
                let tenant = config.to_tenant()?;
                match (&config.receive_id, &config.credential) {
                    (None, CredentialConfig::AuthorizedCorp { suite, .. }) => {
                        let suite_id = self.suite_id_of(suite).ok_or_else(|| {
                            ConfigError::invalid(format!(
                                "tenant {}: {} is not a suite_ticket tenant",
                                config.id, suite
                            ))
                        })?;
                        Ok(tenant.with_receive_id(suite_id.to_string()))
                    }
                    _ => Ok(tenant),
                }
            })
            .collect()
    }

    fn suite_id_of(&self, tenant_id: &str) -> Option<&str> {
        self.tenants.iter().find(|t| t.id == tenant_id).and_then(|t| match &t.credential {
            CredentialConfig::SuiteTicket { suite_id, .. } => Some(suite_id.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const KEY: &str = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2D";

    fn sample_toml() -> String {
        format!(
            r#"
[server]
bind_addr = "127.0.0.1:9000"

[credentials]
safety_margin_secs = 120

[[tenants]]
id = "suite"
token = "suite-token"
encoding_aes_key = "{key}"

[tenants.credential]
kind = "suite_ticket"
suite_id = "ww-suite"
suite_secret = "suite-secret"
initial_ticket = "ticket-0"

[[tenants]]
id = "acme"
token = "acme-token"
encoding_aes_key = "{key}"

[tenants.credential]
kind = "authorized_corp"
suite = "suite"
auth_corp_id = "wx-acme"
permanent_code = "perm"
"#,
            key = KEY
        )
    }

    #[test]
    fn test_defaults_apply_for_missing_sections() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.handler_timeout(), Duration::from_secs(3));
        assert_eq!(config.credentials.safety_margin(), Duration::from_secs(60));
        assert_eq!(config.executor.rejection_codes, vec![40014, 42001, 42009, 40082]);
        assert_eq!(config.executor.max_transport_attempts, 2);
        assert_eq!(config.logging.format, LogFormat::Plain);
        assert!(config.tenants.is_empty());
    }

    #[test]
    fn test_parse_tenants() {
        let config = GatewayConfig::from_toml_str(&sample_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.credentials.safety_margin_secs, 120);

        let tenants = config.build_tenants().unwrap();
        assert_eq!(tenants.len(), 2);

        let suite = &tenants[0];
        assert_eq!(suite.receive_id, "ww-suite");
        assert_eq!(suite.initial_seed.as_deref(), Some("ticket-0"));
        assert!(suite.credential.uses_seed());

        let acme = &tenants[1];
        assert_eq!(acme.receive_id, "ww-suite");
        assert!(matches!(acme.credential, CredentialKind::AuthorizedCorp { .. }));
    }

    #[test]
    fn test_authorized_corp_receive_id_follows_suite_unless_overridden() {
        let mut config = GatewayConfig::from_toml_str(&sample_toml()).unwrap();
        if let CredentialConfig::SuiteTicket { suite_id, .. } = &mut config.tenants[0].credential {
            *suite_id = "ww-renamed-suite".to_string();
        }
        assert_eq!(config.build_tenants().unwrap()[1].receive_id, "ww-renamed-suite");

        config.tenants[1].receive_id = Some("wx-acme".to_string());
        assert_eq!(config.build_tenants().unwrap()[1].receive_id, "wx-acme");
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = GatewayConfig::from_toml_str(&sample_toml()).unwrap();
        config.tenants[1].id = "suite".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tenant id"));
    }

    #[test]
    fn test_validate_rejects_bad_key() {
        let mut config = GatewayConfig::from_toml_str(&sample_toml()).unwrap();
        config.tenants[0].encoding_aes_key = "short".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_dangling_suite_reference() {
        let mut config = GatewayConfig::from_toml_str(&sample_toml()).unwrap();
        if let CredentialConfig::AuthorizedCorp { suite, .. } = &mut config.tenants[1].credential {
            *suite = "nope".to_string();
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown suite tenant"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        let env: HashMap<&str, &str> = [
            ("CW_BIND_ADDR", "127.0.0.1:1234"),
            ("CW_PLATFORM_BASE_URL", "http://localhost:9999"),
            ("CW_LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.platform.base_url, "http://localhost:9999");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.tenants.len(), 2);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = GatewayConfig::from_toml_str(include_str!("../../../config/gateway.example.toml")).unwrap();
        config.validate().unwrap();

        let tenants = config.build_tenants().unwrap();
        assert_eq!(tenants.len(), 3);
        assert_eq!(tenants[2].receive_id, "ww0000000000000002");
    }

    #[test]
    fn test_load_missing_file() {
        let err = GatewayConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
