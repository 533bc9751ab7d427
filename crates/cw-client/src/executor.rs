//! Signed request executor
//!
//! Attaches the tenant's live credential to every outbound platform call and
//! normalizes the reply into `{errcode, errmsg, payload}`.
//! - Credential-rejection codes invalidate the rejected credential and retry exactly once
//! - Transport failures are retried with linear backoff, idempotent methods only
//! - Every call is bounded by one overall deadline

use std::collections::HashSet;
use std::time::Duration;

use cw_common::{BizResponse, LOCAL_ERROR_CODE};
use cw_credential::{Credential, CredentialError, CredentialStore};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Platform codes meaning "this credential is no longer accepted"
    pub rejection_codes: Vec<i64>,
    /// Attempts per call for idempotent methods on transport failure
    pub max_transport_attempts: u32,
    /// Backoff unit, multiplied by the attempt number
    pub transport_backoff: Duration,
    /// Deadline for the whole call including credential waits
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://qyapi.weixin.qq.com".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            rejection_codes: vec![40014, 42001, 42009, 40082],
            max_transport_attempts: 2,
            transport_backoff: Duration::from_millis(200),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("Credential rejected twice by platform ({code}): {message}")]
    AuthRejected { code: i64, message: String },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Platform error {code}: {message}")]
    Business { code: i64, message: String },

    #[error(transparent)]
    Credential(CredentialError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unreadable response: {0}")]
    Decode(String),
}

impl ExecError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Uniform failure shape. Platform codes are kept; local failures use the local code.
    pub fn to_biz(&self) -> BizResponse {
        match self {
            ExecError::AuthRejected { code, message } | ExecError::Business { code, message } => {
                BizResponse::error(*code, message.clone())
            }
            other => BizResponse::error(LOCAL_ERROR_CODE, other.to_string()),
        }
    }
}

impl From<CredentialError> for ExecError {
    fn from(e: CredentialError) -> Self {
        if e.is_fatal() {
            ExecError::Credential(e)
        } else {
            ExecError::Transient(e.to_string())
        }
    }
}

/// One outbound platform call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
        )
    }
}

/// Successful, normalized platform reply
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub errcode: i64,
    pub errmsg: String,
    pub payload: Value,
}

impl ApiReply {
    fn from_payload(payload: Value) -> Self {
        let errcode = payload.get("errcode").and_then(Value::as_i64).unwrap_or(0);
        let errmsg = payload
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            errcode,
            errmsg,
            payload,
        }
    }

    pub fn biz(&self) -> BizResponse {
        BizResponse::error(self.errcode, self.errmsg.clone())
    }

    /// Deserialize the payload into a typed response
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ExecError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ExecError::Decode(e.to_string()))
    }
}

enum SendError {
    /// Nothing usable came back; safe to retry for idempotent methods
    Transport(String),
    Fatal(ExecError),
}

/// Executes platform calls on behalf of tenants
pub struct SignedRequestExecutor {
    client: reqwest::Client,
    base_url: String,
    store: CredentialStore,
    rejection_codes: HashSet<i64>,
    max_transport_attempts: u32,
    transport_backoff: Duration,
    call_timeout: Duration,
}

impl SignedRequestExecutor {
    pub fn new(config: ExecutorConfig, store: CredentialStore) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            store,
            rejection_codes: config.rejection_codes.into_iter().collect(),
            max_transport_attempts: config.max_transport_attempts.max(1),
            transport_backoff: config.transport_backoff,
            call_timeout: config.call_timeout,
        })
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Run one call for `tenant_id`
    pub async fn execute(&self, tenant_id: &str, request: ApiRequest) -> Result<ApiReply, ExecError> {
        let deadline = Instant::now() + self.call_timeout;
        match tokio::time::timeout_at(deadline, self.execute_until(tenant_id, &request, deadline)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tenant_id = %tenant_id, path = %request.path, "Platform call deadline elapsed");
                Err(ExecError::transient("call deadline elapsed"))
            }
        }
    }

    /// `Do(tenant, method, path, body)` form of `execute`
    pub async fn call(
        &self,
        tenant_id: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<ApiReply, ExecError> {
        let mut request = ApiRequest::new(method, path);
        request.body = body;
        self.execute(tenant_id, request).await
    }

    async fn execute_until(&self, tenant_id: &str, request: &ApiRequest, deadline: Instant) -> Result<ApiReply, ExecError> {
        let mut retried_rejection = false;

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let credential = self.store.get_with_deadline(tenant_id, wait).await?;

            let reply = ApiReply::from_payload(self.send_with_retry(tenant_id, request, &credential).await?);
            if reply.errcode == 0 {
                debug!(tenant_id = %tenant_id, path = %request.path, "Platform call succeeded");
                return Ok(reply);
            }

            if !self.rejection_codes.contains(&reply.errcode) {
                debug!(
                    tenant_id = %tenant_id,
                    path = %request.path,
                    errcode = reply.errcode,
                    "Platform returned business error"
                );
                return Err(ExecError::Business {
                    code: reply.errcode,
                    message: reply.errmsg,
                });
            }

            self.store.invalidate_token(tenant_id, &credential.token);
            if retried_rejection {
                warn!(
                    tenant_id = %tenant_id,
                    path = %request.path,
                    errcode = reply.errcode,
                    "Fresh credential rejected again"
                );
                return Err(ExecError::AuthRejected {
                    code: reply.errcode,
                    message: reply.errmsg,
                });
            }

            info!(
                tenant_id = %tenant_id,
                path = %request.path,
                errcode = reply.errcode,
                "Credential rejected, retrying with a fresh one"
            );
            retried_rejection = true;
        }
    }

    async fn send_with_retry(&self, tenant_id: &str, request: &ApiRequest, credential: &Credential) -> Result<Value, ExecError> {
        let attempts = if request.is_idempotent() {
            self.max_transport_attempts
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(request, credential).await {
                Ok(payload) => return Ok(payload),
                Err(SendError::Fatal(e)) => return Err(e),
                Err(SendError::Transport(message)) if attempt < attempts => {
                    warn!(
                        tenant_id = %tenant_id,
                        method = %request.method,
                        path = %request.path,
                        attempt = attempt,
                        error = %message,
                        "Transport failure, retrying"
                    );
                    tokio::time::sleep(self.transport_backoff * attempt).await;
                }
                Err(SendError::Transport(message)) => {
                    warn!(
                        tenant_id = %tenant_id,
                        method = %request.method,
                        path = %request.path,
                        attempts = attempt,
                        error = %message,
                        "Transport failure"
                    );
                    return Err(ExecError::Transient(message));
                }
            }
        }
    }

    async fn send_once(&self, request: &ApiRequest, credential: &Credential) -> Result<Value, SendError> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .query(&[(credential.token_param, credential.token.as_str())])
            .query(&request.query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SendError::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SendError::Transport(format!("platform returned HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(SendError::Fatal(ExecError::transient(format!(
                "platform returned HTTP {}",
                status
            ))));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SendError::Fatal(ExecError::Decode(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_normalization() {
        let reply = ApiReply::from_payload(json!({"errcode": 0, "errmsg": "ok", "msgid": "m1"}));
        assert_eq!(reply.errcode, 0);
        assert!(reply.biz().is_ok());

        // Missing status fields mean success
        let reply = ApiReply::from_payload(json!({"living_info": {"theme": "x"}}));
        assert_eq!(reply.errcode, 0);
        assert_eq!(reply.errmsg, "");
    }

    #[test]
    fn test_errors_map_to_uniform_shape() {
        let business = ExecError::Business {
            code: 60011,
            message: "no privilege".to_string(),
        };
        assert_eq!(business.to_biz(), BizResponse::error(60011, "no privilege"));

        let local = ExecError::invalid("welcome_code is required").to_biz();
        assert_eq!(local.errcode, LOCAL_ERROR_CODE);
        assert!(local.errmsg.contains("welcome_code"));
    }

    #[test]
    fn test_credential_errors_split_by_class() {
        let transient: ExecError = CredentialError::transient("acme", "busy").into();
        assert!(matches!(transient, ExecError::Transient(_)));

        let fatal: ExecError = CredentialError::fatal("acme", "unknown tenant").into();
        assert!(matches!(fatal, ExecError::Credential(_)));
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(ApiRequest::get("/x").is_idempotent());
        assert!(ApiRequest::new(Method::DELETE, "/x").is_idempotent());
        assert!(!ApiRequest::post("/x", json!({})).is_idempotent());
        assert!(!ApiRequest::new(Method::PATCH, "/x").is_idempotent());
    }
}
