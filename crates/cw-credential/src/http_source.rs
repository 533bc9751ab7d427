//! Token source backed by the platform's token endpoints
//!
//! - `CorpSecret`: `GET /cgi-bin/gettoken`
//! - `SuiteTicket`: `POST /cgi-bin/service/get_suite_token` with the latest ticket
//! - `AuthorizedCorp`: `POST /cgi-bin/service/get_corp_token` through the suite credential

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use cw_common::CredentialKind;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{CredentialError, IssuedToken, RefreshRequest, Result, TokenSource};

/// Lifetime assumed when the reply omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 7200;

/// Platform tokens live two hours; anything beyond a day is a broken reply
const MAX_EXPIRES_IN_SECS: u64 = 86_400;

/// Token source configuration
#[derive(Debug, Clone)]
pub struct TokenSourceConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Platform codes that mean the configured secret itself is wrong
    pub fatal_codes: Vec<i64>,
}

impl Default for TokenSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://qyapi.weixin.qq.com".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            fatal_codes: vec![40001, 40013],
        }
    }
}

/// Union of the three token endpoint reply shapes
#[derive(Debug, Default, Deserialize)]
struct TokenReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    suite_access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// HTTP token source
pub struct PlatformTokenSource {
    client: reqwest::Client,
    base_url: String,
    fatal_codes: HashSet<i64>,
}

impl PlatformTokenSource {
    pub fn new(config: TokenSourceConfig) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fatal_codes: config.fatal_codes.into_iter().collect(),
        })
    }

    fn build_request(&self, request: &RefreshRequest<'_>) -> Result<reqwest::RequestBuilder> {
        let tenant_id = request.tenant.id.as_str();
        match &request.tenant.credential {
            CredentialKind::CorpSecret { corp_id, secret } => {
                let url = format!("{}/cgi-bin/gettoken", self.base_url);
                Ok(self
                    .client
                    .get(url)
                    .query(&[("corpid", corp_id.as_str()), ("corpsecret", secret.as_str())]))
            }
            CredentialKind::SuiteTicket { suite_id, suite_secret } => {
                let ticket = request
                    .seed
                    .ok_or_else(|| CredentialError::transient(tenant_id, "no suite ticket received yet"))?;
                let url = format!("{}/cgi-bin/service/get_suite_token", self.base_url);
                Ok(self.client.post(url).json(&json!({
                    "suite_id": suite_id,
                    "suite_secret": suite_secret,
                    "suite_ticket": ticket,
                })))
            }
            CredentialKind::AuthorizedCorp {
                auth_corp_id,
                permanent_code,
                ..
            } => {
                let upstream = request
                    .upstream
                    .ok_or_else(|| CredentialError::transient(tenant_id, "suite credential unavailable"))?;
                let url = format!("{}/cgi-bin/service/get_corp_token", self.base_url);
                Ok(self
                    .client
                    .post(url)
                    .query(&[("suite_access_token", upstream.token.as_str())])
                    .json(&json!({
                        "auth_corpid": auth_corp_id,
                        "permanent_code": permanent_code,
                    })))
            }
        }
    }

    fn classify(&self, tenant_id: &str, reply: TokenReply) -> Result<IssuedToken> {
        if reply.errcode != 0 {
            warn!(
                tenant_id = %tenant_id,
                errcode = reply.errcode,
                errmsg = %reply.errmsg,
                "Token endpoint rejected refresh"
            );
            let message = format!("platform error {}: {}", reply.errcode, reply.errmsg);
            return Err(if self.fatal_codes.contains(&reply.errcode) {
                CredentialError::fatal(tenant_id, message)
            } else {
                CredentialError::transient(tenant_id, message)
            });
        }

        let token = reply
            .access_token
            .or(reply.suite_access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| CredentialError::transient(tenant_id, "token missing from reply"))?;

        let expires_in = reply.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        if expires_in == 0 || expires_in > MAX_EXPIRES_IN_SECS {
            return Err(CredentialError::transient(
                tenant_id,
                format!("implausible expires_in: {}", expires_in),
            ));
        }
        Ok(IssuedToken::new(token, Duration::from_secs(expires_in)))
    }
}

#[async_trait]
impl TokenSource for PlatformTokenSource {
    async fn fetch(&self, request: RefreshRequest<'_>) -> Result<IssuedToken> {
        let tenant_id = request.tenant.id.as_str();
        let builder = self.build_request(&request)?;

        debug!(tenant_id = %tenant_id, kind = ?request.tenant.credential, "Requesting platform token");

        let response = builder
            .send()
            .await
            .map_err(|e| CredentialError::transient(tenant_id, format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::transient(
                tenant_id,
                format!("token endpoint returned HTTP {}", status),
            ));
        }

        let reply = response
            .json::<TokenReply>()
            .await
            .map_err(|e| CredentialError::transient(tenant_id, format!("unreadable token reply: {}", e)))?;

        self.classify(tenant_id, reply)
    }
}
