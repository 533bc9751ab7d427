//! One verification and dispatch cycle per inbound callback

use std::sync::Arc;

use cw_common::CommonError;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::{CallbackCrypto, DecryptError, SignatureError};
use crate::dispatcher::EventDispatcher;
use crate::event::{self, Channel, DecodeError};

/// Body returned to the platform for every accepted delivery
pub const ACK: &str = "success";

/// Query parameters the platform sends with every callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(alias = "signature")]
    pub msg_signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
}

impl CallbackQuery {
    fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, CallbackError> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or(CallbackError::MissingParameter(name))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error(transparent)]
    Tenant(CommonError),

    #[error("Missing query parameter: {0}")]
    MissingParameter(&'static str),

    #[error(transparent)]
    Signature(SignatureError),

    #[error(transparent)]
    Decrypt(DecryptError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<SignatureError> for CallbackError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::Tenant(e) => CallbackError::Tenant(e),
            other => CallbackError::Signature(other),
        }
    }
}

impl From<DecryptError> for CallbackError {
    fn from(e: DecryptError) -> Self {
        match e {
            DecryptError::Tenant(e) => CallbackError::Tenant(e),
            other => CallbackError::Decrypt(other),
        }
    }
}

/// Runs handshakes and deliveries against the crypto and dispatcher
#[derive(Clone)]
pub struct CallbackService {
    crypto: CallbackCrypto,
    dispatcher: Arc<EventDispatcher>,
}

impl CallbackService {
    pub fn new(crypto: CallbackCrypto, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { crypto, dispatcher }
    }

    pub fn crypto(&self) -> &CallbackCrypto {
        &self.crypto
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Prove endpoint ownership: verify and decrypt `echostr`, returning its plaintext verbatim
    pub fn handshake(&self, channel: Channel, tenant_id: &str, query: &CallbackQuery) -> Result<Vec<u8>, CallbackError> {
        let signature = CallbackQuery::required(&query.msg_signature, "msg_signature")?;
        let timestamp = CallbackQuery::required(&query.timestamp, "timestamp")?;
        let nonce = CallbackQuery::required(&query.nonce, "nonce")?;
        let echostr = CallbackQuery::required(&query.echostr, "echostr")?;

        self.crypto.verify(tenant_id, signature, timestamp, nonce, echostr)?;
        let plaintext = self.crypto.decrypt(tenant_id, echostr)?;

        info!(tenant_id = %tenant_id, channel = %channel, "Callback handshake verified");
        Ok(plaintext)
    }

    /// Verify, decrypt, decode and dispatch one delivery. Returns the acknowledgement body.
    pub async fn deliver(
        &self,
        channel: Channel,
        tenant_id: &str,
        query: &CallbackQuery,
        body: &[u8],
    ) -> Result<&'static str, CallbackError> {
        let signature = CallbackQuery::required(&query.msg_signature, "msg_signature")?;
        let timestamp = CallbackQuery::required(&query.timestamp, "timestamp")?;
        let nonce = CallbackQuery::required(&query.nonce, "nonce")?;

        let body = std::str::from_utf8(body)
            .map_err(|e| DecodeError::Malformed(format!("body is not UTF-8: {}", e)))?;
        let encrypted = event::parse_envelope(body)?;

        self.crypto.verify(tenant_id, signature, timestamp, nonce, &encrypted)?;
        let plaintext = self.crypto.decrypt(tenant_id, &encrypted)?;
        let decoded = event::decode(tenant_id, channel, &plaintext)?;

        let outcome = self.dispatcher.dispatch(&decoded).await;
        debug!(
            tenant_id = %tenant_id,
            channel = %channel,
            event_class = %decoded.kind,
            outcome = ?outcome,
            "Callback delivered"
        );
        Ok(ACK)
    }
}
