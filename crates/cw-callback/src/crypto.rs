//! Callback signature and envelope encryption
//!
//! - Signature: SHA-1 over the sorted `[token, timestamp, nonce, encrypted]`, hex encoded
//! - Envelope: AES-256-CBC, IV from the key, PKCS#7 padding to 32-byte blocks
//! - Plaintext: `random(16) | len (u32 BE) | msg | receive_id`

use std::sync::Arc;

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cw_common::{CallbackKey, CommonError, TenantDirectory};
use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Padding block size used by the platform (not the AES block size)
pub const PAD_BLOCK_SIZE: usize = 32;

const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_PREFIX_LEN: usize = 4;
const HEADER_LEN: usize = RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error(transparent)]
    Tenant(#[from] CommonError),

    #[error("Signature mismatch for tenant {0}")]
    Mismatch(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error(transparent)]
    Tenant(#[from] CommonError),

    #[error("Encrypted payload is not valid base64: {0}")]
    Base64(String),

    #[error("Cipher failure: {0}")]
    Cipher(String),

    #[error("Invalid padding value {0}")]
    Padding(u8),

    #[error("Invalid length prefix")]
    Length,

    #[error("Identity marker does not match tenant {tenant_id}")]
    IdentityMismatch { tenant_id: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptError {
    #[error(transparent)]
    Tenant(#[from] CommonError),

    #[error("Cipher failure: {0}")]
    Cipher(String),
}

/// Compute the callback signature for one request
pub fn compute_signature(token: &str, timestamp: &str, nonce: &str, encrypted: &str) -> String {
    let mut parts = [token, timestamp, nonce, encrypted];
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Encrypt `msg` for `receive_id` with an explicit random prefix
pub fn encrypt_with(
    key: &CallbackKey,
    receive_id: &str,
    msg: &[u8],
    random: [u8; RANDOM_PREFIX_LEN],
) -> Result<String, EncryptError> {
    let msg_len = u32::try_from(msg.len()).map_err(|_| EncryptError::Cipher("message too large".to_string()))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + msg.len() + receive_id.len() + PAD_BLOCK_SIZE);
    buf.extend_from_slice(&random);
    buf.extend_from_slice(&msg_len.to_be_bytes());
    buf.extend_from_slice(msg);
    buf.extend_from_slice(receive_id.as_bytes());

    let pad = PAD_BLOCK_SIZE - (buf.len() % PAD_BLOCK_SIZE);
    buf.resize(buf.len() + pad, pad as u8);

    let len = buf.len();
    Aes256CbcEnc::new_from_slices(key.as_bytes(), key.iv())
        .map_err(|e| EncryptError::Cipher(e.to_string()))?
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|e| EncryptError::Cipher(e.to_string()))?;

    Ok(STANDARD.encode(&buf))
}

/// Decrypted envelope: message body and the identity marker it was addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub msg: Vec<u8>,
    pub receive_id: Vec<u8>,
}

/// Decrypt and unframe an envelope without checking the identity marker
pub fn open(key: &CallbackKey, encrypted: &str) -> Result<Opened, DecryptError> {
    let mut buf = STANDARD
        .decode(encrypted.trim())
        .map_err(|e| DecryptError::Base64(e.to_string()))?;

    if buf.is_empty() || buf.len() % PAD_BLOCK_SIZE != 0 {
        return Err(DecryptError::Cipher(format!(
            "ciphertext length {} is not a positive multiple of {}",
            buf.len(),
            PAD_BLOCK_SIZE
        )));
    }

    let plain_len = Aes256CbcDec::new_from_slices(key.as_bytes(), key.iv())
        .map_err(|e| DecryptError::Cipher(e.to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| DecryptError::Cipher(e.to_string()))?
        .len();
    buf.truncate(plain_len);

    let pad = buf.last().copied().unwrap_or(0);
    if pad == 0 || pad as usize > PAD_BLOCK_SIZE {
        return Err(DecryptError::Padding(pad));
    }
    let content = &buf[..buf.len() - pad as usize];

    if content.len() < HEADER_LEN {
        return Err(DecryptError::Length);
    }
    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
    len_bytes.copy_from_slice(&content[RANDOM_PREFIX_LEN..HEADER_LEN]);
    let msg_len = u32::from_be_bytes(len_bytes) as usize;

    let msg_end = HEADER_LEN.checked_add(msg_len).ok_or(DecryptError::Length)?;
    if msg_end > content.len() {
        return Err(DecryptError::Length);
    }

    Ok(Opened {
        msg: content[HEADER_LEN..msg_end].to_vec(),
        receive_id: content[msg_end..].to_vec(),
    })
}

/// Per-tenant signature verification and envelope crypto
#[derive(Clone)]
pub struct CallbackCrypto {
    directory: Arc<dyn TenantDirectory>,
}

impl CallbackCrypto {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self { directory }
    }

    /// Check `signature` against the tenant's token. `payload` is the echo string
    /// for handshakes and the encrypted body for deliveries.
    pub fn verify(
        &self,
        tenant_id: &str,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        payload: &str,
    ) -> Result<(), SignatureError> {
        let tenant = self.directory.resolve_active(tenant_id)?;
        let expected = compute_signature(&tenant.token, timestamp, nonce, payload);
        let supplied = signature.trim().to_ascii_lowercase();

        if bool::from(expected.as_bytes().ct_eq(supplied.as_bytes())) {
            Ok(())
        } else {
            warn!(target: "security", tenant_id = %tenant_id, "Callback signature mismatch");
            Err(SignatureError::Mismatch(tenant_id.to_string()))
        }
    }

    /// Decrypt an envelope addressed to `tenant_id`
    pub fn decrypt(&self, tenant_id: &str, encrypted: &str) -> Result<Vec<u8>, DecryptError> {
        let tenant = self.directory.resolve_active(tenant_id)?;
        let opened = open(&tenant.aes_key, encrypted)?;

        if opened.receive_id != tenant.receive_id.as_bytes() {
            warn!(
                target: "security",
                tenant_id = %tenant_id,
                "Decrypted callback addressed to a different identity"
            );
            return Err(DecryptError::IdentityMismatch {
                tenant_id: tenant_id.to_string(),
            });
        }

        debug!(tenant_id = %tenant_id, bytes = opened.msg.len(), "Decrypted callback payload");
        Ok(opened.msg)
    }

    /// Encrypt a reply payload for `tenant_id`
    pub fn encrypt(&self, tenant_id: &str, plaintext: &[u8]) -> Result<String, EncryptError> {
        let tenant = self.directory.resolve_active(tenant_id)?;
        let mut random = [0u8; RANDOM_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut random);
        encrypt_with(&tenant.aes_key, &tenant.receive_id, plaintext, random)
    }
}
