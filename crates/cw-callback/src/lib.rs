//! CorpWire Callback Core
//!
//! Inbound webhook handling for any number of tenants:
//! - CallbackCrypto: signature verification and envelope decrypt/encrypt
//! - Event decoding into a closed set of classes plus `Unrecognized`
//! - EventDispatcher: per-tenant and global handlers, suite ticket rotation
//! - CallbackService: one handshake or delivery cycle

pub mod crypto;
pub mod dispatcher;
pub mod event;
pub mod service;

pub use crypto::{compute_signature, CallbackCrypto, DecryptError, EncryptError, SignatureError};
pub use dispatcher::{DispatchOutcome, EventDispatcher, EventHandler};
pub use event::{decode, parse_envelope, Channel, DecodeError, DecodedEvent, EventKind};
pub use service::{CallbackError, CallbackQuery, CallbackService, ACK};
