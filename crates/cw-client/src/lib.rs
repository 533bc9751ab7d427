//! CorpWire Platform Client
//!
//! Outbound calls on behalf of tenants:
//! - SignedRequestExecutor: credential attachment, rejection retry, transport retry
//! - PlatformClient: typed wrappers for a set of platform endpoints

pub mod api;
pub mod executor;

pub use api::PlatformClient;
pub use executor::{ApiReply, ApiRequest, ExecError, ExecutorConfig, SignedRequestExecutor};
pub use reqwest::Method;
