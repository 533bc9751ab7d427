//! Typed wrappers over `SignedRequestExecutor`
//!
//! Each wrapper validates its input, makes one call and returns a response struct
//! that flattens `BizResponse`. Failures come back as data, never as `Err`.

use std::sync::Arc;

use cw_common::BizResponse;
use serde::de::DeserializeOwned;

use crate::executor::{ApiRequest, ExecError, SignedRequestExecutor};

pub mod external_contact;
pub mod living;
pub mod message;

pub use external_contact::{ExternalAttachment, ExternalText, WelcomeMessage};
pub use living::{
    GetUserAllLivingIdRequest, GetUserAllLivingIdResponse, LivingInfo, LivingInfoResponse, LivingRange,
};
pub use message::{MessageSendResponse, TextContent, TextMessage};

/// Response types that can carry a failure without a payload
pub trait FromBiz: DeserializeOwned {
    fn from_biz(biz: BizResponse) -> Self;
}

impl FromBiz for BizResponse {
    fn from_biz(biz: BizResponse) -> Self {
        biz
    }
}

macro_rules! impl_from_biz {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::api::FromBiz for $ty {
                fn from_biz(biz: ::cw_common::BizResponse) -> Self {
                    Self {
                        biz,
                        ..Default::default()
                    }
                }
            }
        )*
    };
}
pub(crate) use impl_from_biz;

/// Platform API client for all tenants
#[derive(Clone)]
pub struct PlatformClient {
    executor: Arc<SignedRequestExecutor>,
}

impl PlatformClient {
    pub fn new(executor: Arc<SignedRequestExecutor>) -> Self {
        Self { executor }
    }

    async fn call<T: FromBiz>(&self, tenant_id: &str, request: Result<ApiRequest, ExecError>) -> T {
        let outcome = match request {
            Ok(request) => self
                .executor
                .execute(tenant_id, request)
                .await
                .and_then(|reply| reply.decode::<T>()),
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| T::from_biz(e.to_biz()))
    }
}
