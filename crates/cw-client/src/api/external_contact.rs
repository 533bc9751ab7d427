//! External contact endpoints

use cw_common::BizResponse;
use serde::{Deserialize, Serialize};

use super::PlatformClient;
use crate::executor::{ApiRequest, ExecError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalText {
    pub content: String,
}

/// One welcome attachment: `msgtype` plus the matching payload object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAttachment {
    pub msgtype: String,
    #[serde(flatten)]
    pub content: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub welcome_code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<ExternalText>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<ExternalAttachment>,
}

impl WelcomeMessage {
    pub fn text(welcome_code: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            welcome_code: welcome_code.into(),
            text: Some(ExternalText {
                content: content.into(),
            }),
            attachments: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), ExecError> {
        if self.welcome_code.trim().is_empty() {
            return Err(ExecError::invalid("welcome_code is required"));
        }
        if self.text.is_none() && self.attachments.is_empty() {
            return Err(ExecError::invalid("welcome message needs text or attachments"));
        }
        Ok(())
    }
}

impl PlatformClient {
    /// Send the welcome message for a newly added external contact
    pub async fn send_welcome_msg(&self, tenant_id: &str, msg: &WelcomeMessage) -> BizResponse {
        let built = msg.validate().and_then(|_| {
            serde_json::to_value(msg)
                .map(|body| ApiRequest::post("/cgi-bin/externalcontact/send_welcome_msg", body))
                .map_err(|e| ExecError::invalid(e.to_string()))
        });
        self.call(tenant_id, built).await
    }
}
