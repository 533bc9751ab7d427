//! Application message endpoints

use cw_common::BizResponse;
use serde::{Deserialize, Serialize};

use super::{impl_from_biz, PlatformClient};
use crate::executor::{ApiRequest, ExecError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub content: String,
}

/// Text application message. At least one of `touser`, `toparty`, `totag` is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub touser: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub toparty: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub totag: String,
    pub agentid: i64,
    pub text: TextContent,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub safe: u8,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub enable_duplicate_check: u8,
}

fn is_zero(value: &u8) -> bool {
    *value == 0
}

impl TextMessage {
    pub fn to_users(agentid: i64, touser: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            touser: touser.into(),
            agentid,
            text: TextContent {
                content: content.into(),
            },
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), ExecError> {
        if self.touser.is_empty() && self.toparty.is_empty() && self.totag.is_empty() {
            return Err(ExecError::invalid("one of touser, toparty or totag is required"));
        }
        if self.text.content.trim().is_empty() {
            return Err(ExecError::invalid("text content is required"));
        }
        if self.safe > 1 {
            return Err(ExecError::invalid("safe must be 0 or 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageSendResponse {
    #[serde(flatten)]
    pub biz: BizResponse,
    pub invaliduser: String,
    pub invalidparty: String,
    pub invalidtag: String,
    pub msgid: String,
    pub response_code: String,
}

impl_from_biz!(MessageSendResponse);

impl PlatformClient {
    pub async fn send_text_message(&self, tenant_id: &str, msg: &TextMessage) -> MessageSendResponse {
        let built = msg.validate().and_then(|_| {
            let mut body = serde_json::to_value(msg).map_err(|e| ExecError::invalid(e.to_string()))?;
            if let Some(object) = body.as_object_mut() {
                object.insert("msgtype".to_string(), "text".into());
            }
            Ok(ApiRequest::post("/cgi-bin/message/send", body))
        });
        self.call(tenant_id, built).await
    }
}
