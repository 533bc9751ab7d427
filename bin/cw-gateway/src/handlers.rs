//! Built-in event handlers

use anyhow::{bail, Result};
use async_trait::async_trait;
use cw_callback::{DecodedEvent, EventHandler};
use cw_client::api::WelcomeMessage;
use cw_client::PlatformClient;
use tracing::info;

/// Logs authorization lifecycle events (install, change, cancel)
pub struct AuthLifecycleLogger;

#[async_trait]
impl EventHandler for AuthLifecycleLogger {
    async fn handle(&self, event: &DecodedEvent) -> Result<()> {
        info!(
            tenant_id = %event.tenant_id,
            event_class = %event.kind,
            auth_corp_id = event.field("AuthCorpId").unwrap_or(""),
            "Authorization event received"
        );
        Ok(())
    }
}

/// Greets newly added external contacts with a fixed text
pub struct WelcomeSender {
    client: PlatformClient,
    text: String,
}

impl WelcomeSender {
    pub fn new(client: PlatformClient, text: impl Into<String>) -> Self {
        Self {
            client,
            text: text.into(),
        }
    }
}

/// Welcome code of an `add_external_contact` change, if the event carries one
pub fn welcome_code(event: &DecodedEvent) -> Option<&str> {
    if event.field("ChangeType") != Some("add_external_contact") {
        return None;
    }
    event.field("WelcomeCode").filter(|code| !code.is_empty())
}

#[async_trait]
impl EventHandler for WelcomeSender {
    async fn handle(&self, event: &DecodedEvent) -> Result<()> {
        let Some(code) = welcome_code(event) else {
            return Ok(());
        };

        let resp = self
            .client
            .send_welcome_msg(&event.tenant_id, &WelcomeMessage::text(code, self.text.clone()))
            .await;
        if !resp.is_ok() {
            bail!("send_welcome_msg failed ({}): {}", resp.errcode, resp.errmsg);
        }

        info!(
            tenant_id = %event.tenant_id,
            external_user_id = event.field("ExternalUserID").unwrap_or(""),
            "Welcome message sent"
        );
        Ok(())
    }
}
