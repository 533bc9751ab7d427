//! Live broadcast endpoints

use cw_common::BizResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{impl_from_biz, PlatformClient};
use crate::executor::{ApiRequest, ExecError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUserAllLivingIdRequest {
    pub userid: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub cursor: String,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GetUserAllLivingIdResponse {
    #[serde(flatten)]
    pub biz: BizResponse,
    #[serde(default)]
    pub next_cursor: String,
    #[serde(default)]
    pub livingid_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LivingRange {
    #[serde(default)]
    pub partyids: Vec<i64>,
    #[serde(default)]
    pub group_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LivingInfo {
    pub theme: String,
    pub living_start: i64,
    pub living_duration: i64,
    pub anchor_userid: String,
    pub living_range: LivingRange,
    pub viewer_num: i64,
    pub comment_num: i64,
    pub open_replay: i64,
    pub push_stream_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LivingInfoResponse {
    #[serde(flatten)]
    pub biz: BizResponse,
    #[serde(default)]
    pub living_info: LivingInfo,
}

impl_from_biz!(GetUserAllLivingIdResponse, LivingInfoResponse);

fn require_living_id(living_id: &str) -> Result<(), ExecError> {
    if living_id.trim().is_empty() {
        return Err(ExecError::invalid("livingid is required"));
    }
    Ok(())
}

impl PlatformClient {
    /// List the live broadcast ids of one user
    pub async fn get_user_all_living_id(
        &self,
        tenant_id: &str,
        request: &GetUserAllLivingIdRequest,
    ) -> GetUserAllLivingIdResponse {
        let built = if request.userid.trim().is_empty() {
            Err(ExecError::invalid("userid is required"))
        } else {
            serde_json::to_value(request)
                .map(|body| ApiRequest::post("/cgi-bin/living/get_user_all_livingid", body))
                .map_err(|e| ExecError::invalid(e.to_string()))
        };
        self.call(tenant_id, built).await
    }

    pub async fn get_living_info(&self, tenant_id: &str, living_id: &str) -> LivingInfoResponse {
        let built = require_living_id(living_id)
            .map(|_| ApiRequest::get("/cgi-bin/school/living/get_living_info").query("livingid", living_id));
        self.call(tenant_id, built).await
    }

    /// Cancel a scheduled live broadcast
    pub async fn living_cancel(&self, tenant_id: &str, living_id: &str) -> BizResponse {
        let built = require_living_id(living_id)
            .map(|_| ApiRequest::post("/cgi-bin/living/cancel", json!({ "livingid": living_id })));
        self.call(tenant_id, built).await
    }

    pub async fn delete_replay_data(&self, tenant_id: &str, living_id: &str) -> BizResponse {
        let built = require_living_id(living_id)
            .map(|_| ApiRequest::post("/cgi-bin/living/delete_replay_data", json!({ "livingid": living_id })));
        self.call(tenant_id, built).await
    }
}
