//! Typed platform wrappers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cw_client::api::{GetUserAllLivingIdRequest, TextMessage, WelcomeMessage};
use cw_client::{ExecutorConfig, PlatformClient, SignedRequestExecutor};
use cw_common::{CallbackKey, CredentialKind, InMemoryTenantDirectory, SystemClock, Tenant, LOCAL_ERROR_CODE};
use cw_credential::{CredentialStore, IssuedToken, RefreshRequest, StoreConfig, TokenSource};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FixedSource;

#[async_trait]
impl TokenSource for FixedSource {
    async fn fetch(&self, _request: RefreshRequest<'_>) -> cw_credential::Result<IssuedToken> {
        Ok(IssuedToken::new("corp-token", Duration::from_secs(7200)))
    }
}

fn client(server: &MockServer) -> PlatformClient {
    let tenant = Tenant::new(
        "acme",
        "callback-token",
        CallbackKey::from_bytes([6u8; 32]),
        CredentialKind::CorpSecret {
            corp_id: "ww-acme".to_string(),
            secret: "secret".to_string(),
        },
    );
    let store = CredentialStore::new(
        StoreConfig::default(),
        Arc::new(InMemoryTenantDirectory::from_tenants(vec![tenant])),
        Arc::new(FixedSource),
        Arc::new(SystemClock),
    );
    let executor = SignedRequestExecutor::new(
        ExecutorConfig {
            base_url: server.uri(),
            ..Default::default()
        },
        store,
    )
    .unwrap();
    PlatformClient::new(Arc::new(executor))
}

async fn no_calls_expected() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_send_welcome_msg() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/externalcontact/send_welcome_msg"))
        .and(query_param("access_token", "corp-token"))
        .and(body_json(json!({
            "welcome_code": "CALLBACK_CODE",
            "text": {"content": "welcome"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errcode": 0, "errmsg": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client(&server)
        .send_welcome_msg("acme", &WelcomeMessage::text("CALLBACK_CODE", "welcome"))
        .await;
    assert!(resp.is_ok());
}

#[tokio::test]
async fn test_send_welcome_msg_requires_code() {
    let server = no_calls_expected().await;

    let resp = client(&server)
        .send_welcome_msg("acme", &WelcomeMessage::text("", "welcome"))
        .await;
    assert_eq!(resp.errcode, LOCAL_ERROR_CODE);
    assert!(resp.errmsg.contains("welcome_code"));
}

#[tokio::test]
async fn test_get_user_all_living_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/living/get_user_all_livingid"))
        .and(body_json(json!({"userid": "lecturer-01", "limit": 20})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "next_cursor": "next",
            "livingid_list": ["l1", "l2"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client(&server)
        .get_user_all_living_id(
            "acme",
            &GetUserAllLivingIdRequest {
                userid: "lecturer-01".to_string(),
                cursor: String::new(),
                limit: 20,
            },
        )
        .await;

    assert!(resp.biz.is_ok());
    assert_eq!(resp.next_cursor, "next");
    assert_eq!(resp.livingid_list, vec!["l1".to_string(), "l2".to_string()]);
}

#[tokio::test]
async fn test_get_living_info_decodes_nested_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/school/living/get_living_info"))
        .and(query_param("livingid", "live-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "living_info": {
                "theme": "physics",
                "living_start": 1700000000,
                "anchor_userid": "lecturer-01",
                "living_range": {"partyids": [1, 2], "group_names": ["class a"]},
                "viewer_num": 30
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client(&server).get_living_info("acme", "live-9").await;

    assert!(resp.biz.is_ok());
    assert_eq!(resp.living_info.theme, "physics");
    assert_eq!(resp.living_info.living_range.partyids, vec![1, 2]);
    assert_eq!(resp.living_info.viewer_num, 30);
}

#[tokio::test]
async fn test_living_cancel_and_delete_replay_require_id() {
    let server = no_calls_expected().await;
    let client = client(&server);

    assert_eq!(client.living_cancel("acme", " ").await.errcode, LOCAL_ERROR_CODE);
    assert_eq!(client.delete_replay_data("acme", "").await.errcode, LOCAL_ERROR_CODE);
}

#[tokio::test]
async fn test_delete_replay_data_reports_business_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/living/delete_replay_data"))
        .and(body_json(json!({"livingid": "live-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 300601,
            "errmsg": "living not found"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client(&server).delete_replay_data("acme", "live-1").await;
    assert_eq!(resp.errcode, 300601);
    assert_eq!(resp.errmsg, "living not found");
}

#[tokio::test]
async fn test_send_text_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/message/send"))
        .and(body_partial_json(json!({
            "touser": "u1|u2",
            "msgtype": "text",
            "agentid": 1000002,
            "text": {"content": "hello"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "invaliduser": "u2",
            "msgid": "msg-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client(&server)
        .send_text_message("acme", &TextMessage::to_users(1000002, "u1|u2", "hello"))
        .await;

    assert!(resp.biz.is_ok());
    assert_eq!(resp.invaliduser, "u2");
    assert_eq!(resp.msgid, "msg-1");
}

#[tokio::test]
async fn test_send_text_message_requires_recipient() {
    let server = no_calls_expected().await;
    let mut msg = TextMessage::to_users(1, "", "hello");

    let resp = client(&server).send_text_message("acme", &msg).await;
    assert_eq!(resp.biz.errcode, LOCAL_ERROR_CODE);

    msg.toparty = "2".to_string();
    msg.text.content = String::new();
    let resp = client(&server).send_text_message("acme", &msg).await;
    assert!(resp.biz.errmsg.contains("content"));
}
