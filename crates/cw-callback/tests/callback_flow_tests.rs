//! Full handshake and delivery cycles through CallbackService

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cw_callback::{
    compute_signature, CallbackCrypto, CallbackError, CallbackQuery, CallbackService, Channel, DecodeError,
    DecodedEvent, DecryptError, EventDispatcher, EventHandler, EventKind, SignatureError, ACK,
};
use cw_callback::crypto::encrypt_with;
use cw_common::{CallbackKey, CommonError, CredentialKind, InMemoryTenantDirectory, SystemClock, Tenant};
use cw_credential::{CredentialStore, IssuedToken, RefreshRequest, StoreConfig, TokenSource};
use parking_lot::Mutex;

const TIMESTAMP: &str = "1700000000";
const NONCE: &str = "nonce-1";

/// Records the seed of every refresh
#[derive(Default)]
struct SeedRecorder {
    seeds: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl TokenSource for SeedRecorder {
    async fn fetch(&self, request: RefreshRequest<'_>) -> cw_credential::Result<IssuedToken> {
        self.seeds.lock().push(request.seed.map(str::to_string));
        Ok(IssuedToken::new("suite-token", Duration::from_secs(7200)))
    }
}

#[derive(Default)]
struct Capture {
    calls: AtomicUsize,
    last: Mutex<Option<DecodedEvent>>,
}

#[async_trait]
impl EventHandler for Capture {
    async fn handle(&self, event: &DecodedEvent) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(event.clone());
        Ok(())
    }
}

struct Fixture {
    service: CallbackService,
    store: CredentialStore,
    source: Arc<SeedRecorder>,
    directory: Arc<InMemoryTenantDirectory>,
}

fn corp(id: &str, key_byte: u8) -> Tenant {
    Tenant::new(
        id,
        format!("token-{}", id),
        CallbackKey::from_bytes([key_byte; 32]),
        CredentialKind::CorpSecret {
            corp_id: format!("ww-{}", id),
            secret: "secret".to_string(),
        },
    )
}

fn suite() -> Tenant {
    Tenant::new(
        "suite",
        "token-suite",
        CallbackKey::from_bytes([3u8; 32]),
        CredentialKind::SuiteTicket {
            suite_id: "ww-suite".to_string(),
            suite_secret: "suite-secret".to_string(),
        },
    )
}

fn fixture() -> Fixture {
    let directory = Arc::new(InMemoryTenantDirectory::from_tenants(vec![
        corp("a", 1),
        corp("b", 1),
        suite(),
    ]));
    let source = Arc::new(SeedRecorder::default());
    let store = CredentialStore::new(
        StoreConfig::default(),
        directory.clone(),
        source.clone(),
        Arc::new(SystemClock),
    );
    let crypto = CallbackCrypto::new(directory.clone());
    let dispatcher = Arc::new(EventDispatcher::new(store.clone()));
    Fixture {
        service: CallbackService::new(crypto, dispatcher),
        store,
        source,
        directory,
    }
}

fn signed_query(token: &str, payload: &str, echostr: Option<&str>) -> CallbackQuery {
    CallbackQuery {
        msg_signature: Some(compute_signature(token, TIMESTAMP, NONCE, payload)),
        timestamp: Some(TIMESTAMP.to_string()),
        nonce: Some(NONCE.to_string()),
        echostr: echostr.map(str::to_string),
    }
}

fn delivery_body(encrypted: &str) -> Vec<u8> {
    format!(
        "<xml><ToUserName><![CDATA[ww-a]]></ToUserName><Encrypt><![CDATA[{}]]></Encrypt><AgentID>1</AgentID></xml>",
        encrypted
    )
    .into_bytes()
}

#[test]
fn test_handshake_returns_echo_plaintext_verbatim() {
    let f = fixture();
    let echostr = f.service.crypto().encrypt("a", b"5927782489442352469").unwrap();
    let query = signed_query("token-a", &echostr, Some(&echostr));

    let plaintext = f.service.handshake(Channel::Data, "a", &query).unwrap();
    assert_eq!(plaintext, b"5927782489442352469");
}

#[test]
fn test_handshake_rejects_bad_signature_and_missing_echo() {
    let f = fixture();
    let echostr = f.service.crypto().encrypt("a", b"hello").unwrap();

    let query = signed_query("wrong-token", &echostr, Some(&echostr));
    assert_eq!(
        f.service.handshake(Channel::Data, "a", &query),
        Err(CallbackError::Signature(SignatureError::Mismatch("a".to_string())))
    );

    let query = signed_query("token-a", &echostr, None);
    assert_eq!(
        f.service.handshake(Channel::Data, "a", &query),
        Err(CallbackError::MissingParameter("echostr"))
    );
}

#[test]
fn test_unknown_and_inactive_tenants() {
    let f = fixture();
    let echostr = f.service.crypto().encrypt("a", b"hello").unwrap();
    let query = signed_query("token-a", &echostr, Some(&echostr));

    assert_eq!(
        f.service.handshake(Channel::Data, "ghost", &query),
        Err(CallbackError::Tenant(CommonError::UnknownTenant("ghost".to_string())))
    );

    f.directory.deactivate("a");
    assert_eq!(
        f.service.handshake(Channel::Data, "a", &query),
        Err(CallbackError::Tenant(CommonError::TenantInactive("a".to_string())))
    );
}

#[test]
fn test_payload_for_one_tenant_rejected_by_another() {
    let f = fixture();
    // Same key, different identity marker; the signature is valid for b
    let echostr = f.service.crypto().encrypt("a", b"hello").unwrap();
    let query = signed_query("token-b", &echostr, Some(&echostr));

    assert_eq!(
        f.service.handshake(Channel::Data, "b", &query),
        Err(CallbackError::Decrypt(DecryptError::IdentityMismatch {
            tenant_id: "b".to_string()
        }))
    );
}

#[tokio::test]
async fn test_delivery_dispatches_and_acknowledges() {
    let f = fixture();
    let capture = Arc::new(Capture::default());
    f.service
        .dispatcher()
        .register_for_tenant("a", EventKind::ChangeExternalContact, capture.clone());

    let plaintext = "<xml><MsgType><![CDATA[event]]></MsgType><Event><![CDATA[change_external_contact]]></Event>\
                     <ExternalUserID>wm123</ExternalUserID></xml>";
    let encrypted = f.service.crypto().encrypt("a", plaintext.as_bytes()).unwrap();
    let query = signed_query("token-a", &encrypted, None);

    let ack = f
        .service
        .deliver(Channel::Data, "a", &query, &delivery_body(&encrypted))
        .await
        .unwrap();

    assert_eq!(ack, ACK);
    assert_eq!(capture.calls.load(Ordering::SeqCst), 1);
    let event = capture.last.lock().clone().unwrap();
    assert_eq!(event.tenant_id, "a");
    assert_eq!(event.channel, Channel::Data);
    assert_eq!(event.field("ExternalUserID"), Some("wm123"));
}

#[tokio::test]
async fn test_unrecognized_delivery_is_acknowledged() {
    let f = fixture();
    let encrypted = f
        .service
        .crypto()
        .encrypt("a", b"<xml><InfoType>not_yet_invented</InfoType></xml>")
        .unwrap();
    let query = signed_query("token-a", &encrypted, None);

    let ack = f
        .service
        .deliver(Channel::Cmd, "a", &query, &delivery_body(&encrypted))
        .await
        .unwrap();
    assert_eq!(ack, ACK);
}

#[tokio::test]
async fn test_delivery_failures_are_terminal() {
    let f = fixture();
    let encrypted = f.service.crypto().encrypt("a", b"<xml><MsgType>text</MsgType></xml>").unwrap();

    // Signature computed over a different payload
    let query = signed_query("token-a", "something-else", None);
    let err = f
        .service
        .deliver(Channel::Data, "a", &query, &delivery_body(&encrypted))
        .await
        .unwrap_err();
    assert!(matches!(err, CallbackError::Signature(_)));

    let query = signed_query("token-a", &encrypted, None);
    let err = f
        .service
        .deliver(Channel::Data, "a", &query, b"<xml><ToUserName>x</ToUserName></xml>")
        .await
        .unwrap_err();
    assert_eq!(err, CallbackError::Decode(DecodeError::MissingField("Encrypt")));

    let broken = f.service.crypto().encrypt("a", b"<xml><MsgType>text").unwrap();
    let query = signed_query("token-a", &broken, None);
    let err = f
        .service
        .deliver(Channel::Data, "a", &query, &delivery_body(&broken))
        .await
        .unwrap_err();
    assert!(matches!(err, CallbackError::Decode(DecodeError::Malformed(_))));
}

#[tokio::test]
async fn test_suite_ticket_delivery_feeds_next_refresh() {
    let f = fixture();
    let plaintext = "<xml><SuiteId><![CDATA[ww-suite]]></SuiteId><InfoType><![CDATA[suite_ticket]]></InfoType>\
                     <TimeStamp>1403610513</TimeStamp><SuiteTicket><![CDATA[fresh-ticket]]></SuiteTicket></xml>";
    let encrypted = f.service.crypto().encrypt("suite", plaintext.as_bytes()).unwrap();
    let query = signed_query("token-suite", &encrypted, None);

    f.service
        .deliver(Channel::Cmd, "suite", &query, &delivery_body(&encrypted))
        .await
        .unwrap();

    let credential = f.store.get("suite").await.unwrap();
    assert_eq!(credential.token_param, "suite_access_token");
    assert_eq!(*f.source.seeds.lock(), vec![Some("fresh-ticket".to_string())]);
}

#[test]
fn test_authorized_corp_accepts_data_addressed_to_its_suite() {
    let key = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2D";
    let config = cw_config::GatewayConfig::from_toml_str(&format!(
        r#"
[[tenants]]
id = "suite"
token = "token-suite"
encoding_aes_key = "{key}"

[tenants.credential]
kind = "suite_ticket"
suite_id = "ww-suite"
suite_secret = "suite-secret"

[[tenants]]
id = "school"
token = "token-suite"
encoding_aes_key = "{key}"

[tenants.credential]
kind = "authorized_corp"
suite = "suite"
auth_corp_id = "ww-corp"
permanent_code = "perm"
"#
    ))
    .unwrap();
    config.validate().unwrap();
    let directory = Arc::new(InMemoryTenantDirectory::from_tenants(config.build_tenants().unwrap()));
    let crypto = CallbackCrypto::new(directory);

    let message = b"<xml><ToUserName>ww-corp</ToUserName><MsgType>text</MsgType></xml>";
    let sealed = encrypt_with(
        &CallbackKey::from_encoding_aes_key(key).unwrap(),
        "ww-suite",
        message,
        [7u8; 16],
    )
    .unwrap();

    assert_eq!(crypto.decrypt("school", &sealed).unwrap(), message.to_vec());
}
