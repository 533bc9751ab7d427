//! Callback event decoding
//!
//! Events are flat XML documents. The class tag comes from `InfoType` (command channel),
//! then `Event` for `MsgType=event`, then `MsgType` itself.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use cw_common::TenantId;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;

/// Field carrying the rotated suite ticket
pub const SUITE_TICKET_FIELD: &str = "SuiteTicket";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed callback document: {0}")]
    Malformed(String),

    #[error("Callback document is missing field {0}")]
    MissingField(&'static str),
}

/// Callback route the platform delivered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Data callbacks for authorized corps
    Data,
    /// Instruction callbacks (tickets, authorization changes)
    Cmd,
    /// Customized-application callbacks
    Customized,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Data => "data",
            Channel::Cmd => "cmd",
            Channel::Customized => "customized",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Channel::Data),
            "cmd" => Ok(Channel::Cmd),
            "customized" => Ok(Channel::Customized),
            other => Err(format!("unknown callback channel: {}", other)),
        }
    }
}

/// Event class. New platform classes land in `Unrecognized` instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    SuiteTicket,
    CreateAuth,
    ChangeAuth,
    CancelAuth,
    ResetPermanentCode,
    ChangeContact,
    ChangeExternalContact,
    ChangeExternalChat,
    LivingStatusChange,
    Unrecognized(String),
}

impl EventKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "suite_ticket" => EventKind::SuiteTicket,
            "create_auth" => EventKind::CreateAuth,
            "change_auth" => EventKind::ChangeAuth,
            "cancel_auth" => EventKind::CancelAuth,
            "reset_permanent_code" => EventKind::ResetPermanentCode,
            "change_contact" => EventKind::ChangeContact,
            "change_external_contact" => EventKind::ChangeExternalContact,
            "change_external_chat" => EventKind::ChangeExternalChat,
            "living_status_change" => EventKind::LivingStatusChange,
            other => EventKind::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::SuiteTicket => "suite_ticket",
            EventKind::CreateAuth => "create_auth",
            EventKind::ChangeAuth => "change_auth",
            EventKind::CancelAuth => "cancel_auth",
            EventKind::ResetPermanentCode => "reset_permanent_code",
            EventKind::ChangeContact => "change_contact",
            EventKind::ChangeExternalContact => "change_external_contact",
            EventKind::ChangeExternalChat => "change_external_chat",
            EventKind::LivingStatusChange => "living_status_change",
            EventKind::Unrecognized(tag) => tag,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, EventKind::Unrecognized(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verified, decrypted and decoded callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub tenant_id: TenantId,
    pub channel: Channel,
    pub kind: EventKind,
    pub fields: HashMap<String, String>,
    /// Decrypted XML as delivered
    pub raw: String,
}

impl DecodedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Rotated seed carried by a `suite_ticket` event
    pub fn suite_ticket(&self) -> Option<&str> {
        match self.kind {
            EventKind::SuiteTicket => self.field(SUITE_TICKET_FIELD),
            _ => None,
        }
    }
}

/// Collect leaf element text of a flat XML document. Repeated names keep the first value.
pub fn parse_fields(xml: &str) -> Result<HashMap<String, String>, DecodeError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if path.is_empty() && saw_root {
                    return Err(DecodeError::Malformed("multiple root elements".to_string()));
                }
                saw_root = true;
                path.push(String::from_utf8_lossy(e.local_name().into_inner()).to_string());
            }
            Ok(Event::Empty(ref e)) => {
                if path.is_empty() {
                    saw_root = true;
                } else {
                    let name = String::from_utf8_lossy(e.local_name().into_inner()).to_string();
                    fields.entry(name).or_insert_with(String::new);
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?
                    .to_string();
                record(&mut fields, &path, text);
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8(e.into_inner().into_owned())
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?;
                record(&mut fields, &path, text);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(DecodeError::Malformed(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(DecodeError::Malformed("empty document".to_string()));
    }
    if !path.is_empty() {
        return Err(DecodeError::Malformed("unexpected end of document".to_string()));
    }
    Ok(fields)
}

fn record(fields: &mut HashMap<String, String>, path: &[String], text: String) {
    // Text directly under the root is ignored
    if path.len() < 2 {
        return;
    }
    if let Some(name) = path.last() {
        fields.entry(name.clone()).or_insert(text);
    }
}

/// Pull the encrypted payload out of a delivery body
pub fn parse_envelope(body: &str) -> Result<String, DecodeError> {
    let mut fields = parse_fields(body)?;
    fields
        .remove("Encrypt")
        .filter(|encrypted| !encrypted.is_empty())
        .ok_or(DecodeError::MissingField("Encrypt"))
}

/// Decode a decrypted callback into an event
pub fn decode(tenant_id: &str, channel: Channel, plaintext: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let raw = std::str::from_utf8(plaintext)
        .map_err(|e| DecodeError::Malformed(format!("payload is not UTF-8: {}", e)))?
        .to_string();
    let fields = parse_fields(&raw)?;

    let tag = match (fields.get("InfoType"), fields.get("MsgType")) {
        (Some(info_type), _) => info_type.clone(),
        (None, Some(msg_type)) if msg_type == "event" => fields
            .get("Event")
            .cloned()
            .ok_or(DecodeError::MissingField("Event"))?,
        (None, Some(msg_type)) => msg_type.clone(),
        (None, None) => return Err(DecodeError::MissingField("InfoType")),
    };

    let kind = EventKind::from_tag(&tag);
    if kind == EventKind::SuiteTicket && !fields.contains_key(SUITE_TICKET_FIELD) {
        return Err(DecodeError::MissingField(SUITE_TICKET_FIELD));
    }

    Ok(DecodedEvent {
        tenant_id: tenant_id.to_string(),
        channel,
        kind,
        fields,
        raw,
    })
}
