//! Control channel envelopes and typed message payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "1.6";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// `{type, version, payload}` wrapper around every control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// `Null` when the message had no payload, or an explicit `null`.
    /// Either way it is written back without one.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            version: PROTOCOL_VERSION.to_string(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.parse().unwrap_or(MessageType::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Invite,
    Answer,
    Hangup,
    Cancel,
    Ready,
    Offline,
    Close,
    Error,
    Ringing,
    Connected,
    Ack,
    Register,
    Listen,
    Reject,
    Reinvite,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Invite => "invite",
            MessageType::Answer => "answer",
            MessageType::Hangup => "hangup",
            MessageType::Cancel => "cancel",
            MessageType::Ready => "ready",
            MessageType::Offline => "offline",
            MessageType::Close => "close",
            MessageType::Error => "error",
            MessageType::Ringing => "ringing",
            MessageType::Connected => "connected",
            MessageType::Ack => "ack",
            MessageType::Register => "register",
            MessageType::Listen => "listen",
            MessageType::Reject => "reject",
            MessageType::Reinvite => "reinvite",
            MessageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "invite" => MessageType::Invite,
            "answer" => MessageType::Answer,
            "hangup" => MessageType::Hangup,
            "cancel" => MessageType::Cancel,
            "ready" => MessageType::Ready,
            "offline" => MessageType::Offline,
            "close" => MessageType::Close,
            "error" => MessageType::Error,
            "ringing" => MessageType::Ringing,
            "connected" => MessageType::Connected,
            "ack" => MessageType::Ack,
            "register" => MessageType::Register,
            "listen" => MessageType::Listen,
            "reject" => MessageType::Reject,
            "reinvite" => MessageType::Reinvite,
            _ => return Err(()),
        })
    }
}

/// Fields the server added that this client does not model. Kept so a
/// decoded message re-encodes to the same payload.
pub type Extra = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwilioParams {
    /// URL-encoded custom parameters, in insertion order.
    pub params: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub callsid: String,
    pub sdp: String,
    /// Present on inbound invites: CallSid, From, To, AccountSid, Params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    /// Present on outbound invites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twilio: Option<TwilioParams>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub callsid: String,
    pub sdp: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRef {
    pub callsid: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl CallRef {
    pub fn new(callsid: impl Into<String>) -> Self {
        Self {
            callsid: callsid.into(),
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hangup {
    pub callsid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callsid: Option<String>,
    pub error: ErrorBody,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ringing {
    pub callsid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCapabilities {
    pub audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub media: MediaCapabilities,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listen {
    pub token: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A message on the control channel, decoded by `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    Invite(Invite),
    Answer(SessionDescription),
    Hangup(Hangup),
    Cancel(CallRef),
    Ready(Option<Extra>),
    Offline(Option<Extra>),
    Close(Option<Extra>),
    Error(ErrorMessage),
    Ringing(Ringing),
    Connected(CallRef),
    Ack(Option<Extra>),
    Register(Register),
    Listen(Listen),
    Reject(CallRef),
    Reinvite(SessionDescription),
    Unknown { kind: String, payload: Value },
}

fn decode<T: DeserializeOwned>(kind: MessageType, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::Payload { kind, source })
}

fn decode_extra(kind: MessageType, payload: Value) -> Result<Option<Extra>, ProtocolError> {
    match payload {
        Value::Null => Ok(None),
        other => decode(kind, other).map(Some),
    }
}

impl SignalingMessage {
    pub fn register(audio: bool) -> Self {
        SignalingMessage::Register(Register {
            media: MediaCapabilities { audio },
            extra: Extra::new(),
        })
    }

    pub fn listen(token: impl Into<String>) -> Self {
        SignalingMessage::Listen(Listen {
            token: token.into(),
            extra: Extra::new(),
        })
    }

    pub fn outbound_invite(callsid: &str, sdp: String, params: String) -> Self {
        SignalingMessage::Invite(Invite {
            callsid: callsid.to_string(),
            sdp,
            parameters: None,
            twilio: Some(TwilioParams {
                params,
                extra: Extra::new(),
            }),
            extra: Extra::new(),
        })
    }

    pub fn answer(callsid: &str, sdp: String) -> Self {
        SignalingMessage::Answer(SessionDescription {
            callsid: callsid.to_string(),
            sdp,
            extra: Extra::new(),
        })
    }

    pub fn reinvite(callsid: &str, sdp: String) -> Self {
        SignalingMessage::Reinvite(SessionDescription {
            callsid: callsid.to_string(),
            sdp,
            extra: Extra::new(),
        })
    }

    pub fn hangup(callsid: &str) -> Self {
        SignalingMessage::Hangup(Hangup {
            callsid: callsid.to_string(),
            message: None,
            error: None,
            extra: Extra::new(),
        })
    }

    pub fn reject(callsid: &str) -> Self {
        SignalingMessage::Reject(CallRef::new(callsid))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            SignalingMessage::Invite(_) => MessageType::Invite,
            SignalingMessage::Answer(_) => MessageType::Answer,
            SignalingMessage::Hangup(_) => MessageType::Hangup,
            SignalingMessage::Cancel(_) => MessageType::Cancel,
            SignalingMessage::Ready(_) => MessageType::Ready,
            SignalingMessage::Offline(_) => MessageType::Offline,
            SignalingMessage::Close(_) => MessageType::Close,
            SignalingMessage::Error(_) => MessageType::Error,
            SignalingMessage::Ringing(_) => MessageType::Ringing,
            SignalingMessage::Connected(_) => MessageType::Connected,
            SignalingMessage::Ack(_) => MessageType::Ack,
            SignalingMessage::Register(_) => MessageType::Register,
            SignalingMessage::Listen(_) => MessageType::Listen,
            SignalingMessage::Reject(_) => MessageType::Reject,
            SignalingMessage::Reinvite(_) => MessageType::Reinvite,
            SignalingMessage::Unknown { .. } => MessageType::Unknown,
        }
    }

    /// The call this message belongs to, if any.
    pub fn call_sid(&self) -> Option<&str> {
        match self {
            SignalingMessage::Invite(m) => Some(&m.callsid),
            SignalingMessage::Answer(m) | SignalingMessage::Reinvite(m) => Some(&m.callsid),
            SignalingMessage::Hangup(m) => Some(&m.callsid),
            SignalingMessage::Cancel(m)
            | SignalingMessage::Connected(m)
            | SignalingMessage::Reject(m) => Some(&m.callsid),
            SignalingMessage::Ringing(m) => Some(&m.callsid),
            SignalingMessage::Error(m) => m.callsid.as_deref(),
            _ => None,
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.message_type();
        let payload = envelope.payload;
        Ok(match kind {
            MessageType::Invite => SignalingMessage::Invite(decode(kind, payload)?),
            MessageType::Answer => SignalingMessage::Answer(decode(kind, payload)?),
            MessageType::Hangup => SignalingMessage::Hangup(decode(kind, payload)?),
            MessageType::Cancel => SignalingMessage::Cancel(decode(kind, payload)?),
            MessageType::Ready => SignalingMessage::Ready(decode_extra(kind, payload)?),
            MessageType::Offline => SignalingMessage::Offline(decode_extra(kind, payload)?),
            MessageType::Close => SignalingMessage::Close(decode_extra(kind, payload)?),
            MessageType::Error => SignalingMessage::Error(decode(kind, payload)?),
            MessageType::Ringing => SignalingMessage::Ringing(decode(kind, payload)?),
            MessageType::Connected => SignalingMessage::Connected(decode(kind, payload)?),
            MessageType::Ack => SignalingMessage::Ack(decode_extra(kind, payload)?),
            MessageType::Register => SignalingMessage::Register(decode(kind, payload)?),
            MessageType::Listen => SignalingMessage::Listen(decode(kind, payload)?),
            MessageType::Reject => SignalingMessage::Reject(decode(kind, payload)?),
            MessageType::Reinvite => SignalingMessage::Reinvite(decode(kind, payload)?),
            MessageType::Unknown => SignalingMessage::Unknown {
                kind: envelope.kind,
                payload,
            },
        })
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = match self {
            SignalingMessage::Invite(m) => serde_json::to_value(m)?,
            SignalingMessage::Answer(m) | SignalingMessage::Reinvite(m) => {
                serde_json::to_value(m)?
            }
            SignalingMessage::Hangup(m) => serde_json::to_value(m)?,
            SignalingMessage::Cancel(m)
            | SignalingMessage::Connected(m)
            | SignalingMessage::Reject(m) => serde_json::to_value(m)?,
            SignalingMessage::Ready(m)
            | SignalingMessage::Offline(m)
            | SignalingMessage::Close(m)
            | SignalingMessage::Ack(m) => m.clone().map(Value::Object).unwrap_or(Value::Null),
            SignalingMessage::Error(m) => serde_json::to_value(m)?,
            SignalingMessage::Ringing(m) => serde_json::to_value(m)?,
            SignalingMessage::Register(m) => serde_json::to_value(m)?,
            SignalingMessage::Listen(m) => serde_json::to_value(m)?,
            SignalingMessage::Unknown { kind, payload } => {
                return Ok(Envelope::new(kind.clone(), payload.clone()));
            }
        };
        Ok(Envelope::new(self.message_type().as_str(), payload))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::from_json(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, payload: Value) -> Envelope {
        Envelope::new(kind, payload)
    }

    #[test]
    fn every_message_type_round_trips_its_payload() {
        let cases = vec![
            envelope(
                "invite",
                json!({
                    "callsid": "CA123",
                    "sdp": "v=0",
                    "parameters": {
                        "CallSid": "CA123",
                        "From": "client:alice",
                        "To": "client:bob",
                        "AccountSid": "AC1",
                        "Params": "note=hello"
                    }
                }),
            ),
            envelope(
                "invite",
                json!({"callsid": "TJS1", "sdp": "v=0", "twilio": {"params": "To=bob"}}),
            ),
            envelope("answer", json!({"callsid": "CA123", "sdp": "v=0"})),
            envelope(
                "hangup",
                json!({"callsid": "CA123", "error": {"code": 31486, "message": "busy"}}),
            ),
            envelope("cancel", json!({"callsid": "CA123"})),
            envelope("ready", json!({})),
            envelope("offline", json!({})),
            envelope("close", json!({})),
            envelope(
                "error",
                json!({"error": {"code": 20104, "message": "expired"}}),
            ),
            envelope("ringing", json!({"callsid": "CA123", "sdp": "v=0"})),
            envelope("connected", json!({"callsid": "CA123"})),
            envelope("ack", json!({"acktype": "hangup", "callsid": "CA123"})),
            envelope("register", json!({"media": {"audio": true}})),
            envelope("listen", json!({"token": "abc"})),
            envelope("reject", json!({"callsid": "CA123"})),
            envelope("reinvite", json!({"callsid": "CA123", "sdp": "v=0"})),
            envelope("presence", json!({"whatever": [1, 2]})),
        ];

        for original in cases {
            let text = original.to_json().unwrap();
            let decoded = SignalingMessage::decode(&text).unwrap();
            let encoded = decoded.to_envelope().unwrap();
            assert_eq!(encoded, original, "round trip of {}", original.kind);
        }
    }

    #[test]
    fn absent_payloads_stay_absent() {
        for text in [
            r#"{"type":"ready","version":"1.6"}"#,
            r#"{"type":"offline","version":"1.6"}"#,
            r#"{"type":"ack","version":"1.6"}"#,
            r#"{"type":"close","version":"1.6"}"#,
            r#"{"type":"offline","version":"1.6","payload":{}}"#,
        ] {
            let msg = SignalingMessage::decode(text).unwrap();
            assert_eq!(msg.encode().unwrap(), text);
        }

        let msg = SignalingMessage::decode(r#"{"type":"ready","version":"1.6","payload":null}"#)
            .unwrap();
        assert_eq!(msg, SignalingMessage::Ready(None));
        assert_eq!(msg.encode().unwrap(), r#"{"type":"ready","version":"1.6"}"#);
    }

    #[test]
    fn unmodelled_fields_survive() {
        let original = envelope(
            "answer",
            json!({"callsid": "CA1", "sdp": "v=0", "reconnect": "token"}),
        );
        let msg = SignalingMessage::from_envelope(original.clone()).unwrap();
        assert_eq!(msg.to_envelope().unwrap(), original);
    }

    #[test]
    fn unknown_types_are_kept() {
        let msg = SignalingMessage::decode(r#"{"type":"mystery","version":"1.6","payload":{"a":1}}"#)
            .unwrap();
        assert_eq!(msg.message_type(), MessageType::Unknown);
        match msg {
            SignalingMessage::Unknown { kind, payload } => {
                assert_eq!(kind, "mystery");
                assert_eq!(payload, json!({"a": 1}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn produced_messages_carry_version() {
        let text = SignalingMessage::register(true).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "register", "version": "1.6", "payload": {"media": {"audio": true}}})
        );
    }

    #[test]
    fn missing_payload_fields_are_rejected() {
        let err = SignalingMessage::decode(r#"{"type":"answer","version":"1.6","payload":{}}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Payload {
                kind: MessageType::Answer,
                ..
            }
        ));
    }

    #[test]
    fn call_sid_routing_key() {
        let msg = SignalingMessage::hangup("CA9");
        assert_eq!(msg.call_sid(), Some("CA9"));
        assert_eq!(SignalingMessage::register(false).call_sid(), None);
    }
}
