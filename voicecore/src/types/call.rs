use crate::protocol::Invite;
use indexmap::IndexMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of locally generated outbound call identifiers.
pub const TEMP_CALL_SID_PREFIX: &str = "TJS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Application-defined call parameters, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomParameters(IndexMap<String, String>);

impl CustomParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `k1=v1&k2=v2`, percent-encoded, in insertion order.
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Parses a query string. Pairs that fail to decode are kept verbatim.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(decode_component(key), decode_component(value));
        }
        params
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CustomParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Immutable description of a call, fixed when the call is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallParameters {
    pub call_sid: String,
    pub direction: CallDirection,
    pub from: Option<String>,
    pub to: Option<String>,
    pub account_sid: Option<String>,
    pub custom: CustomParameters,
}

impl CallParameters {
    pub fn outgoing(custom: CustomParameters) -> Self {
        Self {
            call_sid: temp_call_sid(),
            direction: CallDirection::Outgoing,
            from: None,
            to: custom.get("To").map(str::to_string),
            account_sid: None,
            custom,
        }
    }

    pub fn from_invite(invite: &Invite) -> Self {
        let field = |name: &str| -> Option<String> {
            invite
                .parameters
                .as_ref()
                .and_then(|p| p.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            call_sid: invite.callsid.clone(),
            direction: CallDirection::Incoming,
            from: field("From"),
            to: field("To"),
            account_sid: field("AccountSid"),
            custom: field("Params")
                .map(|q| CustomParameters::from_query(&q))
                .unwrap_or_default(),
        }
    }
}

/// `TJS` followed by 32 random hex characters.
pub fn temp_call_sid() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("{TEMP_CALL_SID_PREFIX}{}", hex::encode(bytes))
}
