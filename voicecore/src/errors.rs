//! Static catalog of voice error codes.
//!
//! Every error surfaced to the application is a [`TwilioError`]: a stable
//! numeric code looked up in the catalog, plus the message that came with it.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

pub mod codes {
    pub const ACCESS_TOKEN_INVALID: u32 = 20101;
    pub const ACCESS_TOKEN_EXPIRED: u32 = 20104;
    pub const AUTHENTICATION_FAILED: u32 = 20151;
    pub const UNKNOWN: u32 = 31000;
    pub const CONNECTION_ERROR: u32 = 31005;
    pub const CALL_CANCELLED: u32 = 31008;
    pub const TRANSPORT_ERROR: u32 = 31009;
    pub const BAD_REQUEST: u32 = 31400;
    pub const PERMISSION_DENIED: u32 = 31401;
    pub const ACQUISITION_FAILED: u32 = 31402;
    pub const NOT_FOUND: u32 = 31404;
    pub const TEMPORARILY_UNAVAILABLE: u32 = 31480;
    pub const BUSY_HERE: u32 = 31486;
    pub const DECLINE: u32 = 31603;
    pub const SIGNALING_CONNECTION_ERROR: u32 = 53000;
    pub const SIGNALING_CONNECTION_DISCONNECTED: u32 = 53001;
    pub const CLIENT_LOCAL_DESC_FAILED: u32 = 53400;
    pub const SERVER_LOCAL_DESC_FAILED: u32 = 53401;
    pub const CLIENT_REMOTE_DESC_FAILED: u32 = 53402;
    pub const SERVER_REMOTE_DESC_FAILED: u32 = 53403;
    pub const NO_SUPPORTED_CODEC: u32 = 53404;
    pub const MEDIA_CONNECTION_FAILED: u32 = 53405;
    pub const DTLS_CONNECTION_FAILED: u32 = 53407;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Fatal; a new credential is required.
    Authorization,
    /// Fatal to the operation that produced it.
    Client,
    /// Recovered by reconnect and fallback; surfaced once exhausted.
    Signaling,
    Media,
    UserMedia,
    General,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: u32,
    pub name: &'static str,
    pub kind: ErrorKind,
    pub description: &'static str,
    pub causes: &'static [&'static str],
    pub solutions: &'static [&'static str],
}

static CATALOG: &[ErrorInfo] = &[
    ErrorInfo {
        code: codes::ACCESS_TOKEN_INVALID,
        name: "AccessTokenInvalid",
        kind: ErrorKind::Authorization,
        description: "Invalid access token",
        causes: &["The access token could not be validated."],
        solutions: &["Verify the token is well-formed and signed with a valid API key."],
    },
    ErrorInfo {
        code: codes::ACCESS_TOKEN_EXPIRED,
        name: "AccessTokenExpired",
        kind: ErrorKind::Authorization,
        description: "Access token expired or expiration date invalid",
        causes: &["The access token has expired or its TTL is invalid."],
        solutions: &["Generate a new token and pass it to update_token."],
    },
    ErrorInfo {
        code: codes::AUTHENTICATION_FAILED,
        name: "AuthenticationFailed",
        kind: ErrorKind::Authorization,
        description: "Authentication failed",
        causes: &["The credentials in the access token were rejected."],
        solutions: &["Check the account and API key used to sign the token."],
    },
    ErrorInfo {
        code: codes::UNKNOWN,
        name: "UnknownError",
        kind: ErrorKind::General,
        description: "Unknown error",
        causes: &["An error occurred that could not be classified."],
        solutions: &["Inspect the message and logs for details."],
    },
    ErrorInfo {
        code: codes::CONNECTION_ERROR,
        name: "ConnectionError",
        kind: ErrorKind::General,
        description: "Connection error",
        causes: &["A connection error occurred during the call."],
        solutions: &["Check network connectivity and retry the call."],
    },
    ErrorInfo {
        code: codes::CALL_CANCELLED,
        name: "CallCancelledError",
        kind: ErrorKind::General,
        description: "Call cancelled",
        causes: &["The call was cancelled before it was answered."],
        solutions: &[],
    },
    ErrorInfo {
        code: codes::TRANSPORT_ERROR,
        name: "TransportError",
        kind: ErrorKind::General,
        description: "No transport available to send or receive messages",
        causes: &["The signaling channel is not open."],
        solutions: &["Wait for the transport to reconnect before sending."],
    },
    ErrorInfo {
        code: codes::BAD_REQUEST,
        name: "BadRequest",
        kind: ErrorKind::Client,
        description: "Bad request",
        causes: &["The request could not be understood by the server."],
        solutions: &["Check the call parameters."],
    },
    ErrorInfo {
        code: codes::PERMISSION_DENIED,
        name: "PermissionDeniedError",
        kind: ErrorKind::UserMedia,
        description: "User denied access to the microphone",
        causes: &["Microphone access was refused."],
        solutions: &["Grant microphone permission and retry."],
    },
    ErrorInfo {
        code: codes::ACQUISITION_FAILED,
        name: "AcquisitionFailedError",
        kind: ErrorKind::UserMedia,
        description: "Failed to acquire the audio input device",
        causes: &["No audio input device is available.", "The device is in use."],
        solutions: &["Connect an input device or release it from other applications."],
    },
    ErrorInfo {
        code: codes::NOT_FOUND,
        name: "NotFound",
        kind: ErrorKind::Client,
        description: "Not found",
        causes: &["The dialed resource does not exist."],
        solutions: &["Check the destination of the call."],
    },
    ErrorInfo {
        code: codes::TEMPORARILY_UNAVAILABLE,
        name: "TemporarilyUnavailable",
        kind: ErrorKind::Client,
        description: "Temporarily unavailable",
        causes: &["The callee is currently unavailable."],
        solutions: &["Retry the call later."],
    },
    ErrorInfo {
        code: codes::BUSY_HERE,
        name: "BusyHere",
        kind: ErrorKind::Client,
        description: "Busy here",
        causes: &["The callee is busy."],
        solutions: &["Retry the call later."],
    },
    ErrorInfo {
        code: codes::DECLINE,
        name: "Decline",
        kind: ErrorKind::Client,
        description: "Decline",
        causes: &["The callee declined the call."],
        solutions: &[],
    },
    ErrorInfo {
        code: codes::SIGNALING_CONNECTION_ERROR,
        name: "ConnectionError",
        kind: ErrorKind::Signaling,
        description: "Signaling connection error",
        causes: &["The signaling endpoints could not be reached after all retries."],
        solutions: &["Check network connectivity and firewall rules for websocket traffic."],
    },
    ErrorInfo {
        code: codes::SIGNALING_CONNECTION_DISCONNECTED,
        name: "ConnectionDisconnected",
        kind: ErrorKind::Signaling,
        description: "Signaling connection disconnected",
        causes: &["The signaling connection was lost."],
        solutions: &["The client reconnects automatically; check connectivity if it persists."],
    },
    ErrorInfo {
        code: codes::CLIENT_LOCAL_DESC_FAILED,
        name: "ClientLocalDescFailed",
        kind: ErrorKind::Media,
        description: "The client failed to create or apply a local media description",
        causes: &["The peer connection rejected the generated description."],
        solutions: &["Check that audio devices and codecs are available."],
    },
    ErrorInfo {
        code: codes::SERVER_LOCAL_DESC_FAILED,
        name: "ServerLocalDescFailed",
        kind: ErrorKind::Media,
        description: "The server failed to create a local media description",
        causes: &["The server could not produce an answer."],
        solutions: &[],
    },
    ErrorInfo {
        code: codes::CLIENT_REMOTE_DESC_FAILED,
        name: "ClientRemoteDescFailed",
        kind: ErrorKind::Media,
        description: "The client failed to apply a remote media description",
        causes: &["The remote description was invalid or incompatible."],
        solutions: &["Check codec compatibility between the parties."],
    },
    ErrorInfo {
        code: codes::SERVER_REMOTE_DESC_FAILED,
        name: "ServerRemoteDescFailed",
        kind: ErrorKind::Media,
        description: "The server failed to apply the client's media description",
        causes: &["The offer sent by the client was rejected."],
        solutions: &[],
    },
    ErrorInfo {
        code: codes::NO_SUPPORTED_CODEC,
        name: "NoSupportedCodec",
        kind: ErrorKind::Media,
        description: "No supported codec",
        causes: &["The parties share no audio codec."],
        solutions: &["Adjust the codec preferences."],
    },
    ErrorInfo {
        code: codes::MEDIA_CONNECTION_FAILED,
        name: "ConnectionError",
        kind: ErrorKind::Media,
        description: "Media connection failed",
        causes: &["The media path could not be restored after ICE restarts."],
        solutions: &["Check network conditions and TURN reachability."],
    },
    ErrorInfo {
        code: codes::DTLS_CONNECTION_FAILED,
        name: "DtlsConnectionFailed",
        kind: ErrorKind::Media,
        description: "DTLS connection failed",
        causes: &["The DTLS handshake for the media path failed."],
        solutions: &[],
    },
];

static BY_CODE: Lazy<HashMap<u32, &'static ErrorInfo>> =
    Lazy::new(|| CATALOG.iter().map(|info| (info.code, info)).collect());

pub fn lookup(code: u32) -> Option<&'static ErrorInfo> {
    BY_CODE.get(&code).copied()
}

/// An error surfaced to the application.
///
/// Codes missing from the catalog keep their numeric value and borrow the
/// general `UnknownError` entry for the rest of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwilioError {
    pub code: u32,
    pub message: String,
    info: &'static ErrorInfo,
}

impl TwilioError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        let info = lookup(code).unwrap_or_else(|| &CATALOG[3]);
        Self {
            code,
            message: message.into(),
            info,
        }
    }

    /// Builds an error with the catalog description as its message.
    pub fn from_code(code: u32) -> Self {
        let err = Self::new(code, "");
        Self {
            message: err.info.description.to_string(),
            ..err
        }
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_known() {
            self.info.kind
        } else if (20000..21000).contains(&self.code) {
            ErrorKind::Authorization
        } else {
            ErrorKind::General
        }
    }

    pub fn description(&self) -> &'static str {
        self.info.description
    }

    pub fn causes(&self) -> &'static [&'static str] {
        self.info.causes
    }

    pub fn solutions(&self) -> &'static [&'static str] {
        self.info.solutions
    }

    pub fn is_known(&self) -> bool {
        self.info.code == self.code
    }

    pub fn is_authorization(&self) -> bool {
        self.kind() == ErrorKind::Authorization
    }
}

impl fmt::Display for TwilioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} ({}): {}", self.name(), self.code, self.description())
        } else {
            write!(f, "{} ({}): {}", self.name(), self.code, self.message)
        }
    }
}

impl std::error::Error for TwilioError {}

impl Serialize for TwilioError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TwilioError", 5)?;
        s.serialize_field("code", &self.code)?;
        s.serialize_field("name", self.name())?;
        s.serialize_field("kind", &self.kind())?;
        s.serialize_field("description", self.description())?;
        s.serialize_field("message", &self.message)?;
        s.end()
    }
}
