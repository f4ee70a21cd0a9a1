//! Call-related error types.

use crate::peer::PeerError;
use thiserror::Error;
use voicecore::errors::{TwilioError, codes};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("local description failed: {0}")]
    LocalDescription(PeerError),

    #[error("remote description failed: {0}")]
    RemoteDescription(PeerError),

    #[error("media connection failed: {0}")]
    MediaConnectionFailed(String),

    #[error("remote error: {0}")]
    Remote(TwilioError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),
}

impl CallError {
    /// Classifies a negotiation failure by which side's description broke.
    pub fn from_peer(err: PeerError) -> Self {
        match err {
            PeerError::RemoteDescription(_) => CallError::RemoteDescription(err),
            _ => CallError::LocalDescription(err),
        }
    }

    /// The catalog error surfaced to the application.
    pub fn to_twilio(&self) -> TwilioError {
        match self {
            CallError::LocalDescription(e) => {
                TwilioError::new(codes::CLIENT_LOCAL_DESC_FAILED, e.to_string())
            }
            CallError::RemoteDescription(e) => {
                TwilioError::new(codes::CLIENT_REMOTE_DESC_FAILED, e.to_string())
            }
            CallError::MediaConnectionFailed(msg) => {
                TwilioError::new(codes::MEDIA_CONNECTION_FAILED, msg.clone())
            }
            CallError::Remote(e) => e.clone(),
            CallError::InvalidTransition(e) => TwilioError::new(codes::UNKNOWN, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_failures_map_to_catalog_codes() {
        let local = CallError::from_peer(PeerError::LocalDescription("boom".into()));
        let remote = CallError::from_peer(PeerError::RemoteDescription("bad sdp".into()));
        assert_eq!(local.to_twilio().code, 53400);
        assert_eq!(remote.to_twilio().code, 53402);
        assert_eq!(
            CallError::MediaConnectionFailed("ice".into()).to_twilio().code,
            53405
        );
    }
}
