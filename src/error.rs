use thiserror::Error;
use voicecore::edge::EdgeError;
use voicecore::errors::TwilioError;

#[derive(Debug, Error, Clone)]
pub enum VoiceError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Twilio(#[from] TwilioError),

    #[error("failed to load options: {0}")]
    Options(String),

    #[error("{0} has shut down")]
    Closed(&'static str),
}

impl From<EdgeError> for VoiceError {
    fn from(err: EdgeError) -> Self {
        VoiceError::InvalidArgument(err.to_string())
    }
}

impl VoiceError {
    /// The catalog error behind this failure, if there is one.
    pub fn twilio(&self) -> Option<&TwilioError> {
        match self {
            VoiceError::Twilio(err) => Some(err),
            _ => None,
        }
    }
}
