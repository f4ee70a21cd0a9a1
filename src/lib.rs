// Core protocol and policy types are re-exported from voicecore
pub use voicecore::{backoff, edge, errors, mos, protocol, reconnect, recovery, stats};

// Core types are re-exported, but events (with EventBus) remain here for platform-specific functionality
pub mod types {
    pub use voicecore::types::*;
    pub mod events;
}

pub mod calls;
pub mod config;
pub mod device;
pub mod error;
pub mod insights;
pub mod peer;
pub mod registry;
pub mod signaling;
pub mod transport;

pub(crate) mod timers;

pub use calls::{CallSession, CallState, CallSummary, EndReason};
pub use config::DeviceOptions;
pub use device::{Device, DeviceBuilder};
pub use error::VoiceError;
pub use types::call::{CallDirection, CallParameters, CustomParameters};
