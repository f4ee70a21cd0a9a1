//! Voice calls.
//!
//! Each call is an actor task driving its own signaling exchange, media
//! recovery and quality sampling. Applications hold a [`CallSession`]
//! handle; the owning device routes control messages to the call by
//! `callsid`.
//!
//! # Architecture
//!
//! - [`CallState`] & [`CallInfo`]: call state machine for tracking call lifecycle
//! - [`CallSession`]: public handle (`accept`, `reject`, `disconnect`, ...)
//! - `CallActor`: invite/answer/hangup exchange, ICE restart recovery driven
//!   by [`voicecore::recovery::MediaRecovery`], per-second sampling through
//!   [`voicecore::stats::QualityMonitor`]
//! - [`CallSummary`]: parameters, duration, sample history and warnings of
//!   a finished call
//!
//! # Media recovery
//!
//! Recovery is driven by the peer connection state, never by the control
//! channel. `Disconnected` without inbound traffic for the grace period, or
//! `Failed`, starts an ICE restart (`reinvite`). The call fails with 53405
//! when media is not back within the restart budget of the first failure.

mod actor;
mod error;
mod session;
mod state;

pub(crate) use actor::{CallContext, DeviceNotice};
pub use error::CallError;
pub(crate) use session::CallCommand;
pub use session::{CallSession, CallSummary};
pub use state::{CallInfo, CallState, CallTransition, EndReason, InvalidTransition};
