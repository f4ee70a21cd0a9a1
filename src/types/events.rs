use crate::calls::{CallSession, CallSummary};
use crate::registry::RegistrationState;
use crate::signaling::TransportState;
use std::sync::Arc;
use tokio::sync::broadcast;
use voicecore::errors::TwilioError;
use voicecore::stats::{RtcSample, Warning};

// The size of the broadcast channel buffer.
pub(crate) const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct Registering;

#[derive(Debug, Clone)]
pub struct Registered;

#[derive(Debug, Clone)]
pub struct Unregistered;

#[derive(Debug, Clone)]
pub struct Destroyed;

#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call: CallSession,
}

#[derive(Debug, Clone)]
pub struct DeviceError {
    pub error: TwilioError,
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransportStateChanged {
    pub state: TransportState,
}

#[derive(Debug, Clone)]
pub struct RegistrationChanged {
    pub state: RegistrationState,
}

/// Everything a call reports after its handle exists.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The remote end is ringing.
    Ringing,
    /// Answered: inbound after `accept()`, outbound when the answer arrived.
    Accepted,
    /// Media connected for the first time.
    Connected,
    Reconnecting(TwilioError),
    Reconnected,
    Muted(bool),
    Sample(Arc<RtcSample>),
    Warning(Arc<Warning>),
    WarningCleared(Arc<Warning>),
    Cancelled,
    Rejected,
    Disconnected,
    Error(TwilioError),
    /// Always the last event of a call.
    Closed(Arc<CallSummary>),
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }

        impl Default for EventBus {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

define_event_bus! {
    // Registration events
    (registering, Arc<Registering>),
    (registered, Arc<Registered>),
    (unregistered, Arc<Unregistered>),
    (registration_state, Arc<RegistrationChanged>),

    // Call events
    (incoming, Arc<IncomingCall>),

    // Error and connection events
    (error, Arc<DeviceError>),
    (transport_state, Arc<TransportStateChanged>),
    (destroyed, Arc<Destroyed>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn each_kind_has_its_own_channel() {
        let bus = EventBus::new();
        let mut registered = bus.registered.subscribe();
        let mut destroyed = bus.destroyed.subscribe();

        bus.registered.send(Arc::new(Registered)).unwrap();
        assert!(registered.recv().await.is_ok());
        assert!(destroyed.try_recv().is_err());
    }
}
