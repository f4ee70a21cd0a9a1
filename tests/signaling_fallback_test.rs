// tests/signaling_fallback_test.rs
//
// Drives a full Device against scripted transports and checks which
// signaling endpoints it dials, in which order.

use std::sync::Arc;
use std::time::Duration;
use twilio_voice::edge::EdgeConfig;
use twilio_voice::peer::mock::MockPeerConnectionFactory;
use twilio_voice::protocol::MessageType;
use twilio_voice::registry::RegistrationState;
use twilio_voice::transport::mock::{MockTransportFactory, registrar};
use twilio_voice::{Device, DeviceOptions, VoiceError};

const FOO: &str = "wss://voice-js.foo.twilio.com/signal";
const BAR: &str = "wss://voice-js.bar.twilio.com/signal";
const ASHBURN: &str = "wss://chunderw-vpc-gll-us1.twilio.com/signal";
const DUBLIN: &str = "wss://chunderw-vpc-gll-ie1.twilio.com/signal";

fn options(edges: &[&str]) -> DeviceOptions {
    DeviceOptions {
        edge: Some(EdgeConfig::Ordered(
            edges.iter().map(|e| e.to_string()).collect(),
        )),
        heartbeat_timeout_ms: 3_600_000,
        ..DeviceOptions::default()
    }
}

fn device(options: DeviceOptions, transport: &MockTransportFactory) -> Device {
    Device::builder()
        .with_token("token")
        .with_options(options)
        .with_transport_factory(Arc::new(transport.clone()))
        .with_peer_factory(Arc::new(MockPeerConnectionFactory::new()))
        .build()
        .expect("device should build")
}

#[tokio::test(start_paused = true)]
async fn unknown_edges_fall_through_to_ashburn() {
    let transport = MockTransportFactory::new().with_responder(registrar);
    transport.fail_always(FOO);
    transport.fail_always(BAR);

    let device = device(options(&["foo", "bar", "ashburn"]), &transport);
    assert_eq!(device.uris(), &[FOO, BAR, ASHBURN]);

    device.register().await.expect("register should succeed");
    assert_eq!(transport.attempts(), vec![FOO, BAR, ASHBURN]);
    assert_eq!(device.registration_state(), RegistrationState::Registered);

    let conn = transport.last_connection().unwrap();
    assert_eq!(conn.uri(), ASHBURN);
    assert_eq!(
        conn.sent_types(),
        vec![MessageType::Listen, MessageType::Register]
    );
}

#[tokio::test(start_paused = true)]
async fn drop_after_open_retries_the_same_edge() {
    let transport = MockTransportFactory::new().with_responder(registrar);
    let device = device(options(&["ashburn", "dublin"]), &transport);
    device.register().await.unwrap();

    transport.last_connection().unwrap().close(1006);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.attempts(), vec![ASHBURN, ASHBURN]);
    let reopened = transport.last_connection().unwrap();
    assert_eq!(reopened.id(), 1);
    assert_eq!(
        reopened.sent_types(),
        vec![MessageType::Listen, MessageType::Register]
    );
    assert_eq!(device.registration_state(), RegistrationState::Registered);
}

#[tokio::test(start_paused = true)]
async fn repeat_uris_wraps_back_to_the_first_edge() {
    let transport = MockTransportFactory::new().with_responder(registrar);
    transport.fail(ASHBURN, 1);
    transport.fail_always(DUBLIN);

    let opts = DeviceOptions {
        repeat_uris: true,
        ..options(&["ashburn", "dublin"])
    };
    let device = device(opts, &transport);
    device.register().await.unwrap();

    assert_eq!(transport.attempts(), vec![ASHBURN, DUBLIN, ASHBURN]);
}

#[tokio::test(start_paused = true)]
async fn register_fails_once_retries_are_exhausted() {
    let transport = MockTransportFactory::new().with_responder(registrar);
    transport.fail_always(ASHBURN);

    let opts = DeviceOptions {
        max_reconnect_attempts: 2,
        ..options(&["ashburn"])
    };
    let device = device(opts, &transport);
    let mut errors = device.events().error.subscribe();

    let err = device.register().await.unwrap_err();
    assert_eq!(err.twilio().map(|e| e.code), Some(53000));
    assert_eq!(transport.attempts().len(), 3);
    assert_eq!(errors.recv().await.unwrap().error.code, 53000);
}

#[tokio::test(start_paused = true)]
async fn second_register_has_no_side_effects() {
    let transport = MockTransportFactory::new().with_responder(registrar);
    let device = device(options(&["ashburn"]), &transport);
    device.register().await.unwrap();

    let err = device.register().await.unwrap_err();
    assert!(matches!(err, VoiceError::InvalidState(_)));

    let registers = transport
        .last_connection()
        .unwrap()
        .sent_types()
        .into_iter()
        .filter(|t| *t == MessageType::Register)
        .count();
    assert_eq!(registers, 1);
    assert_eq!(device.registration_state(), RegistrationState::Registered);
}

#[tokio::test(start_paused = true)]
async fn repeat_uris_gives_up_when_every_edge_is_down() {
    let transport = MockTransportFactory::new().with_responder(registrar);
    transport.fail_always(ASHBURN);
    transport.fail_always(DUBLIN);

    let opts = DeviceOptions {
        repeat_uris: true,
        max_reconnect_attempts: 2,
        ..options(&["ashburn", "dublin"])
    };
    let device = device(opts, &transport);
    let mut errors = device.events().error.subscribe();

    let err = device.register().await.unwrap_err();
    assert_eq!(err.twilio().map(|e| e.code), Some(53000));
    assert_eq!(errors.recv().await.unwrap().error.code, 53000);
    assert_eq!(
        transport.attempts(),
        vec![ASHBURN, DUBLIN, ASHBURN, DUBLIN, ASHBURN, DUBLIN, DUBLIN, DUBLIN]
    );
}
