use exam_integrity_kernel::channel::{
    AlertKind, CallSignal, ChannelEvent, ConnectionState, ControlMessage, Device, IceCandidate,
    MemoryTransport, SecureChannelCoordinator,
};
use exam_integrity_kernel::error::integrity_error;
use exam_integrity_kernel::IntegrityError;

const SESSION: &str = "exam-2041";
const SECRET: &[u8] = b"booking-2041-pairing-secret";

struct Peer {
    wire: MemoryTransport,
    channel: SecureChannelCoordinator,
}

fn peer(label: &str, secret: &[u8]) -> Peer {
    let wire = MemoryTransport::new(label);
    let channel =
        SecureChannelCoordinator::new(SESSION, secret, Box::new(wire.clone())).expect("channel");
    Peer { wire, channel }
}

fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host", n, n, n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn alerts(events: &[ChannelEvent]) -> Vec<AlertKind> {
    events
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::Alert(alert) => Some(alert.kind),
            _ => None,
        })
        .collect()
}

fn connect(caller: &mut Peer, callee: &mut Peer) {
    let offer = caller.channel.start_call().expect("offer");
    let answer = callee.channel.accept_call(&offer).expect("answer");
    caller.channel.on_remote_answer(&answer).expect("remote answer");
    caller.channel.on_transport_connected().expect("caller connected");
    callee.channel.on_transport_connected().expect("callee connected");
}

#[test]
fn call_setup_exchanges_control_messages() {
    let mut student = peer("student", SECRET);
    let mut proctor = peer("proctor", SECRET);

    let offer = student.channel.start_call().expect("offer");
    assert_eq!(student.channel.state(), ConnectionState::Connecting);

    // Candidates that arrive before the answer are held back.
    student.channel.add_ice_candidate(candidate(1)).expect("queue");
    assert!(student.wire.candidates().is_empty());

    let answer = proctor.channel.accept_call(&offer).expect("answer");
    assert!(proctor.channel.has_session_key());
    assert_eq!(proctor.wire.remote_description(), Some(offer.description.clone()));

    student.channel.on_remote_answer(&answer).expect("remote answer");
    assert_eq!(student.wire.candidates(), vec![candidate(1)]);
    student.channel.add_ice_candidate(candidate(2)).expect("apply");
    assert_eq!(student.wire.candidates().len(), 2);

    student.channel.on_transport_connected().expect("connected");
    proctor.channel.on_transport_connected().expect("connected");

    proctor
        .channel
        .send(&ControlMessage::ParticipantJoined {
            participant_id: "proctor-7".to_string(),
        })
        .expect("send");
    proctor
        .channel
        .toggle_device(Device::Microphone, true)
        .expect("toggle");

    for frame in proctor.wire.take_sent() {
        student.channel.receive(&frame).expect("receive");
    }
    assert_eq!(
        student.channel.participants().collect::<Vec<_>>(),
        vec!["proctor-7"]
    );
    assert_eq!(student.channel.device_enabled(Device::Microphone), Some(true));
    assert_eq!(student.channel.device_enabled(Device::Screen), None);

    let events = student.channel.drain_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Message(_)))
            .count(),
        2
    );
    assert!(events.contains(&ChannelEvent::StateChanged(ConnectionState::Connected)));
    assert!(alerts(&events).is_empty());
}

#[test]
fn signals_survive_the_json_signalling_path() {
    let mut student = peer("student", SECRET);
    let mut proctor = peer("proctor", SECRET);

    let offer = student.channel.start_call().expect("offer");
    let relayed: CallSignal =
        serde_json::from_str(&serde_json::to_string(&offer).expect("encode")).expect("decode");
    let answer = proctor.channel.accept_call(&relayed).expect("answer");
    let relayed: CallSignal =
        serde_json::from_str(&serde_json::to_string(&answer).expect("encode")).expect("decode");
    student.channel.on_remote_answer(&relayed).expect("remote answer");
    assert!(student.channel.has_session_key());
}

#[test]
fn tampered_frame_raises_alert_but_keeps_channel_up() {
    let mut student = peer("student", SECRET);
    let mut proctor = peer("proctor", SECRET);
    connect(&mut student, &mut proctor);
    student.channel.drain_events();

    proctor
        .channel
        .toggle_device(Device::Camera, false)
        .expect("send");
    let mut frames = proctor.wire.take_sent();
    let last = frames[0].len() - 1;
    frames[0][last] ^= 0x01;

    assert!(student.channel.receive(&frames[0]).is_err());
    assert!(student.channel.receive(b"short").is_err());
    assert_eq!(student.channel.state(), ConnectionState::Connected);
    assert_eq!(
        alerts(&student.channel.drain_events()),
        vec![AlertKind::DecryptFailure, AlertKind::DecryptFailure]
    );
    assert_eq!(student.channel.device_enabled(Device::Camera), None);
}

#[test]
fn mismatched_pairing_secret_cannot_read_traffic() {
    let mut student = peer("student", SECRET);
    let mut intruder = peer("intruder", b"guessed-pairing-secret-0000");
    connect(&mut student, &mut intruder);

    intruder
        .channel
        .send(&ControlMessage::ParticipantLeft {
            participant_id: "proctor-7".to_string(),
        })
        .expect("send");
    let frames = intruder.wire.take_sent();
    assert!(student.channel.receive(&frames[0]).is_err());
    assert_eq!(
        alerts(&student.channel.drain_events()),
        vec![AlertKind::DecryptFailure]
    );
}

#[test]
fn pinned_proctor_rejects_other_peers() {
    let mut student = peer("student", SECRET);
    let mut proctor = peer("proctor", SECRET);
    let mut stranger = peer("stranger", SECRET);
    let proctor_key = proctor.channel.key_agreement_mut().verifying_key();
    student.channel.key_agreement_mut().pin_peer(proctor_key);

    let offer = student.channel.start_call().expect("offer");
    let answer = stranger.channel.accept_call(&offer).expect("answer");
    let err = student
        .channel
        .on_remote_answer(&answer)
        .expect_err("stranger rejected");
    assert!(matches!(
        integrity_error(&err),
        Some(IntegrityError::ChannelConnectionFailure { .. })
    ));
    assert_eq!(student.channel.state(), ConnectionState::Failed);
    assert!(!student.channel.has_session_key());
    assert_eq!(
        alerts(&student.channel.drain_events()),
        vec![AlertKind::KeyRejected]
    );
    assert!(student.channel.on_transport_connected().is_err());
}

#[test]
fn connect_without_key_and_send_failures_fail_the_channel() {
    let mut student = peer("student", SECRET);
    student.channel.start_call().expect("offer");
    assert!(student.channel.on_transport_connected().is_err());
    assert_eq!(student.channel.state(), ConnectionState::Failed);

    let mut student = peer("student", SECRET);
    let mut proctor = peer("proctor", SECRET);
    connect(&mut student, &mut proctor);
    student.wire.set_fail_sends(true);
    assert!(student.channel.toggle_device(Device::Screen, true).is_err());
    assert_eq!(student.channel.state(), ConnectionState::Failed);
    assert!(alerts(&student.channel.drain_events()).contains(&AlertKind::TransportFailure));
}

#[test]
fn close_drops_the_session_key() {
    let mut student = peer("student", SECRET);
    let mut proctor = peer("proctor", SECRET);
    connect(&mut student, &mut proctor);

    student.channel.close();
    assert_eq!(student.channel.state(), ConnectionState::Closed);
    assert!(!student.channel.has_session_key());
    assert!(student.wire.is_closed());
    assert!(student
        .channel
        .send(&ControlMessage::ParticipantLeft {
            participant_id: "student".to_string()
        })
        .is_err());
    // Late candidates after teardown are dropped quietly.
    student.channel.add_ice_candidate(candidate(9)).expect("ignored");
}
