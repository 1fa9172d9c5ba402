//! Encrypted proctor channel.
//!
//! The candidate and remote proctors exchange control messages over a peer
//! transport. Every message is serde_json encoded and sealed with the
//! session key agreed during call setup; the session id is bound in as
//! associated data. The coordinator never blocks: state changes, alerts and
//! inbound messages are queued as `ChannelEvent`s and drained by the owner.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::IntegrityError;
use crate::violation::Violation;

pub mod crypto;
pub mod transport;

pub use crypto::{ChaChaCipher, ChannelCipher, KeyAgreement, KeyOffer, SessionKey};
pub use transport::{IceCandidate, MemoryTransport, PeerTransport, SdpKind, SessionDescription};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Camera,
    Microphone,
    Screen,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ViolationBroadcast { violation: Violation },
    DeviceToggle { device: Device, enabled: bool },
    ParticipantJoined { participant_id: String },
    ParticipantLeft { participant_id: String },
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    KeyRejected,
    DecryptFailure,
    TransportFailure,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SecurityAlert {
    pub kind: AlertKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ConnectionState),
    Alert(SecurityAlert),
    Message(ControlMessage),
}

/// What travels over the external signalling path during call setup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallSignal {
    pub description: SessionDescription,
    pub key_offer: KeyOffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

pub struct SecureChannelCoordinator {
    session_id: String,
    state: ConnectionState,
    role: Option<Role>,
    transport: Box<dyn PeerTransport>,
    agreement: KeyAgreement,
    cipher: Option<Box<dyn ChannelCipher>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    participants: BTreeSet<String>,
    devices: BTreeMap<Device, bool>,
    events: VecDeque<ChannelEvent>,
}

impl SecureChannelCoordinator {
    pub fn new(
        session_id: &str,
        pairing_secret: &[u8],
        transport: Box<dyn PeerTransport>,
    ) -> Result<Self> {
        Ok(Self {
            session_id: session_id.to_string(),
            state: ConnectionState::New,
            role: None,
            transport,
            agreement: KeyAgreement::new(session_id, pairing_secret)?,
            cipher: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            participants: BTreeSet::new(),
            devices: BTreeMap::new(),
            events: VecDeque::new(),
        })
    }

    pub fn key_agreement_mut(&mut self) -> &mut KeyAgreement {
        &mut self.agreement
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_session_key(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().map(String::as_str)
    }

    /// Last known state of a remote device; `None` if never toggled.
    pub fn device_enabled(&self, device: Device) -> Option<bool> {
        self.devices.get(&device).copied()
    }

    pub fn drain_events(&mut self) -> Vec<ChannelEvent> {
        self.events.drain(..).collect()
    }

    fn set_state(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        log::info!(
            "channel {}: {} -> {}",
            self.session_id,
            self.state.as_str(),
            to.as_str()
        );
        self.state = to;
        self.events.push_back(ChannelEvent::StateChanged(to));
    }

    fn alert(&mut self, kind: AlertKind, message: String) {
        log::warn!("channel {} security alert: {}", self.session_id, message);
        self.events
            .push_back(ChannelEvent::Alert(SecurityAlert { kind, message }));
    }

    /// Records an alert, moves to `Failed` and returns the matching error.
    fn fail(&mut self, kind: AlertKind, reason: String) -> anyhow::Error {
        self.alert(kind, reason.clone());
        if !self.state.is_terminal() {
            self.set_state(ConnectionState::Failed);
        }
        self.cipher = None;
        IntegrityError::ChannelConnectionFailure { reason }.into()
    }

    fn require_state(&self, expected: ConnectionState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(IntegrityError::ChannelConnectionFailure {
                reason: format!(
                    "{} requires state {}, channel is {}",
                    operation,
                    expected.as_str(),
                    self.state.as_str()
                ),
            }
            .into());
        }
        Ok(())
    }

    fn install_key(&mut self, remote: &KeyOffer) -> Result<()> {
        match self.agreement.accept(remote) {
            Ok(key) => {
                let cipher = ChaChaCipher::new(key);
                log::info!(
                    "channel {}: session key {} established",
                    self.session_id,
                    cipher.fingerprint()
                );
                self.cipher = Some(Box::new(cipher));
                Ok(())
            }
            Err(e) => Err(self.fail(AlertKind::KeyRejected, format!("{:#}", e))),
        }
    }

    fn flush_candidates(&mut self) -> Result<()> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.transport
                .add_ice_candidate(&candidate)
                .context("apply queued ice candidate")?;
        }
        Ok(())
    }

    /// Caller side: create the offer to hand to the signalling path.
    pub fn start_call(&mut self) -> Result<CallSignal> {
        self.require_state(ConnectionState::New, "start_call")?;
        let description = match self.transport.create_offer() {
            Ok(d) => d,
            Err(e) => return Err(self.fail(AlertKind::TransportFailure, format!("{:#}", e))),
        };
        self.role = Some(Role::Caller);
        self.set_state(ConnectionState::Connecting);
        Ok(CallSignal {
            description,
            key_offer: self.agreement.offer(),
        })
    }

    /// Callee side: accept a remote offer and produce the answer.
    pub fn accept_call(&mut self, offer: &CallSignal) -> Result<CallSignal> {
        self.require_state(ConnectionState::New, "accept_call")?;
        if offer.description.kind != SdpKind::Offer {
            return Err(anyhow!("accept_call expects an offer"));
        }
        self.role = Some(Role::Callee);
        self.set_state(ConnectionState::Connecting);
        self.install_key(&offer.key_offer)?;

        let answer = self
            .transport
            .set_remote_description(&offer.description)
            .and_then(|_| self.transport.create_answer(&offer.description));
        let description = match answer {
            Ok(d) => d,
            Err(e) => return Err(self.fail(AlertKind::TransportFailure, format!("{:#}", e))),
        };
        self.remote_description_set = true;
        self.flush_candidates()?;
        Ok(CallSignal {
            description,
            key_offer: self.agreement.offer(),
        })
    }

    /// Caller side: the remote answer arrived.
    pub fn on_remote_answer(&mut self, answer: &CallSignal) -> Result<()> {
        self.require_state(ConnectionState::Connecting, "on_remote_answer")?;
        if self.role != Some(Role::Caller) || answer.description.kind != SdpKind::Answer {
            return Err(anyhow!("unexpected answer for channel {}", self.session_id));
        }
        self.install_key(&answer.key_offer)?;
        if let Err(e) = self.transport.set_remote_description(&answer.description) {
            return Err(self.fail(AlertKind::TransportFailure, format!("{:#}", e)));
        }
        self.remote_description_set = true;
        self.flush_candidates()
    }

    /// Candidates arriving before the remote description are queued.
    pub fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.state.is_terminal() {
            log::debug!("channel {}: dropping late ice candidate", self.session_id);
            return Ok(());
        }
        if self.remote_description_set {
            self.transport
                .add_ice_candidate(&candidate)
                .context("apply ice candidate")
        } else {
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    pub fn on_transport_connected(&mut self) -> Result<()> {
        self.require_state(ConnectionState::Connecting, "on_transport_connected")?;
        if self.cipher.is_none() {
            return Err(self.fail(
                AlertKind::KeyRejected,
                "transport connected before a session key was agreed".to_string(),
            ));
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    pub fn on_transport_failed(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        let _ = self.fail(AlertKind::TransportFailure, reason.to_string());
    }

    pub fn send(&mut self, message: &ControlMessage) -> Result<()> {
        self.require_state(ConnectionState::Connected, "send")?;
        let plaintext = serde_json::to_vec(message).context("encode control message")?;
        let sealed = match &self.cipher {
            Some(cipher) => cipher.seal(&plaintext, self.session_id.as_bytes())?,
            None => return Err(anyhow!("channel has no session key")),
        };
        if let Err(e) = self.transport.send(&sealed) {
            return Err(self.fail(AlertKind::TransportFailure, format!("{:#}", e)));
        }
        Ok(())
    }

    pub fn broadcast_violation(&mut self, violation: &Violation) -> Result<()> {
        self.send(&ControlMessage::ViolationBroadcast {
            violation: violation.clone(),
        })
    }

    pub fn toggle_device(&mut self, device: Device, enabled: bool) -> Result<()> {
        self.send(&ControlMessage::DeviceToggle { device, enabled })
    }

    /// Opens one inbound frame. Frames that fail authentication raise a
    /// security alert and are dropped; the channel stays up.
    pub fn receive(&mut self, frame: &[u8]) -> Result<ControlMessage> {
        self.require_state(ConnectionState::Connected, "receive")?;
        let opened = match &self.cipher {
            Some(cipher) => cipher.open(frame, self.session_id.as_bytes()),
            None => return Err(anyhow!("channel has no session key")),
        };
        let plaintext = match opened {
            Ok(p) => p,
            Err(e) => {
                self.alert(AlertKind::DecryptFailure, format!("{:#}", e));
                return Err(e);
            }
        };
        let message: ControlMessage = match serde_json::from_slice(&plaintext) {
            Ok(m) => m,
            Err(e) => {
                let message = format!("undecodable control message: {}", e);
                self.alert(AlertKind::DecryptFailure, message.clone());
                return Err(anyhow!(message));
            }
        };

        match &message {
            ControlMessage::DeviceToggle { device, enabled } => {
                self.devices.insert(*device, *enabled);
            }
            ControlMessage::ParticipantJoined { participant_id } => {
                self.participants.insert(participant_id.clone());
            }
            ControlMessage::ParticipantLeft { participant_id } => {
                self.participants.remove(participant_id);
            }
            ControlMessage::ViolationBroadcast { .. } => {}
        }
        self.events.push_back(ChannelEvent::Message(message.clone()));
        Ok(message)
    }

    /// Tears the channel down and drops the session key.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.cipher = None;
        self.pending_candidates.clear();
        self.transport.close();
        self.set_state(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::integrity_error;
    use crate::violation::{CandidateViolation, SensorKind, ViolationKind, ViolationLedger};

    const SECRET: &[u8] = b"exam-42-pairing-secret";

    struct Pair {
        candidate: SecureChannelCoordinator,
        proctor: SecureChannelCoordinator,
        candidate_wire: MemoryTransport,
        proctor_wire: MemoryTransport,
    }

    fn connected_pair() -> Pair {
        let candidate_wire = MemoryTransport::new("candidate");
        let proctor_wire = MemoryTransport::new("proctor");
        let mut candidate =
            SecureChannelCoordinator::new("exam-42", SECRET, Box::new(candidate_wire.clone()))
                .unwrap();
        let mut proctor =
            SecureChannelCoordinator::new("exam-42", SECRET, Box::new(proctor_wire.clone()))
                .unwrap();

        let offer = candidate.start_call().unwrap();
        let answer = proctor.accept_call(&offer).unwrap();
        candidate.on_remote_answer(&answer).unwrap();
        candidate.on_transport_connected().unwrap();
        proctor.on_transport_connected().unwrap();
        Pair {
            candidate,
            proctor,
            candidate_wire,
            proctor_wire,
        }
    }

    #[test]
    fn call_setup_reaches_connected_on_both_sides() {
        let mut pair = connected_pair();
        assert_eq!(pair.candidate.state(), ConnectionState::Connected);
        assert_eq!(pair.proctor.state(), ConnectionState::Connected);
        assert_eq!(
            pair.candidate.drain_events(),
            vec![
                ChannelEvent::StateChanged(ConnectionState::Connecting),
                ChannelEvent::StateChanged(ConnectionState::Connected),
            ]
        );
        assert_eq!(
            pair.proctor_wire.remote_description().map(|d| d.kind),
            Some(SdpKind::Offer)
        );
    }

    #[test]
    fn violation_broadcast_round_trips_encrypted() {
        let mut pair = connected_pair();
        let mut ledger = ViolationLedger::default();
        let violation = ledger
            .append(
                CandidateViolation::new(ViolationKind::MultipleFaces, SensorKind::Face),
                1_000,
            )
            .unwrap();
        pair.candidate.broadcast_violation(&violation).unwrap();

        let frames = pair.candidate_wire.take_sent();
        assert_eq!(frames.len(), 1);
        assert!(!String::from_utf8_lossy(&frames[0]).contains("multiple_faces"));

        let message = pair.proctor.receive(&frames[0]).unwrap();
        assert_eq!(message, ControlMessage::ViolationBroadcast { violation });
    }

    #[test]
    fn device_and_participant_messages_update_state() {
        let mut pair = connected_pair();
        pair.proctor.toggle_device(Device::Camera, false).unwrap();
        pair.proctor
            .send(&ControlMessage::ParticipantJoined {
                participant_id: "proctor-7".to_string(),
            })
            .unwrap();
        for frame in pair.proctor_wire.take_sent() {
            pair.candidate.receive(&frame).unwrap();
        }
        assert_eq!(pair.candidate.device_enabled(Device::Camera), Some(false));
        assert_eq!(pair.candidate.participants().collect::<Vec<_>>(), vec!["proctor-7"]);
    }

    #[test]
    fn tampered_frame_raises_alert_but_keeps_channel() {
        let mut pair = connected_pair();
        pair.candidate.toggle_device(Device::Screen, true).unwrap();
        let mut frame = pair.candidate_wire.take_sent().remove(0);
        let last = frame.len() - 1;
        frame[last] ^= 1;
        pair.proctor.drain_events();
        assert!(pair.proctor.receive(&frame).is_err());
        let events = pair.proctor.drain_events();
        assert!(matches!(
            &events[..],
            [ChannelEvent::Alert(SecurityAlert {
                kind: AlertKind::DecryptFailure,
                ..
            })]
        ));
        assert_eq!(pair.proctor.state(), ConnectionState::Connected);
    }

    #[test]
    fn send_is_refused_unless_connected() {
        let wire = MemoryTransport::new("solo");
        let mut channel =
            SecureChannelCoordinator::new("exam-42", SECRET, Box::new(wire.clone())).unwrap();
        let err = channel.toggle_device(Device::Camera, true).unwrap_err();
        assert_eq!(
            integrity_error(&err).map(|e| e.code()),
            Some("INTEGRITY_CHANNEL_FAILURE")
        );
        channel.start_call().unwrap();
        assert!(channel.on_transport_connected().is_err(), "no key yet");
        assert_eq!(channel.state(), ConnectionState::Failed);
        assert!(wire.take_sent().is_empty());
    }

    #[test]
    fn offer_for_another_session_fails_key_agreement() {
        let mut candidate =
            SecureChannelCoordinator::new("exam-42", SECRET, Box::new(MemoryTransport::new("a")))
                .unwrap();
        let mut proctor = SecureChannelCoordinator::new(
            "exam-43",
            SECRET,
            Box::new(MemoryTransport::new("b")),
        )
        .unwrap();
        let offer = candidate.start_call().unwrap();
        assert!(proctor.accept_call(&offer).is_err());
        assert_eq!(proctor.state(), ConnectionState::Failed);
        assert!(proctor
            .drain_events()
            .iter()
            .any(|e| matches!(e, ChannelEvent::Alert(a) if a.kind == AlertKind::KeyRejected)));
    }

    #[test]
    fn transport_failure_and_close() {
        let mut pair = connected_pair();
        pair.candidate_wire.set_fail_sends(true);
        assert!(pair.candidate.toggle_device(Device::Camera, true).is_err());
        assert_eq!(pair.candidate.state(), ConnectionState::Failed);
        assert!(!pair.candidate.has_session_key());

        pair.proctor.close();
        assert_eq!(pair.proctor.state(), ConnectionState::Closed);
        assert!(!pair.proctor.has_session_key());
        assert!(pair.proctor_wire.is_closed());
        assert!(pair.proctor.toggle_device(Device::Camera, true).is_err());
    }

    #[test]
    fn early_ice_candidates_are_queued_until_remote_description() {
        let wire = MemoryTransport::new("proctor");
        let mut proctor =
            SecureChannelCoordinator::new("exam-42", SECRET, Box::new(wire.clone())).unwrap();
        let mut caller =
            SecureChannelCoordinator::new("exam-42", SECRET, Box::new(MemoryTransport::new("c")))
                .unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        proctor.add_ice_candidate(candidate.clone()).unwrap();
        assert!(wire.candidates().is_empty());
        proctor.accept_call(&caller.start_call().unwrap()).unwrap();
        assert_eq!(wire.candidates(), vec![candidate]);
    }
}
