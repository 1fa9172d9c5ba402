use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// The peer connection underneath the secure channel.
///
/// # Audit Boundary
///
/// Implementations carry opaque sealed frames only. They never see the
/// session key or plaintext control messages. Connection progress is
/// reported back through `SecureChannelCoordinator::on_transport_connected`
/// and `on_transport_failed`.
pub trait PeerTransport: Send {
    fn create_offer(&mut self) -> Result<SessionDescription>;

    fn create_answer(&mut self, offer: &SessionDescription) -> Result<SessionDescription>;

    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()>;

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    fn send(&mut self, frame: &[u8]) -> Result<()>;

    fn close(&mut self);
}

#[derive(Debug, Default)]
struct MemoryWire {
    sent: Vec<Vec<u8>>,
    candidates: Vec<IceCandidate>,
    remote: Option<SessionDescription>,
    fail_sends: bool,
    closed: bool,
}

/// In-process transport for tests and replays. Clones share one wire, so a
/// test can keep a handle and inspect what was sent.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    label: String,
    wire: Arc<Mutex<MemoryWire>>,
}

impl MemoryTransport {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            wire: Arc::default(),
        }
    }

    fn with_wire<R>(&self, f: impl FnOnce(&mut MemoryWire) -> R) -> Result<R> {
        let mut wire = self
            .wire
            .lock()
            .map_err(|_| anyhow!("memory transport lock poisoned"))?;
        Ok(f(&mut wire))
    }

    /// Frames sent so far, oldest first. Drains the wire.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.with_wire(|w| std::mem::take(&mut w.sent))
            .unwrap_or_default()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.with_wire(|w| w.candidates.clone()).unwrap_or_default()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.with_wire(|w| w.remote.clone()).ok().flatten()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        let _ = self.with_wire(|w| w.fail_sends = fail);
    }

    pub fn is_closed(&self) -> bool {
        self.with_wire(|w| w.closed).unwrap_or(true)
    }
}

impl PeerTransport for MemoryTransport {
    fn create_offer(&mut self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 o={} offer", self.label),
        })
    }

    fn create_answer(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(anyhow!("cannot answer a {:?} description", offer.kind));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("v=0 o={} answer", self.label),
        })
    }

    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()> {
        let description = description.clone();
        self.with_wire(|w| w.remote = Some(description))
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        let candidate = candidate.clone();
        self.with_wire(|w| w.candidates.push(candidate))
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.with_wire(|w| {
            if w.closed {
                return Err(anyhow!("transport closed"));
            }
            if w.fail_sends {
                return Err(anyhow!("data channel send failed"));
            }
            w.sent.push(frame.to_vec());
            Ok(())
        })?
    }

    fn close(&mut self) {
        let _ = self.with_wire(|w| w.closed = true);
    }
}
