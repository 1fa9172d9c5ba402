use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const DOMAIN_KEY_OFFER: &str = "eik:channel-key-offer:v1";
const SESSION_KEY_INFO: &str = "eik:channel-session-key:v1";

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 32;

/// Symmetric key of one channel session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Short non-secret fingerprint for logs and pairing confirmation.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Authenticated encryption of channel frames.
pub trait ChannelCipher: Send {
    /// Returns `nonce || ciphertext || tag`.
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>>;
}

pub struct ChaChaCipher {
    key: SessionKey,
}

impl ChaChaCipher {
    pub fn new(key: SessionKey) -> Self {
        Self { key }
    }

    pub fn fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key.0))
    }
}

impl ChannelCipher for ChaChaCipher {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut buffer = plaintext.to_vec();
        let tag = self
            .aead()
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
            .map_err(|_| anyhow!("channel encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + buffer.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buffer);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("channel frame truncated"));
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let mut buffer = ciphertext.to_vec();
        self.aead()
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                aad,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| anyhow!("channel frame failed authentication"))?;
        Ok(buffer)
    }
}

/// One side's contribution to the session key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyOffer {
    pub public_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub signature: Vec<u8>,
}

fn offer_hash(session_id: &str, public_key: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((session_id.len() as u32).to_le_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update(public_key);
    hasher.update(salt);
    hasher.finalize().into()
}

fn domain_separated_hash(domain: &str, hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let domain_bytes = domain.as_bytes();
    hasher.update((domain_bytes.len() as u32).to_le_bytes());
    hasher.update(domain_bytes);
    hasher.update(hash);
    hasher.finalize().into()
}

/// Signed salt exchange followed by HKDF-SHA256 over the pairing secret.
///
/// Both peers must hold the same pairing secret (delivered out of band with
/// the exam booking). The ed25519 signature binds each salt to the session
/// id; an optional pinned peer key rejects offers from anyone else.
pub struct KeyAgreement {
    session_id: String,
    pairing_secret: Zeroizing<Vec<u8>>,
    signing_key: SigningKey,
    salt: [u8; SALT_LEN],
    pinned_peer: Option<VerifyingKey>,
}

impl KeyAgreement {
    pub fn new(session_id: &str, pairing_secret: &[u8]) -> Result<Self> {
        if pairing_secret.len() < 16 {
            return Err(anyhow!("pairing secret must be at least 16 bytes"));
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut seed[..]);
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Ok(Self {
            session_id: session_id.to_string(),
            pairing_secret: Zeroizing::new(pairing_secret.to_vec()),
            signing_key: SigningKey::from_bytes(&seed),
            salt,
            pinned_peer: None,
        })
    }

    /// Only accept offers signed by `peer`.
    pub fn pin_peer(&mut self, peer: VerifyingKey) {
        self.pinned_peer = Some(peer);
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn offer(&self) -> KeyOffer {
        let public_key = self.verifying_key().to_bytes();
        let hash = offer_hash(&self.session_id, &public_key, &self.salt);
        let signature = self
            .signing_key
            .sign(&domain_separated_hash(DOMAIN_KEY_OFFER, &hash));
        KeyOffer {
            public_key: public_key.to_vec(),
            salt: self.salt.to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Verifies the remote offer and derives the shared session key.
    pub fn accept(&self, remote: &KeyOffer) -> Result<SessionKey> {
        let public_key: [u8; 32] = remote
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("invalid peer public key length: {}", remote.public_key.len()))?;
        let signature: [u8; 64] = remote
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("invalid key offer signature length: {}", remote.signature.len()))?;
        if remote.salt.len() != SALT_LEN {
            return Err(anyhow!("invalid key offer salt length: {}", remote.salt.len()));
        }
        let peer = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| anyhow!("invalid peer public key: {}", e))?;
        if peer == self.verifying_key() {
            return Err(anyhow!("key offer reflected back to its sender"));
        }
        if let Some(pinned) = &self.pinned_peer {
            if *pinned != peer {
                return Err(anyhow!("key offer from unexpected peer"));
            }
        }
        let hash = offer_hash(&self.session_id, &public_key, &remote.salt);
        peer.verify(
            &domain_separated_hash(DOMAIN_KEY_OFFER, &hash),
            &Signature::from_bytes(&signature),
        )
        .map_err(|e| anyhow!("key offer signature verification failed: {}", e))?;

        // Order-independent so both sides derive the same key.
        let ours = self.offer();
        let (first, second) = if ours.salt <= remote.salt {
            ((&ours.salt, &ours.public_key), (&remote.salt, &remote.public_key))
        } else {
            ((&remote.salt, &remote.public_key), (&ours.salt, &ours.public_key))
        };
        let mut salt = Vec::with_capacity(SALT_LEN * 2);
        salt.extend_from_slice(first.0);
        salt.extend_from_slice(second.0);
        let mut info = Vec::new();
        info.extend_from_slice(SESSION_KEY_INFO.as_bytes());
        info.extend_from_slice(self.session_id.as_bytes());
        info.extend_from_slice(first.1);
        info.extend_from_slice(second.1);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &self.pairing_secret);
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|e| anyhow!("hkdf expand failed: {:?}", e))?;
        let key = SessionKey::from_bytes(okm);
        okm.zeroize();
        Ok(key)
    }
}
