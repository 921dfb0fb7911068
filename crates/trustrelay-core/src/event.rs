//! Signed events and the keys that produce them.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{EventId, IdentityKey};

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid key material: {0}")]
    Key(String),
    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(String),
    #[error("signature does not verify")]
    BadSignature,
    #[error("event id does not match content")]
    IdMismatch,
    #[error("canonical serialization failed: {0}")]
    Canonical(String),
}

/// Ed25519 keypair used to sign outgoing events.
#[derive(Clone)]
pub struct Keys {
    signing: SigningKey,
}

impl Keys {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Parses a hex-encoded 32-byte secret key.
    pub fn parse(secret_hex: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(secret_hex.trim())?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EventError::Key("secret key must be 32 bytes".into()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&secret),
        })
    }

    /// Hex-encoded verifying key, the identity this keypair signs as.
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey(hex::encode(self.signing.verifying_key().as_bytes()))
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Signature {
        self.signing.sign(digest)
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Immutable signed event record.
///
/// The id is the SHA-256 of the canonical serialization
/// `[0, pubkey, created_at, kind, tags, content]` and the signature covers
/// the id bytes, so any field change invalidates both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: IdentityKey,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    pub fn builder(kind: u16, content: impl Into<String>) -> EventBuilder {
        EventBuilder::new(kind, content)
    }

    /// Values of all tags with the given name, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    /// Whether this event carries an `e` tag referencing the given id.
    pub fn references_event(&self, id: &EventId) -> bool {
        self.tag_values("e").any(|v| v == id.as_str())
    }

    /// Recomputes the id and checks the signature against the pubkey.
    pub fn verify(&self) -> Result<(), EventError> {
        let digest = canonical_digest(
            self.pubkey.as_str(),
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(digest) != self.id.0 {
            return Err(EventError::IdMismatch);
        }

        let key_bytes: [u8; 32] = hex::decode(self.pubkey.as_str())?
            .try_into()
            .map_err(|_| EventError::Key("public key must be 32 bytes".into()))?;
        let verifying = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| EventError::Key(e.to_string()))?;

        let sig_bytes = hex::decode(&self.sig)?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| EventError::SignatureEncoding(e.to_string()))?;

        verifying
            .verify(&digest, &signature)
            .map_err(|_| EventError::BadSignature)
    }
}

fn canonical_digest(
    pubkey: &str,
    created_at: i64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], EventError> {
    let canonical = serde_json::to_vec(&serde_json::json!([
        0, pubkey, created_at, kind, tags, content
    ]))
    .map_err(|e| EventError::Canonical(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hasher.finalize().into())
}

/// Builder for signed events.
pub struct EventBuilder {
    kind: u16,
    content: String,
    tags: Vec<Vec<String>>,
    created_at: Option<i64>,
}

impl EventBuilder {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    /// Adds a `p` tag addressing the event to a recipient key.
    pub fn address_to(self, key: &IdentityKey) -> Self {
        self.tag(vec!["p".into(), key.0.clone()])
    }

    /// Adds an `e` tag referencing another event.
    pub fn reference_event(self, id: &EventId) -> Self {
        self.tag(vec!["e".into(), id.0.clone()])
    }

    /// Overrides the creation timestamp (unix seconds). Defaults to now.
    pub fn created_at(mut self, ts: i64) -> Self {
        self.created_at = Some(ts);
        self
    }

    pub fn sign(self, keys: &Keys) -> Result<Event, EventError> {
        let created_at = self
            .created_at
            .unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp());
        let pubkey = keys.public_key();
        let digest = canonical_digest(
            pubkey.as_str(),
            created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        let signature = keys.sign_digest(&digest);
        Ok(Event {
            id: EventId(hex::encode(digest)),
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(signature.to_bytes()),
        })
    }
}
