//! Core immutable data model for trustrelay.
//!
//! An event is a signed, content-addressed record; once published it is never
//! mutated. Identity keys are hex-encoded Ed25519 verifying keys, event ids
//! are the SHA-256 of the canonical serialization.

use serde::{Deserialize, Serialize};
use std::fmt;

mod event;
mod filter;
pub mod wire;

pub use event::{Event, EventBuilder, EventError, Keys};
pub use filter::Filter;

/// Hex-encoded public key that signed an event (stringly typed so keys can
/// travel through wire frames and storage without re-decoding).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub String);

impl IdentityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hex-encoded event identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Trust score in the closed range [0.0, 1.0].
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TrustScore(f64);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TrustScoreError {
    #[error("trust score must be between 0.0 and 1.0 inclusive, got {0}")]
    OutOfRange(f64),
    #[error("trust score cannot be NaN")]
    NotANumber,
}

impl TrustScore {
    /// Validates the provided value is finite and within [0.0, 1.0].
    pub fn new(value: f64) -> Result<Self, TrustScoreError> {
        if value.is_nan() {
            return Err(TrustScoreError::NotANumber);
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(TrustScoreError::OutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Clamps the provided value into the valid range; NaN becomes 0.0.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl fmt::Display for TrustScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
