//! Cache entry identity
//!
//! A fingerprint is a SHA-256 digest over a caller-chosen key, a version
//! number, the element type and the serialized finite input that produced
//! the cached stream. Every field is length-prefixed before hashing.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sha2::{Digest, Sha256};

use pullflow_core::{Error, Result};

/// Size of a fingerprint in bytes
pub const FINGERPRINT_LEN: usize = 32;

const DOMAIN_TAG: &[u8] = b"pullflow.cache.fingerprint";

/// Identity of one cache entry
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Start a fingerprint for the stream named `key`
    pub fn builder(key: impl Into<String>) -> FingerprintBuilder {
        FingerprintBuilder {
            key: key.into(),
            version: 0,
            inputs: Vec::new(),
        }
    }

    /// Fingerprint of `inputs` mapped to elements of type `T` under `key` and `version`
    pub fn from_parts<T, V>(key: &str, version: u32, inputs: &V) -> Result<Self>
    where
        V: Serialize + ?Sized,
    {
        Ok(Self::builder(key).version(version).input(inputs)?.build::<T>())
    }

    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Lowercase hex encoding, used as the entry file stem
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|err| Error::InvalidArgument(format!("bad fingerprint {s:?}: {err}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Accumulates the parts of a [`Fingerprint`]
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    key: String,
    version: u32,
    inputs: Vec<Vec<u8>>,
}

impl FingerprintBuilder {
    /// Version of the computation; bump it when the producing code changes
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add a serialized input value
    pub fn input<V>(mut self, value: &V) -> Result<Self>
    where
        V: Serialize + ?Sized,
    {
        self.inputs.push(bincode::serialize(value)?);
        Ok(self)
    }

    /// Finish the fingerprint for elements of type `T`
    pub fn build<T>(self) -> Fingerprint {
        let mut hasher = Sha256::new();
        update_prefixed(&mut hasher, DOMAIN_TAG);
        update_prefixed(&mut hasher, self.key.as_bytes());
        hasher.update(self.version.to_le_bytes());
        update_prefixed(&mut hasher, std::any::type_name::<T>().as_bytes());
        hasher.update((self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            update_prefixed(&mut hasher, input);
        }
        Fingerprint(hasher.finalize().into())
    }
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
