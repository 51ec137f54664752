//! Party identities, keys and signatures
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;

use crate::utils;

/// The role a party plays on every account it is named on.
#[derive(minicbor::Encode, minicbor::Decode, serde::Serialize, serde::Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[n(0)]
    Regulator,
    #[n(1)]
    Supplier,
}

/// Ed25519 public key bytes. Ordered so signer sets are deterministic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

/// Ed25519 signature bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

/// A public, key-backed party identity with an explicit role tag.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Party {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub role: Role,
    #[n(2)]
    pub key: PublicKey,
}

/// A party together with its signing key. Never leaves the owning node.
pub struct Identity {
    party: Party,
    signing_key: SigningKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
    pub fn from_hex(encoded: &str) -> anyhow::Result<Self> {
        let bytes: [u8; 32] = hex::decode(encoded)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
        VerifyingKey::from_bytes(&bytes)?;
        Ok(Self(bytes))
    }
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
    /// Checks `signature` over `message` against this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", utils::short_hex(&self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&utils::short_hex(&self.0))
    }
}

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", utils::short_hex(&self.0))
    }
}

impl Party {
    pub fn new(name: impl Into<String>, role: Role, key: PublicKey) -> Self {
        Self {
            name: name.into(),
            role,
            key,
        }
    }
    pub fn is_regulator(&self) -> bool {
        self.role == Role::Regulator
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.key)
    }
}

impl Identity {
    /// Generate a fresh keypair for a named party.
    pub fn generate(name: impl Into<String>, role: Role) -> Self {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        Self::with_signing_key(name, role, signing_key)
    }
    /// Rebuild an identity from a 32-byte secret seed.
    pub fn from_seed(name: impl Into<String>, role: Role, seed: [u8; 32]) -> Self {
        Self::with_signing_key(name, role, SigningKey::from_bytes(&seed))
    }
    fn with_signing_key(name: impl Into<String>, role: Role, signing_key: SigningKey) -> Self {
        let key = PublicKey(signing_key.verifying_key().to_bytes());
        Self {
            party: Party::new(name, role, key),
            signing_key,
        }
    }
    pub fn party(&self) -> &Party {
        &self.party
    }
    pub fn key(&self) -> PublicKey {
        self.party.key
    }
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("party", &self.party).finish()
    }
}

impl<C> minicbor::Encode<C> for PublicKey {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for PublicKey {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let bytes: [u8; 32] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("public key must be 32 bytes"))?;
        Ok(PublicKey(bytes))
    }
}

impl<C> minicbor::Encode<C> for Signature {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for Signature {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let bytes: [u8; 64] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("signature must be 64 bytes"))?;
        Ok(Signature(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_against_own_key_only() {
        let alice = Identity::generate("British Energy", Role::Supplier);
        let bob = Identity::generate("UK Power", Role::Supplier);

        let signature = alice.sign(b"transition");

        assert!(alice.key().verify(b"transition", &signature));
        assert!(!alice.key().verify(b"tampered", &signature));
        assert!(!bob.key().verify(b"transition", &signature));
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let identity = Identity::from_seed("Government Regulator", Role::Regulator, [7u8; 32]);
        let parsed = PublicKey::from_hex(&identity.key().to_hex()).unwrap();

        assert_eq!(identity.key(), parsed);
        assert!(PublicKey::from_hex("abcd").is_err());
    }
}
