//! Signed transitions: a content addressed transition plus the signatures collected so far
use std::collections::BTreeSet;

use crate::contract::Transition;
use crate::error::SignatureError;
use crate::party::{Identity, Party, PublicKey, Signature};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TransactionSignature {
    #[n(0)]
    pub by: PublicKey,
    #[n(1)]
    pub signature: Signature,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SignedTransition {
    #[n(0)]
    pub id: String, // sha256 of the cbor encoded transition
    #[n(1)]
    pub transition: Transition,
    #[n(2)]
    signatures: Vec<TransactionSignature>,
}

impl SignedTransition {
    /// Encodes and hashes the transition. No signatures are attached yet.
    pub fn new(transition: Transition) -> anyhow::Result<Self> {
        let (id, _) = Self::build(&transition)?;
        Ok(Self {
            id,
            transition,
            signatures: vec![],
        })
    }

    fn build(transition: &Transition) -> anyhow::Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(transition)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }

    /// Signature by `identity` over this transition's id.
    pub fn signature_for(&self, identity: &Identity) -> TransactionSignature {
        TransactionSignature {
            by: identity.key(),
            signature: identity.sign(self.id.as_bytes()),
        }
    }

    pub fn sign(self, identity: &Identity) -> Self {
        let signature = self.signature_for(identity);
        self.with_signature(signature)
    }

    /// Adds a signature, replacing any earlier one from the same key.
    pub fn with_signature(mut self, signature: TransactionSignature) -> Self {
        self.signatures.retain(|existing| existing.by != signature.by);
        self.signatures.push(signature);
        self
    }

    pub fn signatures(&self) -> &[TransactionSignature] {
        &self.signatures
    }

    pub fn signed_keys(&self) -> BTreeSet<PublicKey> {
        self.signatures.iter().map(|s| s.by).collect()
    }

    /// Required signers that have not signed yet.
    pub fn missing_signers(&self) -> Vec<&Party> {
        let signed = self.signed_keys();
        self.transition
            .signers
            .iter()
            .filter(|party| !signed.contains(&party.key))
            .collect()
    }

    /// Checks the id and that every attached signature is valid and expected.
    pub fn verify_signatures(&self) -> Result<(), SignatureError> {
        let (id, _) = Self::build(&self.transition).map_err(|_| SignatureError::IdMismatch)?;
        if id != self.id {
            return Err(SignatureError::IdMismatch);
        }

        let required = self.transition.signer_keys();
        for TransactionSignature { by, signature } in &self.signatures {
            if !required.contains(by) {
                return Err(SignatureError::UnexpectedSigner(*by));
            }
            if !by.verify(self.id.as_bytes(), signature) {
                return Err(SignatureError::Invalid(*by));
            }
        }
        Ok(())
    }

    /// Like [`SignedTransition::verify_signatures`], and also requires every declared signer.
    pub fn verify_complete(&self) -> Result<(), SignatureError> {
        self.verify_signatures()?;

        let missing = self.missing_signers();
        if !missing.is_empty() {
            return Err(SignatureError::Missing(
                missing.iter().map(|party| party.to_string()).collect(),
            ));
        }
        Ok(())
    }
}
