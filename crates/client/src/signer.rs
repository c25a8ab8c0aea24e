// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event signing.
//!
//! The publication path takes signing as an injectable seam: a
//! [`KeySigner`] signs locally with a secp256k1 secret key, while
//! [`NoopSigner`] is the null implementation that errors when invoked
//! without a caller-provided key. External signers (NIP-07 style) plug
//! in by implementing [`Signer`].

use async_trait::async_trait;
use k256::schnorr::signature::{Signer as _, Verifier as _};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::ClientError;
use crate::event::{Event, EventParams};

/// Asynchronous signing seam used by the publication engine.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, params: EventParams) -> Result<Event, ClientError>;
}

/// SHA-256 of the canonical `[0, pubkey, created_at, kind, tags,
/// content]` serialization, i.e. the event id.
pub(crate) fn event_id_bytes(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical =
        serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(canonical.as_bytes()).into()
}

fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Signs with a caller-supplied secp256k1 secret key (BIP-340 schnorr).
pub struct KeySigner {
    signing_key: SigningKey,
}

impl KeySigner {
    /// Parse a hex-encoded 32-byte secret key.
    ///
    /// Bech32 (`nsec1…`) input is rejected; supply the hex form.
    pub fn from_hex(secret: &str) -> Result<Self, ClientError> {
        let secret = secret.trim();
        if secret.starts_with("nsec1") {
            return Err(ClientError::InvalidKey(
                "bech32 (nsec) secret keys are not supported, supply hex".to_owned(),
            ));
        }
        let bytes = hex::decode(secret)
            .map_err(|_| ClientError::InvalidKey("secret key is not hex".to_owned()))?;
        let signing_key = SigningKey::from_bytes(&bytes)
            .map_err(|_| ClientError::InvalidKey("not a valid secp256k1 secret key".to_owned()))?;
        Ok(Self { signing_key })
    }

    /// The x-only public key, hex encoded.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Synchronous signing core.
    pub fn sign_params(&self, params: &EventParams) -> Event {
        let created_at = params.created_at.unwrap_or_else(unix_time);
        let pubkey = self.public_key_hex();
        let id = event_id_bytes(&pubkey, created_at, params.kind, &params.tags, &params.content);
        let signature: Signature = self.signing_key.sign(&id);
        Event {
            id: hex::encode(id),
            pubkey,
            created_at,
            kind: params.kind,
            tags: params.tags.clone(),
            content: params.content.clone(),
            sig: hex::encode(signature.to_bytes()),
        }
    }
}

#[async_trait]
impl Signer for KeySigner {
    async fn sign(&self, params: EventParams) -> Result<Event, ClientError> {
        Ok(self.sign_params(&params))
    }
}

/// Null signer: publication without an explicit key fails.
pub struct NoopSigner;

#[async_trait]
impl Signer for NoopSigner {
    async fn sign(&self, _params: EventParams) -> Result<Event, ClientError> {
        Err(ClientError::SignerRequired)
    }
}

impl Event {
    /// Recompute the id and check the schnorr signature.
    ///
    /// Incoming events are never verified implicitly; this is for
    /// callers that opt in.
    pub fn verify(&self) -> Result<(), ClientError> {
        let id = event_id_bytes(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(id) != self.id {
            return Err(ClientError::Signing("event id mismatch".to_owned()));
        }

        let pubkey = hex::decode(&self.pubkey)
            .map_err(|_| ClientError::InvalidKey("pubkey is not hex".to_owned()))?;
        let verifying_key = VerifyingKey::from_bytes(&pubkey)
            .map_err(|_| ClientError::InvalidKey("not a valid x-only public key".to_owned()))?;
        let sig_bytes = hex::decode(&self.sig)
            .map_err(|_| ClientError::Signing("signature is not hex".to_owned()))?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|_| ClientError::Signing("malformed signature".to_owned()))?;
        verifying_key
            .verify(&id, &signature)
            .map_err(|_| ClientError::Signing("signature verification failed".to_owned()))
    }
}

#[cfg(test)]
#[path = "signer_tests.rs"]
mod tests;
