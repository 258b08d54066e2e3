//! Attestation signing support.
//!
//! The signer is an asymmetric key we can ask for signatures; in production
//! the private half lives in an external key service (see [`kms`][]) and
//! never touches this process. DSSE envelope binding lives here: signatures
//! cover the pre-authentication encoding of the payload, never the raw JSON.

use async_trait::async_trait;
use base64::Engine;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rebuildr_schema::attestation::{
    DsseEnvelope, DsseSignature, Statement, INTOTO_PAYLOAD_TYPE,
};

pub mod kms;

pub use kms::{validate_key_name, HttpKmsClient, KmsClient, KmsSigner, MemKms};

use crate::errors::{RebuildError, RebuildResult};

/// An asymmetric signing key, abstract over where the private half lives.
#[async_trait]
pub trait AttestationSigner: Send + Sync {
    /// Identifies the key in envelope `keyid` fields.
    fn key_id(&self) -> &str;
    /// Sign a message; returns a DER-encoded ECDSA signature.
    async fn sign(&self, message: &[u8]) -> RebuildResult<Vec<u8>>;
    /// Verify a DER-encoded signature over `message`.
    fn verify(&self, message: &[u8], signature: &[u8]) -> RebuildResult<()>;
    /// The public half.
    fn public_key(&self) -> VerifyingKey;
}

/// Sign a statement into a one-signature DSSE envelope.
pub async fn sign_envelope(
    signer: &dyn AttestationSigner,
    statement: &Statement,
) -> RebuildResult<DsseEnvelope> {
    let mut envelope = DsseEnvelope::unsigned(statement)?;
    let pae = envelope.pae()?;
    let signature = signer.sign(&pae).await?;
    envelope.signatures = vec![DsseSignature {
        keyid: signer.key_id().to_owned(),
        sig: base64::engine::general_purpose::STANDARD.encode(signature),
    }];
    Ok(envelope)
}

/// Verify an envelope against a signer's public key and return the enclosed
/// statement. Fails closed on payload type, missing signatures, and
/// signature mismatch.
pub fn verify_envelope(
    signer: &dyn AttestationSigner,
    envelope: &DsseEnvelope,
) -> RebuildResult<Statement> {
    if envelope.payload_type != INTOTO_PAYLOAD_TYPE {
        return Err(RebuildError::invalid_argument(format!(
            "unexpected payload type {}",
            envelope.payload_type
        )));
    }
    if envelope.signatures.is_empty() {
        return Err(RebuildError::invalid_argument("envelope has no signatures"));
    }
    let pae = envelope.pae()?;
    for signature in &envelope.signatures {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&signature.sig)
            .map_err(|_| RebuildError::invalid_argument("signature is not valid base64"))?;
        if signer.verify(&pae, &raw).is_ok() {
            return envelope.statement().map_err(Into::into);
        }
    }
    Err(RebuildError::failed_precondition(
        "no envelope signature verifies under the signing key",
    ))
}

/// In-process signer holding its own key. Tests and local smoke runs only;
/// production signing goes through [`KmsSigner`][].
pub struct MemSigner {
    key: SigningKey,
    key_id: String,
}

impl MemSigner {
    /// Wrap an existing key.
    pub fn new(key: SigningKey, key_id: impl Into<String>) -> Self {
        MemSigner {
            key,
            key_id: key_id.into(),
        }
    }
}

#[async_trait]
impl AttestationSigner for MemSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn sign(&self, message: &[u8]) -> RebuildResult<Vec<u8>> {
        let signature: Signature = self.key.sign(message);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> RebuildResult<()> {
        let signature = Signature::from_der(signature)
            .map_err(|e| RebuildError::invalid_argument(format!("malformed signature: {e}")))?;
        self.public_key()
            .verify(message, &signature)
            .map_err(|_| RebuildError::failed_precondition("signature verification failed"))
    }

    fn public_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }
}

/// Re-keys `keyid` with the URL format older signing setups published, so
/// bundles they produced keep verifying against current tooling.
pub struct LegacyKeyIdSigner<S> {
    inner: S,
    legacy_key_id: String,
}

impl<S: AttestationSigner> LegacyKeyIdSigner<S> {
    /// Wrap `inner`, substituting its key id.
    pub fn new(inner: S, legacy_key_id: impl Into<String>) -> Self {
        LegacyKeyIdSigner {
            inner,
            legacy_key_id: legacy_key_id.into(),
        }
    }
}

#[async_trait]
impl<S: AttestationSigner> AttestationSigner for LegacyKeyIdSigner<S> {
    fn key_id(&self) -> &str {
        &self.legacy_key_id
    }

    async fn sign(&self, message: &[u8]) -> RebuildResult<Vec<u8>> {
        self.inner.sign(message).await
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> RebuildResult<()> {
        self.inner.verify(message, signature)
    }

    fn public_key(&self) -> VerifyingKey {
        self.inner.public_key()
    }
}
