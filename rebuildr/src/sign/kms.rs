//! The KMS-backed signer.
//!
//! The key resource name is validated by a strict regex at construction, and
//! algorithm selection is keyed on what the remote reports: only
//! ECDSA-P256-SHA256 is supported, anything else fails closed before a single
//! signature is produced.

use async_trait::async_trait;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use regex::Regex;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use super::AttestationSigner;
use crate::errors::{RebuildError, RebuildResult};

// Key version resource names: no empty segments, no scheme prefixes, numeric
// version.
static KMS_KEY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^projects/[a-z][a-z0-9-]*/locations/[a-z0-9-]+/keyRings/[A-Za-z0-9._-]+/cryptoKeys/[A-Za-z0-9._-]+/cryptoKeyVersions/[1-9][0-9]*$",
    )
    .expect("kms key regex is valid")
});

/// Validate a KMS key version resource name.
pub fn validate_key_name(name: &str) -> RebuildResult<()> {
    if KMS_KEY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(RebuildError::invalid_argument(format!(
            "malformed KMS key name: {name}"
        )))
    }
}

/// The keyid scheme current bundles carry.
pub fn key_id_for(name: &str) -> String {
    format!("kms://{name}")
}

/// The keyid scheme bundles from older signing setups carry.
pub fn legacy_key_id_for(name: &str) -> String {
    format!("https://cloudkms.googleapis.com/v1/{name}")
}

/// Signing algorithms the service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsAlgorithm {
    /// NIST P-256 ECDSA over SHA-256
    EcSignP256Sha256,
}

impl KmsAlgorithm {
    /// Parse the remote-reported algorithm, failing closed on anything
    /// unknown.
    pub fn parse(raw: &str) -> RebuildResult<Self> {
        match raw {
            "EC_SIGN_P256_SHA256" => Ok(KmsAlgorithm::EcSignP256Sha256),
            other => Err(RebuildError::unimplemented(format!(
                "unsupported KMS algorithm: {other}"
            ))),
        }
    }
}

/// Public key material as the key service reports it.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct KmsPublicKey {
    /// PEM-encoded SPKI public key
    pub pem: String,
    /// Remote-reported algorithm name
    pub algorithm: String,
}

/// The remote key service transport.
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Fetch the public half and algorithm of a key version.
    async fn get_public_key(&self, key_name: &str) -> RebuildResult<KmsPublicKey>;
    /// Sign a SHA-256 digest; returns a DER-encoded signature.
    async fn asymmetric_sign(&self, key_name: &str, digest: &[u8; 32]) -> RebuildResult<Vec<u8>>;
}

/// KMS transport over HTTPS with a bearer token.
pub struct HttpKmsClient {
    client: reqwest::Client,
    endpoint: url::Url,
    token: Option<String>,
}

impl HttpKmsClient {
    /// A client against `endpoint` (the service root).
    pub fn new(client: reqwest::Client, endpoint: url::Url, token: Option<String>) -> Self {
        HttpKmsClient {
            client,
            endpoint,
            token,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl KmsClient for HttpKmsClient {
    async fn get_public_key(&self, key_name: &str) -> RebuildResult<KmsPublicKey> {
        let url = self.endpoint.join(&format!("v1/{key_name}/publicKey"))?;
        let resp: serde_json::Value = self
            .request(self.client.get(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(KmsPublicKey {
            pem: resp["pem"]
                .as_str()
                .ok_or_else(|| RebuildError::internal("publicKey response missing pem"))?
                .to_owned(),
            algorithm: resp["algorithm"]
                .as_str()
                .ok_or_else(|| RebuildError::internal("publicKey response missing algorithm"))?
                .to_owned(),
        })
    }

    async fn asymmetric_sign(&self, key_name: &str, digest: &[u8; 32]) -> RebuildResult<Vec<u8>> {
        use base64::Engine;
        let url = self.endpoint.join(&format!("v1/{key_name}:asymmetricSign"))?;
        let body = serde_json::json!({
            "digest": {
                "sha256": base64::engine::general_purpose::STANDARD.encode(digest)
            }
        });
        let resp: serde_json::Value = self
            .request(self.client.post(url).json(&body))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let signature = resp["signature"]
            .as_str()
            .ok_or_else(|| RebuildError::internal("asymmetricSign response missing signature"))?;
        base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| RebuildError::internal("asymmetricSign returned invalid base64"))
    }
}

/// In-memory key service: the fake the test suite signs with.
#[derive(Default)]
pub struct MemKms {
    keys: HashMap<String, SigningKey>,
}

impl MemKms {
    /// A service holding one key under `name`.
    pub fn with_key(name: impl Into<String>, key: SigningKey) -> Self {
        let mut keys = HashMap::new();
        keys.insert(name.into(), key);
        MemKms { keys }
    }
}

#[async_trait]
impl KmsClient for MemKms {
    async fn get_public_key(&self, key_name: &str) -> RebuildResult<KmsPublicKey> {
        let key = self
            .keys
            .get(key_name)
            .ok_or_else(|| RebuildError::not_found(format!("key {key_name}")))?;
        let pem = key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| RebuildError::internal(format!("encode public key: {e}")))?;
        Ok(KmsPublicKey {
            pem,
            algorithm: "EC_SIGN_P256_SHA256".to_owned(),
        })
    }

    async fn asymmetric_sign(&self, key_name: &str, digest: &[u8; 32]) -> RebuildResult<Vec<u8>> {
        let key = self
            .keys
            .get(key_name)
            .ok_or_else(|| RebuildError::not_found(format!("key {key_name}")))?;
        let signature: Signature = key
            .sign_prehash(digest)
            .map_err(|e| RebuildError::internal(format!("prehash sign: {e}")))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

/// The production signer: a key version in the external key service.
pub struct KmsSigner {
    client: Arc<dyn KmsClient>,
    key_name: String,
    key_id: String,
    verifying_key: VerifyingKey,
}

impl KmsSigner {
    /// Validate the key name, fetch the public half, and check the algorithm.
    pub async fn connect(client: Arc<dyn KmsClient>, key_name: &str) -> RebuildResult<Self> {
        validate_key_name(key_name)?;
        let public = client.get_public_key(key_name).await?;
        KmsAlgorithm::parse(&public.algorithm)?;
        let verifying_key = VerifyingKey::from_public_key_pem(&public.pem)
            .map_err(|e| RebuildError::internal(format!("parse KMS public key: {e}")))?;
        Ok(KmsSigner {
            client,
            key_name: key_name.to_owned(),
            key_id: key_id_for(key_name),
            verifying_key,
        })
    }
}

#[async_trait]
impl AttestationSigner for KmsSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn sign(&self, message: &[u8]) -> RebuildResult<Vec<u8>> {
        let digest: [u8; 32] = Sha256::digest(message).into();
        self.client.asymmetric_sign(&self.key_name, &digest).await
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> RebuildResult<()> {
        let signature = Signature::from_der(signature)
            .map_err(|e| RebuildError::invalid_argument(format!("malformed signature: {e}")))?;
        self.verifying_key
            .verify(message, &signature)
            .map_err(|_| RebuildError::failed_precondition("signature verification failed"))
    }

    fn public_key(&self) -> VerifyingKey {
        self.verifying_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_NAME: &str =
        "projects/attest-prod/locations/global/keyRings/rebuilds/cryptoKeys/signing/cryptoKeyVersions/1";

    #[test]
    fn key_name_validation() {
        assert!(validate_key_name(KEY_NAME).is_ok());
        // empty segment
        assert!(validate_key_name(
            "projects//locations/global/keyRings/r/cryptoKeys/k/cryptoKeyVersions/1"
        )
        .is_err());
        // scheme prefix
        assert!(validate_key_name(&format!("https://{KEY_NAME}")).is_err());
        // non-numeric version
        assert!(validate_key_name(
            "projects/p/locations/global/keyRings/r/cryptoKeys/k/cryptoKeyVersions/latest"
        )
        .is_err());
        assert!(validate_key_name("").is_err());
    }

    #[test]
    fn unknown_algorithms_fail_closed() {
        assert!(KmsAlgorithm::parse("EC_SIGN_P256_SHA256").is_ok());
        assert!(KmsAlgorithm::parse("EC_SIGN_P384_SHA384").is_err());
        assert!(KmsAlgorithm::parse("RSA_SIGN_PKCS1_2048_SHA256").is_err());
        assert!(KmsAlgorithm::parse("").is_err());
    }

    #[tokio::test]
    async fn kms_signer_roundtrip() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let kms = Arc::new(MemKms::with_key(KEY_NAME, key));
        let signer = KmsSigner::connect(kms, KEY_NAME).await.unwrap();
        assert_eq!(signer.key_id(), format!("kms://{KEY_NAME}"));

        let signature = signer.sign(b"attestation bytes").await.unwrap();
        signer.verify(b"attestation bytes", &signature).unwrap();
        assert!(signer.verify(b"other bytes", &signature).is_err());
    }

    #[tokio::test]
    async fn connect_rejects_bad_names_and_keys() {
        let kms: Arc<dyn KmsClient> = Arc::new(MemKms::default());
        assert!(KmsSigner::connect(kms.clone(), "not-a-key").await.is_err());
        // valid name, but the service doesn't know it
        assert!(KmsSigner::connect(kms, KEY_NAME).await.is_err());
    }
}
