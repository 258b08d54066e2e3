//! in-toto statements, DSSE envelopes, and the JSONL attestation bundle.
//!
//! A published bundle carries exactly two envelopes per target: a "rebuild"
//! attestation describing how the artifact was reproduced, and an
//! "artifact equivalence" attestation binding the upstream digest to the
//! rebuilt digest under a declared stabilizer set. Statements are
//! SLSA-Provenance-v1 shaped.

use base64::Engine;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The DSSE payload type for in-toto statements.
pub const INTOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";
/// The in-toto statement `_type`.
pub const INTOTO_STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";
/// The SLSA provenance predicate type.
pub const SLSA_PROVENANCE_TYPE: &str = "https://slsa.dev/provenance/v1";

/// buildType of a rebuild attestation.
pub const BUILD_TYPE_REBUILD_V01: &str = "https://docs.rebuildr.dev/builds/Rebuild@v0.1";
/// buildType of an artifact-equivalence attestation.
pub const BUILD_TYPE_ARTIFACT_EQUIVALENCE_V01: &str =
    "https://docs.rebuildr.dev/builds/ArtifactEquivalence@v0.1";
/// buildType of a system-trace rebuild attestation (analyzer services).
pub const BUILD_TYPE_SYSTEM_TRACE_REBUILD_V01: &str =
    "https://docs.rebuildr.dev/builds/SystemTraceRebuild@v0.1";

/// Errors encoding or decoding envelopes and bundles.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Payload was not valid base64
    #[error("envelope payload is not valid base64")]
    PayloadEncoding(#[from] base64::DecodeError),
    /// Payload or bundle line was not valid JSON
    #[error("envelope payload is not a valid statement")]
    PayloadJson(#[from] serde_json::Error),
    /// A bundle line was empty or malformed
    #[error("attestation bundle line {line} is malformed")]
    BundleLine {
        /// 1-indexed offending line
        line: usize,
    },
}

/// A named artifact plus its digests, as referenced from a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceDescriptor {
    /// Logical name of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// URI of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Digests keyed by algorithm name (sha256, sha512, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub digest: BTreeMap<String, String>,
}

/// An in-toto statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Statement {
    /// Statement type discriminator (always [`INTOTO_STATEMENT_TYPE`][])
    #[serde(rename = "_type")]
    pub statement_type: String,
    /// The artifacts this statement is about
    pub subject: Vec<ResourceDescriptor>,
    /// Predicate type discriminator (always [`SLSA_PROVENANCE_TYPE`][])
    #[serde(rename = "predicateType")]
    pub predicate_type: String,
    /// The provenance claim itself
    pub predicate: Predicate,
}

/// SLSA-provenance-v1 predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    /// What was built and from what
    pub build_definition: BuildDefinitionClaim,
    /// Who built it and when
    pub run_details: RunDetails,
}

/// The buildDefinition half of a provenance predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildDefinitionClaim {
    /// One of the BUILD_TYPE_* constants
    pub build_type: String,
    /// Caller-visible parameters (the target, the build definition used)
    pub external_parameters: serde_json::Value,
    /// Service-internal parameters (service source, prebuild location,
    /// overwrite disposition)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub internal_parameters: serde_json::Value,
    /// Inputs resolved during the build (source commit, builder images)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_dependencies: Vec<ResourceDescriptor>,
}

/// The runDetails half of a provenance predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    /// The service that performed the build
    pub builder: Builder,
    /// Invocation bookkeeping
    pub metadata: BuildMetadata,
}

/// The attesting builder identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Builder {
    /// URI identifying the signing service
    pub id: String,
}

/// Invocation bookkeeping inside runDetails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetadata {
    /// Opaque id grouping the attempts of one run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    /// When the build started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_on: Option<DateTime<Utc>>,
    /// When the build finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<DateTime<Utc>>,
}

/// One signature over a DSSE envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DsseSignature {
    /// Identifies the key that produced `sig`
    pub keyid: String,
    /// base64 signature over the PAE encoding
    pub sig: String,
}

/// A DSSE envelope carrying one base64-encoded in-toto statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DsseEnvelope {
    /// Always [`INTOTO_PAYLOAD_TYPE`][]
    #[serde(rename = "payloadType")]
    pub payload_type: String,
    /// base64(statement JSON)
    pub payload: String,
    /// Signatures over `PAE(payloadType, payload)`
    pub signatures: Vec<DsseSignature>,
}

impl DsseEnvelope {
    /// Wrap a statement as an unsigned envelope.
    pub fn unsigned(statement: &Statement) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_vec(statement)?;
        Ok(DsseEnvelope {
            payload_type: INTOTO_PAYLOAD_TYPE.to_owned(),
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
            signatures: Vec::new(),
        })
    }

    /// Decode the enveloped statement.
    pub fn statement(&self) -> Result<Statement, EnvelopeError> {
        let payload = base64::engine::general_purpose::STANDARD.decode(&self.payload)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// The DSSE v1 pre-authentication encoding this envelope's signatures
    /// cover: `DSSEv1 <len(type)> <type> <len(payload)> <payload>`.
    pub fn pae(&self) -> Result<Vec<u8>, EnvelopeError> {
        let payload = base64::engine::general_purpose::STANDARD.decode(&self.payload)?;
        Ok(pre_auth_encoding(&self.payload_type, &payload))
    }
}

/// DSSE v1 pre-authentication encoding over a raw payload.
pub fn pre_auth_encoding(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload.len() + payload_type.len() + 32);
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}

/// The JSONL attestation bundle published for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationBundle {
    /// The envelopes, in publication order
    pub envelopes: Vec<DsseEnvelope>,
}

impl AttestationBundle {
    /// Serialize as JSONL, one envelope per line.
    pub fn to_jsonl(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::new();
        for envelope in &self.envelopes {
            serde_json::to_writer(&mut out, envelope)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Parse a JSONL bundle.
    pub fn from_jsonl(data: &[u8]) -> Result<Self, EnvelopeError> {
        let text = String::from_utf8_lossy(data);
        let mut envelopes = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let envelope: DsseEnvelope = serde_json::from_str(line)
                .map_err(|_| EnvelopeError::BundleLine { line: idx + 1 })?;
            envelopes.push(envelope);
        }
        Ok(AttestationBundle { envelopes })
    }

    /// Find the enveloped statement with the given buildType, if any.
    pub fn statement_with_build_type(
        &self,
        build_type: &str,
    ) -> Option<(usize, Statement)> {
        self.envelopes.iter().enumerate().find_map(|(idx, envelope)| {
            let statement = envelope.statement().ok()?;
            (statement.predicate.build_definition.build_type == build_type)
                .then_some((idx, statement))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_statement(build_type: &str) -> Statement {
        Statement {
            statement_type: INTOTO_STATEMENT_TYPE.to_owned(),
            subject: vec![ResourceDescriptor {
                name: Some("absl_py-2.0.0-py3-none-any.whl".to_owned()),
                uri: None,
                digest: BTreeMap::from([("sha256".to_owned(), "ab12".to_owned())]),
            }],
            predicate_type: SLSA_PROVENANCE_TYPE.to_owned(),
            predicate: Predicate {
                build_definition: BuildDefinitionClaim {
                    build_type: build_type.to_owned(),
                    external_parameters: serde_json::json!({"ecosystem": "pypi"}),
                    internal_parameters: serde_json::Value::Null,
                    resolved_dependencies: vec![],
                },
                run_details: RunDetails {
                    builder: Builder {
                        id: "https://rebuildr.example/builder".to_owned(),
                    },
                    metadata: BuildMetadata::default(),
                },
            },
        }
    }

    #[test]
    fn envelope_roundtrip() {
        let statement = sample_statement(BUILD_TYPE_REBUILD_V01);
        let envelope = DsseEnvelope::unsigned(&statement).unwrap();
        assert_eq!(envelope.payload_type, INTOTO_PAYLOAD_TYPE);
        assert_eq!(envelope.statement().unwrap(), statement);
    }

    #[test]
    fn pae_layout() {
        let pae = pre_auth_encoding("application/test", b"abc");
        assert_eq!(
            pae,
            b"DSSEv1 16 application/test 3 abc".to_vec()
        );
    }

    #[test]
    fn bundle_jsonl_roundtrip() {
        let bundle = AttestationBundle {
            envelopes: vec![
                DsseEnvelope::unsigned(&sample_statement(BUILD_TYPE_ARTIFACT_EQUIVALENCE_V01))
                    .unwrap(),
                DsseEnvelope::unsigned(&sample_statement(BUILD_TYPE_REBUILD_V01)).unwrap(),
            ],
        };
        let jsonl = bundle.to_jsonl().unwrap();
        assert_eq!(jsonl.iter().filter(|b| **b == b'\n').count(), 2);
        let parsed = AttestationBundle::from_jsonl(&jsonl).unwrap();
        assert_eq!(parsed, bundle);

        let (idx, statement) = parsed
            .statement_with_build_type(BUILD_TYPE_REBUILD_V01)
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(
            statement.predicate.build_definition.build_type,
            BUILD_TYPE_REBUILD_V01
        );
    }

    #[test]
    fn camel_case_field_names() {
        let statement = sample_statement(BUILD_TYPE_REBUILD_V01);
        let json = serde_json::to_value(&statement).unwrap();
        assert!(json.get("_type").is_some());
        assert!(json.get("predicateType").is_some());
        assert!(json["predicate"]["buildDefinition"].get("buildType").is_some());
        assert!(json["predicate"]["runDetails"]["builder"].get("id").is_some());
    }
}
