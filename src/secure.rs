//! Secure-part detection
//!
//! Classifies S/MIME and PGP parts by media type and derives the aggregate
//! encryption/signing posture of a message. Detection is purely structural;
//! the cryptographic operations themselves are capability interfaces that
//! default to `NotImplemented` and never block rendering of the surrounding
//! message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};
use crate::models::MimePart;

/// Kind of secure part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurePartKind {
    /// S/MIME detached signature
    SmimeSigned,
    /// S/MIME enveloped (encrypted) payload
    SmimeEncrypted,
    /// PGP detached signature
    PgpSigned,
    /// PGP encrypted payload
    PgpEncrypted,
    /// PGP public key material
    PgpKeys,
}

impl SecurePartKind {
    /// Whether this kind carries encrypted content
    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::SmimeEncrypted | Self::PgpEncrypted)
    }

    /// Whether this kind carries a signature
    pub fn is_signed(self) -> bool {
        matches!(self, Self::SmimeSigned | Self::PgpSigned)
    }

    /// Canonical filename used when the part declares none
    pub fn canonical_filename(self) -> &'static str {
        match self {
            Self::SmimeSigned => "smime.p7s",
            Self::SmimeEncrypted => "smime.p7m",
            Self::PgpSigned => "signature.asc",
            Self::PgpEncrypted => "encrypted.asc",
            Self::PgpKeys => "public_key.asc",
        }
    }
}

/// One detected secure part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedSecurePart {
    /// Section path of the part
    pub part_id: String,
    /// Classification
    pub kind: SecurePartKind,
    /// Filename to store the part under
    pub filename: String,
}

/// Aggregate detection result for a message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecureDetectionResult {
    /// Every secure part found, in tree order
    pub parts: Vec<DetectedSecurePart>,
    /// Exactly one secure part was found and it is an encrypted variant
    pub is_fully_encrypted: bool,
    /// At least one detected part is a signed variant
    pub is_fully_signed: bool,
}

impl SecureDetectionResult {
    /// Whether any secure parts were detected
    pub fn has_secure_parts(&self) -> bool {
        !self.parts.is_empty()
    }
}

/// Classify a media type, including the `x-` aliases
pub fn classify_media_type(media_type: &str) -> Option<SecurePartKind> {
    match media_type.to_ascii_lowercase().as_str() {
        "application/pkcs7-signature" | "application/x-pkcs7-signature" => {
            Some(SecurePartKind::SmimeSigned)
        }
        "application/pkcs7-mime" | "application/x-pkcs7-mime" => {
            Some(SecurePartKind::SmimeEncrypted)
        }
        "application/pgp-signature" => Some(SecurePartKind::PgpSigned),
        "application/pgp-encrypted" => Some(SecurePartKind::PgpEncrypted),
        "application/pgp-keys" => Some(SecurePartKind::PgpKeys),
        _ => None,
    }
}

/// Detect secure parts in a parsed part list
pub fn detect_secure_parts(parts: &[MimePart]) -> SecureDetectionResult {
    let detected: Vec<DetectedSecurePart> = parts
        .iter()
        .filter_map(|part| {
            classify_media_type(&part.media_type).map(|kind| DetectedSecurePart {
                part_id: part.part_id.clone(),
                kind,
                filename: part
                    .filename_normalized
                    .clone()
                    .unwrap_or_else(|| kind.canonical_filename().to_owned()),
            })
        })
        .collect();

    let is_fully_encrypted = detected.len() == 1 && detected[0].kind.is_encrypted();
    let is_fully_signed = detected.iter().any(|p| p.kind.is_signed());

    SecureDetectionResult {
        parts: detected,
        is_fully_encrypted,
        is_fully_signed,
    }
}

/// Outcome of signature verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureVerification {
    /// Whether the signature checked out
    pub valid: bool,
    /// Signer identity when available
    pub signer: Option<String>,
}

/// Cryptographic capability interface
///
/// The core delegates S/MIME and PGP operations here. The bundled
/// implementation reports the capability as absent; hosts wire a real one
/// when they have key material to work with.
#[async_trait]
pub trait SecureMessageVerifier: Send + Sync {
    /// Verify a detached signature over message content
    async fn verify_signature(
        &self,
        message_id: Uuid,
        part_id: &str,
        signed_bytes: &[u8],
        signature_bytes: &[u8],
    ) -> StoreResult<SignatureVerification>;

    /// Decrypt an encrypted payload
    async fn decrypt(
        &self,
        message_id: Uuid,
        part_id: &str,
        encrypted_bytes: &[u8],
    ) -> StoreResult<Vec<u8>>;
}

/// Default verifier: every operation reports `NotImplemented`
#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedVerifier;

#[async_trait]
impl SecureMessageVerifier for UnimplementedVerifier {
    async fn verify_signature(
        &self,
        _message_id: Uuid,
        part_id: &str,
        _signed_bytes: &[u8],
        _signature_bytes: &[u8],
    ) -> StoreResult<SignatureVerification> {
        Err(StoreError::NotImplemented(format!(
            "signature verification for part {part_id}"
        )))
    }

    async fn decrypt(
        &self,
        _message_id: Uuid,
        part_id: &str,
        _encrypted_bytes: &[u8],
    ) -> StoreResult<Vec<u8>> {
        Err(StoreError::NotImplemented(format!(
            "decryption for part {part_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{
        SecureMessageVerifier, SecurePartKind, UnimplementedVerifier, classify_media_type,
        detect_secure_parts,
    };
    use crate::errors::StoreError;
    use crate::models::MimePart;

    fn part(part_id: &str, media_type: &str) -> MimePart {
        MimePart {
            part_id: part_id.to_owned(),
            parent: Some("1".to_owned()),
            media_type: media_type.to_owned(),
            charset: None,
            transfer_encoding: None,
            disposition: None,
            filename_raw: None,
            filename_normalized: None,
            content_id: None,
            size_octets: 100,
            is_body_candidate: false,
            blob_id: None,
        }
    }

    #[test]
    fn classifies_smime_and_pgp_types_with_aliases() {
        assert_eq!(
            classify_media_type("application/pkcs7-signature"),
            Some(SecurePartKind::SmimeSigned)
        );
        assert_eq!(
            classify_media_type("application/x-pkcs7-mime"),
            Some(SecurePartKind::SmimeEncrypted)
        );
        assert_eq!(
            classify_media_type("Application/PGP-Signature"),
            Some(SecurePartKind::PgpSigned)
        );
        assert_eq!(
            classify_media_type("application/pgp-keys"),
            Some(SecurePartKind::PgpKeys)
        );
        assert_eq!(classify_media_type("application/pdf"), None);
    }

    #[test]
    fn one_encrypted_part_means_fully_encrypted() {
        let parts = vec![
            part("1", "multipart/encrypted"),
            part("1.2", "application/pgp-encrypted"),
        ];
        let result = detect_secure_parts(&parts);
        assert_eq!(result.parts.len(), 1);
        assert!(result.is_fully_encrypted);
        assert!(!result.is_fully_signed);
    }

    #[test]
    fn signed_plus_keys_is_signed_but_not_encrypted() {
        let parts = vec![
            part("1.2", "application/pgp-signature"),
            part("1.3", "application/pgp-keys"),
        ];
        let result = detect_secure_parts(&parts);
        assert_eq!(result.parts.len(), 2);
        assert!(result.is_fully_signed);
        assert!(!result.is_fully_encrypted);
    }

    #[test]
    fn canonical_filenames_fill_in_for_missing_names() {
        let parts = vec![part("1.2", "application/pkcs7-signature")];
        let result = detect_secure_parts(&parts);
        assert_eq!(result.parts[0].filename, "smime.p7s");

        let mut named = part("1.2", "application/pkcs7-signature");
        named.filename_normalized = Some("sig.p7s".to_owned());
        let result = detect_secure_parts(&[named]);
        assert_eq!(result.parts[0].filename, "sig.p7s");
    }

    #[tokio::test]
    async fn default_verifier_reports_not_implemented() {
        let verifier = UnimplementedVerifier;
        let err = verifier
            .verify_signature(Uuid::new_v4(), "1.2", b"content", b"sig")
            .await
            .expect_err("must fail");
        assert!(matches!(err, StoreError::NotImplemented(_)));

        let err = verifier
            .decrypt(Uuid::new_v4(), "1.2", b"payload")
            .await
            .expect_err("must fail");
        assert!(matches!(err, StoreError::NotImplemented(_)));
    }
}
