//! Capability token verification.
//!
//! A token is `base64url(claims) "." base64url(signature)` where `claims` is a
//! CBOR map and `signature = HMAC-SHA256(secret, claims)`. Padding on either
//! segment is optional.

use crate::error::AuthError;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_ENCODING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Operation class a token authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope {
    UploadIcon,
    UploadEmoji,
    UploadSticker,
    UploadAttachment,
    AccessDataExport,
}

impl TokenScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScope::UploadIcon => "upload_icon",
            TokenScope::UploadEmoji => "upload_emoji",
            TokenScope::UploadSticker => "upload_sticker",
            TokenScope::UploadAttachment => "upload_attachment",
            TokenScope::AccessDataExport => "access_data_export",
        }
    }
}

/// Decoded token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Operation class, compared against a [`TokenScope`]
    #[serde(rename = "t")]
    pub scope: String,
    /// Absolute expiry in epoch seconds
    #[serde(rename = "e")]
    pub expires_at: i64,
    #[serde(rename = "d", default)]
    pub data: TokenData,
}

/// Operation parameters carried by a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// Upload ID the token is bound to
    #[serde(default)]
    pub id: String,
    /// Identity of the bearer
    #[serde(default)]
    pub uploader: String,
    /// Largest accepted upload in bytes
    #[serde(default)]
    pub max_size: u64,
}

impl TokenClaims {
    pub fn new(scope: TokenScope, expires_at: i64, data: TokenData) -> Self {
        Self {
            scope: scope.as_str().to_string(),
            expires_at,
            data,
        }
    }
}

/// Verifies (and, for trusted issuers, signs) capability tokens
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size")
    }

    /// Encode and sign a set of claims
    pub fn issue(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(claims, &mut payload)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        let mut mac = self.mac();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            TOKEN_ENCODING.encode(&payload),
            TOKEN_ENCODING.encode(signature)
        ))
    }

    /// Verify a token against the current time
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify a token and require a specific scope
    pub fn verify_scoped(&self, token: &str, scope: TokenScope) -> Result<TokenClaims, AuthError> {
        self.verify_scoped_at(token, scope, Utc::now().timestamp())
    }

    pub fn verify_scoped_at(
        &self,
        token: &str,
        scope: TokenScope,
        now: i64,
    ) -> Result<TokenClaims, AuthError> {
        let claims = self.verify_at(token, now)?;
        if claims.scope != scope.as_str() {
            return Err(AuthError::WrongScope {
                expected: scope.as_str().to_string(),
                actual: claims.scope,
            });
        }
        Ok(claims)
    }

    /// Verify signature, payload and expiry relative to `now` (epoch seconds)
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims, AuthError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        let mut segments = token.split('.');
        let (encoded_claims, encoded_signature) =
            match (segments.next(), segments.next(), segments.next()) {
                (Some(c), Some(s), None) if !c.is_empty() && !s.is_empty() => (c, s),
                _ => {
                    return Err(AuthError::Malformed(
                        "expected two dot-separated segments".to_string(),
                    ))
                }
            };

        let payload = TOKEN_ENCODING
            .decode(encoded_claims)
            .map_err(|e| AuthError::Malformed(format!("claims: {}", e)))?;
        let signature = TOKEN_ENCODING
            .decode(encoded_signature)
            .map_err(|e| AuthError::Malformed(format!("signature: {}", e)))?;

        let mut mac = self.mac();
        mac.update(&payload);
        let expected = mac.finalize().into_bytes();
        if !bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
            return Err(AuthError::BadSignature);
        }

        let claims: TokenClaims = ciborium::de::from_reader(payload.as_slice())
            .map_err(|e| AuthError::Malformed(format!("claims: {}", e)))?;

        if claims.expires_at <= now {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }
}

/// Compare two secrets without leaking the position of the first mismatch
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}
