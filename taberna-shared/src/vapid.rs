//! VAPID (RFC 8292) bearer tokens for Web Push requests.
//!
//! Tokens are ES256 JWTs. JWS carries the fixed-width `R || S` signature
//! form rather than DER; [`der_to_raw`] and [`raw_to_der`] convert between
//! the two.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of one signature component on P-256.
const SCALAR_LEN: usize = 32;
/// Raw `R || S` signature width.
pub const RAW_SIGNATURE_LEN: usize = 2 * SCALAR_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VapidClaims {
    pub aud: String,
    pub exp: i64,
    pub sub: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header<'a> {
    typ: &'a str,
    alg: &'a str,
}

#[derive(Debug, Error)]
pub enum VapidError {
    #[error("invalid VAPID private key: {0}")]
    Key(String),
    #[error("malformed DER signature: {0}")]
    Der(String),
    #[error("signature rejected: {0}")]
    Signature(String),
    #[error("invalid token: {0}")]
    Token(String),
}

/// Application server key pair used to sign VAPID tokens.
#[derive(Clone)]
pub struct VapidKey {
    signing: SigningKey,
}

impl std::fmt::Debug for VapidKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VapidKey")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

impl VapidKey {
    /// Loads the private scalar in the usual Web Push format: 32 raw bytes,
    /// base64url without padding (padding and standard alphabet tolerated).
    pub fn from_base64(private_key: &str) -> Result<Self, VapidError> {
        let trimmed = private_key.trim().trim_end_matches('=');
        if trimmed.is_empty() {
            return Err(VapidError::Key("empty key".into()));
        }
        let normalized = trimmed.replace('+', "-").replace('/', "_");
        let bytes = URL_SAFE_NO_PAD
            .decode(normalized.as_bytes())
            .map_err(|e| VapidError::Key(format!("base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(scalar: &[u8]) -> Result<Self, VapidError> {
        if scalar.len() != SCALAR_LEN {
            return Err(VapidError::Key(format!(
                "expected {SCALAR_LEN} bytes, got {}",
                scalar.len()
            )));
        }
        let signing = SigningKey::from_slice(scalar).map_err(|e| VapidError::Key(e.to_string()))?;
        Ok(Self { signing })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing.verifying_key()
    }

    /// Uncompressed public point, base64url, as sent in the `k=` parameter.
    pub fn public_key_base64(&self) -> String {
        let point = self.verifying_key().to_encoded_point(false);
        URL_SAFE_NO_PAD.encode(point.as_bytes())
    }

    /// Builds `base64url(header).base64url(claims).base64url(R || S)`.
    pub fn sign(&self, claims: &VapidClaims) -> Result<String, VapidError> {
        let header = Header {
            typ: "JWT",
            alg: "ES256",
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| VapidError::Token(e.to_string()))?;
        let claims_json =
            serde_json::to_vec(claims).map_err(|e| VapidError::Token(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );

        let signature: Signature = self.signing.sign(signing_input.as_bytes());
        let der = signature.to_der();
        let raw = der_to_raw(der.as_bytes())?;

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(raw)))
    }

    /// `Authorization` header value for a push request.
    pub fn authorization(&self, claims: &VapidClaims) -> Result<String, VapidError> {
        let token = self.sign(claims)?;
        Ok(format!("vapid t={token}, k={}", self.public_key_base64()))
    }
}

/// Checks an ES256 token against `key` and returns its claims. Expiry is not
/// evaluated; that is the push service's business.
pub fn verify(token: &str, key: &VerifyingKey) -> Result<VapidClaims, VapidError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(VapidError::Token("expected three segments".into()));
    };

    let raw = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|e| VapidError::Token(format!("invalid base64 signature: {e}")))?;
    if raw.len() != RAW_SIGNATURE_LEN {
        return Err(VapidError::Token(format!("signature is {} bytes", raw.len())));
    }
    let signature =
        Signature::from_slice(&raw).map_err(|e| VapidError::Signature(e.to_string()))?;

    let signing_input = format!("{header}.{payload}");
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|e| VapidError::Signature(e.to_string()))?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| VapidError::Token(format!("invalid base64 payload: {e}")))?;
    serde_json::from_slice(&payload_bytes)
        .map_err(|e| VapidError::Token(format!("invalid json payload: {e}")))
}

/// Converts a DER `SEQUENCE { INTEGER r, INTEGER s }` into `R || S`, each
/// component left-padded with zeros to 32 bytes.
pub fn der_to_raw(der: &[u8]) -> Result<[u8; RAW_SIGNATURE_LEN], VapidError> {
    let signature = Signature::from_der(der).map_err(|e| VapidError::Der(e.to_string()))?;
    let mut raw = [0u8; RAW_SIGNATURE_LEN];
    raw.copy_from_slice(&signature.to_bytes());
    Ok(raw)
}

/// Inverse of [`der_to_raw`]: minimal DER encoding of `R || S`.
pub fn raw_to_der(raw: &[u8; RAW_SIGNATURE_LEN]) -> Result<Vec<u8>, VapidError> {
    let signature = Signature::from_slice(raw).map_err(|e| VapidError::Der(e.to_string()))?;
    Ok(signature.to_der().as_bytes().to_vec())
}
