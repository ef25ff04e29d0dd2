//! Crypto primitives
//!
//! Token and nonce generation, RFC 7638 JWK thumbprints, key
//! authorizations, DNS-01 digests and EAB HMAC signatures. Everything that
//! crosses the wire is base64url without padding.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a challenge token
const TOKEN_BYTES: usize = 32;

/// Random bytes in a replay nonce
const NONCE_BYTES: usize = 16;

/// EAB MAC keys are 256-bit
const MAC_KEY_BYTES: usize = 32;

pub fn b64url_encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(input: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| CryptoError::Base64(e.to_string()))
}

fn random_b64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    b64url_encode(bytes)
}

/// Fresh challenge token
pub fn generate_token() -> String {
    random_b64(TOKEN_BYTES)
}

/// Fresh replay nonce
pub fn generate_nonce() -> String {
    random_b64(NONCE_BYTES)
}

/// Fresh 256-bit EAB MAC key, base64url encoded
pub fn generate_mac_key() -> String {
    random_b64(MAC_KEY_BYTES)
}

/// Compute the RFC 7638 thumbprint of a public JWK.
///
/// Only the required members for the key type take part, serialized in
/// lexicographic order without whitespace.
pub fn jwk_thumbprint(jwk: &Value) -> Result<String, CryptoError> {
    let kty = jwk
        .get("kty")
        .and_then(Value::as_str)
        .ok_or_else(|| CryptoError::InvalidKey("JWK has no 'kty'".to_string()))?;

    let members: &[&str] = match kty {
        "EC" => &["crv", "kty", "x", "y"],
        "RSA" => &["e", "kty", "n"],
        "OKP" => &["crv", "kty", "x"],
        other => {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key type '{}'",
                other
            )))
        }
    };

    let mut canonical = BTreeMap::new();
    for member in members {
        let value = jwk.get(*member).and_then(Value::as_str).ok_or_else(|| {
            CryptoError::InvalidKey(format!("{} JWK is missing '{}'", kty, member))
        })?;
        canonical.insert(*member, value);
    }

    let json = serde_json::to_string(&canonical)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(b64url_encode(Sha256::digest(json.as_bytes())))
}

/// `token "." thumbprint`
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// Expected DNS-01 TXT record value for a key authorization
pub fn dns01_txt_value(key_authorization: &str) -> String {
    b64url_encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Compare two byte strings in time independent of where they differ.
///
/// Length is not secret: unequal lengths return early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn eab_mac(mac_key_b64: &str, protected_b64: &str, payload_b64: &str) -> Result<HmacSha256, CryptoError> {
    let key = b64url_decode(mac_key_b64)?;
    if key.is_empty() {
        return Err(CryptoError::InvalidKey("EAB MAC key is empty".to_string()));
    }
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(protected_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    Ok(mac)
}

/// HMAC-SHA256 over `{protected}.{payload}`, base64url encoded
pub fn eab_sign(mac_key_b64: &str, protected_b64: &str, payload_b64: &str) -> Result<String, CryptoError> {
    let mac = eab_mac(mac_key_b64, protected_b64, payload_b64)?;
    Ok(b64url_encode(mac.finalize().into_bytes()))
}

/// Verify an EAB binding signature in constant time
pub fn eab_verify(
    mac_key_b64: &str,
    protected_b64: &str,
    payload_b64: &str,
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let signature = b64url_decode(signature_b64)?;
    eab_mac(mac_key_b64, protected_b64, payload_b64)?
        .verify_slice(&signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

// ============================================================================
// Account key
// ============================================================================

/// ECDSA P-256 account key of the self-hosted ACME CA.
///
/// Challenges created by the engine itself derive their key authorization
/// from this key's thumbprint.
pub struct AccountKey {
    key_pair: rcgen::KeyPair,
    jwk: Value,
    thumbprint: String,
}

impl AccountKey {
    pub fn generate() -> Result<Self, CryptoError> {
        let key_pair =
            rcgen::KeyPair::generate().map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let jwk = ec_p256_jwk(key_pair.public_key_raw())?;
        let thumbprint = jwk_thumbprint(&jwk)?;
        Ok(Self {
            key_pair,
            jwk,
            thumbprint,
        })
    }

    /// Restore a key saved with [`private_key_pem`](Self::private_key_pem)
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key_pair = rcgen::KeyPair::from_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let jwk = ec_p256_jwk(key_pair.public_key_raw())?;
        let thumbprint = jwk_thumbprint(&jwk)?;
        Ok(Self {
            key_pair,
            jwk,
            thumbprint,
        })
    }

    pub fn jwk(&self) -> &Value {
        &self.jwk
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// PKCS#8 PEM of the private key
    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.thumbprint)
            .finish()
    }
}

/// Build the public JWK from an uncompressed SEC1 point (`04 || x || y`)
fn ec_p256_jwk(point: &[u8]) -> Result<Value, CryptoError> {
    if point.len() != 65 || point[0] != 0x04 {
        return Err(CryptoError::InvalidKey(
            "expected an uncompressed P-256 public key".to_string(),
        ));
    }
    Ok(serde_json::json!({
        "crv": "P-256",
        "kty": "EC",
        "x": b64url_encode(&point[1..33]),
        "y": b64url_encode(&point[33..65]),
    }))
}

// ============================================================================
// Certificate signing requests
// ============================================================================

/// Fresh P-256 key and a CSR for `domain`.
///
/// Returns `(csr_pem, private_key_pem)`.
pub fn generate_csr(domain: &str) -> Result<(String, String), CryptoError> {
    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| CryptoError::InvalidKey(format!("invalid subject '{}': {}", domain, e)))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, domain.to_string());
    let csr_pem = params
        .serialize_request(&key_pair)
        .and_then(|csr| csr.pem())
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    Ok((csr_pem, key_pair.serialize_pem()))
}
