//! Transport envelope: serialize → compress → encrypt → sign, and back.
//!
//! # Wire format
//!
//! - body: gzip-compressed JSON array of [`MetricPayload`], optionally
//!   AES-GCM encrypted with a random 12-byte nonce prepended
//! - `Content-Encoding: gzip` marks compression; without it the receiver
//!   does not attempt to decompress
//! - `HashSHA256: <hex>` carries the HMAC-SHA256 of the body exactly as sent
//!
//! The signature covers the bytes on the wire, so the receiver can reject a
//! tampered request before decrypting or decompressing anything.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{MetrixError, Result};
use crate::model::MetricPayload;

/// Header carrying the hex HMAC-SHA256 digest of the body.
pub const SIGNATURE_HEADER: &str = "HashSHA256";
/// `Content-Encoding` value for gzip bodies.
pub const GZIP_ENCODING: &str = "gzip";
/// `Content-Type` of every envelope.
pub const JSON_CONTENT_TYPE: &str = "application/json";

const NONCE_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Key material for the optional envelope stages.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeConfig {
    /// Shared secret for HMAC signing. Empty or absent disables signing.
    pub sign_key: Option<String>,
    /// Hex-encoded AES key (16 or 32 bytes). Absent disables encryption.
    pub crypto_key: Option<String>,
}

/// Gzip `data` at the fastest compression level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|e| MetrixError::Codec(format!("compress: {e}")))?;
    encoder
        .finish()
        .map_err(|e| MetrixError::Codec(format!("compress: {e}")))
}

/// Inflate a gzip stream produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| MetrixError::Codec(format!("decompress: {e}")))?;
    Ok(out)
}

/// Hex HMAC-SHA256 of `data` under `key`.
pub fn sign(key: &[u8], data: &[u8]) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| MetrixError::Config(format!("signing key: {e}")))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check `signature` (hex) against the HMAC of `data`, in constant time.
pub fn verify(key: &[u8], data: &[u8], signature: &str) -> Result<()> {
    let expected = hex::decode(signature.trim())
        .map_err(|_| MetrixError::Integrity("signature is not valid hex".to_string()))?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| MetrixError::Config(format!("signing key: {e}")))?;
    mac.update(data);
    mac.verify_slice(&expected)
        .map_err(|_| MetrixError::Integrity("signature does not match body".to_string()))
}

/// AES-GCM with the key size picked from the key material.
pub enum Cipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl Cipher {
    /// Build from a hex-encoded 16- or 32-byte key.
    pub fn from_hex(key: &str) -> Result<Self> {
        let raw = hex::decode(key.trim())
            .map_err(|e| MetrixError::Config(format!("crypto key is not valid hex: {e}")))?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        let invalid = |e| MetrixError::Config(format!("crypto key: {e}"));
        match key.len() {
            16 => Ok(Self::Aes128(
                <Aes128Gcm as KeyInit>::new_from_slice(key).map_err(invalid)?,
            )),
            32 => Ok(Self::Aes256(
                <Aes256Gcm as KeyInit>::new_from_slice(key).map_err(invalid)?,
            )),
            n => Err(MetrixError::Config(format!(
                "crypto key must be 16 or 32 bytes, got {n}"
            ))),
        }
    }

    /// Encrypt under a fresh random nonce; the nonce is prepended.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|e| MetrixError::Codec(format!("nonce: {e}")))?;
        let nonce_ref = Nonce::from_slice(&nonce);
        let sealed = match self {
            Self::Aes128(c) => c.encrypt(nonce_ref, plaintext),
            Self::Aes256(c) => c.encrypt(nonce_ref, plaintext),
        }
        .map_err(|_| MetrixError::Codec("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Split off the leading nonce and decrypt the rest.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(MetrixError::Codec(
                "ciphertext shorter than nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| MetrixError::Codec("decryption failed".to_string()))
    }
}

/// Body and headers produced by [`Envelope::seal`].
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub body: Vec<u8>,
    /// Value for [`SIGNATURE_HEADER`], when signing is enabled.
    pub signature: Option<String>,
}

/// Configured envelope shared by the agent (seal) and collector (unseal).
pub struct Envelope {
    sign_key: Option<Vec<u8>>,
    cipher: Option<Cipher>,
}

impl Envelope {
    /// Validate key material. Malformed keys are fatal configuration errors.
    pub fn new(config: &EnvelopeConfig) -> Result<Self> {
        let sign_key = config
            .sign_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| k.as_bytes().to_vec());
        let cipher = config
            .crypto_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(Cipher::from_hex)
            .transpose()?;
        Ok(Self { sign_key, cipher })
    }

    /// Envelope with every optional stage disabled.
    pub fn plain() -> Self {
        Self {
            sign_key: None,
            cipher: None,
        }
    }

    pub fn signs(&self) -> bool {
        self.sign_key.is_some()
    }

    pub fn encrypts(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize, compress, encrypt and sign a batch.
    pub fn seal(&self, batch: &[MetricPayload]) -> Result<SealedBatch> {
        let json = serde_json::to_vec(batch)
            .map_err(|e| MetrixError::Codec(format!("serialize: {e}")))?;
        self.seal_bytes(&json)
    }

    /// Compress, encrypt and sign an already-serialized body.
    pub fn seal_bytes(&self, json: &[u8]) -> Result<SealedBatch> {
        let mut body = compress(json)?;
        if let Some(cipher) = &self.cipher {
            body = cipher.encrypt(&body)?;
        }
        let signature = self.sign_body(&body)?;
        Ok(SealedBatch { body, signature })
    }

    /// Signature for `body` when signing is enabled.
    pub fn sign_body(&self, body: &[u8]) -> Result<Option<String>> {
        self.sign_key.as_deref().map(|key| sign(key, body)).transpose()
    }

    /// Reverse [`seal_bytes`](Self::seal_bytes): verify, decrypt, decompress.
    ///
    /// A missing signature is an integrity failure when signing is
    /// configured; a signature sent to an envelope without a key is ignored.
    /// An empty body is returned as-is once verified.
    pub fn unseal(
        &self,
        body: &[u8],
        content_encoding: Option<&str>,
        signature: Option<&str>,
    ) -> Result<Vec<u8>> {
        if let Some(key) = &self.sign_key {
            let signature = signature.ok_or_else(|| {
                MetrixError::Integrity(format!("header {SIGNATURE_HEADER} is required"))
            })?;
            verify(key, body, signature)?;
        }
        if body.is_empty() {
            return Ok(Vec::new());
        }

        let decrypted;
        let body = match &self.cipher {
            Some(cipher) => {
                decrypted = cipher.decrypt(body)?;
                decrypted.as_slice()
            }
            None => body,
        };

        if content_encoding.is_some_and(|enc| enc.contains(GZIP_ENCODING)) {
            decompress(body)
        } else {
            Ok(body.to_vec())
        }
    }

    /// Unseal and decode a batch.
    pub fn open(
        &self,
        body: &[u8],
        content_encoding: Option<&str>,
        signature: Option<&str>,
    ) -> Result<Vec<MetricPayload>> {
        let json = self.unseal(body, content_encoding, signature)?;
        serde_json::from_slice(&json).map_err(|e| MetrixError::Codec(format!("deserialize: {e}")))
    }
}
