//! Built-in serializer stages.

use std::io::{self, Read, Write};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{Payload, PayloadKind, Stage};
use crate::error::{CacheError, CacheResult};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 32;

/// Structured value to JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStage {
    pub pretty: bool,
}

impl Stage for JsonStage {
    fn name(&self) -> &str {
        "json"
    }

    fn input(&self) -> PayloadKind {
        PayloadKind::Structured
    }

    fn output(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        let value = payload.into_structured(self.name())?;
        let text = if self.pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        };
        text.map(Payload::Text)
            .map_err(|e| CacheError::serialization(self.name(), e))
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        let text = payload.into_text(self.name())?;
        serde_json::from_str(&text)
            .map(Payload::Structured)
            .map_err(|e| CacheError::serialization(self.name(), e))
    }
}

/// Text to UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Stage;

impl Stage for Utf8Stage {
    fn name(&self) -> &str {
        "utf8"
    }

    fn input(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn output(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        Ok(Payload::Binary(payload.into_text(self.name())?.into_bytes()))
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        let bytes = payload.into_binary(self.name())?;
        String::from_utf8(bytes)
            .map(Payload::Text)
            .map_err(|e| CacheError::serialization(self.name(), e))
    }
}

/// Bytes to standard base64 text, for text-only stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Stage;

impl Stage for Base64Stage {
    fn name(&self) -> &str {
        "base64"
    }

    fn input(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn output(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        Ok(Payload::Text(STANDARD.encode(payload.into_binary(self.name())?)))
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        let text = payload.into_text(self.name())?;
        STANDARD
            .decode(text.trim())
            .map(Payload::Binary)
            .map_err(|e| CacheError::serialization(self.name(), e))
    }
}

/// Gzip compression.
#[derive(Debug, Clone, Copy)]
pub struct GzipStage {
    level: u32,
}

impl GzipStage {
    /// `level` is clamped to 0..=9.
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for GzipStage {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Stage for GzipStage {
    fn name(&self) -> &str {
        "gzip"
    }

    fn input(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn output(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        let bytes = payload.into_binary(self.name())?;
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(bytes.len() / 2),
            Compression::new(self.level),
        );
        encoder
            .write_all(&bytes)
            .map_err(|e| CacheError::serialization(self.name(), e))?;
        encoder
            .finish()
            .map(Payload::Binary)
            .map_err(|e| CacheError::serialization(self.name(), e))
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        let bytes = payload.into_binary(self.name())?;
        let mut out = Vec::with_capacity(bytes.len() * 2);
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| CacheError::serialization(self.name(), e))?;
        Ok(Payload::Binary(out))
    }
}

/// Authenticated encryption with XChaCha20-Poly1305.
///
/// Output layout: 24-byte random nonce, then ciphertext with its tag. A payload
/// that fails to authenticate yields [`CacheError::Integrity`].
#[derive(Clone)]
pub struct EncryptionStage {
    cipher: XChaCha20Poly1305,
}

impl EncryptionStage {
    /// `key` must be exactly 32 bytes.
    pub fn new(key: &[u8]) -> CacheResult<Self> {
        let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| {
            CacheError::InvalidPipeline(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { cipher })
    }

    /// Derives the key as SHA-256 of `passphrase`.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: XChaCha20Poly1305::new(&key),
        }
    }
}

impl Stage for EncryptionStage {
    fn name(&self) -> &str {
        "encrypt"
    }

    fn input(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn output(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        let plaintext = payload.into_binary(self.name())?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| CacheError::serialization(self.name(), e))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(Payload::Binary(out))
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        let bytes = payload.into_binary(self.name())?;
        if bytes.len() < NONCE_LEN {
            return Err(CacheError::integrity(self.name()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Payload::Binary)
            .map_err(|_| CacheError::integrity(self.name()))
    }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signature prefixed to the payload.
#[derive(Clone)]
pub struct SigningStage {
    secret: Vec<u8>,
}

impl SigningStage {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    fn mac(&self) -> CacheResult<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|e| CacheError::serialization("sign", e))
    }
}

impl Stage for SigningStage {
    fn name(&self) -> &str {
        "sign"
    }

    fn input(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn output(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        let bytes = payload.into_binary(self.name())?;
        let mut mac = self.mac()?;
        mac.update(&bytes);
        let tag = mac.finalize().into_bytes();
        let mut out = Vec::with_capacity(TAG_LEN + bytes.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(&bytes);
        Ok(Payload::Binary(out))
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        let bytes = payload.into_binary(self.name())?;
        if bytes.len() < TAG_LEN {
            return Err(CacheError::integrity(self.name()));
        }
        let (tag, body) = bytes.split_at(TAG_LEN);
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| CacheError::integrity(self.name()))?;
        Ok(Payload::Binary(body.to_vec()))
    }
}

type Transform = Arc<dyn Fn(Payload) -> CacheResult<Payload> + Send + Sync>;

/// Wraps a pair of plain functions as a stage.
#[derive(Clone)]
pub struct StageAdapter {
    name: String,
    input: PayloadKind,
    output: PayloadKind,
    encode: Transform,
    decode: Transform,
}

impl StageAdapter {
    pub fn new(
        name: impl Into<String>,
        input: PayloadKind,
        output: PayloadKind,
        encode: impl Fn(Payload) -> CacheResult<Payload> + Send + Sync + 'static,
        decode: impl Fn(Payload) -> CacheResult<Payload> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    /// A bytes-to-bytes stage from a codec such as a third-party compressor.
    pub fn binary<E, D>(name: impl Into<String>, encode: E, decode: D) -> Self
    where
        E: Fn(&[u8]) -> io::Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> io::Result<Vec<u8>> + Send + Sync + 'static,
    {
        let name = name.into();
        let (enc_name, dec_name) = (name.clone(), name.clone());
        Self::new(
            name,
            PayloadKind::Binary,
            PayloadKind::Binary,
            move |payload| {
                let bytes = payload.into_binary(&enc_name)?;
                encode(&bytes)
                    .map(Payload::Binary)
                    .map_err(|e| CacheError::serialization(&enc_name, e))
            },
            move |payload| {
                let bytes = payload.into_binary(&dec_name)?;
                decode(&bytes)
                    .map(Payload::Binary)
                    .map_err(|e| CacheError::serialization(&dec_name, e))
            },
        )
    }
}

impl Stage for StageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> PayloadKind {
        self.input
    }

    fn output(&self) -> PayloadKind {
        self.output
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        (self.encode)(payload)
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        (self.decode)(payload)
    }
}
