//! Composable serialization between [`CachedResponse`] and storable bytes.
//!
//! A pipeline is an ordered list of [`Stage`]s. Encoding runs them first to
//! last; decoding runs their inverses last to first. Each stage declares the
//! [`PayloadKind`] it consumes and produces, and a pipeline refuses to build
//! when neighbours disagree. That is how the text/binary contract is enforced:
//! a text-producing stage cannot feed a compressor or cipher without an
//! explicit [`Utf8Stage`] or similar in between.
//!
//! ```
//! use std::sync::Arc;
//! use rttp_cache::serializer::{GzipStage, JsonStage, SerializerPipeline, Stage};
//!
//! // JSON text straight into gzip is rejected when the pipeline is built.
//! let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(JsonStage::default()), Arc::new(GzipStage::default())];
//! assert!(SerializerPipeline::new("broken", stages).is_err());
//!
//! let pipeline = SerializerPipeline::compressed();
//! assert_eq!(pipeline.name(), "compressed");
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::cache::CachedResponse;
use crate::error::{CacheError, CacheResult};

mod stages;

pub use stages::{
    Base64Stage, EncryptionStage, GzipStage, JsonStage, SigningStage, StageAdapter, Utf8Stage,
};

/// The shape of data flowing between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Structured,
    Text,
    Binary,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Structured => "structured",
            Self::Text => "text",
            Self::Binary => "binary",
        })
    }
}

/// Data in flight between stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Structured(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Structured(_) => PayloadKind::Structured,
            Self::Text(_) => PayloadKind::Text,
            Self::Binary(_) => PayloadKind::Binary,
        }
    }

    pub fn into_structured(self, stage: &str) -> CacheResult<Value> {
        match self {
            Self::Structured(value) => Ok(value),
            other => Err(unexpected(stage, PayloadKind::Structured, other.kind())),
        }
    }

    pub fn into_text(self, stage: &str) -> CacheResult<String> {
        match self {
            Self::Text(text) => Ok(text),
            other => Err(unexpected(stage, PayloadKind::Text, other.kind())),
        }
    }

    pub fn into_binary(self, stage: &str) -> CacheResult<Vec<u8>> {
        match self {
            Self::Binary(bytes) => Ok(bytes),
            other => Err(unexpected(stage, PayloadKind::Binary, other.kind())),
        }
    }
}

fn unexpected(stage: &str, expected: PayloadKind, got: PayloadKind) -> CacheError {
    CacheError::serialization(stage, format!("expected {expected} payload, got {got}"))
}

/// One reversible transform.
///
/// `decode(encode(x)) == x` must hold for every `x` of kind [`input`](Self::input).
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Kind consumed by `encode` (and produced by `decode`).
    fn input(&self) -> PayloadKind;

    /// Kind produced by `encode` (and consumed by `decode`).
    fn output(&self) -> PayloadKind;

    fn encode(&self, payload: Payload) -> CacheResult<Payload>;

    fn decode(&self, payload: Payload) -> CacheResult<Payload>;
}

/// A validated sequence of stages; itself a [`Stage`], so pipelines nest.
#[derive(Clone)]
pub struct StagePipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl StagePipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Stage>>) -> CacheResult<Self> {
        let name = name.into();
        if stages.is_empty() {
            return Err(CacheError::InvalidPipeline(format!("`{name}` has no stages")));
        }
        for pair in stages.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.output() != next.input() {
                return Err(CacheError::InvalidPipeline(format!(
                    "`{name}`: stage `{}` produces {} but `{}` expects {}",
                    prev.name(),
                    prev.output(),
                    next.name(),
                    next.input()
                )));
            }
        }
        Ok(Self { name, stages })
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

impl Stage for StagePipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> PayloadKind {
        self.stages[0].input()
    }

    fn output(&self) -> PayloadKind {
        self.stages[self.stages.len() - 1].output()
    }

    fn encode(&self, payload: Payload) -> CacheResult<Payload> {
        self.stages
            .iter()
            .try_fold(payload, |payload, stage| stage.encode(payload))
    }

    fn decode(&self, payload: Payload) -> CacheResult<Payload> {
        self.stages
            .iter()
            .rev()
            .try_fold(payload, |payload, stage| stage.decode(payload))
    }
}

impl fmt::Debug for StagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagePipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Converts cached responses to and from the bytes a backend stores.
///
/// The first stage must accept a structured value and the last must produce
/// text or bytes.
#[derive(Debug, Clone)]
pub struct SerializerPipeline {
    inner: StagePipeline,
}

impl SerializerPipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Stage>>) -> CacheResult<Self> {
        let inner = StagePipeline::new(name, stages)?;
        if inner.input() != PayloadKind::Structured {
            return Err(CacheError::InvalidPipeline(format!(
                "`{}` must start from a structured value, not {}",
                inner.name(),
                inner.input()
            )));
        }
        if inner.output() == PayloadKind::Structured {
            return Err(CacheError::InvalidPipeline(format!(
                "`{}` must end in text or binary",
                inner.name()
            )));
        }
        Ok(Self { inner })
    }

    /// Wraps stages whose kinds are known to line up.
    fn preset(name: &str, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            inner: StagePipeline {
                name: name.to_owned(),
                stages,
            },
        }
    }

    /// Plain JSON text.
    pub fn json() -> Self {
        Self::preset("json", vec![Arc::new(JsonStage::default()), Arc::new(Utf8Stage)])
    }

    /// JSON, UTF-8, gzip.
    pub fn compressed() -> Self {
        Self::preset(
            "compressed",
            vec![
                Arc::new(JsonStage::default()),
                Arc::new(Utf8Stage),
                Arc::new(GzipStage::default()),
            ],
        )
    }

    /// JSON, UTF-8, HMAC-SHA256 signature. Tampered entries fail with
    /// [`CacheError::Integrity`].
    pub fn signed(secret: &[u8]) -> Self {
        Self::preset(
            "signed",
            vec![
                Arc::new(JsonStage::default()),
                Arc::new(Utf8Stage),
                Arc::new(SigningStage::new(secret)),
            ],
        )
    }

    /// JSON, UTF-8, gzip, XChaCha20-Poly1305 with a 32-byte key.
    pub fn encrypted(key: &[u8]) -> CacheResult<Self> {
        Self::new(
            "encrypted",
            vec![
                Arc::new(JsonStage::default()),
                Arc::new(Utf8Stage),
                Arc::new(GzipStage::default()),
                Arc::new(EncryptionStage::new(key)?),
            ],
        )
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn dumps(&self, response: &CachedResponse) -> CacheResult<Vec<u8>> {
        let value = serde_json::to_value(response)
            .map_err(|e| CacheError::serialization("structure", e))?;
        match self.inner.encode(Payload::Structured(value))? {
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Binary(bytes) => Ok(bytes),
            Payload::Structured(_) => Err(unexpected(
                self.name(),
                PayloadKind::Binary,
                PayloadKind::Structured,
            )),
        }
    }

    pub fn loads(&self, bytes: &[u8]) -> CacheResult<CachedResponse> {
        let payload = match self.inner.output() {
            PayloadKind::Text => Payload::Text(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| CacheError::serialization(self.name(), e))?,
            ),
            _ => Payload::Binary(bytes.to_vec()),
        };
        let value = self.inner.decode(payload)?.into_structured(self.name())?;
        serde_json::from_value(value).map_err(|e| CacheError::serialization("structure", e))
    }
}

/// Serde helper storing byte fields as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
