//! Persisted document codecs.
//!
//! A generation is persisted as one [`GenerationDocument`] and the deployed state as one
//! [`ActualStateDocument`]. YAML and JSON keep documents human-diffable; MessagePack is the
//! compact binary form. Records are written with field names in every codec so documents stay
//! readable by any of them after a schema change.

use chrono::{DateTime, Utc};
use keel_core::config::CodecKind;
use keel_core::PolicyObject;
use keel_planner::ComponentInstance;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::PolicyData;

/// Everything persisted for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDocument {
    pub data: PolicyData,
    /// Objects in key order.
    pub objects: Vec<PolicyObject>,
}

/// The deployed component instances, as last recorded after a successful action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualStateDocument {
    pub updated_at: DateTime<Utc>,
    /// Instances in key order.
    pub instances: Vec<ComponentInstance>,
}

/// Serialization contract for persisted documents.
pub trait Codec: Send + Sync {
    fn kind(&self) -> CodecKind;

    /// Codec name used in errors and logs.
    fn name(&self) -> &'static str;

    /// File extension, without the dot.
    fn extension(&self) -> &'static str;

    fn encode(&self, doc: &GenerationDocument) -> Result<Vec<u8>, StoreError> {
        write(self.kind(), doc).map_err(|reason| StoreError::Encode {
            codec: self.name(),
            subject: format!("generation {}", doc.data.generation),
            reason,
        })
    }

    fn decode(&self, bytes: &[u8], source_name: &str) -> Result<GenerationDocument, StoreError> {
        read(self.kind(), bytes).map_err(|reason| self.decode_error(source_name, reason))
    }

    fn encode_actual(&self, doc: &ActualStateDocument) -> Result<Vec<u8>, StoreError> {
        write(self.kind(), doc).map_err(|reason| StoreError::Encode {
            codec: self.name(),
            subject: "actual state".to_string(),
            reason,
        })
    }

    fn decode_actual(
        &self,
        bytes: &[u8],
        source_name: &str,
    ) -> Result<ActualStateDocument, StoreError> {
        read(self.kind(), bytes).map_err(|reason| self.decode_error(source_name, reason))
    }

    fn decode_error(&self, source_name: &str, reason: String) -> StoreError {
        StoreError::Decode {
            codec: self.name(),
            source_name: source_name.to_string(),
            reason,
        }
    }
}

fn write<T: Serialize>(kind: CodecKind, value: &T) -> Result<Vec<u8>, String> {
    match kind {
        CodecKind::Json => serde_json::to_vec_pretty(value).map_err(|e| e.to_string()),
        CodecKind::Yaml => serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| e.to_string()),
        CodecKind::Msgpack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
    }
}

fn read<T: DeserializeOwned>(kind: CodecKind, bytes: &[u8]) -> Result<T, String> {
    match kind {
        CodecKind::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        CodecKind::Yaml => serde_yaml::from_slice(bytes).map_err(|e| e.to_string()),
        CodecKind::Msgpack => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
    }
}

/// Pick the codec for a configured kind.
pub fn codec_for(kind: CodecKind) -> Box<dyn Codec> {
    match kind {
        CodecKind::Json => Box::new(JsonCodec),
        CodecKind::Yaml => Box::new(YamlCodec),
        CodecKind::Msgpack => Box::new(MsgPackCodec),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Yaml
    }

    fn name(&self) -> &'static str {
        "yaml"
    }

    fn extension(&self) -> &'static str {
        "yaml"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Msgpack
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn extension(&self) -> &'static str {
        "msgpack"
    }
}
