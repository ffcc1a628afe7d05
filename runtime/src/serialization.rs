//! Serialization registry (spec §4.3).
//!
//! Messages cross the wire boundary as `(type_name, content_type, bytes)`.
//! A codec is registered per `(type_name, content_type)` pair; looking up
//! an unregistered pair on deserialize yields [`UnknownPayload`] rather
//! than failing, so a host can forward messages whose schema it does not
//! know (spec §4.3, §9 "message union across application-defined types").

use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RuntimeError};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Wire form of a message: a logical type name, a media type, and the
/// encoded bytes. `type_name` is the value's declared logical type, not a
/// language-level identifier — it is what lets a remote peer without the
/// Rust type still route and forward the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    pub type_name: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// Deserialization result for a `(type_name, content_type)` pair with no
/// registered codec. Carries the raw payload through so the runtime can
/// still route (e.g. forward to a distributed peer) without understanding
/// the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPayload {
    pub type_name: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// Any value flowing through the registry is boxed behind this object-safe
/// wrapper so the registry can hold heterogeneous codecs in one map.
pub trait MessageCodec: Send + Sync {
    fn type_name(&self) -> &str;
    fn content_type(&self) -> &str;
    fn serialize(&self, value: &dyn Any) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>>;
}

/// Record/JSON codec: canonical JSON round-trip for a `Serialize +
/// DeserializeOwned` record type. Discriminated unions are supported
/// because `serde`'s `#[serde(tag = "...")]` enums deserialize through the
/// same `DeserializeOwned` bound; a union with no discriminator simply
/// won't implement `DeserializeOwned` unambiguously and is rejected by the
/// type system rather than at registration, which is the Rust-idiomatic
/// analogue of the spec's registration-time rejection.
pub struct JsonCodec<T> {
    type_name: String,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn serialize(&self, value: &dyn Any) -> Result<Vec<u8>> {
        let typed = value
            .downcast_ref::<T>()
            .ok_or_else(|| RuntimeError::Serialization("value type mismatch".into()))?;
        serde_json::to_vec(typed).map_err(Into::into)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
        let value: T = serde_json::from_slice(bytes)?;
        Ok(Box::new(value))
    }
}

/// Binary framed codec: unpacks a wrapper `{type_url, payload}` envelope
/// carrying an opaque, pre-defined binary schema (spec §4.3). The payload
/// itself is handed back untouched; the framing is only responsible for
/// the type_url wrapper.
pub struct BinaryFramedCodec {
    type_name: String,
    type_url: String,
}

impl BinaryFramedCodec {
    pub fn new(type_name: impl Into<String>, type_url: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            type_url: type_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedBinary {
    pub type_url: String,
    pub payload: Vec<u8>,
}

impl MessageCodec for BinaryFramedCodec {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn content_type(&self) -> &str {
        PROTOBUF_CONTENT_TYPE
    }

    fn serialize(&self, value: &dyn Any) -> Result<Vec<u8>> {
        let framed = value
            .downcast_ref::<FramedBinary>()
            .ok_or_else(|| RuntimeError::Serialization("value type mismatch".into()))?;
        let mut out = Vec::with_capacity(2 + self.type_url.len() + framed.payload.len());
        out.extend_from_slice(&(self.type_url.len() as u16).to_be_bytes());
        out.extend_from_slice(self.type_url.as_bytes());
        out.extend_from_slice(&framed.payload);
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
        if bytes.len() < 2 {
            return Err(RuntimeError::Serialization("truncated frame header".into()));
        }
        let url_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + url_len {
            return Err(RuntimeError::Serialization("truncated type url".into()));
        }
        let type_url = String::from_utf8(bytes[2..2 + url_len].to_vec())
            .map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        let payload = bytes[2 + url_len..].to_vec();
        Ok(Box::new(FramedBinary { type_url, payload }))
    }
}

/// Registry keyed by `(type_name, content_type)`. Adding the same key twice
/// replaces the prior codec.
#[derive(Default)]
pub struct SerializationRegistry {
    codecs: RwLock<HashMap<(String, String), Box<dyn MessageCodec>>>,
}

impl SerializationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, codec: Box<dyn MessageCodec>) {
        let key = (codec.type_name().to_string(), codec.content_type().to_string());
        self.codecs.write().unwrap().insert(key, codec);
    }

    pub fn is_registered(&self, type_name: &str, content_type: &str) -> bool {
        self.codecs
            .read()
            .unwrap()
            .contains_key(&(type_name.to_string(), content_type.to_string()))
    }

    pub fn serialize(&self, type_name: &str, content_type: &str, value: &dyn Any) -> Result<SerializedMessage> {
        let codecs = self.codecs.read().unwrap();
        let codec = codecs
            .get(&(type_name.to_string(), content_type.to_string()))
            .ok_or_else(|| {
                RuntimeError::Serialization(format!("unknown type {type_name} with content type {content_type}"))
            })?;
        Ok(SerializedMessage {
            type_name: type_name.to_string(),
            content_type: content_type.to_string(),
            payload: codec.serialize(value)?,
        })
    }

    /// Returns `Ok(Box<dyn Any>)` wrapping the typed value on a registered
    /// pair, or `Ok` of an [`UnknownPayload`] marker (never `Err`) when the
    /// pair has no codec — deserialization of an unknown type is not a
    /// failure, it is forwarding.
    pub fn deserialize(
        &self,
        type_name: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<DeserializedValue> {
        let codecs = self.codecs.read().unwrap();
        match codecs.get(&(type_name.to_string(), content_type.to_string())) {
            Some(codec) => Ok(DeserializedValue::Known(codec.deserialize(payload)?)),
            None => Ok(DeserializedValue::Unknown(UnknownPayload {
                type_name: type_name.to_string(),
                content_type: content_type.to_string(),
                payload: payload.to_vec(),
            })),
        }
    }
}

pub enum DeserializedValue {
    Known(Box<dyn Any + Send>),
    Unknown(UnknownPayload),
}

impl DeserializedValue {
    pub fn downcast<T: 'static>(self) -> std::result::Result<T, Self> {
        match self {
            DeserializedValue::Known(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(boxed) => Err(DeserializedValue::Known(boxed)),
            },
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    struct Greeting {
        text: String,
    }

    #[test]
    fn json_codec_round_trips() {
        let registry = SerializationRegistry::new();
        registry.register(Box::new(JsonCodec::<Greeting>::new("Greeting")));

        let original = Greeting {
            text: "hi".to_string(),
        };
        let wire = registry
            .serialize("Greeting", JSON_CONTENT_TYPE, &original)
            .unwrap();
        let value = registry
            .deserialize(&wire.type_name, &wire.content_type, &wire.payload)
            .unwrap()
            .downcast::<Greeting>()
            .ok()
            .unwrap();
        assert_eq!(value, original);
    }

    #[test]
    fn unregistered_pair_deserializes_to_unknown_payload() {
        let registry = SerializationRegistry::new();
        let value = registry
            .deserialize("Mystery", JSON_CONTENT_TYPE, b"{}")
            .unwrap();
        match value {
            DeserializedValue::Unknown(payload) => assert_eq!(payload.type_name, "Mystery"),
            DeserializedValue::Known(_) => panic!("expected unknown payload"),
        }
    }

    #[test]
    fn unregistered_pair_fails_to_serialize() {
        let registry = SerializationRegistry::new();
        let err = registry
            .serialize("Mystery", JSON_CONTENT_TYPE, &Greeting { text: "x".into() })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Serialization(_)));
    }

    #[test]
    fn registering_same_key_twice_replaces_prior_codec() {
        let registry = SerializationRegistry::new();
        registry.register(Box::new(JsonCodec::<Greeting>::new("Greeting")));
        registry.register(Box::new(JsonCodec::<Greeting>::new("Greeting")));
        assert!(registry.is_registered("Greeting", JSON_CONTENT_TYPE));
    }

    #[test]
    fn binary_framed_codec_round_trips() {
        let registry = SerializationRegistry::new();
        registry.register(Box::new(BinaryFramedCodec::new("Blob", "type.googleapis.com/blob")));
        let original = FramedBinary {
            type_url: "type.googleapis.com/blob".to_string(),
            payload: vec![1, 2, 3],
        };
        let wire = registry
            .serialize("Blob", PROTOBUF_CONTENT_TYPE, &original)
            .unwrap();
        let value = registry
            .deserialize(&wire.type_name, &wire.content_type, &wire.payload)
            .unwrap()
            .downcast::<FramedBinary>()
            .ok()
            .unwrap();
        assert_eq!(value, original);
    }
}
