//! # Message Factory
//!
//! The receiver side of the data path must turn `(type_name, bytes)`
//! into a payload at runtime. Payloads travel as a self-describing
//! structured encoding (JSON), so two paths exist:
//!
//! - **Registered types**: [`MsgFactory::register::<T>`] installs a
//!   [`MessageCodec`] for `T`; decoding validates the document against
//!   `T`'s schema before projecting it back to a field-preserving view.
//! - **Dynamic fallback**: unknown type names decode straight into a
//!   [`DynamicMessage`], which keeps every field by name for JSON
//!   projection (the `topic echo` tool and the bridge live on this path).
//!
//! Registrations happen at process start; the registry is read-heavy
//! afterwards.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// A typed payload. `type_name` is the fully-qualified message type name
/// carried in every frame; it must be stable across processes.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_name() -> &'static str;
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload for type {type_name} is not a valid document: {source}")]
    Malformed {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload does not match schema of registered type {type_name}: {source}")]
    SchemaMismatch {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A decoded payload with all fields preserved by name.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicMessage {
    type_name: String,
    value: serde_json::Value,
}

impl DynamicMessage {
    pub fn new(type_name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The field-preserving JSON projection.
    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Re-view the document as a concrete type.
    pub fn to_typed<T: Message>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.value.clone()).map_err(|source| DecodeError::SchemaMismatch {
            type_name: T::type_name().to_owned(),
            source,
        })
    }
}

/// Decoder seam between the transport and the typed world: one
/// implementation per known message type, held in the factory registry.
pub trait MessageCodec: Send + Sync {
    fn name(&self) -> &str;
    fn decode(&self, bytes: &[u8]) -> Result<DynamicMessage, DecodeError>;
}

struct TypedCodec<T: Message> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Message> MessageCodec for TypedCodec<T> {
    fn name(&self) -> &str {
        T::type_name()
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicMessage, DecodeError> {
        // Validate against the concrete schema, then keep the projection.
        let typed: T = serde_json::from_slice(bytes).map_err(|source| DecodeError::SchemaMismatch {
            type_name: T::type_name().to_owned(),
            source,
        })?;
        let value = serde_json::to_value(&typed).map_err(|source| DecodeError::Malformed {
            type_name: T::type_name().to_owned(),
            source,
        })?;
        Ok(DynamicMessage::new(T::type_name(), value))
    }
}

/// Serialize a typed payload into its wire form.
pub fn encode_message<T: Message>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Registry of known message types with a dynamic fallback.
#[derive(Default)]
pub struct MsgFactory {
    registry: RwLock<HashMap<String, Arc<dyn MessageCodec>>>,
}

impl MsgFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the codec for `T`. Idempotent.
    pub fn register<T: Message>(&self) {
        let codec: Arc<dyn MessageCodec> = Arc::new(TypedCodec::<T> {
            _marker: std::marker::PhantomData,
        });
        self.registry
            .write()
            .unwrap()
            .insert(T::type_name().to_owned(), codec);
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.registry.read().unwrap().contains_key(type_name)
    }

    /// Decode `bytes` as `type_name`. Registered types validate against
    /// their schema; unknown types fall back to the dynamic path.
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<DynamicMessage, DecodeError> {
        let codec = self.registry.read().unwrap().get(type_name).cloned();
        match codec {
            Some(codec) => codec.decode(bytes),
            None => {
                let value: serde_json::Value =
                    serde_json::from_slice(bytes).map_err(|source| DecodeError::Malformed {
                        type_name: type_name.to_owned(),
                        source,
                    })?;
                Ok(DynamicMessage::new(type_name, value))
            }
        }
    }
}
