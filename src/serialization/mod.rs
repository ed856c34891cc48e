//! Turning message objects into bytes and back.
//!
//! A [`Serializer`] is stateless and shared by all the consumers and publishers of a
//! configuration. Two JSON backends ship with the crate, [`SerdeJsonSerializer`] and
//! [`SimdJsonSerializer`]; wrap either in [`Traced`] to get a span around every call.
//!
//! Deserializing an empty body, or a JSON `null`, yields the default value of the target
//! type.
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};

mod json;
mod simd;
mod traced;

pub use json::SerdeJsonSerializer;
pub use simd::SimdJsonSerializer;
pub use traced::Traced;

/// The serializer used when none is configured explicitly.
pub type DefaultSerializer = Traced<SerdeJsonSerializer>;

pub const JSON_CONTENT_TYPE: &str = "application/json";

pub trait Serializer: Send + Sync + 'static {
    /// The MIME type of the bytes produced by [`Serializer::serialize`].
    fn content_type(&self) -> &'static str;

    fn serialize<T>(
        &self,
        properties: &BasicProperties,
        value: &T,
    ) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize + ?Sized;

    fn deserialize<T>(
        &self,
        properties: &BasicProperties,
        body: &[u8],
    ) -> Result<T, SerializationError>
    where
        T: DeserializeOwned + Default;
}

#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("Failed to serialize a message of type `{type_name}`.")]
    Serialize {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to deserialize the message body into `{type_name}`.")]
    Deserialize {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl SerializationError {
    pub(crate) fn serialize<T: ?Sized, E: Into<anyhow::Error>>(source: E) -> Self {
        Self::Serialize {
            type_name: std::any::type_name::<T>(),
            source: source.into(),
        }
    }

    pub(crate) fn deserialize<T, E: Into<anyhow::Error>>(source: E) -> Self {
        Self::Deserialize {
            type_name: std::any::type_name::<T>(),
            source: source.into(),
        }
    }
}

/// Nothing but whitespace.
pub(crate) fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}
