use super::{is_blank, SerializationError, Serializer, JSON_CONTENT_TYPE};
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};

/// JSON through `simd-json`.
///
/// The parser works in place, so the body is copied before parsing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimdJsonSerializer;

impl Serializer for SimdJsonSerializer {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn serialize<T>(
        &self,
        _properties: &BasicProperties,
        value: &T,
    ) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize + ?Sized,
    {
        simd_json::serde::to_vec(value).map_err(SerializationError::serialize::<T, _>)
    }

    fn deserialize<T>(
        &self,
        _properties: &BasicProperties,
        body: &[u8],
    ) -> Result<T, SerializationError>
    where
        T: DeserializeOwned + Default,
    {
        if is_blank(body) {
            return Ok(T::default());
        }
        let mut buffer = body.to_vec();
        simd_json::serde::from_slice::<Option<T>>(&mut buffer)
            .map(Option::unwrap_or_default)
            .map_err(SerializationError::deserialize::<T, _>)
    }
}
