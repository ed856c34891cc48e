use super::{is_blank, SerializationError, Serializer, JSON_CONTENT_TYPE};
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};

/// JSON through `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerdeJsonSerializer;

impl Serializer for SerdeJsonSerializer {
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
        serde_json::to_vec(value).map_err(SerializationError::serialize::<T, _>)
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
        serde_json::from_slice::<Option<T>>(body)
            .map(Option::unwrap_or_default)
            .map_err(SerializationError::deserialize::<T, _>)
    }
}
