use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::borrow::{Borrow, Cow};

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if the header is missing or not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }

    /// The `reply-to` address, if present and non-empty.
    fn reply_to_str(&self) -> Option<&str>;

    /// The `correlation-id`, if present.
    fn correlation_id_str(&self) -> Option<&str>;

    /// The `message-id`, if present.
    fn message_id_str(&self) -> Option<&str>;
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }

    fn reply_to_str(&self) -> Option<&str> {
        self.reply_to()
            .as_ref()
            .map(ShortString::as_str)
            .filter(|reply_to| !reply_to.trim().is_empty())
    }

    fn correlation_id_str(&self) -> Option<&str> {
        self.correlation_id().as_ref().map(ShortString::as_str)
    }

    fn message_id_str(&self) -> Option<&str> {
        self.message_id().as_ref().map(ShortString::as_str)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// `lapin` does not give mutable access to the headers of a [`BasicProperties`]: the
/// header table is cloned, updated and put back. `properties` is consumed so that the
/// caller cannot keep using the stale copy.
///
/// # Example
///
/// ```rust
/// use carrot_dispatch::amqp::types::{AMQPValue, ShortString};
/// use carrot_dispatch::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = set_header(
///     BasicProperties::default(),
///     "TenantId",
///     AMQPValue::LongString("acme".into()),
/// );
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let name: ShortString = "TenantId".into();
/// assert_eq!(&AMQPValue::LongString("acme".into()), headers.get(&name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = ensure_headers(&properties);
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}

/// Set a string header, encoded as an AMQP long string.
pub fn set_header_str(
    properties: BasicProperties,
    header_name: &str,
    value: &str,
) -> BasicProperties {
    set_header(properties, header_name, AMQPValue::LongString(value.into()))
}

/// A copy of the header table of `properties`, or an empty table if it has none.
pub(crate) fn ensure_headers(properties: &BasicProperties) -> FieldTable {
    properties.headers().clone().unwrap_or_default()
}
