use super::MessageError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// A value that can travel as the payload of a [`Message`](super::Message).
///
/// The tag names the type on the wire so that a receiver asking for the wrong
/// type gets a [`MessageError::TypeMismatch`] instead of garbage. Tags must be
/// unique among the types a simulation exchanges.
///
/// ```
/// use netsim_core::Datum;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Election {
///     candidate: i32,
/// }
///
/// impl Datum for Election {
///     const TAG: &'static str = "bully::Election";
/// }
/// ```
pub trait Datum: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The name of the type on the wire.
    const TAG: &'static str;
}

macro_rules! datum {
    ($($ty:ty => $tag:literal),* $(,)?) => {
        $(
            impl Datum for $ty {
                const TAG: &'static str = $tag;
            }
        )*
    };
}

datum! {
    () => "unit",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    String => "string",
    Vec<u8> => "bytes",
}

/// A type-tagged, already serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload {
    tag: String,
    body: Vec<u8>,
}

impl Payload {
    /// Serializes `data` into a payload.
    ///
    /// # Panics
    ///
    /// Panics if the `Serialize` implementation of `T` fails. The built-in
    /// codec can represent every derived implementation, so a failure here is
    /// a bug in a hand-written `Serialize` impl.
    pub fn new<T: Datum>(data: &T) -> Self {
        let body = match bincode::serialize(data) {
            Ok(body) => body,
            Err(e) => panic!("A {} payload could not be serialized: {}", T::TAG, e),
        };
        Self {
            tag: T::TAG.to_string(),
            body,
        }
    }

    /// The type tag of the payload.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The number of serialized bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Whether the payload holds a `T`.
    pub fn is<T: Datum>(&self) -> bool {
        self.tag == T::TAG
    }

    /// Deserializes the payload as a `T`.
    pub fn decode<T: Datum>(&self) -> Result<T, MessageError> {
        if !self.is::<T>() {
            return Err(MessageError::TypeMismatch {
                expected: T::TAG,
                found: self.tag.clone(),
            });
        }
        Ok(bincode::deserialize(&self.body)?)
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<{}, {} bytes>", self.tag, self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_checks_the_tag() {
        let payload = Payload::new(&"hello".to_string());
        assert!(payload.is::<String>());
        assert_eq!(payload.decode::<String>().unwrap(), "hello");

        match payload.decode::<i32>() {
            Err(MessageError::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "i32");
                assert_eq!(found, "string");
            }
            other => panic!("Expected a type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn same_shape_different_tag() {
        // u32 and i32 have the same encoding; only the tag tells them apart
        let payload = Payload::new(&7u32);
        assert!(payload.decode::<i32>().is_err());
        assert_eq!(payload.decode::<u32>().unwrap(), 7);
    }
}
