// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Value codecs used by the typed region facade.

use std::fmt::{self, Display};
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Converts typed values to and from the bytes a strategy stores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// JSON text, readable by clients written in any language.
    #[default]
    Json,
    /// Compact binary encoding.
    Binary,
}

impl Codec {
    /// Configuration name of the codec.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Binary => "binary",
        }
    }

    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] when the value cannot be encoded.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        match self {
            Self::Json => serde_json::to_vec(value).map(Bytes::from).map_err(Error::serialization),
            Self::Binary => bincode::serialize(value).map(Bytes::from).map_err(Error::serialization),
        }
    }

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] when `bytes` do not hold a `T`.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(Error::serialization),
            Self::Binary => bincode::deserialize(bytes).map_err(Error::serialization),
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        [Self::Json, Self::Binary]
            .into_iter()
            .find(|codec| codec.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::configuration(format!("unknown serializer `{name}`")))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        lines: Vec<String>,
    }

    #[rstest]
    #[case(Codec::Json)]
    #[case(Codec::Binary)]
    fn typed_values_survive_encoding(#[case] codec: Codec) {
        let order = Order {
            id: 42,
            lines: vec!["book".to_owned()],
        };

        let decoded: Order = codec.decode(&codec.encode(&order).expect("encode")).expect("decode");

        assert_eq!(decoded, order);
    }

    #[test]
    fn json_is_text() {
        let bytes = Codec::Json.encode(&"hello").expect("encode");
        assert_eq!(&bytes[..], b"\"hello\"");
    }

    #[test]
    fn wrong_shape_is_a_serialization_error() {
        let error = Codec::Json.decode::<Order>(b"[1,2,3]").expect_err("not an order");
        assert!(matches!(error, Error::Serialization(_)));
    }

    #[test]
    fn parses_names() {
        assert_eq!("JSON".parse::<Codec>().expect("known"), Codec::Json);
        assert_eq!("binary".parse::<Codec>().expect("known"), Codec::Binary);
        assert!(matches!("xml".parse::<Codec>(), Err(Error::Configuration(_))));
    }
}
