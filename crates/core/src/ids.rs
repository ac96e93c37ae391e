#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Byte length shared by every identifier type.
pub const ID_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier must be 16 bytes, got {0}")]
    InvalidLength(usize),
    #[error("identifier text must be 32 hex characters, got {0}")]
    InvalidTextLength(usize),
    #[error("identifier contains a non-hex character")]
    InvalidHex,
}

fn parse_slice(bytes: &[u8]) -> Result<[u8; ID_LEN], IdError> {
    if bytes.is_empty() {
        return Err(IdError::Empty);
    }
    <[u8; ID_LEN]>::try_from(bytes).map_err(|_| IdError::InvalidLength(bytes.len()))
}

fn parse_hex(value: &str) -> Result<[u8; ID_LEN], IdError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IdError::Empty);
    }
    if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IdError::InvalidHex);
    }
    if trimmed.len() != ID_LEN * 2 {
        return Err(IdError::InvalidTextLength(trimmed.len()));
    }
    let mut out = [0u8; ID_LEN];
    hex::decode_to_slice(trimmed, &mut out).map_err(|_| IdError::InvalidHex)?;
    Ok(out)
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            pub fn try_from_slice(bytes: &[u8]) -> Result<Self, IdError> {
                parse_slice(bytes).map(Self)
            }

            /// Fresh random identifier.
            pub fn generate() -> Self {
                Self(*uuid::Uuid::new_v4().as_bytes())
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                parse_hex(value).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// Identifies a tagset (a named, versioned collection of tag definitions).
    TagsetId
);
define_id!(TagDefinitionId);
define_id!(PropertyDefinitionId);
define_id!(
    /// Identifies a markup collection.
    CollectionId
);
define_id!(DocumentId);
define_id!(TagInstanceId);
