//! Build and job identifiers.

use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize};
use std::num::ParseIntError;
use std::str::FromStr;

/// Wire form of an identifier. Producers send ids both as JSON numbers and
/// as decimal strings, and store list entries are always strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Num(u64),
    Str(String),
}

impl IdRepr {
    fn into_u64(self) -> Result<u64, String> {
        match self {
            IdRepr::Num(n) => Ok(n),
            IdRepr::Str(s) => s
                .trim()
                .parse()
                .map_err(|e: ParseIntError| format!("invalid id {s:?}: {e}")),
        }
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display)]
        #[display("{_0}")]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                IdRepr::deserialize(deserializer)?
                    .into_u64()
                    .map(Self)
                    .map_err(serde::de::Error::custom)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.trim().parse()?))
            }
        }
    };
}

numeric_id!(
    /// Identifier of one build (one execution attempt of a job).
    ///
    /// Build ids are handed out in submission order, so numeric order is
    /// chronological order. Waiting queues rely on this.
    BuildId
);

numeric_id!(
    /// Identifier of a job (a logical pipeline stage).
    JobId
);
