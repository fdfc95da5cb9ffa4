//! Identifier newtypes.
//!
//! Storage and segment ids are allocated by providers and opaque everywhere
//! else. Collection ids are UUID-like strings minted by the IOV backend.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::archive::{InputArchive, Load, LoadError, OutputArchive, Save};

macro_rules! numeric_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn value(self) -> u64 {
                self.0
            }

            /// The next id in allocation order.
            pub const fn next(self) -> $name {
                $name(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(s.parse()?))
            }
        }

        impl Save for $name {
            fn save(&self, oa: &mut OutputArchive) {
                self.0.save(oa);
            }
        }

        impl Load for $name {
            fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
                Ok($name(u64::load(ia)?))
            }
        }
    };
}

numeric_id! {
    /// Identifies a storage within one provider. Stable for the storage's
    /// lifetime.
    StorageId
}

numeric_id! {
    /// Identifies a segment within one storage. Monotonically allocated,
    /// never reused.
    SegmentId
}

// ── CollectionId ──────────────────────────────────────────────────────────────

/// Identifies an IOV collection: a UUID-like random hex string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(uuid: impl Into<String>) -> CollectionId {
        CollectionId(uuid.into())
    }

    /// Mint a fresh random id in 8-4-4-4-12 hex form.
    pub fn random() -> CollectionId {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 16] = rng.gen();
        let hex = hex::encode(bytes);
        CollectionId(format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CollectionId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CollectionId(s.to_owned()))
    }
}

impl Save for CollectionId {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.save(oa);
    }
}

impl Load for CollectionId {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(CollectionId(String::load(ia)?))
    }
}
