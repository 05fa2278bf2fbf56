//! Record identifiers.
//!
//! Builds, tasks, sites and users are keyed by database sequence numbers.
//! Each gets its own newtype so a build id can never be passed where a
//! site id is expected.

use derive_more::Display;
use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the underlying sequence value.
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

numeric_id!(
    /// Identifier of a site build.
    BuildId
);
numeric_id!(
    /// Identifier of a named build task.
    BuildTaskId
);
numeric_id!(
    /// Identifier of a site.
    SiteId
);
numeric_id!(
    /// Identifier of a user.
    UserId
);
