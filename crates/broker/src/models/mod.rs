//! Domain models for broker entities
//!
//! Entities reference each other by integer id only. Parent/child and
//! item/collection relations are id-to-id indices resolved through storage.

/// Define an integer entity id newtype with the usual conversions
macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

mod changes;
mod collection;
mod item;
mod relation;
mod tag;

pub use changes::{CollectionChanges, ItemChanges, TagChanges};
pub use collection::{CachePolicy, Collection, CollectionId, CollectionStatistics, SearchSpec};
pub use item::{Item, ItemId, Part, flags, parts};
pub use relation::Relation;
pub use tag::{Tag, TagId};
