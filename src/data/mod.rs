//! Data module: parts, buckets and the entity registry.

pub mod bucket;
pub mod meta;
pub mod registry;
pub mod selector;

pub use bucket::{Bucket, BucketLocation, BucketRepository, FieldDataObserver};
pub use meta::{MetaData, Part, PartOrdinal};
pub use registry::EntityRegistry;
pub use selector::Selector;
