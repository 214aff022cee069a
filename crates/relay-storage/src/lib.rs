//! Destinations of finished recordings.
//!
//! An [`ObjectStore`] keeps the archival file and hands out a public URL for
//! it; a [`MetadataStore`] records that URL against the session. Both come in
//! a local flavor used by the server binary and an in-memory flavor used by
//! tests.

mod error;
pub mod memory;
mod metadata;
mod object;

pub use error::StorageError;
pub use metadata::{JsonFileMetadataStore, MetadataRecord, MetadataStore};
pub use object::{archival_object_key, LocalObjectStore, ObjectRef, ObjectStore};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
