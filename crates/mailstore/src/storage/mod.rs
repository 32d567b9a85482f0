//! Storage traits and implementations
//!
//! Two layers: a content-addressed [`BlobStore`] holding the bytes, and a
//! [`MetadataStore`] holding the rows that point at them. Each has an
//! in-memory implementation for tests and a durable one for production.

mod blob;
mod blob_file;
mod blob_memory;
mod memory;
mod schema;
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;
mod traits;

pub use blob::{
    BlobCodec, BlobStore, BucketName, ByteStream, StoragePolicy, chunked_stream, once_stream,
};
pub use blob_file::FileBlobStore;
pub use blob_memory::InMemoryBlobStore;
pub use memory::InMemoryMetadataStore;
pub use sqlite::{DEFAULT_PAGE_SIZE, SqliteMetadataStore};
pub use traits::{MessageRow, MetadataStore};
