// Content hashing for sync decisions
// MD5 digests and local file descriptors

pub mod digest;

pub use digest::{
    hash_file, hash_file_async, hash_file_chunked, ContentHash, LocalFileDescriptor,
    StreamingHash, HASH_CHUNK_SIZE,
};
