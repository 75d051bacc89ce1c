// Library module for blobkeep
// Hash-checked file transfers between the local filesystem and blob storage

pub mod config;
pub mod error;
pub mod fs;
pub mod hash;
pub mod sync;

pub use config::KeepConfig;
pub use error::{KeepError, Result};
pub use fs::{resolve_location, BlobStore, ContainerLocation, RemoteObject, StoreConnector};
pub use hash::{hash_file, ContentHash, LocalFileDescriptor};
pub use sync::{SyncEngine, TransferOutcome, TransferRequest};
