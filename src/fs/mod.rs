pub mod azure;
pub mod backend;
pub mod location;
pub mod media;

pub use azure::{export_managed_identity, AzureBlobFs, AzureConnector};
pub use backend::{BlobStore, RemoteObject, StoreConnector};
pub use location::{resolve_location, ContainerLocation};
pub use media::media_type;
