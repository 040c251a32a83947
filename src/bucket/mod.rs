//! Managed bucket lifecycle: one driver per cloud, plus the CloudStorage
//! reconciler that walks the create/retain/delete state machine.
use crate::{apis::cloudstorage_types::CloudStorage, Error};
use async_trait::async_trait;
use kube::Client;

mod aws;
pub mod controller;

pub use aws::{discover_region, S3BucketDriver};

/// Object-store operations a cloud must support before its buckets can be
/// managed. All operations act on the bucket named in the CloudStorage spec.
#[async_trait]
pub trait BucketDriver: Send + Sync {
    /// true when the bucket already exists and is reachable
    async fn exists(&self) -> Result<bool, Error>;
    /// true when a bucket was created by this call
    async fn create(&self) -> Result<bool, Error>;
    /// true when the bucket was removed by this call
    async fn delete(&self) -> Result<bool, Error>;
    /// Region the named bucket lives in, for credential augmentation
    async fn region_of(&self, bucket: &str) -> Result<String, Error>;
}

/// Dispatch on the CloudStorage provider. Only AWS buckets are managed today;
/// the other providers are declared in the CRD but rejected here.
pub async fn driver_for(
    client: Client,
    cloud_storage: &CloudStorage,
) -> Result<Box<dyn BucketDriver>, Error> {
    use crate::apis::cloudstorage_types::CloudStorageProvider::*;
    match cloud_storage.spec.provider {
        Aws => Ok(Box::new(S3BucketDriver::new(client, cloud_storage).await?)),
        Azure | Gcp => Err(Error::ProviderUnsupported(
            cloud_storage.spec.provider.to_string(),
        )),
    }
}
