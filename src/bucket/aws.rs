//! S3 driver. Credentials come from the CloudStorage creation secret, parsed
//! from the AWS profile dialect, never from the pod environment.
use super::BucketDriver;
use crate::{
    apis::cloudstorage_types::CloudStorage,
    credentials::{self, CredentialSource, AWS_DEFAULT_PROFILE},
    Error,
};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    error::DisplayErrorContext,
    types::{
        BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier, Tag,
        Tagging,
    },
};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";

/// The legacy GetBucketLocation API reports us-east-1 as an empty constraint
fn constraint_region(constraint: Option<&BucketLocationConstraint>) -> String {
    constraint
        .map(|c| c.as_str().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// Region lookup through the ambient credential chain, for inline locations
/// that carry no creation secret
pub async fn discover_region(bucket: &str) -> Result<String, Error> {
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let s3 = aws_sdk_s3::Client::new(&config);
    let location = s3
        .get_bucket_location()
        .bucket(bucket)
        .send()
        .await
        .map_err(|e| Error::BucketError(DisplayErrorContext(e).to_string()))?;
    Ok(constraint_region(location.location_constraint()))
}

pub struct S3BucketDriver {
    s3: aws_sdk_s3::Client,
    bucket: String,
    region: String,
    tags: BTreeMap<String, String>,
}

impl S3BucketDriver {
    pub async fn new(client: Client, cloud_storage: &CloudStorage) -> Result<Self, Error> {
        let namespace = cloud_storage.namespace().unwrap_or_default();
        let selector = &cloud_storage.spec.creation_secret;
        let source = CredentialSource {
            name: selector.name.clone().unwrap_or_default(),
            key: selector.key.clone(),
        };
        let body = credentials::get_secret_data(client, &namespace, &source).await?;
        let creds = credentials::parse_aws_credentials(&body, AWS_DEFAULT_PROFILE)?;
        if creds.short_lived {
            return Err(Error::ProviderMisconfig(format!(
                "creation secret {} holds short-lived credentials, a static key pair is required",
                source.name
            )));
        }

        let region = cloud_storage
            .spec
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(Credentials::new(
                creds.access_key_id,
                creds.secret_access_key,
                None,
                None,
                "cloudstorage-creation-secret",
            ))
            .build();
        Ok(Self {
            s3: aws_sdk_s3::Client::from_conf(config),
            bucket: cloud_storage.spec.name.clone(),
            region,
            tags: cloud_storage.spec.tags.clone().unwrap_or_default(),
        })
    }

    async fn apply_tags(&self) -> Result<(), Error> {
        if self.tags.is_empty() {
            return Ok(());
        }
        let tags = self
            .tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::BucketError(e.to_string()))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tags))
            .build()
            .map_err(|e| Error::BucketError(e.to_string()))?;
        self.s3
            .put_bucket_tagging()
            .bucket(&self.bucket)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| Error::BucketError(DisplayErrorContext(e).to_string()))?;
        Ok(())
    }

    /// S3 buckets must be empty before DeleteBucket succeeds
    async fn empty_bucket(&self) -> Result<(), Error> {
        let mut continuation: Option<String> = None;
        loop {
            let listing = self
                .s3
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Error::BucketError(DisplayErrorContext(e).to_string()))?;
            let keys: Vec<ObjectIdentifier> = listing
                .contents()
                .iter()
                .filter_map(|o| o.key().map(String::from))
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<_, _>>()
                .map_err(|e| Error::BucketError(e.to_string()))?;
            if !keys.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(keys))
                    .build()
                    .map_err(|e| Error::BucketError(e.to_string()))?;
                self.s3
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| Error::BucketError(DisplayErrorContext(e).to_string()))?;
            }
            match listing.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl BucketDriver for S3BucketDriver {
    async fn exists(&self) -> Result<bool, Error> {
        match self.s3.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()) == Some(true) {
                    Ok(false)
                } else {
                    Err(Error::BucketError(DisplayErrorContext(e).to_string()))
                }
            }
        }
    }

    async fn create(&self) -> Result<bool, Error> {
        let mut request = self.s3.create_bucket().bucket(&self.bucket);
        // us-east-1 is the one region that rejects an explicit constraint
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => {
                debug!("created bucket {}", self.bucket);
                self.apply_tags().await?;
                Ok(true)
            }
            Err(e) => {
                let already_ours = e
                    .as_service_error()
                    .map(|se| se.is_bucket_already_owned_by_you())
                    == Some(true);
                if already_ours {
                    Ok(false)
                } else {
                    Err(Error::BucketError(DisplayErrorContext(e).to_string()))
                }
            }
        }
    }

    async fn delete(&self) -> Result<bool, Error> {
        self.empty_bucket().await?;
        match self.s3.delete_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!("deleted bucket {}", self.bucket);
                Ok(true)
            }
            Err(e) => {
                // a bucket that is already gone counts as deleted
                let not_found = e
                    .raw_response()
                    .map(|r| r.status().as_u16() == 404)
                    .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(Error::BucketError(DisplayErrorContext(e).to_string()))
                }
            }
        }
    }

    async fn region_of(&self, bucket: &str) -> Result<String, Error> {
        let location = self
            .s3
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| Error::BucketError(DisplayErrorContext(e).to_string()))?;
        Ok(constraint_region(location.location_constraint()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_location_constraint_means_us_east_1() {
        assert_eq!(constraint_region(None), "us-east-1");
        assert_eq!(
            constraint_region(Some(&BucketLocationConstraint::from("eu-west-1"))),
            "eu-west-1"
        );
        assert_eq!(
            constraint_region(Some(&BucketLocationConstraint::from(""))),
            "us-east-1"
        );
    }
}
