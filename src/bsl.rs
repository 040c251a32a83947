//! Backup-location reconciler. Materializes each DPA backup-location entry
//! into a BackupStorageLocation child, wires credentials, and sweeps orphans.
use crate::{
    apis::{
        cloudstorage_types::CloudStorage,
        dpa_types::{BackupLocation, CloudStorageLocation, DataProtectionApplication},
        velero_types::{BackupStorageLocation, BackupStorageLocationSpec, ObjectStorageLocation},
    },
    builders::management_labels,
    bucket,
    controller::Context,
    credentials::{self, CredentialSource, AWS_DEFAULT_PROFILE},
    Error, DPA_NAME_LABEL, MANAGED_BY_LABEL, OPERATOR_NAME,
};
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder},
    Resource, ResourceExt,
};
use std::collections::BTreeSet;
use tracing::debug;

/// A backup-location entry with the managed-bucket indirection already
/// resolved away
pub struct ResolvedBackupLocation {
    pub child_name: String,
    pub spec: BackupStorageLocationSpec,
    /// Provider with any `velero.io/` prefix stripped
    pub provider: String,
    pub credential: Option<CredentialSource>,
    /// Present when the entry referenced a managed bucket
    pub cloud_storage: Option<CloudStorage>,
}

impl ResolvedBackupLocation {
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.spec
            .config
            .as_ref()
            .and_then(|c| c.get(key))
            .map(String::as_str)
    }
}

pub fn child_name(dpa_name: &str, entry: &BackupLocation, index: usize) -> String {
    entry
        .name
        .clone()
        .unwrap_or_else(|| format!("{dpa_name}-{}", index + 1))
}

/// Spec for a managed-bucket entry: bucket identity comes from the
/// CloudStorage, everything else from the DPA entry.
fn bucket_backed_spec(
    cloud_storage: &CloudStorage,
    location: &CloudStorageLocation,
) -> BackupStorageLocationSpec {
    let mut config = location.config.clone().unwrap_or_default();
    if cloud_storage.spec.enable_shared_config == Some(true) {
        config.insert("enableSharedConfig".to_string(), "true".to_string());
    }
    if let Some(region) = cloud_storage.spec.region.as_ref() {
        config.entry("region".to_string()).or_insert_with(|| region.clone());
    }
    BackupStorageLocationSpec {
        provider: cloud_storage.spec.provider.to_string(),
        object_storage: Some(ObjectStorageLocation {
            bucket: cloud_storage.spec.name.clone(),
            prefix: location.prefix.clone(),
            ca_cert: location.ca_cert.clone(),
        }),
        config: (!config.is_empty()).then_some(config),
        credential: location.credential.clone(),
        default: location.default,
        access_mode: None,
        backup_sync_period: location.backup_sync_period.clone(),
    }
}

fn validate_entry(
    dpa: &DataProtectionApplication,
    name: &str,
    spec: &BackupStorageLocationSpec,
    provider: &str,
) -> Result<(), Error> {
    let prefix = spec
        .object_storage
        .as_ref()
        .and_then(|os| os.prefix.as_deref())
        .unwrap_or_default();
    if dpa.backup_images() && prefix.is_empty() {
        return Err(Error::InvalidErr(format!(
            "backupLocation {name} must have a prefix when backupImages is not disabled"
        )));
    }
    if provider == "aws" {
        let config = spec.config.clone().unwrap_or_default();
        let path_style = config
            .get("s3ForcePathStyle")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if path_style && !config.contains_key("region") {
            return Err(Error::InvalidErr(format!(
                "backupLocation {name} sets s3ForcePathStyle, the region can not be discovered and must be set"
            )));
        }
    }
    Ok(())
}

/// Parse the referenced secret with the provider's dialect so credential
/// problems surface at validation time, not inside the backup server.
async fn check_secret(
    ctx: &Context,
    namespace: &str,
    provider: &str,
    source: &CredentialSource,
    profile: &str,
) -> Result<(), Error> {
    let body = credentials::get_secret_data(ctx.client.clone(), namespace, source).await?;
    match provider {
        "aws" => {
            credentials::parse_aws_credentials(&body, profile)?;
        }
        "azure" => {
            // the azure dialect tolerates any well-formed key set
            credentials::parse_azure_credentials(&body);
        }
        _ => {}
    }
    Ok(())
}

pub async fn resolve_locations(
    dpa: &DataProtectionApplication,
    ctx: &Context,
) -> Result<Vec<ResolvedBackupLocation>, Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let name = dpa.name_any();
    let cloud_storage_api: Api<CloudStorage> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut resolved = Vec::with_capacity(dpa.spec.backup_locations.len());
    for (index, entry) in dpa.spec.backup_locations.iter().enumerate() {
        let child = child_name(&name, entry, index);
        let (spec, cloud_storage) = match (&entry.velero, &entry.bucket) {
            (Some(inline), None) => (inline.clone(), None),
            (None, Some(bucket)) => {
                let cs = cloud_storage_api
                    .get(&bucket.cloud_storage_ref.name)
                    .await
                    .map_err(Error::KubeError)?;
                (bucket_backed_spec(&cs, bucket), Some(cs))
            }
            _ => {
                return Err(Error::InvalidErr(format!(
                    "backupLocation {child} must set exactly one of velero or bucket"
                )))
            }
        };
        let provider = credentials::strip_provider_prefix(&spec.provider).to_string();
        validate_entry(dpa, &child, &spec, &provider)?;

        let mut credential = credentials::resolve_location_credential(entry);
        if credential.is_none() && cloud_storage.is_some() {
            // managed buckets without a declared credential still get the
            // provider-default secret wired and labelled
            credential = credentials::provider_default_credential(&provider);
        }
        if let Some(source) = credential.as_ref() {
            let profile = spec
                .config
                .as_ref()
                .and_then(|c| c.get("profile"))
                .map(String::as_str)
                .unwrap_or(AWS_DEFAULT_PROFILE);
            check_secret(ctx, &namespace, &provider, source, profile).await?;
        }

        resolved.push(ResolvedBackupLocation {
            child_name: child,
            spec,
            provider,
            credential,
            cloud_storage,
        });
    }
    Ok(resolved)
}

fn desired_child(
    dpa: &DataProtectionApplication,
    location: &ResolvedBackupLocation,
) -> BackupStorageLocation {
    BackupStorageLocation {
        metadata: ObjectMeta {
            name: Some(location.child_name.clone()),
            namespace: dpa.namespace(),
            labels: Some(management_labels(&dpa.name_any())),
            owner_references: dpa.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: location.spec.clone(),
        status: None,
    }
}

async fn patch_short_lived_credentials(
    ctx: &Context,
    namespace: &str,
    location: &ResolvedBackupLocation,
) -> Result<bool, Error> {
    let Some(source) = location.credential.as_ref() else {
        return Ok(false);
    };
    let profile = location.config_value("profile").unwrap_or(AWS_DEFAULT_PROFILE);
    let mut region_hint = location.config_value("region").map(String::from);
    if region_hint.is_none() && location.provider == "aws" {
        region_hint = match location.cloud_storage.as_ref() {
            Some(cs) => {
                let driver = bucket::driver_for(ctx.client.clone(), cs).await?;
                driver.region_of(&cs.spec.name).await.ok()
            }
            // inline entries have no creation secret, ask the ambient chain
            None => match location.spec.object_storage.as_ref() {
                Some(os) if !os.bucket.is_empty() => {
                    bucket::discover_region(&os.bucket).await.ok()
                }
                _ => None,
            },
        };
    }
    credentials::reconcile_short_lived_secret(
        ctx.client.clone(),
        namespace,
        &location.provider,
        source,
        profile,
        region_hint.as_deref(),
        location.config_value("resourceGroup"),
    )
    .await
}

/// Delete children carrying this DPA's management labels that no longer match
/// a desired name
async fn sweep_orphans(
    dpa: &DataProtectionApplication,
    ctx: &Context,
    recorder: &Recorder,
    desired: &BTreeSet<String>,
) -> Result<(), Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let api: Api<BackupStorageLocation> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!(
        "{MANAGED_BY_LABEL}={OPERATOR_NAME},{DPA_NAME_LABEL}={}",
        dpa.name_any()
    );
    let children = api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?;
    for child in children {
        let child_name = child.name_any();
        if desired.contains(&child_name) {
            continue;
        }
        api.delete(&child_name, &Default::default())
            .await
            .map_err(Error::KubeError)?;
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeletedBackupStorageLocation".into(),
                note: Some(format!("Deleted orphaned BackupStorageLocation {child_name}")),
                action: "Delete".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
    }
    Ok(())
}

/// Run the full pipeline. Returns true when any child changed shape enough to
/// warrant a follow-up pass.
pub async fn reconcile(
    dpa: &DataProtectionApplication,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<bool, Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let locations = resolve_locations(dpa, ctx).await?;

    let api: Api<BackupStorageLocation> = Api::namespaced(ctx.client.clone(), &namespace);
    let params = PatchParams::apply(OPERATOR_NAME).force();
    let mut desired = BTreeSet::new();
    for location in &locations {
        if let Some(source) = location.credential.as_ref() {
            let labelled = credentials::ensure_secret_labels(
                ctx.client.clone(),
                &namespace,
                &source.name,
                &dpa.name_any(),
            )
            .await?;
            if labelled {
                recorder
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "SecretLabelled".into(),
                        note: Some(format!("Labelled secret {}", source.name)),
                        action: "Update".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
        }
        let child = desired_child(dpa, location);
        api.patch(&location.child_name, &params, &Patch::Apply(&child))
            .await
            .map_err(Error::KubeError)?;
        debug!("applied BackupStorageLocation {}", location.child_name);
        desired.insert(location.child_name.clone());
    }
    if !locations.is_empty() {
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "BackupStorageLocationReconciled".into(),
                note: Some(format!("Applied {} backup storage location(s)", locations.len())),
                action: "Apply".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
    }

    if let Some(first) = locations.first() {
        patch_short_lived_credentials(ctx, &namespace, first).await?;
    }

    sweep_orphans(dpa, ctx, recorder, &desired).await?;
    Ok(!locations.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::{
        cloudstorage_types::{CloudStorageProvider, CloudStorageSpec},
        dpa_types::{CloudStorageRef, DpaSpec},
    };
    use std::collections::BTreeMap;

    fn managed_bucket() -> CloudStorage {
        CloudStorage::new(
            "testing",
            CloudStorageSpec {
                name: "backups-bucket".to_string(),
                provider: CloudStorageProvider::Aws,
                region: Some("eu-west-1".to_string()),
                enable_shared_config: Some(true),
                ..CloudStorageSpec::default()
            },
        )
    }

    #[test]
    fn child_names_follow_the_one_based_index() {
        let entry = BackupLocation::default();
        assert_eq!(child_name("dpa", &entry, 0), "dpa-1");
        assert_eq!(child_name("dpa", &entry, 2), "dpa-3");

        let named = BackupLocation {
            name: Some("primary".to_string()),
            ..BackupLocation::default()
        };
        assert_eq!(child_name("dpa", &named, 0), "primary");
    }

    #[test]
    fn bucket_backed_spec_copies_bucket_identity() {
        let location = CloudStorageLocation {
            cloud_storage_ref: CloudStorageRef {
                name: "testing".to_string(),
            },
            prefix: Some("velero".to_string()),
            default: true,
            ..CloudStorageLocation::default()
        };
        let spec = bucket_backed_spec(&managed_bucket(), &location);
        assert_eq!(spec.provider, "aws");
        assert_eq!(spec.object_storage.as_ref().unwrap().bucket, "backups-bucket");
        assert!(spec.default);
        let config = spec.config.unwrap();
        assert_eq!(config.get("enableSharedConfig").map(String::as_str), Some("true"));
        assert_eq!(config.get("region").map(String::as_str), Some("eu-west-1"));
    }

    #[test]
    fn prefix_is_required_while_image_backups_are_on() {
        let dpa = DataProtectionApplication::new("test", DpaSpec::default());
        let spec = BackupStorageLocationSpec {
            provider: "aws".to_string(),
            object_storage: Some(ObjectStorageLocation {
                bucket: "b".to_string(),
                ..ObjectStorageLocation::default()
            }),
            ..BackupStorageLocationSpec::default()
        };
        assert!(validate_entry(&dpa, "test-1", &spec, "aws").is_err());

        let mut off = dpa.clone();
        off.spec.backup_images = Some(false);
        assert!(validate_entry(&off, "test-1", &spec, "aws").is_ok());
    }

    #[test]
    fn forced_path_style_needs_an_explicit_region() {
        let mut dpa = DataProtectionApplication::new("test", DpaSpec::default());
        dpa.spec.backup_images = Some(false);
        let mut spec = BackupStorageLocationSpec {
            provider: "aws".to_string(),
            config: Some(BTreeMap::from([(
                "s3ForcePathStyle".to_string(),
                "true".to_string(),
            )])),
            ..BackupStorageLocationSpec::default()
        };
        assert!(validate_entry(&dpa, "test-1", &spec, "aws").is_err());

        spec.config
            .as_mut()
            .unwrap()
            .insert("region".to_string(), "us-east-2".to_string());
        assert!(validate_entry(&dpa, "test-1", &spec, "aws").is_ok());
    }
}
