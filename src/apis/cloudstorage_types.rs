use k8s_openapi::{
    api::core::v1::SecretKeySelector, apimachinery::pkg::apis::meta::v1::Time,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer that protects the underlying bucket from cascading deletion
pub const BUCKET_PROTECTION_FINALIZER: &str = "dataprotection.io/bucket-protection";
/// Opt-in annotation: the bucket is physically deleted only when this parses true
pub const CLOUD_STORAGE_DELETE_ANNOTATION: &str = "dataprotection.io/cloudstorage-delete";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CloudStorageProvider {
    #[default]
    Aws,
    Azure,
    Gcp,
}

impl std::fmt::Display for CloudStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloudStorageProvider::Aws => "aws",
            CloudStorageProvider::Azure => "azure",
            CloudStorageProvider::Gcp => "gcp",
        };
        write!(f, "{s}")
    }
}

/// Declarative object-store bucket whose lifecycle is optionally managed by
/// this operator. Not owned by any DPA: several DPAs may reference it and it
/// outlives them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "CloudStorage",
    group = "dataprotection.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "CloudStorageStatus", shortname = "cs")]
#[serde(rename_all = "camelCase")]
pub struct CloudStorageSpec {
    /// Requested bucket / container name
    pub name: String,
    pub provider: CloudStorageProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Secret holding the credentials used to create and delete the bucket
    pub creation_secret: SecretKeySelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_shared_config: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudStorageStatus {
    /// Observed bucket name
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<Time>,
}

impl CloudStorage {
    /// Whether the user opted in to bucket removal. Err means the annotation is
    /// present but does not parse as a bool.
    pub fn delete_opt_in(&self) -> Result<bool, String> {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CLOUD_STORAGE_DELETE_ANNOTATION))
        {
            None => Ok(false),
            Some(raw) => raw
                .trim()
                .parse::<bool>()
                .map_err(|_| format!("{CLOUD_STORAGE_DELETE_ANNOTATION}: {raw:?} is not a bool")),
        }
    }

    pub fn has_protection_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|n| n == BUCKET_PROTECTION_FINALIZER))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn annotated(value: Option<&str>) -> CloudStorage {
        let mut cs = CloudStorage::new("bucket", CloudStorageSpec::default());
        if let Some(v) = value {
            cs.metadata.annotations = Some(
                [(CLOUD_STORAGE_DELETE_ANNOTATION.to_string(), v.to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        cs
    }

    #[test]
    fn delete_opt_in_defaults_false_when_absent() {
        assert_eq!(annotated(None).delete_opt_in(), Ok(false));
    }

    #[test]
    fn delete_opt_in_parses_bool() {
        assert_eq!(annotated(Some("true")).delete_opt_in(), Ok(true));
        assert_eq!(annotated(Some("false")).delete_opt_in(), Ok(false));
        assert!(annotated(Some("yes")).delete_opt_in().is_err());
    }

    #[test]
    fn provider_serializes_lowercase() {
        let json = serde_json::to_string(&CloudStorageProvider::Aws).unwrap();
        assert_eq!(json, "\"aws\"");
    }
}
