use crate::defaults;
use k8s_openapi::{
    api::core::v1::{EnvVar, PodDNSConfig, ResourceRequirements, SecretKeySelector, Toleration},
    apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pod-level customizations shared by the backup server and the node agent
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_allocations: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
}

/// Structured flags for the backup server binary. Anything not modelled here is
/// only reachable through the unsupported-server-args config map.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VeleroServerArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_sync_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_backup_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_item_operation_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backup_ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_burst: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_qps: Option<i64>,
}

/// A plugin supplied by the user rather than the registry table
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomPlugin {
    pub name: String,
    pub image: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VeleroConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_plugins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_plugins: Vec<CustomPlugin>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_config: Option<PodConfig>,
    #[serde(default)]
    pub no_default_backup_location: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<VeleroServerArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_item_operation_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_informer_cache: Option<bool>,
}

/// Per-node concurrency limits for the data mover
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadConcurrency {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_config: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_node_config: Option<Vec<RuledConfig>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuledConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,
    pub number: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadAffinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,
}

/// Intermediate PVC template used by the data mover for a storage class
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupPvcConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spc_no_relabeling: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestorePvcConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_delay_binding: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// restic or kopia
    #[serde(default = "defaults::default_uploader_type")]
    pub uploader_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_config: Option<PodConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_concurrency: Option<LoadConcurrency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_affinity: Option<Vec<LoadAffinity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_pvc: Option<BTreeMap<String, BackupPvcConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_pvc: Option<RestorePvcConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_fs_backup: Option<bool>,
}

/// Deprecated restic block, accepted only as an input-compat alias for
/// nodeAgent with uploaderType=restic.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResticConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_config: Option<PodConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryMaintenanceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_affinity: Option<Vec<LoadAffinity>>,
}

/// Tuning applied to every backup repository velero creates
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupRepositoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_maintenance_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_limit_mb: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velero: Option<VeleroConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_agent: Option<NodeAgentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restic: Option<ResticConfig>,
    /// keyed by repository type (kopia, restic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_maintenance: Option<BTreeMap<String, RepositoryMaintenanceConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_repository: Option<BackupRepositoryConfig>,
}

/// Backup-location entry: exactly one of `velero` (inline) or `bucket`
/// (managed CloudStorage reference) must be set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velero: Option<super::velero_types::BackupStorageLocationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<CloudStorageLocation>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudStorageLocation {
    pub cloud_storage_ref: CloudStorageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<SecretKeySelector>,
    #[serde(default)]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_sync_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CloudStorageRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velero: Option<super::velero_types::VolumeSnapshotLocationSpec>,
}

/// Admin-enforced template for tenant backup requests. Fields that would let a
/// tenant-facing template bypass location scoping are rejected by validation.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnforceBackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_locations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_cluster_scoped_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_move_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_volumes_to_fs_backup: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnforceRestoreSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_mapping: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_pvs: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonAdmin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_backup_spec: Option<EnforceBackupSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_restore_spec: Option<EnforceRestoreSpec>,
    /// metav1-style duration, e.g. "2m0s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_sync_period: Option<String>,
}

/// Deprecated built-in data mover. Present only so that validation can reject it.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataMover {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<DataMover>,
}

/// Generate the Kubernetes wrapper struct `DataProtectionApplication` from our
/// Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "DataProtectionApplication",
    group = "dataprotection.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "DpaStatus", shortname = "dpa")]
#[serde(rename_all = "camelCase")]
pub struct DpaSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_locations: Vec<BackupLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_locations: Vec<SnapshotLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Configuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_admin: Option<NonAdmin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unsupported_overrides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_dns_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_dns_config: Option<PodDNSConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_annotations: Option<BTreeMap<String, String>>,
    /// None means true: image backups are on unless explicitly disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_images: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct DpaStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl DataProtectionApplication {
    pub fn velero(&self) -> Option<&VeleroConfig> {
        self.spec.configuration.as_ref()?.velero.as_ref()
    }

    pub fn node_agent(&self) -> Option<&NodeAgentConfig> {
        self.spec.configuration.as_ref()?.node_agent.as_ref()
    }

    pub fn node_agent_enabled(&self) -> bool {
        self.node_agent()
            .map(|na| na.enable.unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn backup_images(&self) -> bool {
        self.spec.backup_images.unwrap_or(true)
    }

    pub fn non_admin_enabled(&self) -> bool {
        self.spec
            .non_admin
            .as_ref()
            .map(|na| na.enable.unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn has_plugin(&self, plugin: &str) -> bool {
        self.velero()
            .map(|v| v.default_plugins.iter().any(|p| p == plugin))
            .unwrap_or(false)
    }

    /// In-memory auto-corrections applied before validation on every pass.
    /// Never written back to the cluster.
    pub fn with_auto_corrections(&self) -> Self {
        let mut dpa = self.clone();
        let Some(config) = dpa.spec.configuration.as_mut() else {
            return dpa;
        };

        // the restic block is the legacy alias for nodeAgent with the restic uploader
        if config.node_agent.is_none() {
            if let Some(restic) = config.restic.take() {
                config.node_agent = Some(NodeAgentConfig {
                    enable: restic.enable,
                    uploader_type: "restic".to_string(),
                    pod_config: restic.pod_config,
                    timeout: restic.timeout,
                    ..NodeAgentConfig::default()
                });
            }
        }

        if let Some(velero) = config.velero.as_mut() {
            dedup_in_place(&mut velero.default_plugins);
            dedup_in_place(&mut velero.feature_flags);
            // the csi plugin implies its feature flag
            if velero.default_plugins.iter().any(|p| p == "csi")
                && !velero.feature_flags.iter().any(|f| f == "EnableCSI")
            {
                velero.feature_flags.push("EnableCSI".to_string());
            }
        }

        // pod-volume operations inherit the node-agent timeout unless set explicitly
        if let (Some(velero), Some(na)) = (config.velero.as_mut(), config.node_agent.as_ref()) {
            if velero.default_item_operation_timeout.is_none() {
                velero.default_item_operation_timeout = na.timeout.clone();
            }
        }

        // translate the legacy node-selector form into affinity when unset
        if let Some(na) = config.node_agent.as_mut() {
            if na.load_affinity.is_none() {
                if let Some(selector) = na
                    .pod_config
                    .as_ref()
                    .and_then(|pc| pc.node_selector.clone())
                {
                    na.load_affinity = Some(vec![LoadAffinity {
                        node_selector: Some(LabelSelector {
                            match_labels: Some(selector),
                            match_expressions: None,
                        }),
                    }]);
                }
            }
        }
        dpa
    }
}

// order-preserving de-duplication
fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = std::collections::BTreeSet::new();
    items.retain(|i| seen.insert(i.clone()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn restic_block_rewrites_into_node_agent() {
        let mut dpa = DataProtectionApplication::new("test", DpaSpec::default());
        dpa.spec.configuration = Some(Configuration {
            velero: Some(VeleroConfig::default()),
            restic: Some(ResticConfig {
                enable: Some(true),
                timeout: Some("2h".to_string()),
                ..ResticConfig::default()
            }),
            ..Configuration::default()
        });

        let corrected = dpa.with_auto_corrections();
        let config = corrected.spec.configuration.unwrap();
        assert!(config.restic.is_none());
        let na = config.node_agent.unwrap();
        assert_eq!(na.uploader_type, "restic");
        assert_eq!(na.enable, Some(true));
        assert_eq!(na.timeout.as_deref(), Some("2h"));
    }

    #[test]
    fn plugins_and_flags_are_deduplicated_and_csi_flag_inferred() {
        let mut dpa = DataProtectionApplication::new("test", DpaSpec::default());
        dpa.spec.configuration = Some(Configuration {
            velero: Some(VeleroConfig {
                default_plugins: vec!["aws".into(), "csi".into(), "aws".into()],
                feature_flags: vec!["EnableAPIGroupVersions".into(), "EnableAPIGroupVersions".into()],
                ..VeleroConfig::default()
            }),
            ..Configuration::default()
        });

        let corrected = dpa.with_auto_corrections();
        let velero = corrected.spec.configuration.unwrap().velero.unwrap();
        assert_eq!(velero.default_plugins, vec!["aws", "csi"]);
        assert_eq!(
            velero.feature_flags,
            vec!["EnableAPIGroupVersions", "EnableCSI"]
        );
    }

    #[test]
    fn node_selector_translates_to_affinity_when_affinity_unset() {
        let mut selector = BTreeMap::new();
        selector.insert("kubernetes.io/os".to_string(), "linux".to_string());
        let mut dpa = DataProtectionApplication::new("test", DpaSpec::default());
        dpa.spec.configuration = Some(Configuration {
            velero: Some(VeleroConfig::default()),
            node_agent: Some(NodeAgentConfig {
                enable: Some(true),
                pod_config: Some(PodConfig {
                    node_selector: Some(selector.clone()),
                    ..PodConfig::default()
                }),
                ..NodeAgentConfig::default()
            }),
            ..Configuration::default()
        });

        let corrected = dpa.with_auto_corrections();
        let na = corrected.spec.configuration.unwrap().node_agent.unwrap();
        let affinity = na.load_affinity.unwrap();
        assert_eq!(affinity.len(), 1);
        assert_eq!(
            affinity[0].node_selector.as_ref().unwrap().match_labels,
            Some(selector)
        );
    }

    #[test]
    fn default_item_operation_timeout_falls_back_to_node_agent_timeout() {
        let mut dpa = DataProtectionApplication::new("test", DpaSpec::default());
        dpa.spec.configuration = Some(Configuration {
            velero: Some(VeleroConfig::default()),
            node_agent: Some(NodeAgentConfig {
                enable: Some(true),
                timeout: Some("4h".to_string()),
                ..NodeAgentConfig::default()
            }),
            ..Configuration::default()
        });

        let corrected = dpa.with_auto_corrections();
        let velero = corrected.spec.configuration.unwrap().velero.unwrap();
        assert_eq!(velero.default_item_operation_timeout.as_deref(), Some("4h"));
    }
}
