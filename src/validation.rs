//! Cross-field invariants checked before any child resource is touched.
//!
//! `validate` is a pure function: it never mutates the DPA and never talks to
//! the apiserver. Everything it needs from the cluster is carried in a
//! `ClusterView` assembled by the reconciler.
use crate::{
    apis::dpa_types::{DataProtectionApplication, NonAdmin},
    registry,
};
use kube::ResourceExt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("only one DataProtectionApplication is allowed per namespace, found {0}")]
    Duplicate(usize),
    #[error("DPA spec.configuration.velero is required")]
    MissingBackupServerConfig,
    #[error("DPA spec.configuration can not have both restic and nodeAgent")]
    ConflictingAgentBlocks,
    #[error("{0}")]
    NoDefaultLocation(&'static str),
    #[error("only one backupStorageLocation can be marked as the default")]
    MultipleDefaults,
    #[error("a backupStorageLocation named default must also be marked as the default")]
    NameReservedForDefault,
    #[error("backupLocation {0} must set exactly one of velero or bucket")]
    LocationAmbiguous(usize),
    #[error("aws and legacy-aws can not be both specified in DPA spec.configuration.velero.defaultPlugins")]
    ConflictingAWSPlugins,
    #[error("the built-in dataMover has been removed, use spec.configuration.nodeAgent instead")]
    DeprecatedDataMover,
    #[error("unsupported override key {0}")]
    OverrideUnsupported(String),
    #[error("{0}")]
    InvalidResourceRequest(String),
    #[error("{0} can not be enforced for non-admin users")]
    NonAdminEnforcement(String),
    #[error("the nonAdmin backupSyncPeriod ({0}) can not be greater or equal nonAdmin garbageCollectionPeriod ({1})")]
    NonAdminTiming(String, String),
    #[error("node agent loadAffinity is incompatible with podConfig.nodeSelector: {0}")]
    NodeAgentAffinityMismatch(String),
    #[error("only one DataProtectionApplication in the cluster may enable nonAdmin")]
    MultipleNonAdminDeployments,
}

/// Cluster-scoped facts the intrinsic checks cannot see. `dpas` is the
/// cluster-wide DPA list, including the object under validation.
#[derive(Default, Clone)]
pub struct ClusterView {
    pub dpas: Vec<DataProtectionApplication>,
}

pub fn validate(
    dpa: &DataProtectionApplication,
    cluster: &ClusterView,
) -> Result<(), ValidationError> {
    check_singleton(dpa, cluster)?;

    let velero = dpa.velero().ok_or(ValidationError::MissingBackupServerConfig)?;

    let config = dpa.spec.configuration.as_ref();
    if config.map(|c| c.restic.is_some() && c.node_agent.is_some()) == Some(true) {
        return Err(ValidationError::ConflictingAgentBlocks);
    }

    check_locations(dpa, velero.no_default_backup_location)?;
    check_plugins(dpa)?;

    if dpa
        .spec
        .features
        .as_ref()
        .and_then(|f| f.data_mover.as_ref())
        .is_some()
    {
        return Err(ValidationError::DeprecatedDataMover);
    }

    for key in dpa.spec.unsupported_overrides.keys() {
        if !registry::KNOWN_OVERRIDE_KEYS.contains(&key.as_str()) {
            return Err(ValidationError::OverrideUnsupported(key.clone()));
        }
    }

    check_resource_requests(dpa)?;

    if let Some(non_admin) = dpa.spec.non_admin.as_ref() {
        check_non_admin(non_admin)?;
        if dpa.non_admin_enabled() {
            check_single_non_admin(dpa, cluster)?;
        }
    }

    check_node_agent_affinity(dpa)?;
    Ok(())
}

fn check_singleton(
    dpa: &DataProtectionApplication,
    cluster: &ClusterView,
) -> Result<(), ValidationError> {
    let in_namespace = cluster
        .dpas
        .iter()
        .filter(|other| other.namespace() == dpa.namespace())
        .count();
    if in_namespace > 1 {
        return Err(ValidationError::Duplicate(in_namespace));
    }
    Ok(())
}

fn check_locations(
    dpa: &DataProtectionApplication,
    no_default: bool,
) -> Result<(), ValidationError> {
    let locations = &dpa.spec.backup_locations;

    if no_default {
        if !locations.is_empty() {
            return Err(ValidationError::NoDefaultLocation(
                "backupLocations must be empty when noDefaultBackupLocation is set",
            ));
        }
        if dpa.spec.backup_images != Some(false) {
            return Err(ValidationError::NoDefaultLocation(
                "backupImages must be explicitly disabled when noDefaultBackupLocation is set",
            ));
        }
        return Ok(());
    }

    if locations.is_empty() {
        return Err(ValidationError::NoDefaultLocation(
            "no backupLocations configured and noDefaultBackupLocation is not set",
        ));
    }

    let mut defaults = 0;
    for (i, location) in locations.iter().enumerate() {
        let (is_default, name) = match (&location.velero, &location.bucket) {
            (Some(velero), None) => (velero.default, &location.name),
            (None, Some(bucket)) => (bucket.default, &location.name),
            _ => return Err(ValidationError::LocationAmbiguous(i)),
        };
        if is_default {
            defaults += 1;
        }
        // "default" is the conventional name velero resolves implicitly
        if name.as_deref() == Some("default") && !is_default {
            return Err(ValidationError::NameReservedForDefault);
        }
    }
    match defaults {
        0 => Err(ValidationError::NoDefaultLocation(
            "one backupLocation must be marked as the default",
        )),
        1 => Ok(()),
        _ => Err(ValidationError::MultipleDefaults),
    }
}

fn check_plugins(dpa: &DataProtectionApplication) -> Result<(), ValidationError> {
    if dpa.has_plugin("aws") && dpa.has_plugin("legacy-aws") {
        return Err(ValidationError::ConflictingAWSPlugins);
    }
    Ok(())
}

fn check_resource_requests(dpa: &DataProtectionApplication) -> Result<(), ValidationError> {
    let mut pod_configs = Vec::new();
    if let Some(velero) = dpa.velero() {
        pod_configs.push(("velero", velero.pod_config.as_ref()));
    }
    if let Some(na) = dpa.node_agent() {
        pod_configs.push(("nodeAgent", na.pod_config.as_ref()));
    }
    for (component, pod_config) in pod_configs {
        let Some(resources) = pod_config.and_then(|pc| pc.resource_allocations.as_ref()) else {
            continue;
        };
        for quantities in [resources.requests.as_ref(), resources.limits.as_ref()] {
            let Some(quantities) = quantities else { continue };
            for (resource, quantity) in quantities {
                if !is_valid_quantity(&quantity.0) {
                    return Err(ValidationError::InvalidResourceRequest(format!(
                        "{component} podConfig {resource} value {:?} is not a valid quantity",
                        quantity.0
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_non_admin(non_admin: &NonAdmin) -> Result<(), ValidationError> {
    if let Some(backup) = non_admin.enforce_backup_spec.as_ref() {
        let path = "spec.nonAdmin.enforceBackupSpec";
        if backup.storage_location.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.storageLocation"
            )));
        }
        if backup.volume_snapshot_locations.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.volumeSnapshotLocations"
            )));
        }
        if backup.included_namespaces.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.includedNamespaces"
            )));
        }
        if backup.excluded_namespaces.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.excludedNamespaces"
            )));
        }
        if backup.include_cluster_resources == Some(true) {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.includeClusterResources"
            )));
        }
        if backup
            .included_cluster_scoped_resources
            .as_ref()
            .map(|v| !v.is_empty())
            == Some(true)
        {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.includedClusterScopedResources"
            )));
        }
    }
    if let Some(restore) = non_admin.enforce_restore_spec.as_ref() {
        let path = "spec.nonAdmin.enforceRestoreSpec";
        if restore.schedule_name.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.scheduleName"
            )));
        }
        if restore.namespace_mapping.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.namespaceMapping"
            )));
        }
        if restore.included_namespaces.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.includedNamespaces"
            )));
        }
        if restore.excluded_namespaces.is_some() {
            return Err(ValidationError::NonAdminEnforcement(format!(
                "{path}.excludedNamespaces"
            )));
        }
    }

    if let (Some(sync), Some(gc)) = (
        non_admin.backup_sync_period.as_deref(),
        non_admin.garbage_collection_period.as_deref(),
    ) {
        let sync_d = parse_duration(sync)
            .ok_or_else(|| ValidationError::NonAdminTiming(sync.to_string(), gc.to_string()))?;
        let gc_d = parse_duration(gc)
            .ok_or_else(|| ValidationError::NonAdminTiming(sync.to_string(), gc.to_string()))?;
        if sync_d >= gc_d {
            return Err(ValidationError::NonAdminTiming(
                sync.to_string(),
                gc.to_string(),
            ));
        }
    }
    Ok(())
}

fn check_single_non_admin(
    dpa: &DataProtectionApplication,
    cluster: &ClusterView,
) -> Result<(), ValidationError> {
    let enabled = cluster
        .dpas
        .iter()
        .filter(|other| {
            other.non_admin_enabled()
                && !(other.namespace() == dpa.namespace() && other.name_any() == dpa.name_any())
        })
        .count();
    if enabled > 0 {
        return Err(ValidationError::MultipleNonAdminDeployments);
    }
    Ok(())
}

fn check_node_agent_affinity(dpa: &DataProtectionApplication) -> Result<(), ValidationError> {
    let Some(na) = dpa.node_agent() else {
        return Ok(());
    };
    let Some(selector) = na.pod_config.as_ref().and_then(|pc| pc.node_selector.as_ref()) else {
        return Ok(());
    };
    let Some(affinities) = na.load_affinity.as_ref() else {
        return Ok(());
    };
    for affinity in affinities {
        let Some(node_selector) = affinity.node_selector.as_ref() else {
            continue;
        };
        if node_selector
            .match_expressions
            .as_ref()
            .map(|e| !e.is_empty())
            == Some(true)
        {
            return Err(ValidationError::NodeAgentAffinityMismatch(
                "matchExpressions are not allowed alongside a nodeSelector".to_string(),
            ));
        }
        let match_labels = node_selector.match_labels.clone().unwrap_or_default();
        for (key, value) in selector {
            if match_labels.get(key) != Some(value) {
                return Err(ValidationError::NodeAgentAffinityMismatch(format!(
                    "label {key}={value} is missing from a loadAffinity matchLabels"
                )));
            }
        }
    }
    Ok(())
}

/// Kubernetes quantity syntax: a decimal number with an optional binary or
/// decimal SI suffix, or an exponent. Longest suffix wins so that "2Ei" is
/// exbibytes rather than an exponent with a stray "i".
fn is_valid_quantity(value: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "k", "K", "M", "G", "T", "P", "E",
    ];
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    for suffix in SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            if !number.is_empty() && !number.contains(['e', 'E']) {
                return number.parse::<f64>().is_ok();
            }
        }
    }
    // no suffix: plain decimal or exponent form like 1e3
    value.parse::<f64>().is_ok()
}

/// Go-style duration strings, e.g. "15m", "2h0m", "90s"
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut chars = s.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if !c.is_ascii_digit() {
            return None;
        }
        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let number: f64 = s[start..end].parse().ok()?;
        let unit_start = end;
        let mut unit_end = unit_start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() {
                break;
            }
            unit_end = i + c.len_utf8();
            chars.next();
        }
        if unit_end == unit_start {
            return None;
        }
        let seconds = match &s[unit_start..unit_end] {
            "ns" => number / 1e9,
            "us" | "µs" => number / 1e6,
            "ms" => number / 1e3,
            "s" => number,
            "m" => number * 60.0,
            "h" => number * 3600.0,
            _ => return None,
        };
        if seconds < 0.0 {
            return None;
        }
        total += Duration::from_secs_f64(seconds);
    }
    Some(total)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::{
        dpa_types::{
            BackupLocation, CloudStorageLocation, CloudStorageRef, Configuration,
            DataMover, DpaSpec, EnforceBackupSpec, Features, LoadAffinity, NodeAgentConfig,
            NonAdmin, PodConfig, VeleroConfig,
        },
        velero_types::BackupStorageLocationSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    fn minimal_dpa() -> DataProtectionApplication {
        let spec = DpaSpec {
            configuration: Some(Configuration {
                velero: Some(VeleroConfig {
                    default_plugins: vec!["aws".to_string()],
                    ..VeleroConfig::default()
                }),
                ..Configuration::default()
            }),
            backup_locations: vec![BackupLocation {
                velero: Some(BackupStorageLocationSpec {
                    provider: "aws".to_string(),
                    default: true,
                    ..BackupStorageLocationSpec::default()
                }),
                ..BackupLocation::default()
            }],
            ..DpaSpec::default()
        };
        let mut dpa = DataProtectionApplication::new("test", spec);
        dpa.metadata.namespace = Some("testns".to_string());
        dpa
    }

    fn view(dpas: &[&DataProtectionApplication]) -> ClusterView {
        ClusterView {
            dpas: dpas.iter().map(|d| (*d).clone()).collect(),
        }
    }

    #[test]
    fn minimal_dpa_validates() {
        let dpa = minimal_dpa();
        assert_eq!(validate(&dpa, &view(&[&dpa])), Ok(()));
    }

    #[test]
    fn two_dpas_in_one_namespace_are_rejected() {
        let dpa = minimal_dpa();
        let mut other = minimal_dpa();
        other.metadata.name = Some("second".to_string());
        assert_eq!(
            validate(&dpa, &view(&[&dpa, &other])),
            Err(ValidationError::Duplicate(2))
        );
    }

    #[test]
    fn missing_velero_block_is_rejected() {
        let mut dpa = minimal_dpa();
        dpa.spec.configuration = Some(Configuration::default());
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::MissingBackupServerConfig)
        );
    }

    #[test]
    fn restic_and_node_agent_together_are_rejected() {
        let mut dpa = minimal_dpa();
        let config = dpa.spec.configuration.as_mut().unwrap();
        config.restic = Some(Default::default());
        config.node_agent = Some(NodeAgentConfig::default());
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::ConflictingAgentBlocks)
        );
    }

    #[test]
    fn both_aws_plugins_are_rejected_with_exact_message() {
        let mut dpa = minimal_dpa();
        dpa.spec
            .configuration
            .as_mut()
            .unwrap()
            .velero
            .as_mut()
            .unwrap()
            .default_plugins = vec!["aws".to_string(), "legacy-aws".to_string()];
        let err = validate(&dpa, &view(&[&dpa])).unwrap_err();
        assert_eq!(err, ValidationError::ConflictingAWSPlugins);
        assert_eq!(
            err.to_string(),
            "aws and legacy-aws can not be both specified in DPA spec.configuration.velero.defaultPlugins"
        );
    }

    #[test]
    fn location_with_both_shapes_is_ambiguous() {
        let mut dpa = minimal_dpa();
        dpa.spec.backup_locations[0].bucket = Some(CloudStorageLocation {
            cloud_storage_ref: CloudStorageRef {
                name: "b".to_string(),
            },
            ..CloudStorageLocation::default()
        });
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::LocationAmbiguous(0))
        );
    }

    #[test]
    fn no_default_location_is_rejected() {
        let mut dpa = minimal_dpa();
        dpa.spec.backup_locations[0]
            .velero
            .as_mut()
            .unwrap()
            .default = false;
        assert!(matches!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::NoDefaultLocation(_))
        ));
    }

    #[test]
    fn two_defaults_are_rejected() {
        let mut dpa = minimal_dpa();
        let extra = dpa.spec.backup_locations[0].clone();
        dpa.spec.backup_locations.push(extra);
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::MultipleDefaults)
        );
    }

    #[test]
    fn location_named_default_must_be_default() {
        let mut dpa = minimal_dpa();
        let mut extra = dpa.spec.backup_locations[0].clone();
        extra.name = Some("default".to_string());
        extra.velero.as_mut().unwrap().default = false;
        dpa.spec.backup_locations.push(extra);
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::NameReservedForDefault)
        );
    }

    #[test]
    fn no_default_backup_location_requires_empty_list_and_disabled_image_backup() {
        let mut dpa = minimal_dpa();
        dpa.spec
            .configuration
            .as_mut()
            .unwrap()
            .velero
            .as_mut()
            .unwrap()
            .no_default_backup_location = true;
        assert!(matches!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::NoDefaultLocation(_))
        ));

        dpa.spec.backup_locations.clear();
        assert!(matches!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::NoDefaultLocation(_))
        ));

        dpa.spec.backup_images = Some(false);
        assert_eq!(validate(&dpa, &view(&[&dpa])), Ok(()));
    }

    #[test]
    fn deprecated_data_mover_is_rejected() {
        let mut dpa = minimal_dpa();
        dpa.spec.features = Some(Features {
            data_mover: Some(DataMover::default()),
        });
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::DeprecatedDataMover)
        );
    }

    #[test]
    fn unknown_override_key_is_rejected() {
        let mut dpa = minimal_dpa();
        dpa.spec
            .unsupported_overrides
            .insert("madeUpImageFqin".to_string(), "img".to_string());
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::OverrideUnsupported(
                "madeUpImageFqin".to_string()
            ))
        );
    }

    #[test]
    fn non_admin_enforced_storage_location_is_rejected() {
        let mut dpa = minimal_dpa();
        dpa.spec.non_admin = Some(NonAdmin {
            enforce_backup_spec: Some(EnforceBackupSpec {
                storage_location: Some("default".to_string()),
                ..EnforceBackupSpec::default()
            }),
            ..NonAdmin::default()
        });
        assert_eq!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::NonAdminEnforcement(
                "spec.nonAdmin.enforceBackupSpec.storageLocation".to_string()
            ))
        );
    }

    #[test]
    fn non_admin_sync_must_be_shorter_than_gc() {
        let mut dpa = minimal_dpa();
        dpa.spec.non_admin = Some(NonAdmin {
            backup_sync_period: Some("15m".to_string()),
            garbage_collection_period: Some("10m".to_string()),
            ..NonAdmin::default()
        });
        let err = validate(&dpa, &view(&[&dpa])).unwrap_err();
        assert_eq!(
            err,
            ValidationError::NonAdminTiming("15m".to_string(), "10m".to_string())
        );
        assert!(err.to_string().contains("can not be greater or equal"));

        dpa.spec.non_admin.as_mut().unwrap().backup_sync_period = Some("2m0s".to_string());
        assert_eq!(validate(&dpa, &view(&[&dpa])), Ok(()));
    }

    #[test]
    fn second_non_admin_deployment_is_rejected() {
        let mut dpa = minimal_dpa();
        dpa.spec.non_admin = Some(NonAdmin {
            enable: Some(true),
            ..NonAdmin::default()
        });
        let mut other = dpa.clone();
        other.metadata.namespace = Some("otherns".to_string());
        assert_eq!(
            validate(&dpa, &view(&[&dpa, &other])),
            Err(ValidationError::MultipleNonAdminDeployments)
        );
    }

    #[test]
    fn node_selector_labels_must_appear_in_affinity() {
        let mut dpa = minimal_dpa();
        dpa.spec.configuration.as_mut().unwrap().node_agent = Some(NodeAgentConfig {
            enable: Some(true),
            pod_config: Some(PodConfig {
                node_selector: Some(BTreeMap::from([(
                    "kubernetes.io/arch".to_string(),
                    "amd64".to_string(),
                )])),
                ..PodConfig::default()
            }),
            load_affinity: Some(vec![LoadAffinity {
                node_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "zone".to_string(),
                        "a".to_string(),
                    )])),
                    ..LabelSelector::default()
                }),
            }]),
            ..NodeAgentConfig::default()
        });
        assert!(matches!(
            validate(&dpa, &view(&[&dpa])),
            Err(ValidationError::NodeAgentAffinityMismatch(_))
        ));
    }

    #[test]
    fn quantity_syntax_is_recognized() {
        for ok in ["100m", "2", "1.5Gi", "512Mi", "1e3", "2E", "2Ei"] {
            assert!(is_valid_quantity(ok), "{ok} should be valid");
        }
        for bad in ["", "lots", "1.5.0", "10mi", "2e3Ki"] {
            assert!(!is_valid_quantity(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn duration_parser_handles_composite_forms() {
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h0m"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1h30m10s"), Some(Duration::from_secs(5410)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("bogus"), None);
        assert_eq!(parse_duration("15"), None);
    }
}
