//! Derived config artifacts. Every artifact follows the same contract: a pure
//! `required` predicate over the DPA, deletion when not required, otherwise a
//! create-or-patch of a config map whose single data key holds the compact
//! JSON of the relevant sub-block.
use crate::{
    apis::dpa_types::{DataProtectionApplication, NodeAgentConfig},
    builders::management_labels,
    controller::Context,
    registry, Error, OPERATOR_NAME,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder},
    Resource, ResourceExt,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const NODE_AGENT_CONFIG_PREFIX: &str = "node-agent-config";
pub const BACKUP_REPO_CONFIG_PREFIX: &str = "backup-repository-config";
pub const REPO_MAINTENANCE_CONFIG_PREFIX: &str = "repository-maintenance-config";
/// Consumed by the restore item action that injects the helper image
pub const FS_RESTORE_HELPER_CM: &str = "fs-restore-action-config";

pub fn artifact_name(prefix: &str, dpa_name: &str) -> String {
    format!("{prefix}-{dpa_name}")
}

fn node_agent_payload(na: &NodeAgentConfig) -> Option<Value> {
    let mut map = serde_json::Map::new();
    if let Some(v) = na.load_concurrency.as_ref() {
        map.insert("loadConcurrency".to_string(), json!(v));
    }
    if let Some(v) = na.load_affinity.as_ref() {
        map.insert("loadAffinity".to_string(), json!(v));
    }
    if let Some(v) = na.backup_pvc.as_ref() {
        map.insert("backupPVC".to_string(), json!(v));
    }
    if let Some(v) = na.restore_pvc.as_ref() {
        map.insert("restorePVC".to_string(), json!(v));
    }
    (!map.is_empty()).then(|| Value::Object(map))
}

pub fn node_agent_config_required(dpa: &DataProtectionApplication) -> bool {
    dpa.node_agent_enabled()
        && dpa.node_agent().and_then(node_agent_payload).is_some()
}

pub fn backup_repository_config_required(dpa: &DataProtectionApplication) -> bool {
    dpa.spec
        .configuration
        .as_ref()
        .and_then(|c| c.backup_repository.as_ref())
        .is_some()
}

pub fn repository_maintenance_config_required(dpa: &DataProtectionApplication) -> bool {
    dpa.spec
        .configuration
        .as_ref()
        .and_then(|c| c.repository_maintenance.as_ref())
        .map(|m| !m.is_empty())
        .unwrap_or(false)
}

pub fn fs_restore_helper_required(dpa: &DataProtectionApplication) -> bool {
    dpa.node_agent_enabled()
        && dpa
            .node_agent()
            .map(|na| na.disable_fs_backup != Some(true))
            .unwrap_or(false)
}

async fn delete_if_present(
    api: &Api<ConfigMap>,
    name: &str,
    recorder: &Recorder,
) -> Result<(), Error> {
    match api.delete(name, &Default::default()).await {
        Ok(_) => {
            debug!("deleted configmap {name}");
            recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "ConfigMapDeleted".into(),
                    note: Some(format!("Deleted config map {name}")),
                    action: "Delete".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

async fn apply_config_map(
    dpa: &DataProtectionApplication,
    recorder: &Recorder,
    api: &Api<ConfigMap>,
    name: &str,
    data: BTreeMap<String, String>,
    extra_labels: Option<BTreeMap<String, String>>,
) -> Result<(), Error> {
    let existed = matches!(api.get_opt(name).await.map_err(Error::KubeError)?, Some(_));
    let mut labels = management_labels(&dpa.name_any());
    if let Some(extra) = extra_labels {
        labels.extend(extra);
    }
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: dpa.namespace(),
            labels: Some(labels),
            owner_references: dpa.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    };
    let params = PatchParams::apply(OPERATOR_NAME).force();
    api.patch(name, &params, &Patch::Apply(&cm))
        .await
        .map_err(Error::KubeError)?;
    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: if existed {
                "ConfigMapUpdated".into()
            } else {
                "ConfigMapCreated".into()
            },
            note: Some(format!("Applied config map {name}")),
            action: "Apply".into(),
            secondary: None,
        })
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Run all artifact reconcilers in a fixed order
pub async fn reconcile(
    dpa: &DataProtectionApplication,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<bool, Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let name = dpa.name_any();
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);

    // fs-restore helper image for injected init containers
    if fs_restore_helper_required(dpa) {
        let image = registry::resolve_image(dpa, &registry::RESTORE_HELPER_IMAGE);
        let plugin_config_labels = BTreeMap::from([
            ("velero.io/plugin-config".to_string(), String::new()),
            (
                "velero.io/pod-volume-restore".to_string(),
                "RestoreItemAction".to_string(),
            ),
        ]);
        apply_config_map(
            dpa,
            recorder,
            &api,
            FS_RESTORE_HELPER_CM,
            BTreeMap::from([("image".to_string(), image)]),
            Some(plugin_config_labels),
        )
        .await?;
    } else {
        delete_if_present(&api, FS_RESTORE_HELPER_CM, recorder).await?;
    }

    let na_config_name = artifact_name(NODE_AGENT_CONFIG_PREFIX, &name);
    if node_agent_config_required(dpa) {
        let payload = dpa
            .node_agent()
            .and_then(node_agent_payload)
            .unwrap_or_default();
        apply_config_map(
            dpa,
            recorder,
            &api,
            &na_config_name,
            BTreeMap::from([(
                NODE_AGENT_CONFIG_PREFIX.to_string(),
                serde_json::to_string(&payload).map_err(Error::SerializationError)?,
            )]),
            None,
        )
        .await?;
    } else {
        delete_if_present(&api, &na_config_name, recorder).await?;
    }

    let repo_config_name = artifact_name(BACKUP_REPO_CONFIG_PREFIX, &name);
    if backup_repository_config_required(dpa) {
        let block = dpa
            .spec
            .configuration
            .as_ref()
            .and_then(|c| c.backup_repository.as_ref());
        apply_config_map(
            dpa,
            recorder,
            &api,
            &repo_config_name,
            BTreeMap::from([(
                BACKUP_REPO_CONFIG_PREFIX.to_string(),
                serde_json::to_string(&block).map_err(Error::SerializationError)?,
            )]),
            None,
        )
        .await?;
    } else {
        delete_if_present(&api, &repo_config_name, recorder).await?;
    }

    let maintenance_name = artifact_name(REPO_MAINTENANCE_CONFIG_PREFIX, &name);
    if repository_maintenance_config_required(dpa) {
        let block = dpa
            .spec
            .configuration
            .as_ref()
            .and_then(|c| c.repository_maintenance.as_ref());
        apply_config_map(
            dpa,
            recorder,
            &api,
            &maintenance_name,
            BTreeMap::from([(
                REPO_MAINTENANCE_CONFIG_PREFIX.to_string(),
                serde_json::to_string(&block).map_err(Error::SerializationError)?,
            )]),
            None,
        )
        .await?;
    } else {
        delete_if_present(&api, &maintenance_name, recorder).await?;
    }

    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::dpa_types::{
        BackupPvcConfig, Configuration, DpaSpec, LoadConcurrency, VeleroConfig,
    };

    fn dpa_with(configuration: Configuration) -> DataProtectionApplication {
        DataProtectionApplication::new(
            "test",
            DpaSpec {
                configuration: Some(configuration),
                ..DpaSpec::default()
            },
        )
    }

    #[test]
    fn node_agent_config_requires_a_tunable_block() {
        let mut na = NodeAgentConfig {
            enable: Some(true),
            uploader_type: "kopia".to_string(),
            ..NodeAgentConfig::default()
        };
        let dpa = dpa_with(Configuration {
            velero: Some(VeleroConfig::default()),
            node_agent: Some(na.clone()),
            ..Configuration::default()
        });
        assert!(!node_agent_config_required(&dpa));

        na.load_concurrency = Some(LoadConcurrency {
            global_config: Some(4),
            ..LoadConcurrency::default()
        });
        let dpa = dpa_with(Configuration {
            velero: Some(VeleroConfig::default()),
            node_agent: Some(na),
            ..Configuration::default()
        });
        assert!(node_agent_config_required(&dpa));
    }

    #[test]
    fn node_agent_payload_structure_matches_the_sub_blocks() {
        let na = NodeAgentConfig {
            load_concurrency: Some(LoadConcurrency {
                global_config: Some(2),
                ..LoadConcurrency::default()
            }),
            backup_pvc: Some(BTreeMap::from([(
                "fast".to_string(),
                BackupPvcConfig {
                    storage_class: Some("fast-sc".to_string()),
                    read_only: Some(true),
                    ..BackupPvcConfig::default()
                },
            )])),
            ..NodeAgentConfig::default()
        };
        let payload = node_agent_payload(&na).unwrap();
        // compare parsed structure, key order is irrelevant to consumers
        assert_eq!(payload["loadConcurrency"]["globalConfig"], json!(2));
        assert_eq!(payload["backupPVC"]["fast"]["storageClass"], json!("fast-sc"));
        assert_eq!(payload["backupPVC"]["fast"]["readOnly"], json!(true));
        assert!(payload.get("loadAffinity").is_none());
    }

    #[test]
    fn fs_restore_helper_tracks_fs_backup_state() {
        let enabled = dpa_with(Configuration {
            node_agent: Some(NodeAgentConfig {
                enable: Some(true),
                uploader_type: "kopia".to_string(),
                ..NodeAgentConfig::default()
            }),
            ..Configuration::default()
        });
        assert!(fs_restore_helper_required(&enabled));

        let disabled = dpa_with(Configuration {
            node_agent: Some(NodeAgentConfig {
                enable: Some(true),
                uploader_type: "kopia".to_string(),
                disable_fs_backup: Some(true),
                ..NodeAgentConfig::default()
            }),
            ..Configuration::default()
        });
        assert!(!fs_restore_helper_required(&disabled));
    }

    #[test]
    fn artifact_names_are_prefixed_by_kind() {
        assert_eq!(
            artifact_name(NODE_AGENT_CONFIG_PREFIX, "dpa"),
            "node-agent-config-dpa"
        );
    }
}
