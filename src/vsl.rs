//! Snapshot-location reconciler. Same shape as the backup-location pipeline,
//! minus bucket indirection and credential rewriting.
use crate::{
    apis::{
        dpa_types::{DataProtectionApplication, SnapshotLocation},
        velero_types::VolumeSnapshotLocation,
    },
    builders::management_labels,
    credentials,
    controller::Context,
    Error, DPA_NAME_LABEL, MANAGED_BY_LABEL, OPERATOR_NAME,
};
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder},
    Resource, ResourceExt,
};
use std::collections::BTreeSet;
use tracing::debug;

pub fn child_name(dpa_name: &str, entry: &SnapshotLocation, index: usize) -> String {
    entry
        .name
        .clone()
        .unwrap_or_else(|| format!("{dpa_name}-{}", index + 1))
}

pub async fn reconcile(
    dpa: &DataProtectionApplication,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<bool, Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let name = dpa.name_any();
    let api: Api<VolumeSnapshotLocation> = Api::namespaced(ctx.client.clone(), &namespace);
    let params = PatchParams::apply(OPERATOR_NAME).force();

    let mut desired = BTreeSet::new();
    for (index, entry) in dpa.spec.snapshot_locations.iter().enumerate() {
        let Some(spec) = entry.velero.as_ref() else {
            return Err(Error::InvalidErr(format!(
                "snapshotLocation {} must carry a velero spec",
                child_name(&name, entry, index)
            )));
        };
        let child = child_name(&name, entry, index);
        if let Some(selector) = spec.credential.as_ref() {
            let secret_name = selector.name.clone().unwrap_or_default();
            let labelled = credentials::ensure_secret_labels(
                ctx.client.clone(),
                &namespace,
                &secret_name,
                &name,
            )
            .await?;
            if labelled {
                recorder
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "SecretLabelled".into(),
                        note: Some(format!("Labelled secret {secret_name}")),
                        action: "Update".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
        }
        let vsl = VolumeSnapshotLocation {
            metadata: ObjectMeta {
                name: Some(child.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(management_labels(&name)),
                owner_references: dpa.controller_owner_ref(&()).map(|oref| vec![oref]),
                ..ObjectMeta::default()
            },
            spec: spec.clone(),
        };
        api.patch(&child, &params, &Patch::Apply(&vsl))
            .await
            .map_err(Error::KubeError)?;
        debug!("applied VolumeSnapshotLocation {child}");
        desired.insert(child);
    }

    let selector = format!("{MANAGED_BY_LABEL}={OPERATOR_NAME},{DPA_NAME_LABEL}={name}");
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
                reason: "DeletedVolumeSnapshotLocation".into(),
                note: Some(format!("Deleted orphaned VolumeSnapshotLocation {child_name}")),
                action: "Delete".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
    }

    Ok(!dpa.spec.snapshot_locations.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn child_names_follow_the_one_based_index() {
        let entry = SnapshotLocation::default();
        assert_eq!(child_name("dpa", &entry, 0), "dpa-1");
        let named = SnapshotLocation {
            name: Some("snaps".to_string()),
            ..SnapshotLocation::default()
        };
        assert_eq!(child_name("dpa", &named, 1), "snaps");
    }
}
