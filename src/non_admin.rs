//! Non-admin controller deployment. Enforcement blocks are tracked by content
//! hash on the pod template, so an enforcement edit rolls the deployment and a
//! controller restart does not.
use crate::{
    apis::dpa_types::{DataProtectionApplication, NonAdmin},
    builders::{env_var, management_labels, merge_env_vars, proxy_env},
    controller::Context,
    registry, Error, OPERATOR_NAME,
};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder},
    Resource, ResourceExt,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

pub const NON_ADMIN_DEPLOYMENT_NAME: &str = "non-admin-controller";
pub const ENFORCED_SPEC_HASH_ANNOTATION: &str = "dataprotection.io/enforced-spec-hash";

/// Stable digest of everything the non-admin controller enforces
pub fn enforcement_hash(non_admin: &NonAdmin) -> Result<String, Error> {
    let canonical = serde_json::to_vec(&(
        &non_admin.enforce_backup_spec,
        &non_admin.enforce_restore_spec,
        &non_admin.garbage_collection_period,
        &non_admin.backup_sync_period,
    ))
    .map_err(Error::SerializationError)?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn selector_labels(dpa_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            NON_ADMIN_DEPLOYMENT_NAME.to_string(),
        ),
        (crate::DPA_NAME_LABEL.to_string(), dpa_name.to_string()),
    ])
}

pub fn build_deployment(dpa: &DataProtectionApplication) -> Result<Deployment, Error> {
    let dpa_name = dpa.name_any();
    let non_admin = dpa
        .spec
        .non_admin
        .as_ref()
        .ok_or_else(|| Error::InvalidErr("nonAdmin block is required".to_string()))?;

    let image = registry::resolve_image(dpa, &registry::NON_ADMIN_IMAGE);
    let mut args = Vec::new();
    if let Some(period) = non_admin.garbage_collection_period.as_ref() {
        args.push(format!("--garbage-collection-period={period}"));
    }
    if let Some(period) = non_admin.backup_sync_period.as_ref() {
        args.push(format!("--backup-sync-period={period}"));
    }

    let mut container = Container {
        name: NON_ADMIN_DEPLOYMENT_NAME.to_string(),
        image: Some(image.clone()),
        image_pull_policy: Some(registry::image_pull_policy(dpa, &image)),
        args: (!args.is_empty()).then_some(args),
        env: Some(vec![EnvVar {
            name: "WATCH_NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..ObjectFieldSelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        }]),
        ..Container::default()
    };
    merge_env_vars(container.env.get_or_insert_with(Vec::new), &proxy_env());
    merge_env_vars(
        container.env.get_or_insert_with(Vec::new),
        &[env_var("DPA_NAME", &dpa_name)],
    );

    let mut labels = selector_labels(&dpa_name);
    labels.extend(management_labels(&dpa_name));

    let annotations = BTreeMap::from([(
        ENFORCED_SPEC_HASH_ANNOTATION.to_string(),
        enforcement_hash(non_admin)?,
    )]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(NON_ADMIN_DEPLOYMENT_NAME.to_string()),
            namespace: dpa.namespace(),
            labels: Some(labels.clone()),
            owner_references: dpa.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&dpa_name)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(NON_ADMIN_DEPLOYMENT_NAME.to_string()),
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

pub async fn reconcile(
    dpa: &DataProtectionApplication,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<bool, Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);

    if !dpa.non_admin_enabled() {
        match api
            .delete(NON_ADMIN_DEPLOYMENT_NAME, &Default::default())
            .await
        {
            Ok(_) => {
                debug!("deleted deployment {NON_ADMIN_DEPLOYMENT_NAME}");
                recorder
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "NonAdminDeploymentDeleteSucceed".into(),
                        note: Some(format!("Deleted deployment {NON_ADMIN_DEPLOYMENT_NAME}")),
                        action: "Delete".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => {
                recorder
                    .publish(Event {
                        type_: EventType::Warning,
                        reason: "NonAdminDeploymentDeleteFailed".into(),
                        note: Some(format!(
                            "Failed to delete deployment {NON_ADMIN_DEPLOYMENT_NAME}: {e}"
                        )),
                        action: "Delete".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
                return Err(Error::KubeError(e));
            }
        }
        return Ok(true);
    }

    let deployment = build_deployment(dpa)?;
    let params = PatchParams::apply(OPERATOR_NAME).force();
    api.patch(NON_ADMIN_DEPLOYMENT_NAME, &params, &Patch::Apply(&deployment))
        .await
        .map_err(Error::KubeError)?;
    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: "NonAdminDeploymentReconciled".into(),
            note: Some(format!("Applied deployment {NON_ADMIN_DEPLOYMENT_NAME}")),
            action: "Apply".into(),
            secondary: None,
        })
        .await
        .map_err(Error::KubeError)?;
    Ok(true)
}
