//! Backup-server deployment builder and reconciler. The builder produces the
//! whole desired spec from the DPA; the reconciler applies it and falls back
//! to delete-and-recreate when the immutable selector is rejected.
use crate::{
    apis::dpa_types::DataProtectionApplication,
    bsl::ResolvedBackupLocation,
    builders::{
        append_unique_mount, append_unique_volume, container_mut, env_var, management_labels,
        merge_env_vars, merge_labels, proxy_env,
    },
    controller::Context,
    credentials::DEFAULT_SECRET_KEY,
    registry,
    Error, OPERATOR_NAME,
};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{
        ConfigMap, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
        ObjectFieldSelector, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Resource, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const VELERO_DEPLOYMENT_NAME: &str = "velero";
/// Key/value pairs of the named config map wholly replace the server argv
pub const SERVER_ARGS_ANNOTATION: &str = "dataprotection.io/unsupported-server-args-cm";

fn selector_labels(dpa_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "velero".to_string()),
        (crate::DPA_NAME_LABEL.to_string(), dpa_name.to_string()),
    ])
}

fn template_labels(dpa_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(dpa_name);
    labels.extend(management_labels(dpa_name));
    labels.insert("component".to_string(), "velero".to_string());
    labels
}

/// Synthesized server argv from the structured args block. Flag order is
/// fixed so repeated builds compare equal.
pub fn server_args(dpa: &DataProtectionApplication) -> Vec<String> {
    let mut args = vec!["server".to_string()];
    let Some(velero) = dpa.velero() else {
        return args;
    };

    if !velero.feature_flags.is_empty() {
        args.push(format!("--features={}", velero.feature_flags.join(",")));
    }
    args.push(format!(
        "--log-level={}",
        velero
            .log_level
            .clone()
            .unwrap_or_else(crate::defaults::default_log_level)
    ));
    if let Some(format) = dpa.spec.log_format.as_ref() {
        args.push(format!("--log-format={format}"));
    }
    if let Some(na) = dpa.node_agent() {
        let uploader = if na.uploader_type.is_empty() {
            crate::defaults::default_uploader_type()
        } else {
            na.uploader_type.clone()
        };
        args.push(format!("--uploader-type={uploader}"));
    }
    if velero.no_default_backup_location {
        args.push("--default-backup-storage-location=".to_string());
    }
    if let Some(timeout) = velero.resource_timeout.as_ref() {
        args.push(format!("--resource-timeout={timeout}"));
    }
    if let Some(timeout) = velero.default_item_operation_timeout.as_ref() {
        args.push(format!("--default-item-operation-timeout={timeout}"));
    }
    if let Some(disable) = velero.disable_informer_cache {
        args.push(format!("--disable-informer-cache={disable}"));
    }
    if let Some(block) = velero.args.as_ref() {
        if let Some(v) = block.backup_sync_period.as_ref() {
            args.push(format!("--backup-sync-period={v}"));
        }
        if let Some(v) = block.fs_backup_timeout.as_ref() {
            args.push(format!("--fs-backup-timeout={v}"));
        }
        if let Some(v) = block.default_item_operation_timeout.as_ref() {
            // the structured block wins over the shorthand field
            args.retain(|a| !a.starts_with("--default-item-operation-timeout="));
            args.push(format!("--default-item-operation-timeout={v}"));
        }
        if let Some(v) = block.default_backup_ttl.as_ref() {
            args.push(format!("--default-backup-ttl={v}"));
        }
        if let Some(v) = block.garbage_collection_frequency.as_ref() {
            args.push(format!("--garbage-collection-frequency={v}"));
        }
        if let Some(v) = block.client_burst {
            args.push(format!("--client-burst={v}"));
        }
        if let Some(v) = block.client_qps {
            args.push(format!("--client-qps={v}"));
        }
    }
    args
}

/// Credential wiring for one provider-class plugin or bucket-backed location
fn wire_credentials(
    pod: &mut PodSpec,
    secret_name: &str,
    mount_path: &str,
    env_name: &str,
) {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    append_unique_volume(
        volumes,
        Volume {
            name: secret_name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
    );
    let container = container_mut(&mut pod.containers, VELERO_DEPLOYMENT_NAME);
    append_unique_mount(
        container.volume_mounts.get_or_insert_with(Vec::new),
        VolumeMount {
            name: secret_name.to_string(),
            mount_path: mount_path.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
    );
    merge_env_vars(
        container.env.get_or_insert_with(Vec::new),
        &[env_var(env_name, &format!("{mount_path}/{DEFAULT_SECRET_KEY}"))],
    );
}

fn plugin_init_containers(dpa: &DataProtectionApplication) -> Vec<Container> {
    let mut inits = Vec::new();
    let Some(velero) = dpa.velero() else {
        return inits;
    };
    for plugin in &velero.default_plugins {
        let Some(specs) = registry::plugin_specs(plugin) else {
            continue;
        };
        let Some(image_ref) = specs.image else {
            continue;
        };
        let image = registry::resolve_image(dpa, &image_ref);
        inits.push(init_container(dpa, plugin, &image));
    }
    for custom in &velero.custom_plugins {
        if inits.iter().any(|c| c.name == custom.name) {
            continue;
        }
        inits.push(init_container(dpa, &custom.name, &custom.image));
    }
    inits
}

fn init_container(dpa: &DataProtectionApplication, name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(registry::image_pull_policy(dpa, image)),
        volume_mounts: Some(vec![VolumeMount {
            name: "plugins".to_string(),
            mount_path: "/target".to_string(),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    }
}

pub fn build_deployment(
    dpa: &DataProtectionApplication,
    locations: &[ResolvedBackupLocation],
    args_override: Option<Vec<String>>,
) -> Result<Deployment, Error> {
    let dpa_name = dpa.name_any();
    let velero = dpa
        .velero()
        .ok_or_else(|| Error::InvalidErr("configuration.velero is required".to_string()))?;
    let pod_config = velero.pod_config.as_ref();

    let image = registry::resolve_image(dpa, &registry::VELERO_IMAGE);
    let mut server = Container {
        name: VELERO_DEPLOYMENT_NAME.to_string(),
        image: Some(image.clone()),
        image_pull_policy: Some(registry::image_pull_policy(dpa, &image)),
        command: Some(vec!["/velero".to_string()]),
        args: Some(args_override.unwrap_or_else(|| server_args(dpa))),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: 8085,
            ..ContainerPort::default()
        }]),
        env: Some(vec![
            EnvVar {
                name: "VELERO_NAMESPACE".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.namespace".to_string(),
                        ..ObjectFieldSelector::default()
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            },
            env_var("VELERO_SCRATCH_DIR", "/scratch"),
            env_var("LD_LIBRARY_PATH", "/plugins"),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "plugins".to_string(),
                mount_path: "/plugins".to_string(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "scratch".to_string(),
                mount_path: "/scratch".to_string(),
                ..VolumeMount::default()
            },
        ]),
        resources: pod_config.and_then(|pc| pc.resource_allocations.clone()),
        ..Container::default()
    };
    merge_env_vars(server.env.get_or_insert_with(Vec::new), &proxy_env());
    if let Some(user_env) = pod_config.and_then(|pc| pc.env.as_ref()) {
        merge_env_vars(server.env.get_or_insert_with(Vec::new), user_env);
    }

    let mut pod = PodSpec {
        service_account_name: Some("velero".to_string()),
        restart_policy: Some("Always".to_string()),
        containers: vec![server],
        init_containers: {
            let inits = plugin_init_containers(dpa);
            (!inits.is_empty()).then_some(inits)
        },
        volumes: Some(vec![
            Volume {
                name: "plugins".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            },
            Volume {
                name: "scratch".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            },
        ]),
        node_selector: pod_config.and_then(|pc| pc.node_selector.clone()),
        tolerations: pod_config.and_then(|pc| pc.tolerations.clone()),
        dns_policy: dpa.spec.pod_dns_policy.clone(),
        dns_config: dpa.spec.pod_dns_config.clone(),
        ..PodSpec::default()
    };

    // provider plugins first, then bucket-backed locations; duplicates collapse
    for plugin in &velero.default_plugins {
        let Some(specs) = registry::plugin_specs(plugin) else {
            continue;
        };
        if let (Some(secret), Some(mount), Some(env)) =
            (specs.secret_name, specs.mount_path, specs.credentials_env)
        {
            wire_credentials(&mut pod, secret, mount, env);
        }
    }
    for location in locations {
        let Some(source) = location.credential.as_ref() else {
            continue;
        };
        let Some(specs) = registry::plugin_specs(&location.provider) else {
            continue;
        };
        if let (Some(mount), Some(env)) = (specs.mount_path, specs.credentials_env) {
            wire_credentials(&mut pod, &source.name, mount, env);
        }
    }

    let labels = merge_labels(
        &template_labels(&dpa_name),
        pod_config.and_then(|pc| pc.labels.as_ref()),
    )?;
    let mut annotations = dpa.spec.pod_annotations.clone().unwrap_or_default();
    if let Some(extra) = pod_config.and_then(|pc| pc.annotations.as_ref()) {
        for (k, v) in extra {
            annotations.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(VELERO_DEPLOYMENT_NAME.to_string()),
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
                    annotations: (!annotations.is_empty()).then_some(annotations),
                    ..ObjectMeta::default()
                }),
                spec: Some(pod),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

/// Argv override from the annotation-named config map, sorted for stability
async fn args_override(
    dpa: &DataProtectionApplication,
    ctx: &Context,
) -> Result<Option<Vec<String>>, Error> {
    let Some(cm_name) = dpa.annotations().get(SERVER_ARGS_ANNOTATION) else {
        return Ok(None);
    };
    let namespace = dpa.namespace().unwrap_or_default();
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    let cm = api.get(cm_name).await.map_err(Error::KubeError)?;
    let mut args: Vec<String> = cm
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| format!("--{k}={v}"))
        .collect();
    args.sort();
    args.insert(0, "server".to_string());
    Ok(Some(args))
}

pub async fn reconcile(
    dpa: &DataProtectionApplication,
    ctx: &Context,
    locations: &[ResolvedBackupLocation],
) -> Result<bool, Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let deployment = build_deployment(dpa, locations, args_override(dpa, ctx).await?)?;
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let params = PatchParams::apply(OPERATOR_NAME).force();

    match api
        .patch(VELERO_DEPLOYMENT_NAME, &params, &Patch::Apply(&deployment))
        .await
    {
        Ok(_) => {
            debug!("applied deployment {VELERO_DEPLOYMENT_NAME}");
            Ok(true)
        }
        // the pod selector is immutable; an old-shape deployment must be replaced
        Err(kube::Error::Api(ae)) if ae.code == 422 => {
            warn!("deployment {VELERO_DEPLOYMENT_NAME} rejected, recreating: {}", ae.message);
            api.delete(VELERO_DEPLOYMENT_NAME, &Default::default())
                .await
                .map_err(Error::KubeError)?;
            api.patch(VELERO_DEPLOYMENT_NAME, &params, &Patch::Apply(&deployment))
                .await
                .map_err(Error::KubeError)?;
            Ok(true)
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}
