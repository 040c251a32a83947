//! Node-agent daemonset builder and reconciler. Host paths differ per
//! platform, and the whole daemonset drops its privileges when file-system
//! backup is disabled.
use crate::{
    apis::dpa_types::DataProtectionApplication,
    builders::{
        container_mut, env_var, management_labels, merge_env_vars, merge_labels, proxy_env,
    },
    controller::Context,
    defaults,
    registry, Config, Error, OPERATOR_NAME,
};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, DaemonSetSpec},
    core::v1::{
        Capabilities, ConfigMap, Container, EnvVar, EnvVarSource, HostPathVolumeSource, Node,
        ObjectFieldSelector, PodSpec, PodTemplateSpec, SeccompProfile, SecretVolumeSource,
        SecurityContext, Volume, VolumeMount,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder},
    Resource, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::debug;

pub const NODE_AGENT_NAME: &str = "node-agent";
pub const NODE_AGENT_ARGS_ANNOTATION: &str =
    "dataprotection.io/unsupported-node-agent-server-args-cm";

/// Kubelet paths for pod volumes and CSI plugin sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub pods: String,
    pub plugins: String,
}

impl HostPaths {
    pub fn generic() -> Self {
        HostPaths {
            pods: defaults::GENERIC_PODS_HOSTPATH.to_string(),
            plugins: defaults::GENERIC_PLUGINS_HOSTPATH.to_string(),
        }
    }

    pub fn ibm() -> Self {
        HostPaths {
            pods: defaults::IBM_PODS_HOSTPATH.to_string(),
            plugins: defaults::IBM_PLUGINS_HOSTPATH.to_string(),
        }
    }
}

/// Env overrides win; otherwise the node providerID decides the platform
pub async fn resolve_host_paths(ctx: &Context, cfg: &Config) -> Result<HostPaths, Error> {
    let mut paths = if is_ibm_platform(ctx).await? {
        HostPaths::ibm()
    } else {
        HostPaths::generic()
    };
    if let Some(pods) = cfg.fs_pv_hostpath.as_ref() {
        paths.pods = pods.clone();
    }
    if let Some(plugins) = cfg.plugins_hostpath.as_ref() {
        paths.plugins = plugins.clone();
    }
    Ok(paths)
}

async fn is_ibm_platform(ctx: &Context) -> Result<bool, Error> {
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let listing = nodes
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::KubeError)?;
    Ok(listing.items.first().is_some_and(|node| {
        node.spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .map(|id| id.starts_with("ibm"))
            .unwrap_or(false)
    }))
}

fn selector_labels(dpa_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), NODE_AGENT_NAME.to_string()),
        (crate::DPA_NAME_LABEL.to_string(), dpa_name.to_string()),
    ])
}

fn template_labels(dpa_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(dpa_name);
    labels.extend(management_labels(dpa_name));
    labels.insert("component".to_string(), NODE_AGENT_NAME.to_string());
    labels
}

fn server_args(dpa: &DataProtectionApplication) -> Vec<String> {
    let mut args = vec![NODE_AGENT_NAME.to_string(), "server".to_string()];
    let Some(na) = dpa.node_agent() else {
        return args;
    };
    if let Some(velero) = dpa.velero() {
        if !velero.feature_flags.is_empty() {
            args.push(format!("--features={}", velero.feature_flags.join(",")));
        }
    }
    if na.disable_fs_backup == Some(true) {
        args.push("--disable-fs-backup=true".to_string());
    }
    args
}

pub fn build_daemonset(
    dpa: &DataProtectionApplication,
    host_paths: &HostPaths,
    args_override: Option<Vec<String>>,
) -> Result<DaemonSet, Error> {
    let dpa_name = dpa.name_any();
    let na = dpa
        .node_agent()
        .ok_or_else(|| Error::InvalidErr("configuration.nodeAgent is required".to_string()))?;
    let pod_config = na.pod_config.as_ref();
    let fs_backup = na.disable_fs_backup != Some(true);

    let image = registry::resolve_image(dpa, &registry::VELERO_IMAGE);
    let security_context = if fs_backup {
        SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }
    } else {
        SecurityContext {
            privileged: Some(false),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Capabilities::default()
            }),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..SeccompProfile::default()
            }),
            ..SecurityContext::default()
        }
    };

    let mut agent = Container {
        name: NODE_AGENT_NAME.to_string(),
        image: Some(image.clone()),
        image_pull_policy: Some(registry::image_pull_policy(dpa, &image)),
        command: Some(vec!["/velero".to_string()]),
        args: Some(args_override.unwrap_or_else(|| server_args(dpa))),
        security_context: Some(security_context),
        env: Some(vec![
            EnvVar {
                name: "NODE_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        ..ObjectFieldSelector::default()
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            },
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
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "scratch".to_string(),
            mount_path: "/scratch".to_string(),
            ..VolumeMount::default()
        }]),
        resources: pod_config.and_then(|pc| pc.resource_allocations.clone()),
        ..Container::default()
    };
    merge_env_vars(agent.env.get_or_insert_with(Vec::new), &proxy_env());
    if let Some(user_env) = pod_config.and_then(|pc| pc.env.as_ref()) {
        merge_env_vars(agent.env.get_or_insert_with(Vec::new), user_env);
    }

    let mut volumes = vec![Volume {
        name: "scratch".to_string(),
        empty_dir: Some(Default::default()),
        ..Volume::default()
    }];
    if fs_backup {
        volumes.push(Volume {
            name: "host-pods".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: host_paths.pods.clone(),
                ..HostPathVolumeSource::default()
            }),
            ..Volume::default()
        });
        volumes.push(Volume {
            name: "host-plugins".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: host_paths.plugins.clone(),
                ..HostPathVolumeSource::default()
            }),
            ..Volume::default()
        });
        let mounts = agent.volume_mounts.get_or_insert_with(Vec::new);
        mounts.push(VolumeMount {
            name: "host-pods".to_string(),
            mount_path: "/host_pods".to_string(),
            mount_propagation: Some("HostToContainer".to_string()),
            ..VolumeMount::default()
        });
        mounts.push(VolumeMount {
            name: "host-plugins".to_string(),
            mount_path: host_paths.plugins.clone(),
            mount_propagation: Some("HostToContainer".to_string()),
            ..VolumeMount::default()
        });
    }

    let mut pod = PodSpec {
        service_account_name: Some("velero".to_string()),
        containers: vec![agent],
        volumes: Some(volumes),
        node_selector: pod_config.and_then(|pc| pc.node_selector.clone()),
        tolerations: pod_config.and_then(|pc| pc.tolerations.clone()),
        dns_policy: dpa.spec.pod_dns_policy.clone(),
        dns_config: dpa.spec.pod_dns_config.clone(),
        ..PodSpec::default()
    };

    // the agent signs object-store requests itself and needs the same secrets
    if let Some(velero) = dpa.velero() {
        for plugin in &velero.default_plugins {
            let Some(specs) = registry::plugin_specs(plugin) else {
                continue;
            };
            if let (Some(secret), Some(mount), Some(env)) =
                (specs.secret_name, specs.mount_path, specs.credentials_env)
            {
                let pod_volumes = pod.volumes.get_or_insert_with(Vec::new);
                if !pod_volumes.iter().any(|v| v.name == secret) {
                    pod_volumes.push(Volume {
                        name: secret.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(secret.to_string()),
                            ..SecretVolumeSource::default()
                        }),
                        ..Volume::default()
                    });
                }
                let container = container_mut(&mut pod.containers, NODE_AGENT_NAME);
                let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
                if !mounts.iter().any(|m| m.name == secret) {
                    mounts.push(VolumeMount {
                        name: secret.to_string(),
                        mount_path: mount.to_string(),
                        read_only: Some(true),
                        ..VolumeMount::default()
                    });
                }
                merge_env_vars(
                    container.env.get_or_insert_with(Vec::new),
                    &[env_var(env, &format!("{mount}/cloud"))],
                );
            }
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

    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(NODE_AGENT_NAME.to_string()),
            namespace: dpa.namespace(),
            labels: Some(labels.clone()),
            owner_references: dpa.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DaemonSetSpec {
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
            ..DaemonSetSpec::default()
        }),
        status: None,
    })
}

async fn args_override(
    dpa: &DataProtectionApplication,
    ctx: &Context,
) -> Result<Option<Vec<String>>, Error> {
    let Some(cm_name) = dpa.annotations().get(NODE_AGENT_ARGS_ANNOTATION) else {
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
    args.insert(0, NODE_AGENT_NAME.to_string());
    Ok(Some(args))
}

pub async fn reconcile(
    dpa: &DataProtectionApplication,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<bool, Error> {
    let namespace = dpa.namespace().unwrap_or_default();
    let api: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), &namespace);

    if !dpa.node_agent_enabled() {
        match api.delete(NODE_AGENT_NAME, &Default::default()).await {
            Ok(_) => debug!("deleted daemonset {NODE_AGENT_NAME}"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
        return Ok(true);
    }

    let cfg = Config::default();
    let host_paths = resolve_host_paths(ctx, &cfg).await?;
    let daemonset = build_daemonset(dpa, &host_paths, args_override(dpa, ctx).await?)?;
    let params = PatchParams::apply(OPERATOR_NAME).force();
    api.patch(NODE_AGENT_NAME, &params, &Patch::Apply(&daemonset))
        .await
        .map_err(Error::KubeError)?;
    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: "NodeAgentDaemonsetReconciled".into(),
            note: Some(format!("Applied daemonset {NODE_AGENT_NAME}")),
            action: "Apply".into(),
            secondary: None,
        })
        .await
        .map_err(Error::KubeError)?;
    Ok(true)
}
