//! Set-merge helpers shared by the workload builders. Everything here is
//! first-write-wins: template-owned values are placed first and user values
//! never override them silently.
use crate::Error;
use k8s_openapi::api::core::v1::{Container, EnvVar, Volume, VolumeMount};
use std::collections::BTreeMap;

/// Append `extra` env vars, skipping names already present
pub fn merge_env_vars(base: &mut Vec<EnvVar>, extra: &[EnvVar]) {
    for var in extra {
        if !base.iter().any(|existing| existing.name == var.name) {
            base.push(var.clone());
        }
    }
}

/// Merge user labels under template labels. A user label that collides with a
/// template-owned key at a different value is an error rather than a silent
/// override.
pub fn merge_labels(
    template: &BTreeMap<String, String>,
    user: Option<&BTreeMap<String, String>>,
) -> Result<BTreeMap<String, String>, Error> {
    let mut merged = template.clone();
    if let Some(user) = user {
        for (key, value) in user {
            match merged.get(key) {
                Some(existing) if existing != value => {
                    return Err(Error::InvalidErr(format!(
                        "label {key} is owned by the operator and can not be overridden"
                    )));
                }
                Some(_) => {}
                None => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
    }
    Ok(merged)
}

pub fn append_unique_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    if !volumes.iter().any(|existing| existing.name == volume.name) {
        volumes.push(volume);
    }
}

pub fn append_unique_mount(mounts: &mut Vec<VolumeMount>, mount: VolumeMount) {
    if !mounts.iter().any(|existing| existing.name == mount.name) {
        mounts.push(mount);
    }
}

/// Labels every child managed on behalf of a DPA carries
pub fn management_labels(dpa_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            crate::MANAGED_BY_LABEL.to_string(),
            crate::OPERATOR_NAME.to_string(),
        ),
        (crate::DPA_NAME_LABEL.to_string(), dpa_name.to_string()),
    ])
}

/// Cluster-wide proxy settings propagate into every managed container
pub fn proxy_env() -> Vec<EnvVar> {
    ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"]
        .iter()
        .filter_map(|name| {
            std::env::var(name).ok().filter(|v| !v.is_empty()).map(|value| EnvVar {
                name: name.to_string(),
                value: Some(value),
                ..EnvVar::default()
            })
        })
        .collect()
}

pub fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

/// Find a container by name, or push a fresh one and return it
pub fn container_mut<'a>(containers: &'a mut Vec<Container>, name: &str) -> &'a mut Container {
    if let Some(idx) = containers.iter().position(|c| c.name == name) {
        return &mut containers[idx];
    }
    containers.push(Container {
        name: name.to_string(),
        ..Container::default()
    });
    containers.last_mut().unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_merge_is_first_write_wins() {
        let mut base = vec![env_var("A", "template")];
        merge_env_vars(&mut base, &[env_var("A", "user"), env_var("B", "user")]);
        assert_eq!(base.len(), 2);
        assert_eq!(base[0].value.as_deref(), Some("template"));
        assert_eq!(base[1].name, "B");
    }

    #[test]
    fn label_conflicts_with_template_are_rejected() {
        let template = BTreeMap::from([("app".to_string(), "velero".to_string())]);
        let user = BTreeMap::from([("app".to_string(), "mine".to_string())]);
        assert!(merge_labels(&template, Some(&user)).is_err());

        let same = BTreeMap::from([("app".to_string(), "velero".to_string())]);
        assert!(merge_labels(&template, Some(&same)).is_ok());
    }

    #[test]
    fn user_labels_are_added_alongside_template_labels() {
        let template = BTreeMap::from([("app".to_string(), "velero".to_string())]);
        let user = BTreeMap::from([("team".to_string(), "backup".to_string())]);
        let merged = merge_labels(&template, Some(&user)).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn duplicate_volumes_are_dropped() {
        let mut volumes = vec![Volume {
            name: "plugins".to_string(),
            ..Volume::default()
        }];
        append_unique_volume(
            &mut volumes,
            Volume {
                name: "plugins".to_string(),
                ..Volume::default()
            },
        );
        assert_eq!(volumes.len(), 1);
    }
}
