//! Static plugin table and container image resolution.
//!
//! Image resolution order for any component: the DPA's unsupportedOverrides
//! entry, then the RELATED_IMAGE_* environment variable, then the compiled-in
//! default.
use crate::apis::dpa_types::DataProtectionApplication;

/// Registry entry for a logical plugin name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginSpecs {
    /// provider identity for credential wiring; None for non-cloud plugins
    pub provider: Option<&'static str>,
    pub secret_name: Option<&'static str>,
    pub mount_path: Option<&'static str>,
    /// env var pointing the backup server at the credentials file
    pub credentials_env: Option<&'static str>,
    /// None means the plugin ships inside the server binary (no init container)
    pub image: Option<ImageRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRef {
    pub override_key: &'static str,
    pub related_image_env: &'static str,
    pub default: &'static str,
}

pub const VELERO_IMAGE: ImageRef = ImageRef {
    override_key: "veleroImageFqin",
    related_image_env: "RELATED_IMAGE_VELERO",
    default: "velero/velero:v1.14.1",
};

pub const RESTORE_HELPER_IMAGE: ImageRef = ImageRef {
    override_key: "veleroRestoreHelperImageFqin",
    related_image_env: "RELATED_IMAGE_VELERO_RESTORE_HELPER",
    default: "velero/velero-restore-helper:v1.14.1",
};

pub const NON_ADMIN_IMAGE: ImageRef = ImageRef {
    override_key: "nonAdminControllerImageFqin",
    related_image_env: "RELATED_IMAGE_NON_ADMIN_CONTROLLER",
    default: "quay.io/dpa-operator/non-admin-controller:v0.3.0",
};

/// Look up a logical plugin name in the static table
pub fn plugin_specs(plugin: &str) -> Option<PluginSpecs> {
    let specs = match plugin {
        "aws" => PluginSpecs {
            provider: Some("aws"),
            secret_name: Some("cloud-credentials"),
            mount_path: Some("/credentials"),
            credentials_env: Some("AWS_SHARED_CREDENTIALS_FILE"),
            image: Some(ImageRef {
                override_key: "awsPluginImageFqin",
                related_image_env: "RELATED_IMAGE_VELERO_PLUGIN_FOR_AWS",
                default: "velero/velero-plugin-for-aws:v1.10.1",
            }),
        },
        "legacy-aws" => PluginSpecs {
            provider: Some("aws"),
            secret_name: Some("cloud-credentials"),
            mount_path: Some("/credentials"),
            credentials_env: Some("AWS_SHARED_CREDENTIALS_FILE"),
            image: Some(ImageRef {
                override_key: "legacyAWSPluginImageFqin",
                related_image_env: "RELATED_IMAGE_VELERO_PLUGIN_FOR_LEGACY_AWS",
                default: "velero/velero-plugin-for-legacy-aws:v1.10.1",
            }),
        },
        "gcp" => PluginSpecs {
            provider: Some("gcp"),
            secret_name: Some("cloud-credentials-gcp"),
            mount_path: Some("/credentials-gcp"),
            credentials_env: Some("GOOGLE_APPLICATION_CREDENTIALS"),
            image: Some(ImageRef {
                override_key: "gcpPluginImageFqin",
                related_image_env: "RELATED_IMAGE_VELERO_PLUGIN_FOR_GCP",
                default: "velero/velero-plugin-for-gcp:v1.10.1",
            }),
        },
        "azure" => PluginSpecs {
            provider: Some("azure"),
            secret_name: Some("cloud-credentials-azure"),
            mount_path: Some("/credentials-azure"),
            credentials_env: Some("AZURE_CREDENTIALS_FILE"),
            image: Some(ImageRef {
                override_key: "azurePluginImageFqin",
                related_image_env: "RELATED_IMAGE_VELERO_PLUGIN_FOR_MICROSOFT_AZURE",
                default: "velero/velero-plugin-for-microsoft-azure:v1.10.1",
            }),
        },
        "kubevirt" => PluginSpecs {
            provider: None,
            secret_name: None,
            mount_path: None,
            credentials_env: None,
            image: Some(ImageRef {
                override_key: "kubevirtPluginImageFqin",
                related_image_env: "RELATED_IMAGE_KUBEVIRT_VELERO_PLUGIN",
                default: "quay.io/kubevirt/kubevirt-velero-plugin:v0.7.0",
            }),
        },
        // shipped inside the server binary
        "csi" => PluginSpecs {
            provider: None,
            secret_name: None,
            mount_path: None,
            credentials_env: None,
            image: None,
        },
        _ => return None,
    };
    Some(specs)
}

/// Plugins in the cloud-provider class require credential wiring
pub fn is_cloud_provider_plugin(plugin: &str) -> bool {
    plugin_specs(plugin)
        .map(|s| s.provider.is_some())
        .unwrap_or(false)
}

/// Default secret name for a provider, for locations without a declared credential
pub fn default_secret_for_provider(provider: &str) -> Option<&'static str> {
    match provider {
        "aws" => Some("cloud-credentials"),
        "gcp" => Some("cloud-credentials-gcp"),
        "azure" => Some("cloud-credentials-azure"),
        _ => None,
    }
}

/// Accepted keys for spec.unsupportedOverrides
pub const KNOWN_OVERRIDE_KEYS: &[&str] = &[
    "veleroImageFqin",
    "veleroRestoreHelperImageFqin",
    "nonAdminControllerImageFqin",
    "awsPluginImageFqin",
    "legacyAWSPluginImageFqin",
    "gcpPluginImageFqin",
    "azurePluginImageFqin",
    "kubevirtPluginImageFqin",
];

pub fn resolve_image(dpa: &DataProtectionApplication, image: &ImageRef) -> String {
    if let Some(img) = dpa.spec.unsupported_overrides.get(image.override_key) {
        return img.clone();
    }
    if let Ok(img) = std::env::var(image.related_image_env) {
        if !img.is_empty() {
            return img;
        }
    }
    image.default.to_string()
}

/// Immutable digests never change under a tag, so re-pulling them is pointless
pub fn image_pull_policy(dpa: &DataProtectionApplication, image: &str) -> String {
    if let Some(policy) = dpa.spec.image_pull_policy.as_ref() {
        return policy.clone();
    }
    if image.contains("@sha256:") || image.contains("@sha512:") {
        "IfNotPresent".to_string()
    } else {
        "Always".to_string()
    }
}
