pub fn default_uploader_type() -> String {
    "kopia".to_owned()
}

pub fn default_log_level() -> String {
    "info".to_owned()
}

/// Host directory the kubelet keeps pod volumes under, on generic platforms
pub const GENERIC_PODS_HOSTPATH: &str = "/var/lib/kubelet/pods";
/// IBM Cloud mounts kubelet state under /var/data instead
pub const IBM_PODS_HOSTPATH: &str = "/var/data/kubelet/pods";
pub const GENERIC_PLUGINS_HOSTPATH: &str = "/var/lib/kubelet/plugins";
pub const IBM_PLUGINS_HOSTPATH: &str = "/var/data/kubelet/plugins";
