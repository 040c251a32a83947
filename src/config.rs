use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    /// Seconds between successful full reconciles (jitter is added on top)
    pub reconcile_ttl: u64,
    /// Deadline for bucket existence and region probes, seconds
    pub bucket_probe_timeout: u64,
    /// Override for the pod-volume backup host path
    pub fs_pv_hostpath: Option<String>,
    /// Override for the plugin socket dir host path
    pub plugins_hostpath: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_ttl: from_env_default("RECONCILE_TTL", "90").parse().unwrap(),
            bucket_probe_timeout: from_env_default("BUCKET_PROBE_TIMEOUT", "30")
                .parse()
                .unwrap(),
            fs_pv_hostpath: env::var("FS_PV_HOSTPATH").ok().filter(|v| !v.is_empty()),
            plugins_hostpath: env::var("PLUGINS_HOSTPATH").ok().filter(|v| !v.is_empty()),
        }
    }
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}
