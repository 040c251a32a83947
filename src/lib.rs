/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

pub mod artifacts;
pub mod bsl;
pub mod bucket;
pub mod builders;
pub mod credentials;
pub mod node_agent;
pub mod non_admin;
pub mod registry;
pub mod validation;
pub mod velero_deployment;
pub mod vsl;
/// Log and trace integrations
pub mod telemetry;

mod config;
pub use config::Config;
mod metrics;
pub use metrics::Metrics;
pub mod defaults;
#[cfg(test)]
pub mod fixtures;

/// API group of the operator's own CRDs
pub const API_GROUP: &str = "dataprotection.io";
pub const OPERATOR_NAME: &str = "dpa-operator";

/// Label pair carried by every object this operator manages
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const DPA_NAME_LABEL: &str = "dataprotection.io/dpa-name";

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0}")]
    Validation(#[from] crate::validation::ValidationError),

    #[error("{0}")]
    ProviderMisconfig(String),

    #[error("bucket provisioning is not supported for provider {0}")]
    ProviderUnsupported(String),

    #[error("Bucket Error: {0}")]
    BucketError(String),

    #[error("Missing Secret Error: {0}")]
    MissingSecretError(String),

    #[error("Invalid Data: {0}")]
    InvalidErr(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serializationerror",
            Error::KubeError(_) => "kubeerror",
            Error::Validation(_) => "validation",
            Error::ProviderMisconfig(_) => "providermisconfig",
            Error::ProviderUnsupported(_) => "providerunsupported",
            Error::BucketError(_) => "bucketerror",
            Error::MissingSecretError(_) => "missingsecreterror",
            Error::InvalidErr(_) => "invaliderr",
        }
        .to_string()
    }

    /// Validation-class errors are surfaced on the status condition and not retried
    /// until the spec changes.
    pub fn is_validation_class(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::ProviderMisconfig(_) | Error::ProviderUnsupported(_)
        )
    }
}
