/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

pub mod account;
pub mod claim;
pub mod federated_access;
pub mod federated_role;
pub mod pool;
/// Log and trace integrations
pub mod telemetry;

pub mod aws;
/// Metrics
mod metrics;
pub use metrics::Metrics;
pub mod config;
pub mod configmap;
pub mod defaults;
pub mod errors;

#[cfg(test)]
pub mod fixtures;
mod secret;
pub use secret::{copy_secret_to_namespace, fetch_all_decoded_data_from_secret};
pub mod watchers;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("SerializationError: {0}")]
    YamlSerializationError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("AWS Error: {0}")]
    AwsError(#[from] errors::AwsError),

    #[error("Missing Secret Error: {0}")]
    MissingSecretError(String),

    #[error("Missing ConfigMap Key: {0}")]
    MissingConfigKey(String),

    #[error("Invalid Data: {0}")]
    InvalidErr(String),

    #[error("No suitable account: {0}")]
    NoSuitableAccount(String),

    #[error("Account creation blocked: {0}")]
    CreationBlocked(String),

    #[error("Cleanup Error: {0}")]
    CleanupError(String),

    #[error("ValueError: {0}")]
    ValueError(#[from] errors::ValueError),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}")
            .split(|c: char| !c.is_alphanumeric())
            .next()
            .unwrap_or("unknown")
            .to_lowercase()
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::YamlSerializationError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err)
    }
}
