/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

/// Log and trace integrations
pub mod telemetry;

mod exec;
/// Metrics
mod metrics;
pub use metrics::Metrics;
mod config;
pub use config::Config;
pub mod defaults;

pub mod backup;
pub mod certmanager;
pub mod cloudnativepg;
#[cfg(test)]
pub mod fixtures;
pub mod gateway_tls;
pub mod psql;
pub mod rbac;
pub mod replication;
pub mod scheduledbackup;
mod secret;
pub mod service;
pub mod snapshots;

/// Annotation stamped on the CNPG cluster whenever the gateway TLS secret
/// changes, forcing the PG-operator to reroll pods.
pub const GATEWAY_TLS_REV_ANNOTATION: &str = "documentdb.io/gateway-tls-rev";

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("An error occurred in kube-exec: {0}")]
    KubeExecError(String),

    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid Data: {0}")]
    InvalidErr(String),

    #[error("Invalid cron schedule: {0}")]
    CronParseError(String),

    #[error("Missing Secret Error: {0}")]
    MissingSecretError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}
