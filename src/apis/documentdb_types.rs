use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::defaults;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Generate the Kubernetes wrapper struct `DocumentDB` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "DocumentDB",
    group = "documentdb.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "DocumentDBStatus", shortname = "ddb")]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBSpec {
    /// Number of DocumentDB nodes. Only single-node clusters are provisioned
    /// today; the field exists so multi-node declarations round-trip.
    #[serde(default = "defaults::default_node_count")]
    pub node_count: i32,

    /// Stateful instances the CNPG cluster runs per node.
    #[serde(default = "defaults::default_instances_per_node")]
    pub instances_per_node: i32,

    #[serde(default = "defaults::default_resource")]
    pub resource: DocumentDBResource,

    /// Full engine image reference; takes precedence over every version field.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "documentDBImage")]
    pub documentdb_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "documentDBVersion")]
    pub documentdb_version: Option<String>,

    /// Secret holding the gateway admin username/password. Defaults to the
    /// operator-wide well-known name when unset.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "documentDbCredentialSecret"
    )]
    pub documentdb_credential_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose_via_service: Option<ExposeViaService>,

    /// Cloud the cluster runs on; selects load-balancer annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_injector_plugin_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_replication: Option<ClusterReplication>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpecOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<Bootstrap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<Timeouts>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBResource {
    pub storage: DocumentDBStorage,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBStorage {
    #[serde(default = "defaults::default_pvc_size")]
    pub pvc_size: Quantity,
    /// Unset means the cluster's default StorageClass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposeViaService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub enum ServiceType {
    ClusterIP,
    LoadBalancer,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Aks,
    Eks,
    Gke,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayTls>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTls {
    #[serde(default)]
    pub mode: TlsMode,
    /// Only meaningful when mode is Provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provided: Option<ProvidedTls>,
    /// Only meaningful when mode is CertManager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_manager: Option<CertManagerTls>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Disabled,
    SelfSigned,
    Provided,
    CertManager,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvidedTls {
    pub secret_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerTls {
    pub issuer_ref: IssuerRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct IssuerRef {
    pub name: String,
    /// Defaults to "Issuer" when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Defaults to the cert-manager API group when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReplication {
    /// Cluster-member currently acting as primary of the replication group.
    pub primary: String,
    pub cluster_list: Vec<ClusterMember>,
    #[serde(default)]
    pub cross_cloud_networking_strategy: CrossCloudNetworkingStrategy,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_override: Option<Environment>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum CrossCloudNetworkingStrategy {
    #[default]
    None,
    AzureFleet,
    Istio,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpecOptions {
    /// Days a completed backup is kept before it self-deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<BootstrapRecovery>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRecovery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<RecoveryBackup>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct RecoveryBackup {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Seconds CNPG waits for a clean instance shutdown (maxStopDelay).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_delay: Option<i64>,
}

/// The status object of `DocumentDB`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBStatus {
    /// Phase string mirrored from the CNPG cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsStatus>,

    /// Desired primary pod during an operator-driven failover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,

    /// Primary pod last observed as settled; lags targetPrimary while a
    /// failover is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_primary: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TlsMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DocumentDB {
    pub fn gateway_tls(&self) -> Option<&GatewayTls> {
        self.spec.tls.as_ref().and_then(|tls| tls.gateway.as_ref())
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.gateway_tls().map(|gw| gw.mode).unwrap_or(TlsMode::Disabled)
    }

    /// True once the gateway certificate comes from a trusted chain, so
    /// clients do not need to skip certificate verification.
    pub fn tls_trusted(&self) -> bool {
        matches!(self.tls_mode(), TlsMode::Provided | TlsMode::CertManager)
    }

    pub fn recovery_backup_name(&self) -> Option<&str> {
        self.spec
            .bootstrap
            .as_ref()
            .and_then(|b| b.recovery.as_ref())
            .and_then(|r| r.backup.as_ref())
            .map(|b| b.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_deserialize() {
        let db: DocumentDB = serde_json::from_value(serde_json::json!({
            "apiVersion": "documentdb.io/v1alpha1",
            "kind": "DocumentDB",
            "metadata": {"name": "minimal", "namespace": "default"},
            "spec": {
                "nodeCount": 1,
                "instancesPerNode": 1,
                "resource": {"storage": {"pvcSize": "10Gi"}},
                "exposeViaService": {"serviceType": "ClusterIP"}
            }
        }))
        .unwrap();
        assert_eq!(db.spec.node_count, 1);
        assert_eq!(db.spec.resource.storage.pvc_size.0, "10Gi");
        assert_eq!(
            db.spec.expose_via_service.unwrap().service_type,
            Some(ServiceType::ClusterIP)
        );
        assert_eq!(db.spec.documentdb_credential_secret, None);
    }

    #[test]
    fn test_tls_mode_defaults_to_disabled() {
        let db = DocumentDB::new("t", DocumentDBSpec::default());
        assert_eq!(db.tls_mode(), TlsMode::Disabled);
        assert!(!db.tls_trusted());
    }

    #[test]
    fn test_environment_parses_lowercase() {
        let env: Environment = serde_json::from_str("\"aks\"").unwrap();
        assert_eq!(env, Environment::Aks);
    }

    #[test]
    fn test_recovery_backup_name() {
        let db = DocumentDB::new(
            "t",
            DocumentDBSpec {
                bootstrap: Some(Bootstrap {
                    recovery: Some(BootstrapRecovery {
                        backup: Some(RecoveryBackup {
                            name: "seed".to_string(),
                        }),
                    }),
                }),
                ..DocumentDBSpec::default()
            },
        );
        assert_eq!(db.recovery_backup_name(), Some("seed"));
    }
}
