// WARNING: generated by kopium - manual changes will be overwritten
// kopium command: kopium -D Default clusters.postgresql.cnpg.io -A
// kopium version: 0.16.5
// Trimmed to the subset of the Cluster API this operator reads and writes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Specification of the desired behavior of the cluster. More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters"
)]
#[kube(namespaced)]
#[kube(status = "ClusterStatus")]
pub struct ClusterSpec {
    /// Number of instances required in the cluster
    pub instances: i64,
    /// Name of the container image, supporting both tags (`<image>:<tag>`) and digests for deterministic and repeatable deployments (`<image>:<tag>@sha256:<digestValue>`)
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "imageName")]
    pub image_name: Option<String>,
    /// Metadata that will be inherited by all objects related to the Cluster
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "inheritedMetadata"
    )]
    pub inherited_metadata: Option<ClusterInheritedMetadata>,
    /// The plugins configuration, containing any plugin to be loaded with the corresponding configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<ClusterPlugins>>,
    /// Configuration of the PostgreSQL server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<ClusterPostgresql>,
    /// Instructions to bootstrap this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<ClusterBootstrap>,
    /// Replica cluster configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<ClusterReplica>,
    /// The list of external clusters which are used in the configuration
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "externalClusters"
    )]
    pub external_clusters: Option<Vec<ClusterExternalClusters>>,
    /// Replication slots management configuration
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "replicationSlots"
    )]
    pub replication_slots: Option<ClusterReplicationSlots>,
    /// The configuration to be used for backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<ClusterBackup>,
    /// The maximum time in seconds that is allowed for a PostgreSQL instance to gracefully shutdown
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "maxStopDelay"
    )]
    pub max_stop_delay: Option<i64>,
    /// Configuration of the storage of the instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ClusterStorage>,
}

/// Metadata that will be inherited by all objects related to the Cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterInheritedMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// A plugin to be loaded with the corresponding configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ClusterPlugins {
    /// Name is the plugin name
    pub name: String,
    /// Enabled is true if this plugin will be used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Parameters is the configuration of the plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

/// Configuration of the PostgreSQL server
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterPostgresql {
    /// PostgreSQL configuration options (postgresql.conf)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
    /// Lists of shared preload libraries to add to the default ones
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "shared_preload_libraries"
    )]
    pub shared_preload_libraries: Option<Vec<String>>,
    /// PostgreSQL Host Based Authentication rules (lines to be appended to the pg_hba.conf file)
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "pg_hba")]
    pub pg_hba: Option<Vec<String>>,
}

/// Instructions to bootstrap this cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrap {
    /// Bootstrap the cluster via initdb
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initdb: Option<ClusterBootstrapInitdb>,
    /// Bootstrap the cluster from a backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<ClusterBootstrapRecovery>,
}

/// Bootstrap the cluster via initdb
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrapInitdb {
    /// Name of the database used by the application. Default: `app`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Name of the owner of the database in the instance to be used by applications. Defaults to the value of the `database` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// List of SQL queries to be executed as a superuser immediately after the cluster has been created - to be used with extreme care
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "postInitSQL"
    )]
    pub post_init_sql: Option<Vec<String>>,
}

/// Bootstrap the cluster from a backup
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrapRecovery {
    /// The backup object containing the physical base backup from which to initiate the recovery procedure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<ClusterBootstrapRecoveryBackup>,
    /// The external cluster whose backup we will restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The backup object containing the physical base backup from which to initiate the recovery procedure
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrapRecoveryBackup {
    /// Name of the referent.
    pub name: String,
}

/// Replica cluster configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterReplica {
    /// If replica mode is enabled, this cluster will be a replica of an existing cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// The name of the external cluster which is the replication origin
    pub source: String,
}

/// An external cluster which is used in the configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterExternalClusters {
    /// The server name, required
    pub name: String,
    /// The list of connection parameters, such as dbname, host, username, etc
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "connectionParameters"
    )]
    pub connection_parameters: Option<BTreeMap<String, String>>,
}

/// Replication slots management configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterReplicationSlots {
    /// Replication slots for high availability configuration
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "highAvailability"
    )]
    pub high_availability: Option<ClusterReplicationSlotsHighAvailability>,
    /// Standby will update the status of the local replication slots every `updateInterval` seconds (default 30).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "updateInterval"
    )]
    pub update_interval: Option<i64>,
}

/// Replication slots for high availability configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterReplicationSlotsHighAvailability {
    /// If enabled, the operator will automatically manage replication slots on the primary instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// The configuration to be used for backups
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBackup {
    /// VolumeSnapshot provides the configuration for the execution of volume snapshot backups.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "volumeSnapshot"
    )]
    pub volume_snapshot: Option<ClusterBackupVolumeSnapshot>,
    /// The policy to decide which instance should perform backups. Available options are empty string, which will default to `prefer-standby` policy, `primary` to have backups run always on primary instances, `prefer-standby` to have backups run preferably on the most updated standby, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// VolumeSnapshot provides the configuration for the execution of volume snapshot backups.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBackupVolumeSnapshot {
    /// ClassName specifies the Snapshot Class to be used for PG_DATA PersistentVolumeClaim. It is the default class for the other types if no specific class is present
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "className")]
    pub class_name: Option<String>,
    /// Whether the default type of backup with volume snapshots is online/hot (`true`, default) or offline/cold (`false`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    /// SnapshotOwnerReference indicates the type of owner reference the snapshot should have
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "snapshotOwnerReference"
    )]
    pub snapshot_owner_reference: Option<ClusterBackupVolumeSnapshotSnapshotOwnerReference>,
}

/// SnapshotOwnerReference indicates the type of owner reference the snapshot should have
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub enum ClusterBackupVolumeSnapshotSnapshotOwnerReference {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "cluster")]
    Cluster,
    #[serde(rename = "backup")]
    Backup,
}

/// Configuration of the storage of the instances
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterStorage {
    /// Resize existent PVCs, defaults to true
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "resizeInUseVolumes"
    )]
    pub resize_in_use_volumes: Option<bool>,
    /// Size of the storage. Required if not already specified in the PVC template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// StorageClass to use for PVCs. Applied after evaluating the PVC template, if available. If not specified, the generated PVCs will use the default storage class
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "storageClass"
    )]
    pub storage_class: Option<String>,
}

/// Most recently observed status of the cluster. This data may not be up to date. Populated by the system. Read-only. More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterStatus {
    /// Current phase of the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Current primary instance
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "currentPrimary"
    )]
    pub current_primary: Option<String>,
    /// Target primary instance, this is different from the previous one during a switchover or a failover
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "targetPrimary"
    )]
    pub target_primary: Option<String>,
    /// The timestamp when the last request for a new primary has occurred
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "targetPrimaryTimestamp"
    )]
    pub target_primary_timestamp: Option<String>,
    /// The list of instances in the cluster, keyed by their status ("healthy", "replicating", "failed")
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "instancesStatus"
    )]
    pub instances_status: Option<BTreeMap<String, Vec<String>>>,
}

impl Cluster {
    /// True when the named pod is reported healthy by the PG-operator.
    pub fn pod_healthy(&self, pod_name: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.instances_status.as_ref())
            .and_then(|m| m.get("healthy"))
            .map(|pods| pods.iter().any(|p| p == pod_name))
            .unwrap_or(false)
    }
}
