use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One-shot backup request for a DocumentDB cluster. Created directly by
/// users or minted by a ScheduledBackup; owned by the referenced DocumentDB
/// so it is collected with the cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "Backup",
    group = "documentdb.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "BackupStatus")]
pub struct BackupSpec {
    pub cluster: ClusterRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ClusterRef {
    /// Name of a DocumentDB in the same namespace.
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    /// Once the clock passes this instant the backup deletes itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BackupPhase {
    Pending,
    Started,
    Running,
    Completed,
    Failed,
}

impl BackupPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupPhase::Completed | BackupPhase::Failed)
    }

    /// CNPG reports phases in lower case ("completed"); normalize on ingest.
    pub fn from_cnpg(phase: &str) -> Option<Self> {
        match phase.to_ascii_lowercase().as_str() {
            "pending" => Some(BackupPhase::Pending),
            "started" => Some(BackupPhase::Started),
            "running" => Some(BackupPhase::Running),
            "completed" => Some(BackupPhase::Completed),
            "failed" => Some(BackupPhase::Failed),
            _ => None,
        }
    }
}

impl Backup {
    pub fn phase(&self) -> Option<BackupPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().map(|p| p.is_terminal()).unwrap_or(false)
    }
}

/// Recurring backup declaration: a five-field cron schedule that mints
/// Backup resources against one DocumentDB.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "ScheduledBackup",
    group = "documentdb.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "ScheduledBackupStatus")]
pub struct ScheduledBackupSpec {
    /// Standard five-field cron expression.
    pub schedule: String,
    pub cluster: ClusterRef,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledBackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_time: Option<String>,
}
