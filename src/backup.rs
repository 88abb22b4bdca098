use crate::{
    apis::{
        backup_types::{Backup, BackupPhase, BackupStatus},
        documentdb_types::DocumentDB,
    },
    cloudnativepg::backups::{
        Backup as CnpgBackup, BackupCluster, BackupMethod, BackupSpec as CnpgBackupSpec,
    },
    defaults::DEFAULT_BACKUP_RETENTION_DAYS,
    replication::ReplicationContext,
    snapshots::{ensure_default_volume_snapshot_class, SnapshotClassError},
    Context, Error,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, Resource, ResourceExt,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Days between stoppedAt and expiry for this backup's cluster.
fn retention_days(db: &DocumentDB) -> i64 {
    db.spec
        .backup
        .as_ref()
        .and_then(|b| b.retention_policy.as_ref())
        .and_then(|policy| policy.parse::<i64>().ok())
        .unwrap_or(DEFAULT_BACKUP_RETENTION_DAYS)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn expiry_of(backup: &Backup) -> Option<DateTime<Utc>> {
    backup
        .status
        .as_ref()
        .and_then(|s| s.expired_at.as_deref())
        .and_then(parse_rfc3339)
}

/// Compute the instant a backup expires from its stop time and retention.
pub fn compute_expired_at(stopped_at: &str, retention_days: i64) -> Option<String> {
    parse_rfc3339(stopped_at).map(|dt| (dt + ChronoDuration::days(retention_days)).to_rfc3339())
}

async fn publish_event(
    backup: &Backup,
    ctx: &Arc<Context>,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let recorder = ctx
        .diagnostics
        .read()
        .await
        .recorder(ctx.client.clone(), backup.object_ref(&()));
    if let Err(e) = recorder
        .publish(Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconciling".into(),
            secondary: None,
        })
        .await
    {
        warn!("Failed to publish {} event: {}", reason, e);
    }
}

async fn update_backup_status<F>(
    ctx: &Arc<Context>,
    name: &str,
    namespace: &str,
    mutate: F,
) -> Result<(), Action>
where
    F: Fn(&mut BackupStatus),
{
    let api: Api<Backup> = Api::namespaced(ctx.client.clone(), namespace);
    for _attempt in 0..5 {
        let mut backup = api.get(name).await.map_err(|e| {
            error!("Error getting Backup {} for status update: {}", name, e);
            Action::requeue(Duration::from_secs(10))
        })?;
        let mut status = backup.status.take().unwrap_or_default();
        mutate(&mut status);
        backup.status = Some(status);

        let bytes = serde_json::to_vec(&backup).map_err(|e| {
            error!("Error serializing Backup status: {}", e);
            Action::requeue(Duration::from_secs(10))
        })?;
        match api.replace_status(name, &PostParams::default(), bytes).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => {
                error!("Error updating Backup status for {}: {}", name, e);
                return Err(Action::requeue(Duration::from_secs(10)));
            }
        }
    }
    warn!("Exhausted status update retries for Backup {}", name);
    Err(Action::requeue(Duration::from_secs(10)))
}

async fn fail_backup(
    backup: &Backup,
    ctx: &Arc<Context>,
    message: String,
) -> Result<Action, Action> {
    warn!("Backup {} failed: {}", backup.name_any(), message);
    publish_event(
        backup,
        ctx,
        EventType::Warning,
        "BackupFailed",
        message.clone(),
    )
    .await;
    update_backup_status(
        ctx,
        &backup.name_any(),
        &backup.namespace().unwrap(),
        move |status| {
            status.phase = Some(BackupPhase::Failed);
            status.error = Some(message.clone());
        },
    )
    .await?;
    Ok(Action::await_change())
}

/// Make sure the backup is controller-owned by the DocumentDB it references,
/// so deleting the cluster collects its backups.
async fn ensure_owned_by_cluster(
    backup: &Backup,
    ctx: &Arc<Context>,
    db: &DocumentDB,
) -> Result<(), Action> {
    let already_owned = backup
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == db.meta().uid.clone().unwrap_or_default()))
        .unwrap_or(false);
    if already_owned {
        return Ok(());
    }
    let api: Api<Backup> = Api::namespaced(ctx.client.clone(), &backup.namespace().unwrap());
    let patch = serde_json::json!({
        "metadata": {
            "ownerReferences": [db.controller_owner_ref(&()).unwrap()],
        }
    });
    api.patch(
        &backup.name_any(),
        &PatchParams::apply("patch_merge"),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| {
        error!("Error setting owner on Backup {}: {}", backup.name_any(), e);
        Action::requeue(Duration::from_secs(10))
    })?;
    Ok(())
}

/// Backup reconcile: expire, then drive the owned CNPG backup and mirror its
/// progress. Terminal statuses are frozen apart from expiry-driven deletion.
#[instrument(skip(backup, ctx), fields(backup_name = %backup.name_any()))]
pub async fn reconcile_backup(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action, Error> {
    match reconcile_backup_inner(&backup, &ctx).await {
        Ok(action) => Ok(action),
        Err(action) => Ok(action),
    }
}

async fn reconcile_backup_inner(
    backup: &Backup,
    ctx: &Arc<Context>,
) -> Result<Action, Action> {
    let name = backup.name_any();
    let namespace = backup.namespace().unwrap();
    let now = Utc::now();

    // 1. Retention expiry: delete self once past expiredAt
    if let Some(expired_at) = expiry_of(backup) {
        if now >= expired_at {
            info!("Backup {} expired at {}, deleting", name, expired_at);
            publish_event(
                backup,
                ctx,
                EventType::Normal,
                "BackupExpired",
                format!("Backup expired at {}", expired_at.to_rfc3339()),
            )
            .await;
            let api: Api<Backup> = Api::namespaced(ctx.client.clone(), &namespace);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => return Ok(Action::await_change()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    return Ok(Action::await_change())
                }
                Err(e) => {
                    error!("Error deleting expired Backup {}: {}", name, e);
                    return Err(Action::requeue(Duration::from_secs(10)));
                }
            }
        }
    }

    // 2. Terminal backups only wait for expiry
    if backup.is_terminal() {
        return Ok(match expiry_of(backup) {
            Some(expired_at) => {
                let until = (expired_at - now).to_std().unwrap_or_default();
                Action::requeue(until.max(std::time::Duration::from_secs(10)))
            }
            None => Action::await_change(),
        });
    }

    // 3. The referenced DocumentDB must exist
    let db_api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &namespace);
    let db = match db_api
        .get_opt(&backup.spec.cluster.name)
        .await
        .map_err(|e| {
            error!("Error getting DocumentDB {}: {}", backup.spec.cluster.name, e);
            Action::requeue(Duration::from_secs(10))
        })? {
        Some(db) => db,
        None => {
            return fail_backup(
                backup,
                ctx,
                format!("DocumentDB {} not found", backup.spec.cluster.name),
            )
            .await;
        }
    };

    ensure_owned_by_cluster(backup, ctx, &db).await?;

    // 4. Volume snapshots need a default class to land in
    match ensure_default_volume_snapshot_class(ctx.client.clone(), db.spec.environment).await {
        Ok(class) => debug!("Using VolumeSnapshotClass {}", class),
        Err(SnapshotClassError::NoDriverForEnvironment) => {
            return fail_backup(
                backup,
                ctx,
                "No default VolumeSnapshotClass exists; create a default VolumeSnapshotClass"
                    .to_string(),
            )
            .await;
        }
        Err(SnapshotClassError::KubeErr(e)) => {
            error!("Error ensuring default VolumeSnapshotClass: {}", e);
            return Err(Action::requeue(Duration::from_secs(10)));
        }
    }

    // 5. Drive the CNPG backup of the same name
    let repl = ReplicationContext::resolve(ctx.client.clone(), &db).await?;
    let cnpg_api: Api<CnpgBackup> = Api::namespaced(ctx.client.clone(), &namespace);
    let cnpg_backup = cnpg_api.get_opt(&name).await.map_err(|e| {
        error!("Error getting CNPG Backup {}: {}", name, e);
        Action::requeue(Duration::from_secs(10))
    })?;

    let cnpg_backup = match cnpg_backup {
        None => {
            info!("Creating CNPG Backup {} for cluster {}", name, repl.self_name);
            let desired = CnpgBackup {
                metadata: kube::api::ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.clone()),
                    owner_references: Some(vec![backup.controller_owner_ref(&()).unwrap()]),
                    ..Default::default()
                },
                spec: CnpgBackupSpec {
                    cluster: BackupCluster {
                        name: repl.self_name.clone(),
                    },
                    method: Some(BackupMethod::VolumeSnapshot),
                    target: None,
                },
                status: None,
            };
            cnpg_api
                .create(&PostParams::default(), &desired)
                .await
                .map_err(|e| {
                    error!("Error creating CNPG Backup {}: {}", name, e);
                    Action::requeue(Duration::from_secs(10))
                })?;
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        Some(b) => b,
    };

    // 6. Mirror progress into our status and compute expiry
    let cnpg_status = cnpg_backup.status.clone().unwrap_or_default();
    let phase = cnpg_status
        .phase
        .as_deref()
        .and_then(BackupPhase::from_cnpg)
        .unwrap_or(BackupPhase::Pending);
    let retention = retention_days(&db);
    let started_at = cnpg_status.started_at.clone();
    let stopped_at = cnpg_status.stopped_at.clone();
    let cnpg_error = cnpg_status.error.clone();
    let expired_at = stopped_at
        .as_deref()
        .and_then(|stopped| compute_expired_at(stopped, retention));

    if phase == BackupPhase::Failed {
        publish_event(
            backup,
            ctx,
            EventType::Warning,
            "BackupFailed",
            cnpg_error.clone().unwrap_or_else(|| "backup failed".to_string()),
        )
        .await;
    }

    let expired_at_for_status = expired_at.clone();
    update_backup_status(ctx, &name, &namespace, move |status| {
        status.phase = Some(phase);
        status.started_at = started_at.clone();
        status.stopped_at = stopped_at.clone();
        status.error = cnpg_error.clone();
        status.expired_at = expired_at_for_status.clone();
    })
    .await?;

    if phase.is_terminal() {
        let requeue = expired_at
            .as_deref()
            .and_then(parse_rfc3339)
            .map(|expiry| (expiry - now).to_std().unwrap_or_default())
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Action::requeue(requeue.max(std::time::Duration::from_secs(10))))
    } else {
        Ok(Action::requeue(Duration::from_secs(10)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::backup_types::{BackupSpec, ClusterRef};
    use crate::apis::documentdb_types::{BackupSpecOptions, DocumentDBSpec};
    use crate::fixtures::{timeout_after_1s, Scenario};

    #[tokio::test]
    async fn expired_backup_publishes_event_and_deletes_itself() {
        let (testctx, fakeserver) = Context::test();
        let backup = Backup::test().with_status(BackupStatus {
            phase: Some(BackupPhase::Completed),
            expired_at: Some((Utc::now() - ChronoDuration::seconds(1)).to_rfc3339()),
            ..BackupStatus::default()
        });
        let mocksrv = fakeserver.run(Scenario::ExpiredBackup(backup.clone()));
        let res = reconcile_backup(Arc::new(backup), testctx).await;
        timeout_after_1s(mocksrv).await;
        let action = res.expect("expiry path succeeds");
        assert_eq!(
            format!("{:?}", action),
            format!("{:?}", Action::await_change())
        );
    }

    #[tokio::test]
    async fn terminal_backup_waits_for_expiry() {
        let (testctx, _fakeserver) = Context::test();
        let backup = Backup::test().with_status(BackupStatus {
            phase: Some(BackupPhase::Completed),
            expired_at: Some((Utc::now() + ChronoDuration::days(1)).to_rfc3339()),
            ..BackupStatus::default()
        });
        // No API calls expected: terminal and unexpired just requeues
        let res = reconcile_backup(Arc::new(backup), testctx).await;
        let action = res.expect("terminal path succeeds");
        assert!(format!("{:?}", action).contains("requeue_after"));
    }

    #[test]
    fn test_retention_defaults_to_thirty_days() {
        let db = DocumentDB::new("d", DocumentDBSpec::default());
        assert_eq!(retention_days(&db), 30);
    }

    #[test]
    fn test_retention_reads_spec_policy() {
        let db = DocumentDB::new(
            "d",
            DocumentDBSpec {
                backup: Some(BackupSpecOptions {
                    retention_policy: Some("7".to_string()),
                }),
                ..DocumentDBSpec::default()
            },
        );
        assert_eq!(retention_days(&db), 7);

        let invalid = DocumentDB::new(
            "d",
            DocumentDBSpec {
                backup: Some(BackupSpecOptions {
                    retention_policy: Some("a week".to_string()),
                }),
                ..DocumentDBSpec::default()
            },
        );
        assert_eq!(retention_days(&invalid), 30);
    }

    #[test]
    fn test_compute_expired_at() {
        let expired = compute_expired_at("2026-01-01T00:00:00Z", 30).unwrap();
        let parsed = parse_rfc3339(&expired).unwrap();
        assert_eq!(
            parsed,
            parse_rfc3339("2026-01-31T00:00:00Z").unwrap()
        );
        assert_eq!(compute_expired_at("not a time", 30), None);
    }

    #[test]
    fn test_expiry_of_reads_status() {
        let mut backup = Backup::new(
            "b",
            BackupSpec {
                cluster: ClusterRef {
                    name: "minimal".to_string(),
                },
            },
        );
        assert_eq!(expiry_of(&backup), None);
        backup.status = Some(BackupStatus {
            expired_at: Some("2026-01-31T00:00:00Z".to_string()),
            ..BackupStatus::default()
        });
        assert_eq!(
            expiry_of(&backup),
            parse_rfc3339("2026-01-31T00:00:00Z")
        );
    }
}
