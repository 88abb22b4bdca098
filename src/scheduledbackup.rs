use crate::{
    apis::{
        backup_types::{
            Backup, BackupSpec, ClusterRef, ScheduledBackup, ScheduledBackupStatus,
        },
        documentdb_types::DocumentDB,
    },
    Context, Error,
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, Resource, ResourceExt,
};
use std::{str::FromStr, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Floor for the requeue interval; also the wait applied while another
/// backup for the same cluster is still in flight.
const MIN_REQUEUE: Duration = Duration::from_secs(60);

/// Parse a standard five-field cron expression. The cron crate wants a
/// seconds field, so five-field expressions get a zero-seconds prefix.
pub fn parse_schedule(expression: &str) -> Result<Schedule, Error> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::CronParseError(format!("{}: {}", expression, e)))
}

/// The instant the next backup is due: the cron tick following the last
/// backup's creation, or the tick following the schedule's own creation when
/// no backup exists yet. Anchoring on a stable past instant is what lets the
/// fire gate open once the wall clock passes the tick.
pub fn next_schedule_time(
    schedule: &Schedule,
    last_backup_created: Option<DateTime<Utc>>,
    schedule_created: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let anchor = last_backup_created.unwrap_or(schedule_created);
    schedule.after(&anchor).next()
}

/// Deterministic name for the backup minted at `at`.
pub fn backup_name_for(schedule_name: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", schedule_name, at.format("%Y%m%d%H%M%S"))
}

async fn publish_warning(sb: &ScheduledBackup, ctx: &Arc<Context>, reason: &str, note: String) {
    let recorder = ctx
        .diagnostics
        .read()
        .await
        .recorder(ctx.client.clone(), sb.object_ref(&()));
    if let Err(e) = recorder
        .publish(Event {
            type_: EventType::Warning,
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

async fn update_scheduledbackup_status<F>(
    ctx: &Arc<Context>,
    name: &str,
    namespace: &str,
    mutate: F,
) -> Result<(), Action>
where
    F: Fn(&mut ScheduledBackupStatus),
{
    let api: Api<ScheduledBackup> = Api::namespaced(ctx.client.clone(), namespace);
    for _attempt in 0..5 {
        let mut sb = api.get(name).await.map_err(|e| {
            error!("Error getting ScheduledBackup {}: {}", name, e);
            Action::requeue(Duration::from_secs(10))
        })?;
        let mut status = sb.status.take().unwrap_or_default();
        mutate(&mut status);
        sb.status = Some(status);

        let bytes = serde_json::to_vec(&sb).map_err(|e| {
            error!("Error serializing ScheduledBackup status: {}", e);
            Action::requeue(Duration::from_secs(10))
        })?;
        match api.replace_status(name, &PostParams::default(), bytes).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => {
                error!("Error updating ScheduledBackup status for {}: {}", name, e);
                return Err(Action::requeue(Duration::from_secs(10)));
            }
        }
    }
    warn!("Exhausted status update retries for ScheduledBackup {}", name);
    Err(Action::requeue(Duration::from_secs(10)))
}

async fn ensure_owned_by_cluster(
    sb: &ScheduledBackup,
    ctx: &Arc<Context>,
    db: &DocumentDB,
) -> Result<(), Action> {
    let already_owned = sb
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.uid == db.meta().uid.clone().unwrap_or_default())
        })
        .unwrap_or(false);
    if already_owned {
        return Ok(());
    }
    let api: Api<ScheduledBackup> =
        Api::namespaced(ctx.client.clone(), &sb.namespace().unwrap());
    let patch = serde_json::json!({
        "metadata": {
            "ownerReferences": [db.controller_owner_ref(&()).unwrap()],
        }
    });
    api.patch(
        &sb.name_any(),
        &PatchParams::apply("patch_merge"),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| {
        error!("Error setting owner on ScheduledBackup {}: {}", sb.name_any(), e);
        Action::requeue(Duration::from_secs(10))
    })?;
    Ok(())
}

/// ScheduledBackup reconcile: a timer-less scheduler. Next fire time is
/// recomputed from (schedule, last backup creation) every pass and the
/// reconcile requeues itself at that instant; at most one backup per cluster
/// is in flight at a time.
#[instrument(skip(sb, ctx), fields(schedule_name = %sb.name_any()))]
pub async fn reconcile_scheduledbackup(
    sb: Arc<ScheduledBackup>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    match reconcile_scheduledbackup_inner(&sb, &ctx).await {
        Ok(action) => Ok(action),
        Err(action) => Ok(action),
    }
}

async fn reconcile_scheduledbackup_inner(
    sb: &ScheduledBackup,
    ctx: &Arc<Context>,
) -> Result<Action, Action> {
    let name = sb.name_any();
    let namespace = sb.namespace().unwrap();
    let now = Utc::now();

    // 1. Unparseable schedules halt until the spec changes
    let schedule = match parse_schedule(&sb.spec.schedule) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!("ScheduledBackup {} has an invalid schedule: {}", name, e);
            publish_warning(sb, ctx, "InvalidCronSchedule", e.to_string()).await;
            return Ok(Action::await_change());
        }
    };

    // 2. The schedule dies with its cluster
    let db_api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &namespace);
    let db = match db_api.get_opt(&sb.spec.cluster.name).await.map_err(|e| {
        error!("Error getting DocumentDB {}: {}", sb.spec.cluster.name, e);
        Action::requeue(Duration::from_secs(10))
    })? {
        Some(db) => db,
        None => {
            publish_warning(
                sb,
                ctx,
                "TargetClusterNotFound",
                format!("DocumentDB {} not found", sb.spec.cluster.name),
            )
            .await;
            return Ok(Action::requeue(MIN_REQUEUE));
        }
    };
    ensure_owned_by_cluster(sb, ctx, &db).await?;

    // 3. Single writer per cluster: wait while any backup is in flight
    let backup_api: Api<Backup> = Api::namespaced(ctx.client.clone(), &namespace);
    let backups = backup_api
        .list(&ListParams::default())
        .await
        .map_err(|e| {
            error!("Error listing Backups in {}: {}", namespace, e);
            Action::requeue(Duration::from_secs(10))
        })?;
    let cluster_backups: Vec<&Backup> = backups
        .items
        .iter()
        .filter(|b| b.spec.cluster.name == sb.spec.cluster.name)
        .collect();

    if cluster_backups.iter().any(|b| !b.is_terminal()) {
        debug!(
            "A backup for {} is still in flight, deferring schedule",
            sb.spec.cluster.name
        );
        return Ok(Action::requeue(MIN_REQUEUE));
    }

    // 4. Fire when the cron tick after the last backup has passed
    let last_created: Option<DateTime<Utc>> = cluster_backups
        .iter()
        .filter_map(|b| b.meta().creation_timestamp.as_ref())
        .map(|t| t.0)
        .max();
    let schedule_created = sb
        .meta()
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(now);

    let mut next = match next_schedule_time(&schedule, last_created, schedule_created) {
        Some(next) => next,
        None => {
            publish_warning(
                sb,
                ctx,
                "InvalidCronSchedule",
                format!("schedule {} has no future fire time", sb.spec.schedule),
            )
            .await;
            return Ok(Action::await_change());
        }
    };

    if now >= next {
        let backup_name = backup_name_for(&name, now);
        info!(
            "Schedule {} fired at {}, creating Backup {}",
            name, next, backup_name
        );
        let backup = Backup {
            metadata: kube::api::ObjectMeta {
                name: Some(backup_name),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![db.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            spec: BackupSpec {
                cluster: ClusterRef {
                    name: sb.spec.cluster.name.clone(),
                },
            },
            status: None,
        };
        match backup_api.create(&PostParams::default(), &backup).await {
            Ok(_) => {}
            // Deterministic names make double-fires collide instead of duplicating
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("Backup already created for this tick");
            }
            Err(e) => {
                error!("Error creating Backup: {}", e);
                return Err(Action::requeue(Duration::from_secs(10)));
            }
        }

        let last_scheduled = now.to_rfc3339();
        next = schedule.after(&now).next().unwrap_or(next);
        let next_scheduled = next.to_rfc3339();
        update_scheduledbackup_status(ctx, &name, &namespace, move |status| {
            status.last_scheduled_time = Some(last_scheduled.clone());
            status.next_scheduled_time = Some(next_scheduled.clone());
        })
        .await?;
    } else {
        let next_scheduled = next.to_rfc3339();
        update_scheduledbackup_status(ctx, &name, &namespace, move |status| {
            status.next_scheduled_time = Some(next_scheduled.clone());
        })
        .await?;
    }

    let until_next = (next - Utc::now()).to_std().unwrap_or_default();
    Ok(Action::requeue(until_next.max(MIN_REQUEUE)))
}
