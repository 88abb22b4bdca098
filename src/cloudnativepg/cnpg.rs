use crate::{
    apis::documentdb_types::DocumentDB,
    cloudnativepg::{
        clusters::{
            Cluster, ClusterBackup, ClusterBackupVolumeSnapshot,
            ClusterBackupVolumeSnapshotSnapshotOwnerReference, ClusterBootstrap,
            ClusterBootstrapInitdb, ClusterBootstrapRecovery, ClusterBootstrapRecoveryBackup,
            ClusterExternalClusters, ClusterInheritedMetadata, ClusterPlugins, ClusterPostgresql,
            ClusterReplica, ClusterReplicationSlots, ClusterReplicationSlotsHighAvailability,
            ClusterSpec, ClusterStorage,
        },
        cnpg_utils::{patch_cluster_merge, update_documentdb_status},
    },
    config::Config,
    defaults,
    psql::PsqlCommand,
    replication::{ReplicationContext, ReplicationState},
    Context, GATEWAY_TLS_REV_ANNOTATION,
};
use chrono::Utc;
use json_patch::{AddOperation, Patch as JsonPatch, PatchOperation, RemoveOperation, ReplaceOperation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Patch, PatchParams, PostParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, Resource, ResourceExt,
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Cluster spec paths this operator manages. The delta between desired and
/// current is computed only along these paths; anything else the PG-operator
/// or a user writes to the Cluster is left as-is.
pub const MANAGED_CLUSTER_PATHS: &[&str] = &[
    "/spec/instances",
    "/spec/postgresql",
    "/spec/plugins",
    "/spec/replica",
    "/spec/replicationSlots",
];

const GATEWAY_IMAGE_PARAM: &str = "gatewayImage";
const GATEWAY_TLS_SECRET_PARAM: &str = "gatewayTLSSecret";

fn cnpg_postgresql_config() -> ClusterPostgresql {
    let parameters = BTreeMap::from([
        ("max_replication_slots".to_string(), "10".to_string()),
        ("max_wal_senders".to_string(), "10".to_string()),
    ]);
    ClusterPostgresql {
        parameters: Some(parameters),
        shared_preload_libraries: Some(vec![
            "pg_cron".to_string(),
            "pg_documentdb_core".to_string(),
            "pg_documentdb".to_string(),
        ]),
        pg_hba: Some(vec!["host replication all all trust".to_string()]),
    }
}

fn cnpg_sidecar_plugin(
    db: &DocumentDB,
    cfg: &Config,
    gateway_tls_secret: Option<&str>,
) -> ClusterPlugins {
    let mut parameters = BTreeMap::from([(
        GATEWAY_IMAGE_PARAM.to_string(),
        defaults::resolve_gateway_image(db, cfg),
    )]);
    if let Some(secret) = gateway_tls_secret {
        parameters.insert(GATEWAY_TLS_SECRET_PARAM.to_string(), secret.to_string());
    }
    if let Some(log_level) = &db.spec.log_level {
        parameters.insert("logLevel".to_string(), log_level.clone());
    }
    ClusterPlugins {
        name: defaults::sidecar_injector_plugin_name(db),
        enabled: Some(true),
        parameters: Some(parameters),
    }
}

fn cnpg_bootstrap(db: &DocumentDB, repl: &ReplicationContext) -> ClusterBootstrap {
    if let (Some(backup_name), true) = (db.recovery_backup_name(), repl.is_primary()) {
        return ClusterBootstrap {
            recovery: Some(ClusterBootstrapRecovery {
                backup: Some(ClusterBootstrapRecoveryBackup {
                    name: backup_name.to_string(),
                }),
                source: None,
            }),
            initdb: None,
        };
    }
    ClusterBootstrap {
        initdb: Some(ClusterBootstrapInitdb {
            post_init_sql: Some(vec![
                "CREATE EXTENSION IF NOT EXISTS documentdb CASCADE".to_string(),
                "CREATE ROLE documentdb_admin_role LOGIN".to_string(),
                "ALTER ROLE documentdb_admin_role SUPERUSER".to_string(),
            ]),
            ..ClusterBootstrapInitdb::default()
        }),
        recovery: None,
    }
}

fn cnpg_backup_config() -> ClusterBackup {
    ClusterBackup {
        volume_snapshot: Some(ClusterBackupVolumeSnapshot {
            online: Some(true),
            // Snapshots die with their Backup resource, not with the cluster
            snapshot_owner_reference: Some(
                ClusterBackupVolumeSnapshotSnapshotOwnerReference::Backup,
            ),
            class_name: None,
        }),
        target: Some("primary".to_string()),
    }
}

fn cnpg_replication(
    db: &DocumentDB,
    repl: &ReplicationContext,
    cfg: &Config,
) -> (
    Option<ClusterReplica>,
    Option<Vec<ClusterExternalClusters>>,
    Option<ClusterReplicationSlots>,
) {
    if !repl.is_replicating() {
        let slots = (db.spec.instances_per_node > 1).then(|| ClusterReplicationSlots {
            high_availability: Some(ClusterReplicationSlotsHighAvailability {
                enabled: Some(true),
            }),
            update_interval: Some(30),
        });
        return (None, None, slots);
    }

    let replica = match repl.state {
        ReplicationState::Replica => repl.replication_source().map(|source| ClusterReplica {
            enabled: Some(true),
            source,
        }),
        _ => None,
    };

    let external_clusters: Vec<ClusterExternalClusters> = repl
        .others
        .iter()
        .map(|other| ClusterExternalClusters {
            name: other.clone(),
            connection_parameters: Some(BTreeMap::from([
                ("host".to_string(), repl.rw_service_host(other)),
                ("port".to_string(), cfg.postgres_port.to_string()),
                ("user".to_string(), "streaming_replica".to_string()),
                ("dbname".to_string(), "postgres".to_string()),
            ])),
        })
        .collect();

    let slots = Some(ClusterReplicationSlots {
        high_availability: Some(ClusterReplicationSlotsHighAvailability {
            enabled: Some(true),
        }),
        update_interval: Some(30),
    });

    (replica, Some(external_clusters), slots)
}

/// Desired CNPG Cluster: a pure function of the DocumentDB, the resolved
/// replication context and the TLS secret already surfaced in status.
#[instrument(skip(db, repl), fields(instance_name = %db.name_any()))]
pub fn cnpg_cluster_from_documentdb(
    db: &DocumentDB,
    repl: &ReplicationContext,
    gateway_tls_secret: Option<&str>,
) -> Cluster {
    let cfg = Config::default();
    let name = repl.self_name.clone();
    let namespace = db.namespace().unwrap();
    let owner_reference = db.controller_owner_ref(&()).unwrap();

    let (replica, external_clusters, replication_slots) = cnpg_replication(db, repl, &cfg);

    let labels = BTreeMap::from([
        ("app".to_string(), name.clone()),
        ("replica_type".to_string(), "primary".to_string()),
    ]);

    let max_stop_delay = db
        .spec
        .timeouts
        .as_ref()
        .and_then(|t| t.stop_delay)
        .unwrap_or_else(defaults::default_stop_delay);

    Cluster {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            owner_references: Some(vec![owner_reference]),
            ..ObjectMeta::default()
        },
        spec: ClusterSpec {
            instances: i64::from(db.spec.instances_per_node),
            image_name: Some(defaults::resolve_documentdb_image(db, &cfg)),
            inherited_metadata: Some(ClusterInheritedMetadata {
                labels: Some(labels),
                annotations: None,
            }),
            plugins: Some(vec![cnpg_sidecar_plugin(db, &cfg, gateway_tls_secret)]),
            postgresql: Some(cnpg_postgresql_config()),
            bootstrap: Some(cnpg_bootstrap(db, repl)),
            replica,
            external_clusters,
            replication_slots,
            backup: Some(cnpg_backup_config()),
            max_stop_delay: Some(max_stop_delay),
            storage: Some(ClusterStorage {
                resize_in_use_volumes: Some(true),
                size: Some(db.spec.resource.storage.pvc_size.0.clone()),
                storage_class: repl.storage_class.clone(),
            }),
        },
        status: None,
    }
}

/// Delta between the current and desired Cluster along the managed paths
/// only, so fields the PG-operator defaults or mutates are never fought over.
pub fn managed_paths_delta(current: &Value, desired: &Value) -> JsonPatch {
    let mut ops = Vec::new();
    for path in MANAGED_CLUSTER_PATHS {
        let current_value = current.pointer(path);
        let desired_value = desired.pointer(path);
        match (current_value, desired_value) {
            (Some(cur), Some(want)) if cur != want => {
                ops.push(PatchOperation::Replace(ReplaceOperation {
                    path: (*path).to_string(),
                    value: want.clone(),
                }));
            }
            (None, Some(want)) => {
                ops.push(PatchOperation::Add(AddOperation {
                    path: (*path).to_string(),
                    value: want.clone(),
                }));
            }
            (Some(_), None) => {
                ops.push(PatchOperation::Remove(RemoveOperation {
                    path: (*path).to_string(),
                }));
            }
            _ => {}
        }
    }
    JsonPatch(ops)
}

fn gateway_tls_param_of(cluster: &Cluster) -> Option<String> {
    cluster
        .spec
        .plugins
        .as_ref()
        .and_then(|plugins| plugins.first())
        .and_then(|plugin| plugin.parameters.as_ref())
        .and_then(|params| params.get(GATEWAY_TLS_SECRET_PARAM))
        .cloned()
}

/// Create or converge the CNPG Cluster. Returns the requeue the caller should
/// apply when the TLS secret binding changed and pods are being rerolled.
#[instrument(skip(db, ctx, repl), fields(instance_name = %db.name_any()))]
pub async fn reconcile_cnpg(
    db: &DocumentDB,
    ctx: Arc<Context>,
    repl: &ReplicationContext,
) -> Result<(), Action> {
    let namespace = db.metadata.namespace.as_ref().ok_or_else(|| {
        error!("Namespace is empty for instance: {}.", db.name_any());
        Action::requeue(Duration::from_secs(10))
    })?;

    let gateway_tls_secret = db
        .status
        .as_ref()
        .and_then(|s| s.tls.as_ref())
        .filter(|tls| tls.ready)
        .and_then(|tls| tls.secret_name.clone());

    let desired = cnpg_cluster_from_documentdb(db, repl, gateway_tls_secret.as_deref());
    let name = desired.name_any();
    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace);

    let maybe_cluster = cluster_api.get_opt(&name).await.map_err(|e| {
        error!("Error getting Cluster {}: {}", name, e);
        Action::requeue(Duration::from_secs(10))
    })?;

    let current = match maybe_cluster {
        None => {
            info!("Creating Cluster for instance: {}", name);
            cluster_api
                .create(&PostParams::default(), &desired)
                .await
                .map_err(|e| {
                    error!("Error creating Cluster {}: {}", name, e);
                    Action::requeue(Duration::from_secs(10))
                })?;
            return Ok(());
        }
        Some(current) => current,
    };

    let tls_binding_changed =
        gateway_tls_secret.is_some() && gateway_tls_param_of(&current) != gateway_tls_secret;

    let current_value = serde_json::to_value(&current).map_err(|e| {
        error!("Error serializing current Cluster {}: {}", name, e);
        Action::requeue(Duration::from_secs(10))
    })?;
    let desired_value = serde_json::to_value(&desired).map_err(|e| {
        error!("Error serializing desired Cluster {}: {}", name, e);
        Action::requeue(Duration::from_secs(10))
    })?;

    let delta = managed_paths_delta(&current_value, &desired_value);
    if !delta.0.is_empty() {
        debug!("Applying {} patch ops to Cluster {}", delta.0.len(), name);
        cluster_api
            .patch(&name, &PatchParams::default(), &Patch::Json::<()>(delta))
            .await
            .map_err(|e| {
                error!("Error patching Cluster {}: {}", name, e);
                Action::requeue(Duration::from_secs(10))
            })?;
    }

    if tls_binding_changed {
        // Stamp a revision so the PG-operator rerolls pods with the new secret
        let rev_patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    GATEWAY_TLS_REV_ANNOTATION: Utc::now().to_rfc3339(),
                }
            }
        });
        patch_cluster_merge(db, &ctx, &name, rev_patch).await?;
        info!(
            "Gateway TLS secret bound to Cluster {}, waiting for rollout",
            name
        );
        return Err(Action::requeue(Duration::from_secs(10)));
    }

    Ok(())
}

/// One-time grant letting the `streaming_replica` role stream documentdb
/// tables. Guarded by a SELECT so retries (pod restarts mid-exec included)
/// are harmless.
#[instrument(skip(db, ctx, repl), fields(instance_name = %db.name_any()))]
pub async fn grant_streaming_replica(
    db: &DocumentDB,
    ctx: Arc<Context>,
    repl: &ReplicationContext,
) -> Result<(), Action> {
    if !repl.is_primary() {
        return Ok(());
    }
    let namespace = db.namespace().unwrap();
    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = match cluster_api.get_opt(&repl.self_name).await.map_err(|e| {
        error!("Error getting Cluster {}: {}", repl.self_name, e);
        Action::requeue(Duration::from_secs(10))
    })? {
        Some(cluster) => cluster,
        None => return Ok(()),
    };

    let primary_pod = match cluster
        .status
        .as_ref()
        .and_then(|s| s.current_primary.clone())
    {
        Some(pod) => pod,
        None => {
            debug!("Cluster {} has no current primary yet", repl.self_name);
            return Ok(());
        }
    };
    if !cluster.pod_healthy(&primary_pod) {
        debug!(
            "Primary pod {} of {} is not healthy yet, skipping grant",
            primary_pod, repl.self_name
        );
        return Ok(());
    }

    let guard = PsqlCommand::new(
        primary_pod.clone(),
        namespace.clone(),
        "SELECT 1 FROM pg_roles WHERE rolname='streaming_replica' \
         AND pg_has_role('streaming_replica','documentdb_admin_role','USAGE')"
            .to_string(),
        "postgres".to_string(),
        ctx.clone(),
    )
    .execute()
    .await?;

    if guard.row_count() > 0 {
        debug!("streaming_replica already granted on {}", repl.self_name);
        return Ok(());
    }

    info!("Granting documentdb_admin_role to streaming_replica on {}", repl.self_name);
    let grant = PsqlCommand::new(
        primary_pod,
        namespace,
        "GRANT documentdb_admin_role TO streaming_replica".to_string(),
        "postgres".to_string(),
        ctx,
    )
    .execute()
    .await?;
    if !grant.success {
        warn!(
            "GRANT to streaming_replica failed on {}: {:?}",
            repl.self_name, grant.stderr
        );
        return Err(Action::requeue(Duration::from_secs(10)));
    }
    Ok(())
}

/// Cross-member failover: push the desired target primary into the CNPG
/// cluster's status to start a switchover, then settle `localPrimary` once
/// the cluster catches up.
#[instrument(skip(db, ctx, repl), fields(instance_name = %db.name_any()))]
pub async fn reconcile_failover(
    db: &DocumentDB,
    ctx: Arc<Context>,
    repl: &ReplicationContext,
) -> Result<(), Action> {
    if !repl.is_primary() {
        return Ok(());
    }
    let target = match db.status.as_ref().and_then(|s| s.target_primary.clone()) {
        Some(target) => target,
        None => return Ok(()),
    };

    let namespace = db.namespace().unwrap();
    let name = db.name_any();
    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = match cluster_api.get_opt(&repl.self_name).await.map_err(|e| {
        error!("Error getting Cluster {}: {}", repl.self_name, e);
        Action::requeue(Duration::from_secs(10))
    })? {
        Some(cluster) => cluster,
        None => return Ok(()),
    };

    let cluster_target = cluster.status.as_ref().and_then(|s| s.target_primary.clone());
    if cluster_target.as_deref() != Some(target.as_str()) {
        info!(
            "Initiating switchover of {} to {}",
            repl.self_name, target
        );
        initiate_switchover(&cluster_api, &repl.self_name, &target).await?;
        let recorder = ctx
            .diagnostics
            .read()
            .await
            .recorder(ctx.client.clone(), db.object_ref(&()));
        if let Err(e) = recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "SwitchoverInitiated".into(),
                note: Some(format!(
                    "Switchover of {} to {} requested",
                    repl.self_name, target
                )),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
        {
            warn!("Failed to publish SwitchoverInitiated event: {}", e);
        }
        return Err(Action::requeue(Duration::from_secs(10)));
    }

    let current_primary = cluster
        .status
        .as_ref()
        .and_then(|s| s.current_primary.clone());
    let local_primary = db.status.as_ref().and_then(|s| s.local_primary.clone());
    if current_primary.as_deref() == Some(target.as_str()) && local_primary != current_primary {
        info!("Failover of {} to {} complete", name, target);
        update_documentdb_status(&ctx, &name, &namespace, |status| {
            status.local_primary = Some(target.clone());
        })
        .await?;
    }

    Ok(())
}

/// Write targetPrimary/targetPrimaryTimestamp/phase into the CNPG cluster's
/// status under optimistic-concurrency retry.
async fn initiate_switchover(
    cluster_api: &Api<Cluster>,
    cluster_name: &str,
    target: &str,
) -> Result<(), Action> {
    for _attempt in 0..5 {
        let mut cluster = cluster_api.get(cluster_name).await.map_err(|e| {
            error!("Error getting Cluster {} for switchover: {}", cluster_name, e);
            Action::requeue(Duration::from_secs(10))
        })?;
        let mut status = cluster.status.take().unwrap_or_default();
        status.target_primary = Some(target.to_string());
        status.target_primary_timestamp = Some(Utc::now().to_rfc3339());
        status.phase = Some("Switchover".to_string());
        cluster.status = Some(status);

        let bytes = serde_json::to_vec(&cluster).map_err(|e| {
            error!("Error serializing Cluster for switchover: {}", e);
            Action::requeue(Duration::from_secs(10))
        })?;
        match cluster_api
            .replace_status(cluster_name, &PostParams::default(), bytes)
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => {
                error!("Error patching Cluster status for switchover: {}", e);
                return Err(Action::requeue(Duration::from_secs(10)));
            }
        }
    }
    warn!("Exhausted switchover status retries for {}", cluster_name);
    Err(Action::requeue(Duration::from_secs(10)))
}
