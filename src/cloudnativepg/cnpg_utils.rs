pub use crate::{
    apis::documentdb_types::{DocumentDB, DocumentDBStatus},
    cloudnativepg::clusters::Cluster,
    Context,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Api, ResourceExt,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Attempts made on optimistic-concurrency status writes before requeueing.
const STATUS_UPDATE_ATTEMPTS: u32 = 5;

// patch_cluster_merge takes a DocumentDB, context and serde_json::Value and patch merges the Cluster with the new spec
#[instrument(skip(db, ctx, patch), fields(instance_name = %db.name_any()))]
pub async fn patch_cluster_merge(
    db: &DocumentDB,
    ctx: &Arc<Context>,
    cluster_name: &str,
    patch: serde_json::Value,
) -> Result<(), Action> {
    let namespace = db.metadata.namespace.as_ref().ok_or_else(|| {
        error!("Namespace is empty for instance: {}.", db.name_any());
        Action::requeue(Duration::from_secs(10))
    })?;

    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace);
    let pp = PatchParams::apply("patch_merge");
    cluster_api
        .patch(cluster_name, &pp, &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            error!("Error patching cluster: {}", e);
            Action::requeue(Duration::from_secs(10))
        })?;

    Ok(())
}

/// GET-mutate-UPDATE loop for the DocumentDB status subresource. On a 409 the
/// object is re-read and the mutation reapplied, so concurrent writers (the
/// TLS controller and the cluster controller both own status fields) never
/// clobber each other.
#[instrument(skip(ctx, mutate))]
pub async fn update_documentdb_status<F>(
    ctx: &Arc<Context>,
    name: &str,
    namespace: &str,
    mutate: F,
) -> Result<DocumentDB, Action>
where
    F: Fn(&mut DocumentDBStatus),
{
    let api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), namespace);
    for attempt in 1..=STATUS_UPDATE_ATTEMPTS {
        let mut db = api.get(name).await.map_err(|e| {
            error!("Error getting DocumentDB {} for status update: {}", name, e);
            Action::requeue(Duration::from_secs(10))
        })?;
        let mut status = db.status.take().unwrap_or_default();
        mutate(&mut status);
        db.status = Some(status);

        match api
            .replace_status(
                name,
                &PostParams::default(),
                serde_json::to_vec(&db).map_err(|e| {
                    error!("Error serializing DocumentDB status: {}", e);
                    Action::requeue(Duration::from_secs(10))
                })?,
            )
            .await
        {
            Ok(updated) => {
                debug!("Updated DocumentDB status for {}", name);
                return Ok(updated);
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                warn!(
                    "Conflict updating status for {} (attempt {}/{}), retrying",
                    name, attempt, STATUS_UPDATE_ATTEMPTS
                );
                continue;
            }
            Err(e) => {
                error!("Error updating DocumentDB status for {}: {}", name, e);
                return Err(Action::requeue(Duration::from_secs(10)));
            }
        }
    }
    warn!("Exhausted status update retries for {}", name);
    Err(Action::requeue(Duration::from_secs(10)))
}
