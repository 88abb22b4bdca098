use chrono::{DateTime, Utc};
use futures::stream::StreamExt;

use crate::{
    apis::{
        backup_types::{Backup, ScheduledBackup},
        documentdb_types::DocumentDB,
    },
    backup::reconcile_backup,
    certmanager::{certificates::Certificate, issuers::Issuer},
    cloudnativepg::{
        backups::Backup as CnpgBackup,
        clusters::Cluster,
        cnpg::{grant_streaming_replica, reconcile_cnpg, reconcile_failover},
        update_documentdb_status,
    },
    gateway_tls::reconcile_gateway_tls,
    rbac::{cleanup_rbac, reconcile_rbac},
    replication::ReplicationContext,
    scheduledbackup::reconcile_scheduledbackup,
    secret::connection_string,
    service::reconcile_service,
    telemetry, Config, Error, Metrics, Result,
};
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Recorder, Reporter},
        watcher::Config as watcherConfig,
    },
    ResourceExt,
};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, RwLock},
    time::Duration,
};
use tracing::*;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Serializes DocumentDB reconciles process-wide so bursty events on
    /// different resources never interleave downstream writes
    pub reconcile_lock: Arc<Mutex<()>>,
}

pub fn requeue_normal_with_jitter() -> Action {
    let cfg = Config::default();
    let jitter = rand::thread_rng().gen_range(0..15);
    Action::requeue(Duration::from_secs(cfg.requeue_long + jitter))
}

#[instrument(skip(ctx, db), fields(trace_id))]
async fn reconcile_documentdb(db: Arc<DocumentDB>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    // One DocumentDB reconcile at a time, process-wide
    let _guard = ctx.reconcile_lock.lock().await;

    let ns = db.namespace().unwrap(); // db is namespace scoped
    let name = db.name_any();
    let api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &ns);

    // Re-read the object; the watch event may race its own deletion. Owned
    // resources cascade through the apiserver, the RBAC objects are swept
    // here.
    let db = match api.get_opt(&name).await.map_err(Error::KubeError)? {
        Some(db) => db,
        None => {
            info!("DocumentDB {} is gone, cleaning up RBAC objects", name);
            cleanup_rbac(ctx.clone(), &name, &ns).await;
            return Ok(Action::await_change());
        }
    };

    debug!("Reconciling DocumentDB \"{}\" in {}", name, ns);
    match db.reconcile(ctx.clone()).await {
        Ok(action) => Ok(action),
        Err(requeue_action) => Ok(requeue_action),
    }
}

#[instrument(skip(ctx, db), fields(trace_id))]
async fn reconcile_documentdb_tls(db: Arc<DocumentDB>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = db.namespace().unwrap();
    let api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &ns);
    let db = match api.get_opt(&db.name_any()).await.map_err(Error::KubeError)? {
        Some(db) => db,
        None => return Ok(Action::await_change()),
    };

    match reconcile_gateway_tls(&db, ctx).await {
        Ok(action) => Ok(action),
        Err(requeue_action) => Ok(requeue_action),
    }
}

fn requeue_for(error: &Error) -> Action {
    match error {
        Error::KubeError(kube::Error::Api(api_error)) if api_error.code == 429 => {
            // Too many requests: back off with jitter instead of hammering
            let backoff: u64 = 60;
            let jitter: u64 = rand::thread_rng().gen_range(0..=120);
            let backoff_with_jitter = Duration::from_secs(backoff + jitter);
            warn!(
                "Received HTTP 429 Too Many Requests. Requeuing after {} seconds.",
                backoff_with_jitter.as_secs()
            );
            Action::requeue(backoff_with_jitter)
        }
        _ => Action::requeue(Duration::from_secs(10)),
    }
}

pub(crate) fn error_policy(db: Arc<DocumentDB>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&db.name_any(), error);
    requeue_for(error)
}

pub(crate) fn tls_error_policy(db: Arc<DocumentDB>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("gateway TLS reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&db.name_any(), error);
    requeue_for(error)
}

pub(crate) fn backup_error_policy(
    backup: Arc<Backup>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    warn!("backup reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&backup.name_any(), error);
    requeue_for(error)
}

pub(crate) fn scheduledbackup_error_policy(
    sb: Arc<ScheduledBackup>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    warn!("scheduled backup reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&sb.name_any(), error);
    requeue_for(error)
}

impl DocumentDB {
    /// The ten-step convergence of one DocumentDB into its downstream set.
    #[instrument(skip(self, ctx))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, Action> {
        let cfg = Config::default();

        // Where does this cluster sit in its replication group?
        let repl = ReplicationContext::resolve(ctx.client.clone(), self).await?;

        // Frontend service, when requested; the returned host feeds status
        let service_host = reconcile_service(self, ctx.clone(), &repl).await?;

        reconcile_rbac(self, ctx.clone()).await.map_err(|e| {
            error!("Error reconciling RBAC for {}: {:?}", self.name_any(), e);
            Action::requeue(Duration::from_secs(10))
        })?;

        // Build and converge the CNPG cluster (including the gateway TLS
        // binding once status.tls reports ready)
        reconcile_cnpg(self, ctx.clone(), &repl).await?;

        grant_streaming_replica(self, ctx.clone(), &repl).await?;

        reconcile_failover(self, ctx.clone(), &repl).await?;

        self.update_status(ctx.clone(), &repl, service_host.as_deref(), &cfg)
            .await?;

        let service_requested = self
            .spec
            .expose_via_service
            .as_ref()
            .and_then(|e| e.service_type.as_ref())
            .is_some();
        if service_requested && service_host.is_none() {
            // Address still pending; come back soon rather than at the
            // steady-state cadence
            return Ok(Action::requeue(Duration::from_secs(cfg.requeue_short)));
        }

        info!("Fully reconciled {}", self.name_any());
        Ok(requeue_normal_with_jitter())
    }

    /// Mirror the CNPG phase and surface the connection string once the
    /// frontend is addressable and allowed to serve.
    #[instrument(skip(self, ctx, repl))]
    async fn update_status(
        &self,
        ctx: Arc<Context>,
        repl: &ReplicationContext,
        service_host: Option<&str>,
        cfg: &Config,
    ) -> Result<(), Action> {
        let name = self.name_any();
        let ns = self.namespace().unwrap();
        let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
        let cluster = cluster_api.get_opt(&repl.self_name).await.map_err(|e| {
            error!("Error getting Cluster {}: {}", repl.self_name, e);
            Action::requeue(Duration::from_secs(10))
        })?;
        let phase = cluster
            .as_ref()
            .and_then(|c| c.status.as_ref())
            .and_then(|s| s.phase.clone());

        let connection = match (service_host, repl.endpoint_enabled(self)) {
            (Some(host), true) => Some(connection_string(self, host, cfg.gateway_port)),
            _ => None,
        };

        let current_phase = self.status.as_ref().and_then(|s| s.status.clone());
        let current_connection = self
            .status
            .as_ref()
            .and_then(|s| s.connection_string.clone());
        let phase_changed = phase.is_some() && phase != current_phase;
        let connection_changed = connection.is_some() && connection != current_connection;
        if !phase_changed && !connection_changed {
            return Ok(());
        }

        debug!("Updating DocumentDB status for {}", name);
        update_documentdb_status(&ctx, &name, &ns, |status| {
            if let Some(phase) = &phase {
                status.status = Some(phase.clone());
            }
            if let Some(connection) = &connection {
                status.connection_string = Some(connection.clone());
            }
        })
        .await?;
        Ok(())
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "documentdb-controller".into(),
        }
    }
}
impl Diagnostics {
    pub(crate) fn recorder(&self, client: Client, reference: ObjectReference) -> Recorder {
        Recorder::new(client, self.reporter.clone(), reference)
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn create_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
            reconcile_lock: Arc::new(Mutex::new(())),
        })
    }
}

fn watch_config() -> watcherConfig {
    watcherConfig::default().any_semantic()
}

/// Initialize the four controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(_) => panic!("Please configure your Kubernetes Context"),
    };

    let documentdbs = Api::<DocumentDB>::all(client.clone());
    if let Err(e) = documentdbs.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let ctx = state.create_context(client.clone());

    let documentdb_controller = Controller::new(documentdbs, watch_config())
        .owns(Api::<Service>::all(client.clone()), watch_config())
        .owns(Api::<Cluster>::all(client.clone()), watch_config())
        .shutdown_on_signal()
        .run(reconcile_documentdb, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let tls_controller = Controller::new(Api::<DocumentDB>::all(client.clone()), watch_config())
        .owns(Api::<Certificate>::all(client.clone()), watch_config())
        .owns(Api::<Issuer>::all(client.clone()), watch_config())
        .shutdown_on_signal()
        .run(reconcile_documentdb_tls, tls_error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let backup_controller = Controller::new(Api::<Backup>::all(client.clone()), watch_config())
        .owns(Api::<CnpgBackup>::all(client.clone()), watch_config())
        .shutdown_on_signal()
        .run(reconcile_backup, backup_error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let scheduledbackup_controller =
        Controller::new(Api::<ScheduledBackup>::all(client.clone()), watch_config())
            .shutdown_on_signal()
            .run(reconcile_scheduledbackup, scheduledbackup_error_policy, ctx)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

    tokio::join!(
        documentdb_controller,
        tls_controller,
        backup_controller,
        scheduledbackup_controller
    );
}
