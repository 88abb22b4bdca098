//! Helper methods only available for tests
use crate::{
    apis::{
        backup_types::{Backup, BackupSpec, BackupStatus, ClusterRef, ScheduledBackup},
        documentdb_types::{
            DocumentDB, DocumentDBSpec, DocumentDBStatus, GatewayTls, ProvidedTls, TlsMode,
            TlsSpec,
        },
    },
    Context, Metrics,
};
use http::{Request, Response};
use hyper::Body;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

impl DocumentDB {
    /// A normal test DocumentDB
    pub fn test() -> Self {
        let mut d = DocumentDB::new("testdb", DocumentDBSpec::default());
        d.meta_mut().namespace = Some("testns".into());
        d.meta_mut().uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".into());
        d.spec.instances_per_node = 1;
        d
    }

    /// A test DocumentDB asking for a user-provided TLS secret
    pub fn test_with_provided_tls(secret_name: &str) -> Self {
        let mut d = DocumentDB::test();
        d.spec.tls = Some(TlsSpec {
            gateway: Some(GatewayTls {
                mode: TlsMode::Provided,
                provided: Some(ProvidedTls {
                    secret_name: secret_name.to_string(),
                }),
                cert_manager: None,
            }),
        });
        d
    }

    /// Modify a DocumentDB to have an expected status
    pub fn with_status(mut self, status: DocumentDBStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl Backup {
    /// A test Backup referencing the test DocumentDB
    pub fn test() -> Self {
        let mut b = Backup::new(
            "testbackup",
            BackupSpec {
                cluster: ClusterRef {
                    name: "testdb".to_string(),
                },
            },
        );
        b.meta_mut().namespace = Some("testns".into());
        b.meta_mut().uid = Some("b91f19ab-8811-4710-8c42-cc6e87a02f1b".into());
        b
    }

    /// Modify a Backup to have an expected status
    pub fn with_status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// A minimal DocumentDB gets its RBAC trio and a CNPG Cluster created
    MinimalReconcile(DocumentDB),
    /// A deleted DocumentDB has its RBAC objects swept
    CleanupOnMissing(DocumentDB),
    /// Provided-mode TLS with the secret absent surfaces a waiting status
    ProvidedTlsSecretMissing(DocumentDB),
    /// A Backup past its expiry publishes an event and deletes itself
    ExpiredBackup(Backup),
    /// A fresh ScheduledBackup records its next fire time without minting a Backup
    ScheduleNotDueYet(ScheduledBackup, DocumentDB),
    /// A schedule whose tick has passed mints one Backup owned by the DocumentDB
    ScheduleDue(ScheduledBackup, DocumentDB),
    /// A converged cluster produces zero spec writes; only the phase is mirrored
    SteadyStateStatusMirror(DocumentDB),
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

fn conflict_body(kind: &str, name: &str) -> Body {
    Body::from(
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{} \"{}\" already exists", kind, name),
            "reason": "AlreadyExists",
            "code": 409
        })
        .to_string(),
    )
}

fn not_found_body(kind: &str, name: &str) -> Body {
    Body::from(
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{} \"{}\" not found", kind, name),
            "reason": "NotFound",
            "code": 404
        })
        .to_string(),
    )
}

/// Create a responder + verifier object that deals with the main reconcile scenarios
///
/// NB: If the controller is making more calls than we are handling in the
/// scenario, you then typically see a `KubeError(Service(Closed(())))` from
/// the reconciler. Await the `JoinHandle` (with a timeout) to ensure all
/// expected calls were responded to.
impl ApiServerVerifier {
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::MinimalReconcile(db) => self.handle_minimal_reconcile(db).await,
                Scenario::CleanupOnMissing(db) => self.handle_cleanup_on_missing(db).await,
                Scenario::ProvidedTlsSecretMissing(db) => {
                    self.handle_provided_tls_secret_missing(db).await
                }
                Scenario::ExpiredBackup(backup) => self.handle_expired_backup(backup).await,
                Scenario::ScheduleNotDueYet(sb, db) => {
                    self.handle_schedule_not_due_yet(sb, db).await
                }
                Scenario::ScheduleDue(sb, db) => self.handle_schedule_due(sb, db).await,
                Scenario::SteadyStateStatusMirror(db) => {
                    self.handle_steady_state_status_mirror(db).await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    async fn expect(
        &mut self,
        method: http::Method,
        path: &str,
    ) -> (Request<Body>, tower_test::mock::SendResponse<Response<Body>>) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), method, "unexpected method for {}", path);
        assert_eq!(request.uri().path(), path, "unexpected path");
        (request, send)
    }

    async fn handle_minimal_reconcile(mut self, db: DocumentDB) -> Result<Self, kube::Error> {
        let name = db.name_any();

        // Fresh read of the root object
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&db).unwrap()))
                .unwrap(),
        );

        // RBAC trio, created in order
        let (request, send) = self
            .expect(http::Method::POST, "/api/v1/namespaces/testns/serviceaccounts")
            .await;
        let body = request.into_body();
        send.send_response(Response::builder().status(201).body(body).unwrap());

        let (request, send) = self
            .expect(
                http::Method::POST,
                "/apis/rbac.authorization.k8s.io/v1/namespaces/testns/roles",
            )
            .await;
        let body = request.into_body();
        send.send_response(Response::builder().status(201).body(body).unwrap());

        let (request, send) = self
            .expect(
                http::Method::POST,
                "/apis/rbac.authorization.k8s.io/v1/namespaces/testns/rolebindings",
            )
            .await;
        let body = request.into_body();
        send.send_response(Response::builder().status(201).body(body).unwrap());

        // No Cluster yet, so one is created
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/postgresql.cnpg.io/v1/namespaces/testns/clusters/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("clusters.postgresql.cnpg.io", &name))
                .unwrap(),
        );

        let (request, send) = self
            .expect(
                http::Method::POST,
                "/apis/postgresql.cnpg.io/v1/namespaces/testns/clusters",
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let cluster: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        assert_eq!(cluster["spec"]["instances"], json!(1));
        assert_eq!(
            cluster["metadata"]["ownerReferences"][0]["kind"],
            json!("DocumentDB")
        );
        send.send_response(
            Response::builder()
                .status(201)
                .body(Body::from(req_body))
                .unwrap(),
        );

        // Streaming-replica grant looks the Cluster up again
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/postgresql.cnpg.io/v1/namespaces/testns/clusters/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("clusters.postgresql.cnpg.io", &name))
                .unwrap(),
        );

        // Status mirroring reads the Cluster one more time
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/postgresql.cnpg.io/v1/namespaces/testns/clusters/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("clusters.postgresql.cnpg.io", &name))
                .unwrap(),
        );

        Ok(self)
    }

    async fn handle_schedule_due(
        mut self,
        sb: ScheduledBackup,
        db: DocumentDB,
    ) -> Result<Self, kube::Error> {
        let name = sb.name_any();
        let db_name = db.name_any();

        // The referenced cluster exists
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{db_name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&db).unwrap()))
                .unwrap(),
        );

        // The schedule is adopted by the cluster
        let (_request, send) = self
            .expect(
                http::Method::PATCH,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/scheduledbackups/{name}"
                ),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&sb).unwrap()))
                .unwrap(),
        );

        // No backup history, so the tick after the schedule's creation gates
        let (_request, send) = self
            .expect(
                http::Method::GET,
                "/apis/documentdb.io/v1alpha1/namespaces/testns/backups",
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(
                    json!({
                        "apiVersion": "documentdb.io/v1alpha1",
                        "kind": "BackupList",
                        "metadata": {},
                        "items": []
                    })
                    .to_string(),
                ))
                .unwrap(),
        );

        // The tick has passed: exactly one Backup is minted, owned by the
        // DocumentDB and named after the schedule
        let (request, send) = self
            .expect(
                http::Method::POST,
                "/apis/documentdb.io/v1alpha1/namespaces/testns/backups",
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let backup: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        let backup_name = backup["metadata"]["name"].as_str().expect("backup named");
        assert!(
            backup_name.starts_with(&format!("{}-", name)),
            "unexpected backup name {}",
            backup_name
        );
        assert_eq!(
            backup["metadata"]["ownerReferences"][0]["kind"],
            json!("DocumentDB")
        );
        assert_eq!(backup["spec"]["cluster"]["name"], json!(db_name));
        send.send_response(
            Response::builder()
                .status(201)
                .body(Body::from(req_body))
                .unwrap(),
        );

        // Both schedule timestamps are recorded after the fire
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/scheduledbackups/{name}"
                ),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&sb).unwrap()))
                .unwrap(),
        );

        let (request, send) = self
            .expect(
                http::Method::PUT,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/scheduledbackups/{name}/status"
                ),
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let updated: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        assert!(updated["status"]["lastScheduledTime"].is_string());
        assert!(updated["status"]["nextScheduledTime"].is_string());
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());

        Ok(self)
    }

    async fn handle_steady_state_status_mirror(
        mut self,
        db: DocumentDB,
    ) -> Result<Self, kube::Error> {
        use crate::cloudnativepg::clusters::ClusterStatus;
        use crate::replication::ReplicationContext;

        let name = db.name_any();
        // The live Cluster is exactly what the builder would produce, so the
        // managed-path delta must be empty and no PATCH may be issued
        let repl = ReplicationContext::derive(&db, "unused");
        let mut cluster = crate::cloudnativepg::cnpg::cnpg_cluster_from_documentdb(&db, &repl, None);
        cluster.status = Some(ClusterStatus {
            phase: Some("Cluster in healthy state".to_string()),
            ..ClusterStatus::default()
        });

        // Fresh read of the root object
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&db).unwrap()))
                .unwrap(),
        );

        // RBAC creation is attempted every pass and tolerates 409s
        let (_request, send) = self
            .expect(http::Method::POST, "/api/v1/namespaces/testns/serviceaccounts")
            .await;
        send.send_response(
            Response::builder()
                .status(409)
                .body(conflict_body("serviceaccounts", &name))
                .unwrap(),
        );

        let (_request, send) = self
            .expect(
                http::Method::POST,
                "/apis/rbac.authorization.k8s.io/v1/namespaces/testns/roles",
            )
            .await;
        send.send_response(
            Response::builder()
                .status(409)
                .body(conflict_body("roles.rbac.authorization.k8s.io", &name))
                .unwrap(),
        );

        let (_request, send) = self
            .expect(
                http::Method::POST,
                "/apis/rbac.authorization.k8s.io/v1/namespaces/testns/rolebindings",
            )
            .await;
        send.send_response(
            Response::builder()
                .status(409)
                .body(conflict_body("rolebindings.rbac.authorization.k8s.io", &name))
                .unwrap(),
        );

        // The Cluster already matches the desired spec: no write follows
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/postgresql.cnpg.io/v1/namespaces/testns/clusters/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&cluster).unwrap()))
                .unwrap(),
        );

        // The grant step sees no current primary yet and stands down
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/postgresql.cnpg.io/v1/namespaces/testns/clusters/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&cluster).unwrap()))
                .unwrap(),
        );

        // Status mirroring picks up the phase and writes it once
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/postgresql.cnpg.io/v1/namespaces/testns/clusters/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&cluster).unwrap()))
                .unwrap(),
        );

        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&db).unwrap()))
                .unwrap(),
        );

        let (request, send) = self
            .expect(
                http::Method::PUT,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}/status"
                ),
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let updated: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        assert_eq!(
            updated["status"]["status"],
            json!("Cluster in healthy state")
        );
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());

        Ok(self)
    }

    async fn handle_cleanup_on_missing(mut self, db: DocumentDB) -> Result<Self, kube::Error> {
        let name = db.name_any();

        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("documentdbs.documentdb.io", &name))
                .unwrap(),
        );

        // Best-effort sweep of the RBAC objects, all already gone
        let (_request, send) = self
            .expect(
                http::Method::DELETE,
                &format!("/apis/rbac.authorization.k8s.io/v1/namespaces/testns/rolebindings/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("rolebindings.rbac.authorization.k8s.io", &name))
                .unwrap(),
        );

        let (_request, send) = self
            .expect(
                http::Method::DELETE,
                &format!("/apis/rbac.authorization.k8s.io/v1/namespaces/testns/roles/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("roles.rbac.authorization.k8s.io", &name))
                .unwrap(),
        );

        let (_request, send) = self
            .expect(
                http::Method::DELETE,
                &format!("/api/v1/namespaces/testns/serviceaccounts/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("serviceaccounts", &name))
                .unwrap(),
        );

        Ok(self)
    }

    async fn handle_provided_tls_secret_missing(
        mut self,
        db: DocumentDB,
    ) -> Result<Self, kube::Error> {
        let name = db.name_any();
        let secret_name = db
            .gateway_tls()
            .and_then(|gw| gw.provided.as_ref())
            .map(|p| p.secret_name.clone())
            .expect("scenario requires a provided secret name");

        // Fresh read of the root object
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&db).unwrap()))
                .unwrap(),
        );

        // The provided secret does not exist
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/api/v1/namespaces/testns/secrets/{secret_name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .status(404)
                .body(not_found_body("secrets", &secret_name))
                .unwrap(),
        );

        // The waiting status is written through the GET-mutate-UPDATE loop
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&db).unwrap()))
                .unwrap(),
        );

        let (request, send) = self
            .expect(
                http::Method::PUT,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{name}/status"
                ),
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let updated: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        assert_eq!(updated["status"]["tls"]["ready"], json!(false));
        assert_eq!(updated["status"]["tls"]["secretName"], json!(secret_name));
        assert_eq!(
            updated["status"]["tls"]["message"],
            json!("Waiting for provided TLS secret")
        );
        send.send_response(
            Response::builder()
                .body(Body::from(req_body))
                .unwrap(),
        );

        Ok(self)
    }

    async fn handle_expired_backup(mut self, backup: Backup) -> Result<Self, kube::Error> {
        let name = backup.name_any();

        // The expiry event goes out before the deletion
        let (request, send) = self
            .expect(
                http::Method::POST,
                "/apis/events.k8s.io/v1/namespaces/testns/events",
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        assert_eq!(event["reason"], json!("BackupExpired"));
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());

        let (_request, send) = self
            .expect(
                http::Method::DELETE,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/backups/{name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(
                    json!({
                        "kind": "Status",
                        "apiVersion": "v1",
                        "metadata": {},
                        "status": "Success"
                    })
                    .to_string(),
                ))
                .unwrap(),
        );

        Ok(self)
    }

    async fn handle_schedule_not_due_yet(
        mut self,
        sb: ScheduledBackup,
        db: DocumentDB,
    ) -> Result<Self, kube::Error> {
        let name = sb.name_any();
        let db_name = db.name_any();

        // The referenced cluster exists
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!("/apis/documentdb.io/v1alpha1/namespaces/testns/documentdbs/{db_name}"),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&db).unwrap()))
                .unwrap(),
        );

        // The schedule is adopted by the cluster
        let (request, send) = self
            .expect(
                http::Method::PATCH,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/scheduledbackups/{name}"
                ),
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let patch: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        assert_eq!(
            patch["metadata"]["ownerReferences"][0]["kind"],
            json!("DocumentDB")
        );
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&sb).unwrap()))
                .unwrap(),
        );

        // No backups exist yet
        let (_request, send) = self
            .expect(
                http::Method::GET,
                "/apis/documentdb.io/v1alpha1/namespaces/testns/backups",
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(
                    json!({
                        "apiVersion": "documentdb.io/v1alpha1",
                        "kind": "BackupList",
                        "metadata": {},
                        "items": []
                    })
                    .to_string(),
                ))
                .unwrap(),
        );

        // Only nextScheduledTime is recorded; nothing fired
        let (_request, send) = self
            .expect(
                http::Method::GET,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/scheduledbackups/{name}"
                ),
            )
            .await;
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&sb).unwrap()))
                .unwrap(),
        );

        let (request, send) = self
            .expect(
                http::Method::PUT,
                &format!(
                    "/apis/documentdb.io/v1alpha1/namespaces/testns/scheduledbackups/{name}/status"
                ),
            )
            .await;
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let updated: serde_json::Value = serde_json::from_slice(&req_body).unwrap();
        assert!(updated["status"]["nextScheduledTime"].is_string());
        assert!(updated["status"]["lastScheduledTime"].is_null());
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());

        Ok(self)
    }
}

impl Context {
    // Create a test context with a mocked kube client, locally registered metrics and default diagnostics
    pub fn test() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let ctx = Self {
            client: mock_client,
            metrics: Metrics::default(),
            diagnostics: Arc::default(),
            reconcile_lock: Arc::new(Mutex::new(())),
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}
