use crate::{
    apis::documentdb_types::{DocumentDB, TlsMode, TlsStatus},
    certmanager::{
        certificates::{Certificate, CertificateIssuerRef, CertificateSpec},
        issuers::{Issuer, IssuerSelfSigned, IssuerSpec},
        CERT_MANAGER_GROUP,
    },
    cloudnativepg::update_documentdb_status,
    replication::ReplicationContext,
    secret::{check_tls_secret, TlsSecretCheck},
    service::frontend_service_name,
    Context,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument};

/// Certificate lifetime and renewal window handed to the certificate
/// controller: 90 days, renewed 15 days before expiry.
const CERT_DURATION: &str = "2160h";
const CERT_RENEW_BEFORE: &str = "360h";

const READY_MESSAGE: &str = "Gateway TLS certificate ready";
const DISABLED_MESSAGE: &str = "Gateway TLS disabled";

pub fn selfsigned_issuer_name(db: &DocumentDB) -> String {
    format!("{}-gateway-selfsigned", db.name_any())
}

pub fn gateway_certificate_name(db: &DocumentDB) -> String {
    format!("{}-gateway-cert", db.name_any())
}

pub fn default_tls_secret_name(db: &DocumentDB) -> String {
    format!("{}-gateway-cert-tls", db.name_any())
}

/// The gateway service's in-cluster names, in increasing qualification.
fn service_dns_names(db: &DocumentDB, repl: &ReplicationContext) -> Vec<String> {
    let service = frontend_service_name(repl);
    let namespace = db.namespace().unwrap_or_default();
    vec![
        service.clone(),
        format!("{}.{}", service, namespace),
        format!("{}.{}.svc", service, namespace),
    ]
}

/// User-supplied names first, then the service names, first occurrence wins.
fn merge_dns_names(user: &[String], service: Vec<String>) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(user.len() + service.len());
    for name in user.iter().cloned().chain(service) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn desired_certificate(
    db: &DocumentDB,
    name: &str,
    secret_name: &str,
    dns_names: Vec<String>,
    issuer_ref: CertificateIssuerRef,
) -> Certificate {
    Certificate {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: db.namespace(),
            owner_references: Some(vec![db.controller_owner_ref(&()).unwrap()]),
            ..ObjectMeta::default()
        },
        spec: CertificateSpec {
            secret_name: secret_name.to_string(),
            duration: Some(CERT_DURATION.to_string()),
            renew_before: Some(CERT_RENEW_BEFORE.to_string()),
            dns_names: Some(dns_names),
            issuer_ref,
            usages: Some(vec!["server auth".to_string()]),
        },
        status: None,
    }
}

async fn apply_issuer(db: &DocumentDB, ctx: &Arc<Context>) -> Result<String, Action> {
    let name = selfsigned_issuer_name(db);
    let namespace = db.namespace().unwrap();
    let issuer = Issuer {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            owner_references: Some(vec![db.controller_owner_ref(&()).unwrap()]),
            ..ObjectMeta::default()
        },
        spec: IssuerSpec {
            self_signed: Some(IssuerSelfSigned::default()),
        },
    };
    let issuer_api: Api<Issuer> = Api::namespaced(ctx.client.clone(), &namespace);
    let ps = PatchParams::apply("cntrlr").force();
    issuer_api
        .patch(&name, &ps, &Patch::Apply(&issuer))
        .await
        .map_err(|e| {
            error!("Failed to apply Issuer {}: {}", name, e);
            Action::requeue(Duration::from_secs(10))
        })?;
    Ok(name)
}

async fn apply_certificate(
    ctx: &Arc<Context>,
    namespace: &str,
    certificate: &Certificate,
) -> Result<(), Action> {
    let name = certificate.name_any();
    let cert_api: Api<Certificate> = Api::namespaced(ctx.client.clone(), namespace);
    let ps = PatchParams::apply("cntrlr").force();
    debug!("Applying Certificate {} in namespace {}", name, namespace);
    cert_api
        .patch(&name, &ps, &Patch::Apply(certificate))
        .await
        .map_err(|e| {
            error!(
                "Failed to apply Certificate {} in namespace {}: {}",
                name, namespace, e
            );
            Action::requeue(Duration::from_secs(10))
        })?;
    Ok(())
}

/// Write `status.tls` only when it changed; re-running with the same inputs
/// produces no writes.
async fn write_tls_status(
    db: &DocumentDB,
    ctx: &Arc<Context>,
    desired: TlsStatus,
) -> Result<(), Action> {
    let current = db.status.as_ref().and_then(|s| s.tls.as_ref());
    if current == Some(&desired) {
        return Ok(());
    }
    let name = db.name_any();
    let namespace = db.namespace().unwrap();
    update_documentdb_status(ctx, &name, &namespace, |status| {
        status.tls = Some(desired.clone());
    })
    .await?;
    Ok(())
}

/// Poll the named Certificate and surface its readiness into `status.tls`.
async fn reconcile_certificate_readiness(
    db: &DocumentDB,
    ctx: &Arc<Context>,
    cert_name: &str,
    secret_name: &str,
    mode: TlsMode,
) -> Result<Action, Action> {
    let namespace = db.namespace().unwrap();
    let cert_api: Api<Certificate> = Api::namespaced(ctx.client.clone(), &namespace);
    let certificate = cert_api.get_opt(cert_name).await.map_err(|e| {
        error!("Error getting Certificate {}: {}", cert_name, e);
        Action::requeue(Duration::from_secs(10))
    })?;

    let ready = certificate.map(|c| c.is_ready()).unwrap_or(false);
    if ready {
        info!("Certificate {} is ready for {}", cert_name, db.name_any());
        write_tls_status(
            db,
            ctx,
            TlsStatus {
                ready: true,
                mode: Some(mode),
                secret_name: Some(secret_name.to_string()),
                message: Some(READY_MESSAGE.to_string()),
            },
        )
        .await?;
        Ok(Action::requeue(Duration::from_secs(30)))
    } else {
        write_tls_status(
            db,
            ctx,
            TlsStatus {
                ready: false,
                mode: Some(mode),
                secret_name: Some(secret_name.to_string()),
                message: Some(format!("Waiting for certificate {} to become ready", cert_name)),
            },
        )
        .await?;
        Ok(Action::requeue(Duration::from_secs(10)))
    }
}

/// Gateway TLS state machine, keyed on `spec.tls.gateway.mode`. Feeds
/// `status.tls.{ready,secretName}` which the cluster reconciler then binds
/// into the CNPG sidecar plugin.
#[instrument(skip(db, ctx), fields(instance_name = %db.name_any()))]
pub async fn reconcile_gateway_tls(
    db: &DocumentDB,
    ctx: Arc<Context>,
) -> Result<Action, Action> {
    match db.tls_mode() {
        TlsMode::Disabled => {
            let previously_set = db
                .status
                .as_ref()
                .and_then(|s| s.tls.as_ref())
                .map(|tls| tls.ready || tls.message.as_deref() != Some(DISABLED_MESSAGE))
                .unwrap_or(false);
            if previously_set {
                write_tls_status(
                    db,
                    &ctx,
                    TlsStatus {
                        ready: false,
                        mode: Some(TlsMode::Disabled),
                        secret_name: None,
                        message: Some(DISABLED_MESSAGE.to_string()),
                    },
                )
                .await?;
            }
            Ok(Action::await_change())
        }

        TlsMode::SelfSigned => {
            let repl = ReplicationContext::resolve(ctx.client.clone(), db).await?;
            let issuer = apply_issuer(db, &ctx).await?;
            let cert_name = gateway_certificate_name(db);
            let secret_name = default_tls_secret_name(db);
            let certificate = desired_certificate(
                db,
                &cert_name,
                &secret_name,
                service_dns_names(db, &repl),
                CertificateIssuerRef {
                    name: issuer,
                    kind: Some("Issuer".to_string()),
                    group: Some(CERT_MANAGER_GROUP.to_string()),
                },
            );
            apply_certificate(&ctx, &db.namespace().unwrap(), &certificate).await?;
            reconcile_certificate_readiness(db, &ctx, &cert_name, &secret_name, TlsMode::SelfSigned)
                .await
        }

        TlsMode::Provided => {
            let secret_name = match db
                .gateway_tls()
                .and_then(|gw| gw.provided.as_ref())
                .map(|p| p.secret_name.clone())
            {
                Some(name) => name,
                None => {
                    write_tls_status(
                        db,
                        &ctx,
                        TlsStatus {
                            ready: false,
                            mode: Some(TlsMode::Provided),
                            secret_name: None,
                            message: Some(
                                "spec.tls.gateway.provided.secretName is required".to_string(),
                            ),
                        },
                    )
                    .await?;
                    return Ok(Action::await_change());
                }
            };
            let namespace = db.namespace().unwrap();
            let check = check_tls_secret(ctx.client.clone(), &namespace, &secret_name)
                .await
                .map_err(|e| {
                    error!("Error reading provided TLS secret {}: {}", secret_name, e);
                    Action::requeue(Duration::from_secs(10))
                })?;
            let (ready, message) = match check {
                TlsSecretCheck::Missing => {
                    (false, "Waiting for provided TLS secret".to_string())
                }
                TlsSecretCheck::MissingKey(key) => {
                    (false, format!("Provided TLS secret is missing {}", key))
                }
                TlsSecretCheck::Complete => (true, READY_MESSAGE.to_string()),
            };
            write_tls_status(
                db,
                &ctx,
                TlsStatus {
                    ready,
                    mode: Some(TlsMode::Provided),
                    secret_name: Some(secret_name),
                    message: Some(message),
                },
            )
            .await?;
            if ready {
                Ok(Action::requeue(Duration::from_secs(30)))
            } else {
                Ok(Action::requeue(Duration::from_secs(10)))
            }
        }

        TlsMode::CertManager => {
            let cert_manager = match db.gateway_tls().and_then(|gw| gw.cert_manager.as_ref()) {
                Some(cm) => cm.clone(),
                None => {
                    write_tls_status(
                        db,
                        &ctx,
                        TlsStatus {
                            ready: false,
                            mode: Some(TlsMode::CertManager),
                            secret_name: None,
                            message: Some(
                                "spec.tls.gateway.certManager is required".to_string(),
                            ),
                        },
                    )
                    .await?;
                    return Ok(Action::await_change());
                }
            };
            let repl = ReplicationContext::resolve(ctx.client.clone(), db).await?;
            let issuer_ref = CertificateIssuerRef {
                name: cert_manager.issuer_ref.name.clone(),
                kind: Some(
                    cert_manager
                        .issuer_ref
                        .kind
                        .clone()
                        .unwrap_or_else(|| "Issuer".to_string()),
                ),
                group: Some(
                    cert_manager
                        .issuer_ref
                        .group
                        .clone()
                        .unwrap_or_else(|| CERT_MANAGER_GROUP.to_string()),
                ),
            };
            let dns_names =
                merge_dns_names(&cert_manager.dns_names, service_dns_names(db, &repl));
            let cert_name = gateway_certificate_name(db);
            let secret_name = cert_manager
                .secret_name
                .clone()
                .unwrap_or_else(|| default_tls_secret_name(db));
            let certificate =
                desired_certificate(db, &cert_name, &secret_name, dns_names, issuer_ref);
            apply_certificate(&ctx, &db.namespace().unwrap(), &certificate).await?;
            reconcile_certificate_readiness(
                db,
                &ctx,
                &cert_name,
                &secret_name,
                TlsMode::CertManager,
            )
            .await
        }
    }
}
