use crate::{
    apis::documentdb_types::{DocumentDB, Environment, ServiceType},
    replication::{truncate_name, ReplicationContext},
    Config, Context,
};
use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const SERVICE_NAME_PREFIX: &str = "documentdb-service-";
pub const GATEWAY_PORT_NAME: &str = "gateway";

/// Attempts made waiting for the load balancer before giving up the cycle.
const INGRESS_WAIT_ATTEMPTS: u32 = 5;
const INGRESS_WAIT_SECONDS: u64 = 10;

pub fn frontend_service_name(repl: &ReplicationContext) -> String {
    truncate_name(&format!("{}{}", SERVICE_NAME_PREFIX, repl.self_name), 63)
}

/// Pod selector for the frontend Service. While this cluster must not serve
/// traffic (replica, or mid-failover) the selector matches nothing so the
/// Service black-holes instead of routing to a stale primary.
fn service_selector(db: &DocumentDB, repl: &ReplicationContext) -> BTreeMap<String, String> {
    if repl.endpoint_enabled(db) {
        BTreeMap::from([
            ("cnpg.io/cluster".to_string(), repl.self_name.clone()),
            ("cnpg.io/instanceRole".to_string(), "primary".to_string()),
        ])
    } else {
        BTreeMap::from([("disabled".to_string(), "true".to_string())])
    }
}

fn environment_annotations(
    environment: Option<Environment>,
) -> Option<BTreeMap<String, String>> {
    match environment {
        Some(Environment::Aks) => Some(BTreeMap::from([(
            "service.beta.kubernetes.io/azure-load-balancer-external".to_string(),
            "true".to_string(),
        )])),
        Some(Environment::Eks) => Some(BTreeMap::from([
            (
                "service.beta.kubernetes.io/aws-load-balancer-type".to_string(),
                "nlb".to_string(),
            ),
            (
                "service.beta.kubernetes.io/aws-load-balancer-scheme".to_string(),
                "internet-facing".to_string(),
            ),
            (
                "service.beta.kubernetes.io/aws-load-balancer-cross-zone-load-balancing-enabled"
                    .to_string(),
                "true".to_string(),
            ),
            (
                "service.beta.kubernetes.io/aws-load-balancer-nlb-target-type".to_string(),
                "ip".to_string(),
            ),
        ])),
        Some(Environment::Gke) => Some(BTreeMap::from([(
            "cloud.google.com/load-balancer-type".to_string(),
            "External".to_string(),
        )])),
        None => None,
    }
}

/// Desired frontend Service, or None when the spec does not expose one.
pub fn desired_service(
    db: &DocumentDB,
    repl: &ReplicationContext,
    cfg: &Config,
) -> Option<Service> {
    let service_type = db
        .spec
        .expose_via_service
        .as_ref()
        .and_then(|e| e.service_type.as_ref())?;
    let name = frontend_service_name(repl);
    let namespace = db.namespace().unwrap_or_default();
    let owner_reference = db.controller_owner_ref(&()).unwrap();

    let type_ = match service_type {
        ServiceType::ClusterIP => "ClusterIP",
        ServiceType::LoadBalancer => "LoadBalancer",
    };

    Some(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            annotations: environment_annotations(repl.environment),
            owner_references: Some(vec![owner_reference]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(GATEWAY_PORT_NAME.to_string()),
                port: i32::from(cfg.gateway_port),
                target_port: Some(IntOrString::Int(i32::from(cfg.gateway_port))),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            selector: Some(service_selector(db, repl)),
            type_: Some(type_.to_string()),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    })
}

fn service_host(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    match spec.type_.as_deref() {
        Some("LoadBalancer") => service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone())),
        _ => spec.cluster_ip.clone().filter(|ip| ip != "None"),
    }
}

/// Ensure the frontend Service and wait (bounded) for it to be addressable.
/// Returns the host clients should dial, or None when the address is still
/// pending; the caller requeues in that case without treating it as an error.
#[instrument(skip(db, ctx, repl), fields(instance_name = %db.name_any()))]
pub async fn reconcile_service(
    db: &DocumentDB,
    ctx: Arc<Context>,
    repl: &ReplicationContext,
) -> Result<Option<String>, Action> {
    let cfg = Config::default();
    let service = match desired_service(db, repl, &cfg) {
        Some(service) => service,
        None => {
            debug!(
                "No service type requested for {}, skipping Service",
                db.name_any()
            );
            return Ok(None);
        }
    };
    let name = service.name_any();
    let namespace = db.namespace().unwrap();
    let service_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    let ps = PatchParams::apply("cntrlr").force();
    service_api
        .patch(&name, &ps, &Patch::Apply(&service))
        .await
        .map_err(|e| {
            error!("Error patching Service {}: {}", name, e);
            Action::requeue(Duration::from_secs(10))
        })?;

    for attempt in 1..=INGRESS_WAIT_ATTEMPTS {
        let current = service_api.get(&name).await.map_err(|e| {
            error!("Error getting Service {}: {}", name, e);
            Action::requeue(Duration::from_secs(10))
        })?;
        if let Some(host) = service_host(&current) {
            info!("Service {} is addressable at {}", name, host);
            return Ok(Some(host));
        }
        debug!(
            "Service {} has no address yet (attempt {}/{})",
            name, attempt, INGRESS_WAIT_ATTEMPTS
        );
        if attempt < INGRESS_WAIT_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(INGRESS_WAIT_SECONDS)).await;
        }
    }

    warn!(
        "Service {} still has no address, deferring dependent status updates",
        name
    );
    Ok(None)
}
