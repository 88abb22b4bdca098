use crate::apis::documentdb_types::{
    CrossCloudNetworkingStrategy, DocumentDB, Environment,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{runtime::controller::Action, Api, Client, ResourceExt};
use tokio::time::Duration;
use tracing::{debug, error, instrument};

/// Namespace/name/key of the platform-owned ConfigMap naming the Kubernetes
/// cluster this operator instance runs in. Required whenever replication is
/// enabled.
pub const CLUSTER_NAME_CONFIGMAP_NAMESPACE: &str = "kube-system";
pub const CLUSTER_NAME_CONFIGMAP: &str = "cluster-name";
pub const CLUSTER_NAME_KEY: &str = "name";

/// Derived member names are clipped to this length before any use, keeping
/// `documentdb-service-<self>` within the 63-character label limit.
pub const SELF_NAME_MAX_LEN: usize = 40;

/// Suffix of the multi-cluster service names the fleet manager materializes.
const FLEET_SERVICE_SUFFIX: &str = "fleet-system";

const KUBE_NAME_MAX_LEN: usize = 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationState {
    NoReplication,
    Primary,
    Replica,
}

/// Answers, for one reconcile, where this cluster sits in its replication
/// group. Pure data after resolution; every consumer branches on it.
#[derive(Clone, Debug)]
pub struct ReplicationContext {
    /// Derived name of this cluster; doubles as the CNPG cluster name.
    pub self_name: String,
    pub state: ReplicationState,
    /// Derived full names of every other member of the group.
    pub others: Vec<String>,
    /// Derived full name of the group's primary member.
    pub primary_cluster: String,
    /// Storage class after applying this member's override.
    pub storage_class: Option<String>,
    /// Environment after applying this member's override.
    pub environment: Option<Environment>,
    strategy: CrossCloudNetworkingStrategy,
    namespace: String,
}

/// Clip a name to `max` bytes; derived names are ASCII so byte clipping is
/// character clipping.
pub fn truncate_name(name: &str, max: usize) -> String {
    if name.len() <= max {
        name.to_string()
    } else {
        name[..max].to_string()
    }
}

fn fnv1a64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME))
}

fn derive_member_name(member: &str, db_name: &str) -> String {
    truncate_name(&format!("{}-{}", member, db_name), SELF_NAME_MAX_LEN)
}

impl ReplicationContext {
    /// Resolve the context for `db`. Reads the platform cluster-name
    /// ConfigMap only when replication is enabled; a missing ConfigMap is a
    /// transient condition and requeues.
    #[instrument(skip(client, db), fields(instance_name = %db.name_any()))]
    pub async fn resolve(client: Client, db: &DocumentDB) -> Result<Self, Action> {
        if db.spec.cluster_replication.is_none() {
            return Ok(Self::standalone(db));
        }

        let cm_api: Api<ConfigMap> =
            Api::namespaced(client, CLUSTER_NAME_CONFIGMAP_NAMESPACE);
        let cm = cm_api.get(CLUSTER_NAME_CONFIGMAP).await.map_err(|e| {
            error!(
                "Failed to read {}/{} for instance {}: {}",
                CLUSTER_NAME_CONFIGMAP_NAMESPACE,
                CLUSTER_NAME_CONFIGMAP,
                db.name_any(),
                e
            );
            Action::requeue(Duration::from_secs(10))
        })?;
        let physical_cluster = cm
            .data
            .as_ref()
            .and_then(|d| d.get(CLUSTER_NAME_KEY))
            .cloned()
            .ok_or_else(|| {
                error!(
                    "ConfigMap {}/{} has no '{}' key",
                    CLUSTER_NAME_CONFIGMAP_NAMESPACE, CLUSTER_NAME_CONFIGMAP, CLUSTER_NAME_KEY
                );
                Action::requeue(Duration::from_secs(10))
            })?;

        Ok(Self::derive(db, &physical_cluster))
    }

    fn standalone(db: &DocumentDB) -> Self {
        Self {
            self_name: db.name_any(),
            state: ReplicationState::NoReplication,
            others: Vec::new(),
            primary_cluster: db.name_any(),
            storage_class: db.spec.resource.storage.storage_class.clone(),
            environment: db.spec.environment,
            strategy: CrossCloudNetworkingStrategy::None,
            namespace: db.namespace().unwrap_or_default(),
        }
    }

    /// Pure derivation once the physical cluster name is known.
    pub fn derive(db: &DocumentDB, physical_cluster: &str) -> Self {
        let replication = match &db.spec.cluster_replication {
            Some(replication) => replication,
            None => return Self::standalone(db),
        };
        let db_name = db.name_any();

        let state = if replication.primary == physical_cluster {
            ReplicationState::Primary
        } else {
            ReplicationState::Replica
        };

        let others = replication
            .cluster_list
            .iter()
            .filter(|member| member.name != physical_cluster)
            .map(|member| derive_member_name(&member.name, &db_name))
            .collect();

        let own_member = replication
            .cluster_list
            .iter()
            .find(|member| member.name == physical_cluster);
        let storage_class = own_member
            .and_then(|m| m.storage_class_override.clone())
            .or_else(|| db.spec.resource.storage.storage_class.clone());
        let environment = own_member
            .and_then(|m| m.environment_override)
            .or(db.spec.environment);

        debug!(
            "Replication context for {}: physical cluster {}, state {:?}",
            db_name, physical_cluster, state
        );

        Self {
            self_name: derive_member_name(physical_cluster, &db_name),
            state,
            others,
            primary_cluster: derive_member_name(&replication.primary, &db_name),
            storage_class,
            environment,
            strategy: replication.cross_cloud_networking_strategy,
            namespace: db.namespace().unwrap_or_default(),
        }
    }

    /// True for clusters allowed to drive primary-only operations (the
    /// streaming-replica grant, recovery bootstrap, failover writes).
    pub fn is_primary(&self) -> bool {
        matches!(
            self.state,
            ReplicationState::NoReplication | ReplicationState::Primary
        )
    }

    pub fn is_replicating(&self) -> bool {
        self.state != ReplicationState::NoReplication
    }

    /// Whether the frontend Service may route traffic: always for standalone
    /// clusters, and for a replicating primary only while no failover is in
    /// flight (local and target primaries agree).
    pub fn endpoint_enabled(&self, db: &DocumentDB) -> bool {
        match self.state {
            ReplicationState::NoReplication => true,
            ReplicationState::Primary => {
                let status = db.status.as_ref();
                let target = status.and_then(|s| s.target_primary.as_ref());
                let local = status.and_then(|s| s.local_primary.as_ref());
                target == local
            }
            ReplicationState::Replica => false,
        }
    }

    /// The member this cluster streams from: the primary for replicas, the
    /// first other member for a primary (its downstream peer for slot setup).
    pub fn replication_source(&self) -> Option<String> {
        match self.state {
            ReplicationState::NoReplication => None,
            ReplicationState::Replica => Some(self.primary_cluster.clone()),
            ReplicationState::Primary => self.others.first().cloned(),
        }
    }

    /// DNS name of another member's read-write service. Under AzureFleet the
    /// fleet manager exposes it as `<namespace>-<hash>-<suffix>` where the
    /// hash is a 64-bit FNV-1a over (source, target); otherwise the member's
    /// CNPG `-rw` service is addressed directly.
    pub fn rw_service_host(&self, other: &str) -> String {
        match self.strategy {
            CrossCloudNetworkingStrategy::AzureFleet => {
                let hash = fnv1a64(format!("{}{}", self.self_name, other).as_bytes());
                truncate_name(
                    &format!("{}-{:x}-{}", self.namespace, hash, FLEET_SERVICE_SUFFIX),
                    KUBE_NAME_MAX_LEN,
                )
            }
            _ => format!("{}-rw.{}.svc", other, self.namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::documentdb_types::{
        ClusterMember, ClusterReplication, DocumentDBSpec, DocumentDBStatus,
    };
    use kube::Resource;

    fn replicated_db(primary: &str, strategy: CrossCloudNetworkingStrategy) -> DocumentDB {
        let mut db = DocumentDB::new(
            "orders",
            DocumentDBSpec {
                cluster_replication: Some(ClusterReplication {
                    primary: primary.to_string(),
                    cluster_list: vec![
                        ClusterMember {
                            name: "aks-eastus".to_string(),
                            storage_class_override: Some("managed-csi".to_string()),
                            environment_override: Some(Environment::Aks),
                        },
                        ClusterMember {
                            name: "eks-westus".to_string(),
                            storage_class_override: None,
                            environment_override: Some(Environment::Eks),
                        },
                    ],
                    cross_cloud_networking_strategy: strategy,
                }),
                ..DocumentDBSpec::default()
            },
        );
        db.meta_mut().namespace = Some("default".to_string());
        db
    }

    #[test]
    fn test_standalone_context() {
        let mut db = DocumentDB::new("minimal", DocumentDBSpec::default());
        db.meta_mut().namespace = Some("default".to_string());
        let ctx = ReplicationContext::derive(&db, "ignored");
        assert_eq!(ctx.state, ReplicationState::NoReplication);
        assert_eq!(ctx.self_name, "minimal");
        assert!(ctx.is_primary());
        assert!(!ctx.is_replicating());
        assert!(ctx.endpoint_enabled(&db));
        assert_eq!(ctx.replication_source(), None);
    }

    #[test]
    fn test_primary_member_derivation() {
        let db = replicated_db("aks-eastus", CrossCloudNetworkingStrategy::None);
        let ctx = ReplicationContext::derive(&db, "aks-eastus");
        assert_eq!(ctx.state, ReplicationState::Primary);
        assert_eq!(ctx.self_name, "aks-eastus-orders");
        assert_eq!(ctx.others, vec!["eks-westus-orders".to_string()]);
        assert_eq!(ctx.primary_cluster, "aks-eastus-orders");
        assert_eq!(ctx.storage_class.as_deref(), Some("managed-csi"));
        assert_eq!(ctx.environment, Some(Environment::Aks));
        assert_eq!(ctx.replication_source(), Some("eks-westus-orders".to_string()));
    }

    #[test]
    fn test_replica_member_derivation() {
        let db = replicated_db("aks-eastus", CrossCloudNetworkingStrategy::None);
        let ctx = ReplicationContext::derive(&db, "eks-westus");
        assert_eq!(ctx.state, ReplicationState::Replica);
        assert!(!ctx.is_primary());
        assert!(!ctx.endpoint_enabled(&db));
        assert_eq!(ctx.replication_source(), Some("aks-eastus-orders".to_string()));
        assert_eq!(ctx.environment, Some(Environment::Eks));
    }

    #[test]
    fn test_endpoint_disabled_while_failover_in_flight() {
        let mut db = replicated_db("aks-eastus", CrossCloudNetworkingStrategy::None);
        db.status = Some(DocumentDBStatus {
            target_primary: Some("aks-eastus-orders-2".to_string()),
            local_primary: Some("aks-eastus-orders-1".to_string()),
            ..DocumentDBStatus::default()
        });
        let ctx = ReplicationContext::derive(&db, "aks-eastus");
        assert!(!ctx.endpoint_enabled(&db));

        db.status.as_mut().unwrap().local_primary = Some("aks-eastus-orders-2".to_string());
        assert!(ctx.endpoint_enabled(&db));
    }

    #[test]
    fn test_derived_names_are_truncated() {
        let mut db = DocumentDB::new(
            "a-document-database-with-a-very-long-resource-name",
            DocumentDBSpec {
                cluster_replication: Some(ClusterReplication {
                    primary: "aks-australiaeast-production".to_string(),
                    cluster_list: vec![ClusterMember {
                        name: "aks-australiaeast-production".to_string(),
                        ..ClusterMember::default()
                    }],
                    ..ClusterReplication::default()
                }),
                ..DocumentDBSpec::default()
            },
        );
        db.meta_mut().namespace = Some("default".to_string());
        let ctx = ReplicationContext::derive(&db, "aks-australiaeast-production");
        assert_eq!(ctx.self_name.len(), SELF_NAME_MAX_LEN);
        assert_eq!(ctx.primary_cluster, ctx.self_name);
    }

    #[test]
    fn test_fleet_service_name_is_stable_and_bounded() {
        let db = replicated_db("aks-eastus", CrossCloudNetworkingStrategy::AzureFleet);
        let ctx = ReplicationContext::derive(&db, "aks-eastus");
        let first = ctx.rw_service_host("eks-westus-orders");
        let second = ctx.rw_service_host("eks-westus-orders");
        assert_eq!(first, second);
        assert!(first.len() <= 63);
        assert!(first.starts_with("default-"));
        assert!(first.contains("fleet-system") || first.len() == 63);

        // Direction matters for the pair hash
        let reverse_ctx = ReplicationContext::derive(&db, "eks-westus");
        let reverse = reverse_ctx.rw_service_host("aks-eastus-orders");
        assert_ne!(first, reverse);
    }

    #[test]
    fn test_direct_rw_service_name_without_fleet() {
        let db = replicated_db("aks-eastus", CrossCloudNetworkingStrategy::None);
        let ctx = ReplicationContext::derive(&db, "aks-eastus");
        assert_eq!(
            ctx.rw_service_host("eks-westus-orders"),
            "eks-westus-orders-rw.default.svc"
        );
    }

    #[test]
    fn test_fnv1a64_known_vectors() {
        // Reference values for the 64-bit FNV-1a function
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
    }
}
