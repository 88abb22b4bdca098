use crate::apis::documentdb_types::{DocumentDB, DocumentDBResource, DocumentDBStorage};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::Config;

/// Secret holding the gateway admin credentials when the user does not name one.
pub const DEFAULT_CREDENTIAL_SECRET: &str = "documentdb-credentials";

/// CNPG sidecar-injector plugin the operator binds the gateway through.
pub const DEFAULT_SIDECAR_INJECTOR_PLUGIN: &str = "documentdb-sidecar-injector";

/// Days between a backup's stoppedAt and its expiry when the DocumentDB spec
/// does not carry a retention policy.
pub const DEFAULT_BACKUP_RETENTION_DAYS: i64 = 30;

pub fn default_node_count() -> i32 {
    1
}

pub fn default_instances_per_node() -> i32 {
    1
}

pub fn default_resource() -> DocumentDBResource {
    DocumentDBResource {
        storage: DocumentDBStorage {
            pvc_size: default_pvc_size(),
            storage_class: None,
        },
    }
}

pub fn default_pvc_size() -> Quantity {
    Quantity("10Gi".to_string())
}

pub fn default_repository() -> String {
    "ghcr.io/documentdb".to_owned()
}

pub fn default_documentdb_version() -> String {
    "16".to_owned()
}

pub fn default_documentdb_image() -> String {
    format!("{}/documentdb:{}", default_repository(), default_documentdb_version())
}

pub fn default_gateway_image() -> String {
    format!(
        "{}/documentdb-gateway:{}",
        default_repository(),
        default_documentdb_version()
    )
}

/// Engine image resolution: explicit image, then spec-level version tag, then
/// the operator-wide version from the environment, then the hardcoded default.
pub fn resolve_documentdb_image(db: &DocumentDB, cfg: &Config) -> String {
    if let Some(image) = &db.spec.documentdb_image {
        return image.clone();
    }
    if let Some(version) = &db.spec.documentdb_version {
        return format!("{}/documentdb:{}", default_repository(), version);
    }
    if let Some(version) = &cfg.documentdb_version {
        return format!("{}/documentdb:{}", default_repository(), version);
    }
    default_documentdb_image()
}

/// Same precedence as [`resolve_documentdb_image`], applied to the gateway.
pub fn resolve_gateway_image(db: &DocumentDB, cfg: &Config) -> String {
    if let Some(image) = &db.spec.gateway_image {
        return image.clone();
    }
    if let Some(version) = &db.spec.documentdb_version {
        return format!("{}/documentdb-gateway:{}", default_repository(), version);
    }
    if let Some(version) = &cfg.documentdb_version {
        return format!("{}/documentdb-gateway:{}", default_repository(), version);
    }
    default_gateway_image()
}

pub fn credential_secret_name(db: &DocumentDB) -> String {
    db.spec
        .documentdb_credential_secret
        .clone()
        .unwrap_or_else(|| DEFAULT_CREDENTIAL_SECRET.to_string())
}

pub fn sidecar_injector_plugin_name(db: &DocumentDB) -> String {
    db.spec
        .sidecar_injector_plugin_name
        .clone()
        .unwrap_or_else(|| DEFAULT_SIDECAR_INJECTOR_PLUGIN.to_string())
}

/// Seconds CNPG waits for a clean instance shutdown.
pub fn default_stop_delay() -> i64 {
    300
}
