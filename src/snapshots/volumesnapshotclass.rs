use crate::apis::documentdb_types::Environment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{DynamicObject, ListParams, PostParams},
    core::{ApiResource, TypeMeta},
    Api, Client,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Annotation marking the cluster-wide default VolumeSnapshotClass.
pub const DEFAULT_CLASS_ANNOTATION: &str = "snapshot.storage.kubernetes.io/is-default-class";

const SYNTHESIZED_CLASS_NAME: &str = "documentdb-default-snapshot-class";

#[derive(Error, Debug)]
pub enum SnapshotClassError {
    #[error("KubeErr: {0}")]
    KubeErr(#[from] kube::Error),

    /// No default class exists and the environment does not map to a known
    /// CSI driver, so one cannot be synthesized.
    #[error("no default VolumeSnapshotClass and no driver known for this environment")]
    NoDriverForEnvironment,
}

// The snapshot CRDs are externally installed; address them dynamically the
// same way the VolumeSnapshot objects are addressed elsewhere in the stack.
fn volume_snapshot_class_resource() -> ApiResource {
    ApiResource {
        group: "snapshot.storage.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "snapshot.storage.k8s.io/v1".to_string(),
        kind: "VolumeSnapshotClass".to_string(),
        plural: "volumesnapshotclasses".to_string(),
    }
}

fn csi_driver_for(environment: Option<Environment>) -> Option<&'static str> {
    match environment {
        Some(Environment::Aks) => Some("disk.csi.azure.com"),
        Some(Environment::Eks) => Some("ebs.csi.aws.com"),
        Some(Environment::Gke) => Some("pd.csi.storage.gke.io"),
        None => None,
    }
}

/// Make sure the cluster has a default VolumeSnapshotClass, synthesizing one
/// keyed by the DocumentDB's environment when none carries the default-class
/// annotation. Returns the name of the default class.
pub async fn ensure_default_volume_snapshot_class(
    client: Client,
    environment: Option<Environment>,
) -> Result<String, SnapshotClassError> {
    let api_resource = volume_snapshot_class_resource();
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource);

    let classes = api.list(&ListParams::default()).await?;
    for class in &classes.items {
        let is_default = class
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(DEFAULT_CLASS_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false);
        if is_default {
            let name = class.metadata.name.clone().unwrap_or_default();
            debug!("Found default VolumeSnapshotClass {}", name);
            return Ok(name);
        }
    }

    let driver = csi_driver_for(environment).ok_or(SnapshotClassError::NoDriverForEnvironment)?;

    let class = DynamicObject {
        types: Some(TypeMeta {
            api_version: api_resource.api_version.clone(),
            kind: api_resource.kind.clone(),
        }),
        metadata: ObjectMeta {
            name: Some(SYNTHESIZED_CLASS_NAME.to_string()),
            annotations: Some(BTreeMap::from([(
                DEFAULT_CLASS_ANNOTATION.to_string(),
                "true".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        data: serde_json::json!({
            "driver": driver,
            "deletionPolicy": "Delete",
        }),
    };

    info!(
        "No default VolumeSnapshotClass found, creating {} with driver {}",
        SYNTHESIZED_CLASS_NAME, driver
    );
    match api.create(&PostParams::default(), &class).await {
        Ok(_) => Ok(SYNTHESIZED_CLASS_NAME.to_string()),
        // Another reconcile got there first
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(SYNTHESIZED_CLASS_NAME.to_string()),
        Err(e) => Err(SnapshotClassError::KubeErr(e)),
    }
}
