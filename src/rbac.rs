use crate::{apis::documentdb_types::DocumentDB, Context, Error};
use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use kube::{
    api::{DeleteParams, ObjectMeta, PostParams},
    Api, Resource, ResourceExt,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, instrument};

fn instance_labels(db: &DocumentDB) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_owned(), "documentdb".to_string()),
        ("documentdb.io/name".to_owned(), db.name_any()),
    ])
}

fn instance_metadata(db: &DocumentDB, ns: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(db.name_any()),
        namespace: Some(ns.to_owned()),
        labels: Some(instance_labels(db)),
        owner_references: Some(vec![db.controller_owner_ref(&()).unwrap()]),
        ..ObjectMeta::default()
    }
}

fn instance_policy_rules() -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(vec![
            "pods".to_string(),
            "services".to_string(),
            "endpoints".to_string(),
        ]),
        verbs: vec![
            "get".to_string(),
            "list".to_string(),
            "watch".to_string(),
            "create".to_string(),
            "update".to_string(),
            "patch".to_string(),
            "delete".to_string(),
        ],
        ..PolicyRule::default()
    }]
}

async fn create_ignoring_conflict<K>(api: &Api<K>, obj: &K, kind: &str) -> Result<(), Error>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!("{} already exists, leaving it as-is", kind);
            Ok(())
        }
        Err(e) => {
            error!("Error creating {}: {}", kind, e);
            Err(Error::KubeError(e))
        }
    }
}

/// Create the per-instance ServiceAccount, Role and RoleBinding, all sharing
/// the DocumentDB's name. Creation is idempotent.
#[instrument(skip(db, ctx), fields(instance_name = %db.name_any()))]
pub async fn reconcile_rbac(db: &DocumentDB, ctx: Arc<Context>) -> Result<(), Error> {
    let client = ctx.client.clone();
    let ns = db.namespace().unwrap();
    let name = db.name_any();

    let sa = ServiceAccount {
        metadata: instance_metadata(db, &ns),
        ..ServiceAccount::default()
    };
    let sa_api: Api<ServiceAccount> = Api::namespaced(client.clone(), &ns);
    create_ignoring_conflict(&sa_api, &sa, "ServiceAccount").await?;

    let role = Role {
        metadata: instance_metadata(db, &ns),
        rules: Some(instance_policy_rules()),
    };
    let role_api: Api<Role> = Api::namespaced(client.clone(), &ns);
    create_ignoring_conflict(&role_api, &role, "Role").await?;

    let role_binding = RoleBinding {
        metadata: instance_metadata(db, &ns),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(ns.clone()),
            ..Subject::default()
        }]),
    };
    let rb_api: Api<RoleBinding> = Api::namespaced(client, &ns);
    create_ignoring_conflict(&rb_api, &role_binding, "RoleBinding").await?;

    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str, kind: &str)
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => debug!("Deleted {} {}", kind, name),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => error!("Error deleting {} {}: {}", kind, name, e),
    }
}

/// Best-effort removal of the per-instance RBAC objects after the DocumentDB
/// is gone. Owned resources cascade through the apiserver; this covers the
/// same objects in case their owner references were ever stripped.
#[instrument(skip(ctx))]
pub async fn cleanup_rbac(ctx: Arc<Context>, name: &str, namespace: &str) {
    let client = ctx.client.clone();

    let rb_api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    delete_ignoring_missing(&rb_api, name, "RoleBinding").await;

    let role_api: Api<Role> = Api::namespaced(client.clone(), namespace);
    delete_ignoring_missing(&role_api, name, "Role").await;

    let sa_api: Api<ServiceAccount> = Api::namespaced(client, namespace);
    delete_ignoring_missing(&sa_api, name, "ServiceAccount").await;
}
