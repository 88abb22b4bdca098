use crate::{apis::documentdb_types::DocumentDB, defaults, Error};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

/// Outcome of probing a gateway TLS secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSecretCheck {
    /// The secret does not exist (yet).
    Missing,
    /// The secret exists but lacks the named data key.
    MissingKey(&'static str),
    /// The secret carries both `tls.crt` and `tls.key`.
    Complete,
}

/// Probe a TLS secret for the two keys the gateway needs. The secret is never
/// owned or mutated; CSI drivers and users manage Provided-mode secrets.
pub async fn check_tls_secret(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<TlsSecretCheck, Error> {
    let secret_api: Api<Secret> = Api::namespaced(client, namespace);
    let secret = match secret_api.get_opt(name).await? {
        Some(secret) => secret,
        None => return Ok(TlsSecretCheck::Missing),
    };
    Ok(tls_secret_completeness(&secret))
}

fn tls_secret_completeness(secret: &Secret) -> TlsSecretCheck {
    let data = secret.data.as_ref();
    let has = |key: &str| data.map(|d| d.contains_key(key)).unwrap_or(false);
    if !has(TLS_CERT_KEY) {
        return TlsSecretCheck::MissingKey(TLS_CERT_KEY);
    }
    if !has(TLS_KEY_KEY) {
        return TlsSecretCheck::MissingKey(TLS_KEY_KEY);
    }
    TlsSecretCheck::Complete
}

/// Compose the connection string surfaced in the DocumentDB status. The
/// credential reads are left as kubectl substitutions so the status never
/// embeds secret material; users paste the string into a shell.
pub fn connection_string(db: &DocumentDB, host: &str, port: u16) -> String {
    let namespace = db.namespace().unwrap_or_default();
    let secret = defaults::credential_secret_name(db);
    let username = format!(
        "$(kubectl get secret {secret} -n {namespace} -o jsonpath='{{.data.username}}' | base64 -d)"
    );
    let password = format!(
        "$(kubectl get secret {secret} -n {namespace} -o jsonpath='{{.data.password}}' | base64 -d)"
    );

    let mut options = vec![
        "directConnection=true".to_string(),
        "authMechanism=SCRAM-SHA-256".to_string(),
        "tls=true".to_string(),
    ];
    if !db.tls_trusted() {
        options.push("tlsAllowInvalidCertificates=true".to_string());
    }
    options.push("replicaSet=rs0".to_string());

    debug!("Composed connection string for {}", db.name_any());
    format!(
        "mongodb://{username}:{password}@{host}:{port}/?{}",
        options.join("&")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::documentdb_types::{
        DocumentDBSpec, GatewayTls, ProvidedTls, TlsMode, TlsSpec,
    };
    use k8s_openapi::ByteString;
    use kube::Resource;
    use std::collections::BTreeMap;

    fn secret_with_keys(keys: &[&str]) -> Secret {
        Secret {
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(b"x".to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Secret::default()
        }
    }

    #[test]
    fn test_tls_secret_completeness() {
        assert_eq!(
            tls_secret_completeness(&secret_with_keys(&["tls.crt", "tls.key"])),
            TlsSecretCheck::Complete
        );
        assert_eq!(
            tls_secret_completeness(&secret_with_keys(&["tls.crt"])),
            TlsSecretCheck::MissingKey("tls.key")
        );
        assert_eq!(
            tls_secret_completeness(&secret_with_keys(&[])),
            TlsSecretCheck::MissingKey("tls.crt")
        );
    }

    fn db_with_mode(mode: TlsMode) -> DocumentDB {
        let mut db = DocumentDB::new(
            "minimal",
            DocumentDBSpec {
                tls: Some(TlsSpec {
                    gateway: Some(GatewayTls {
                        mode,
                        provided: Some(ProvidedTls {
                            secret_name: "mysec".to_string(),
                        }),
                        cert_manager: None,
                    }),
                }),
                ..DocumentDBSpec::default()
            },
        );
        db.meta_mut().namespace = Some("default".to_string());
        db
    }

    #[test]
    fn test_connection_string_untrusted_tls() {
        let db = db_with_mode(TlsMode::SelfSigned);
        let conn = connection_string(&db, "20.1.2.3", 10260);
        assert!(conn.starts_with("mongodb://"));
        assert!(conn.contains("@20.1.2.3:10260/?"));
        assert!(conn.contains("tlsAllowInvalidCertificates=true"));
        assert!(conn.contains("authMechanism=SCRAM-SHA-256"));
        assert!(conn.contains("replicaSet=rs0"));
        assert!(conn.contains("kubectl get secret documentdb-credentials -n default"));
    }

    #[test]
    fn test_connection_string_trusted_tls_omits_invalid_certs() {
        let db = db_with_mode(TlsMode::Provided);
        let conn = connection_string(&db, "20.1.2.3", 10260);
        assert!(!conn.contains("tlsAllowInvalidCertificates"));
        assert!(conn.contains("tls=true"));
    }

    #[test]
    fn test_connection_string_honors_custom_credential_secret() {
        let mut db = db_with_mode(TlsMode::Provided);
        db.spec.documentdb_credential_secret = Some("my-creds".to_string());
        let conn = connection_string(&db, "h", 10260);
        assert!(conn.contains("kubectl get secret my-creds"));
    }
}
