// WARNING: generated by kopium - manual changes will be overwritten
// kopium command: kopium -D Default certificates.cert-manager.io -A
// kopium version: 0.16.5
// Trimmed to the subset of the Certificate API this operator reads and writes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of the Certificate resource.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates"
)]
#[kube(namespaced)]
#[kube(status = "CertificateStatus")]
pub struct CertificateSpec {
    /// Name of the Secret resource that will be automatically created and managed by this Certificate resource.
    #[serde(rename = "secretName")]
    pub secret_name: String,
    /// The requested 'duration' (i.e. lifetime) of the Certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// How long before the currently issued certificate's expiry cert-manager should renew the certificate.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "renewBefore"
    )]
    pub renew_before: Option<String>,
    /// Requested DNS subject alternative names.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "dnsNames")]
    pub dns_names: Option<Vec<String>>,
    /// Reference to the issuer responsible for issuing the certificate.
    #[serde(rename = "issuerRef")]
    pub issuer_ref: CertificateIssuerRef,
    /// Requested key usages and extended key usages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usages: Option<Vec<String>>,
}

/// Reference to the issuer responsible for issuing the certificate.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct CertificateIssuerRef {
    /// Name of the resource being referred to.
    pub name: String,
    /// Kind of the resource being referred to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Group of the resource being referred to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Status of the Certificate. This is set and managed automatically.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CertificateStatus {
    /// List of status conditions to indicate the status of certificates. Known condition types are `Ready` and `Issuing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<CertificateCondition>>,
}

/// CertificateCondition contains condition information for a Certificate.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CertificateCondition {
    /// Type of the condition, known values are (`Ready`, `Issuing`).
    #[serde(rename = "type")]
    pub r#type: String,
    /// Status of the condition, one of (`True`, `False`, `Unknown`).
    pub status: String,
    /// Human readable description of the details of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Certificate {
    /// True once the certificate controller reports the Ready condition.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.r#type == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }
}
