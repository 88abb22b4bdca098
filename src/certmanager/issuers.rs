// WARNING: generated by kopium - manual changes will be overwritten
// kopium command: kopium -D Default issuers.cert-manager.io -A
// kopium version: 0.16.5
// Trimmed to the subset of the Issuer API this operator reads and writes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of the Issuer resource.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Issuer",
    plural = "issuers"
)]
#[kube(namespaced)]
pub struct IssuerSpec {
    /// SelfSigned configures this issuer to 'self sign' certificates using the private key used to create the CertificateRequest object.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "selfSigned"
    )]
    pub self_signed: Option<IssuerSelfSigned>,
}

/// SelfSigned configures this issuer to 'self sign' certificates.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct IssuerSelfSigned {
    /// The CRL distribution points set on certificates issued by this issuer.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "crlDistributionPoints"
    )]
    pub crl_distribution_points: Option<Vec<String>>,
}
