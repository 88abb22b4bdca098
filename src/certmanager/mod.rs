pub mod certificates;
pub mod issuers;

/// API group of the certificate controller.
pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";
