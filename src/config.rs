use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub postgres_port: u16,
    pub sidecar_port: u16,
    pub gateway_port: u16,
    pub documentdb_version: Option<String>,
    pub requeue_short: u64,
    pub requeue_long: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            postgres_port: from_env_default("POSTGRES_PORT", "5432").parse().unwrap(),
            sidecar_port: from_env_default("SIDECAR_PORT", "8445").parse().unwrap(),
            gateway_port: from_env_default("GATEWAY_PORT", "10260").parse().unwrap(),
            documentdb_version: env::var("DOCUMENTDB_VERSION").ok(),
            // Waiting on another controller (TLS secret, CNPG rollout)
            requeue_short: from_env_default("REQUEUE_SHORT_SECONDS", "10").parse().unwrap(),
            // Steady-state polling
            requeue_long: from_env_default("REQUEUE_LONG_SECONDS", "30").parse().unwrap(),
        }
    }
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}
