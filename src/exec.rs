use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, client::Client, core::subresource::AttachParams};
use tokio::io::AsyncReadExt;

use crate::Error;
use tracing::{debug, warn};

/// Container the setup SQL runs in; CNPG names the engine container
/// "postgres" on every instance pod.
const POSTGRES_CONTAINER: &str = "postgres";

const MAX_BUF_SIZE: usize = 10240;

#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub success: bool,
}

pub struct ExecCommand {
    pods_api: Api<Pod>,
    pod_name: String,
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>, stream: &str, pod: &str) -> String {
    match reader {
        None => {
            warn!("No {} from exec to pod: {:?}", stream, pod);
            String::new()
        }
        Some(mut reader) => {
            let mut buf = String::new();
            reader.read_to_string(&mut buf).await.unwrap_or_default();
            buf
        }
    }
}

impl ExecCommand {
    pub fn new(pod_name: String, namespace: String, client: Client) -> Self {
        let pods_api: Api<Pod> = Api::namespaced(client, &namespace);
        Self { pods_api, pod_name }
    }

    pub async fn execute(&self, command: &[String]) -> Result<ExecOutput, Error> {
        let attach_params = AttachParams {
            container: Some(POSTGRES_CONTAINER.to_string()),
            tty: false,
            stdin: true,
            stdout: true,
            stderr: true,
            max_stdin_buf_size: Some(MAX_BUF_SIZE),
            max_stdout_buf_size: Some(MAX_BUF_SIZE),
            max_stderr_buf_size: Some(MAX_BUF_SIZE),
        };

        let mut attached = self
            .pods_api
            .exec(self.pod_name.as_str(), command, &attach_params)
            .await?;

        let stdout = drain(attached.stdout(), "stdout", &self.pod_name).await;
        let stderr = drain(attached.stderr(), "stderr", &self.pod_name).await;

        let status = attached.take_status().ok_or_else(|| {
            Error::KubeExecError(format!(
                "Error executing command: {:?} on pod: {:?}. Failed to find command status.",
                command, self.pod_name
            ))
        })?;
        let status = status.await.unwrap_or_default();

        // The apiserver only ever reports Success or Failure here
        let success = match status.status.as_deref() {
            Some("Success") => true,
            Some("Failure") => {
                warn!(
                    "Command failed on pod {:?}: stdout: {} stderr: {}",
                    self.pod_name, stdout, stderr
                );
                if let Some(reason) = &status.reason {
                    warn!("Reason for failed exec: {reason}, code {:?}", status.code);
                }
                debug!("Failed command: {:?}", command);
                false
            }
            _ => {
                return Err(Error::KubeExecError(format!(
                    "Undefined exec status for command: {:?} on pod: {:?}.",
                    command, self.pod_name
                )));
            }
        };

        Ok(ExecOutput {
            stdout: Some(stdout),
            stderr: Some(stderr),
            success,
        })
    }
}
