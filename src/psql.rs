use crate::Context;

use kube::{runtime::controller::Action, Client};
use std::{sync::Arc, time::Duration};
use tracing::warn;

use crate::exec::ExecCommand;

#[derive(Debug)]
pub struct PsqlOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub success: bool,
}

impl PsqlOutput {
    /// Number of result rows in an unaligned psql output, header and footer
    /// excluded. Used for existence-guard queries.
    pub fn row_count(&self) -> usize {
        self.stdout
            .as_deref()
            .map(|out| {
                out.lines()
                    .skip(2)
                    .filter(|line| !line.trim().is_empty() && !line.starts_with('('))
                    .count()
            })
            .unwrap_or(0)
    }
}

pub struct PsqlCommand {
    pod_name: String,
    namespace: String,
    database: String,
    command: String,
    client: Client,
}

impl PsqlCommand {
    pub fn new(
        pod_name: String,
        namespace: String,
        command: String,
        database: String,
        context: Arc<Context>,
    ) -> Self {
        Self {
            pod_name,
            namespace,
            database,
            command,
            client: context.client.clone(),
        }
    }

    pub async fn execute(&self) -> Result<PsqlOutput, Action> {
        let psql_command = vec![
            String::from("psql"),
            format!(
                "postgres://?dbname={}&application_name=documentdb-operator",
                self.database
            ),
            String::from("-c"),
            self.command.clone(),
        ];
        let command = ExecCommand::new(
            self.pod_name.clone(),
            self.namespace.clone(),
            self.client.clone(),
        );
        let output = match command.execute(&psql_command).await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    "{}: Failed to kubectl exec a psql command: {:?}",
                    self.namespace, e
                );
                return Err(Action::requeue(Duration::from_secs(10)));
            }
        };

        if !output.success
            && output
                .stderr
                .as_deref()
                .map(|stderr| stderr.contains("the database system is shutting down"))
                .unwrap_or(false)
        {
            warn!(
                "Failed to execute psql command because DB is shutting down. Requeueing. {}",
                self.namespace
            );
            return Err(Action::requeue(Duration::from_secs(10)));
        }

        Ok(PsqlOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.success,
        })
    }
}
