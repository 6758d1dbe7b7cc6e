// src/remote/liveness.rs

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::types::Liveness;

use super::{BoxFuture, RemoteShell, shell_quote, truncate};

/// Answers "is the worker for this experiment still running on this host?".
pub trait LivenessCheck: Send + Sync + Debug {
    fn check<'a>(&'a self, host: &'a str, id: &'a str) -> BoxFuture<'a, Liveness>;
}

/// Liveness over the remote shell.
///
/// Workers are started with `<tag_var>=<id>` in their environment, so the
/// query counts processes whose environment carries exactly that entry. The
/// query's own processes never match, unlike a command-line grep.
#[derive(Debug, Clone)]
pub struct LivenessVerifier {
    shell: Arc<dyn RemoteShell>,
    tag_var: String,
    timeout: Duration,
}

impl LivenessVerifier {
    pub fn new(shell: Arc<dyn RemoteShell>, tag_var: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell,
            tag_var: tag_var.into(),
            timeout,
        }
    }

    pub fn query(&self, id: &str) -> String {
        liveness_query(&self.tag_var, id)
    }
}

/// Remote command printing the number of processes tagged with `id`.
pub fn liveness_query(tag_var: &str, id: &str) -> String {
    format!(
        "grep -zlsxF {} /proc/[0-9]*/environ | wc -l",
        shell_quote(&format!("{tag_var}={id}"))
    )
}

impl LivenessCheck for LivenessVerifier {
    fn check<'a>(&'a self, host: &'a str, id: &'a str) -> BoxFuture<'a, Liveness> {
        Box::pin(async move {
            let command = self.query(id);
            let output = match self.shell.run(host, &command, self.timeout).await {
                Ok(out) => out,
                Err(err) => {
                    warn!(experiment = %id, host = %host, error = %err, "liveness check failed; assuming still running");
                    return Liveness::Unknown;
                }
            };

            if !output.success() {
                warn!(
                    experiment = %id,
                    host = %host,
                    code = output.status,
                    stderr = %truncate(output.stderr.trim(), 200),
                    "liveness check exited with failure; assuming still running"
                );
                return Liveness::Unknown;
            }

            match output.stdout_trimmed().parse::<u64>() {
                Ok(0) => {
                    debug!(experiment = %id, host = %host, "no matching process");
                    Liveness::Dead
                }
                Ok(count) => {
                    debug!(experiment = %id, host = %host, count, "process alive");
                    Liveness::Alive
                }
                Err(_) => {
                    warn!(
                        experiment = %id,
                        host = %host,
                        output = %truncate(&output.stdout, 80),
                        "unparseable liveness output; assuming still running"
                    );
                    Liveness::Unknown
                }
            }
        })
    }
}
