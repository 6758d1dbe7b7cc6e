// src/remote/dispatch.rs

//! Starts experiment workers on remote hosts.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::WorkerSection;
use crate::fs::FileSystem;
use crate::store::Experiment;

use super::{RemoteError, RemoteShell, shell_quote};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("could not write lock {path:?}: {message}")]
    Lock { path: PathBuf, message: String },

    #[error(transparent)]
    Launch(#[from] RemoteError),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    shell: Arc<dyn RemoteShell>,
    fs: Arc<dyn FileSystem>,
    worker: WorkerSection,
    lock_file: String,
}

impl Dispatcher {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        fs: Arc<dyn FileSystem>,
        worker: WorkerSection,
        lock_file: impl Into<String>,
    ) -> Self {
        Self {
            shell,
            fs,
            worker,
            lock_file: lock_file.into(),
        }
    }

    /// Full remote command line for `exp`.
    ///
    /// `{dir}` and `{id}` in the template are substituted verbatim; the
    /// working directory, tag and log path are shell-quoted. The worker is
    /// detached with `nohup` so the ssh session returns immediately.
    pub fn command_for(&self, exp: &Experiment) -> String {
        let dir = exp.dir.to_string_lossy();
        let body = self
            .worker
            .command
            .replace("{dir}", &dir)
            .replace("{id}", &exp.id);
        let cwd = self
            .worker
            .cwd
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.to_string());
        let log = exp.marker(&self.worker.log_file);

        format!(
            "cd {} && nohup env {} {} > {} 2>&1 &",
            shell_quote(&cwd),
            shell_quote(&format!("{}={}", self.worker.tag_var, exp.id)),
            body,
            shell_quote(&log.to_string_lossy()),
        )
    }

    /// Record the dispatch and start the worker on `host`.
    ///
    /// The lock is written first so a scheduler crash between the two steps
    /// can never leave an untracked worker behind. If the launch cannot even
    /// start locally, the lock is removed again and the experiment stays
    /// `todo`. Failures after that point surface through the grace period.
    pub async fn dispatch(&self, exp: &Experiment, host: &str) -> Result<(), DispatchError> {
        let lock = exp.marker(&self.lock_file);
        self.fs
            .write(&lock, host.as_bytes())
            .map_err(|e| DispatchError::Lock {
                path: lock.clone(),
                message: e.to_string(),
            })?;

        let command = self.command_for(exp);
        if let Err(err) = self.shell.launch(host, &command).await {
            if let Err(rm) = self.fs.remove_file(&lock) {
                warn!(experiment = %exp.id, error = %rm, "could not roll back lock after failed launch");
            }
            return Err(err.into());
        }

        info!(experiment = %exp.id, host = %host, "dispatched");
        Ok(())
    }
}
