use crate::{ProtocolError, ProtocolResult, WorkerChannel};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;

/// Environment variable naming the worker executable.
pub const WORKER_PATH_ENV: &str = "VAT_WORKER_PATH";

/// Starts a fresh worker and returns the runtime end of its channel.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, name: &str) -> ProtocolResult<WorkerChannel>;
}

/// Runs each worker as a child process speaking frames on stdin/stdout.
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
    async fn launch(&self, name: &str) -> ProtocolResult<WorkerChannel> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("VAT_WORKER_NAME", name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProtocolError::WorkerExited(name.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProtocolError::WorkerExited(name.to_string()))?;
        tracing::debug!(
            worker = name,
            pid = child.id(),
            program = %self.program.display(),
            "spawned worker process"
        );
        Ok(WorkerChannel::new(name, Box::new(stdout), Box::new(stdin)).with_child(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_worker_binary_is_an_io_error() {
        let launcher = SubprocessLauncher::new("/nonexistent/vat-worker");
        let err = launcher.launch("v1").await.expect_err("spawn fails");
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
