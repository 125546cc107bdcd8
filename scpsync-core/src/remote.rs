use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// What a remote shell command printed, and how it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server closed the channel without an exit status
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status.unwrap_or(0) == 0 && self.stderr.trim().is_empty()
    }
}

/// Secure shell access to the remote host.
///
/// Connection-level problems (unreachable host, auth failure, protocol
/// error) are returned as `SyncError::Connection`. A command that merely
/// fails on the remote side is returned as `Ok` with its output and exit
/// status; the caller decides what that means.
#[async_trait]
pub trait RemoteSession: Send + Sync + 'static {
    async fn run_command(&self, command: &str) -> Result<CommandOutput>;

    /// Copy one local file into `remote_dir`, keeping its file name.
    async fn upload_file(&self, local: &Path, remote_dir: &str) -> Result<()>;
}

#[async_trait]
impl<T: RemoteSession + ?Sized> RemoteSession for std::sync::Arc<T> {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        (**self).run_command(command).await
    }

    async fn upload_file(&self, local: &Path, remote_dir: &str) -> Result<()> {
        (**self).upload_file(local, remote_dir).await
    }
}
