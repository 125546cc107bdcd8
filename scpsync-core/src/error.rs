//! Error types shared by the resolver, mapper, sessions and the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Everything that can stop or degrade a sync run.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Could not reach or authenticate against the remote host
    #[error("Connection error: {0}")]
    Connection(String),

    /// A remote shell command exited non-zero or wrote to stderr
    #[error("Remote command failed: {command}\n  Output: {output}")]
    Command { command: String, output: String },

    /// A single file upload failed at the transport layer
    #[error("Transfer failed for {}: {message}", .file.display())]
    Transfer { file: PathBuf, message: String },

    /// A resolved file does not live under the source folder
    #[error("{} is not under source folder {}", .path.display(), .root.display())]
    PathOutsideRoot { path: PathBuf, root: PathBuf },

    /// Glob expression could not be compiled
    #[error("Invalid pattern '{pattern}': {source}")]
    PatternSyntax {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// Walking the source folder failed
    #[error("Failed to enumerate source files: {0}")]
    Enumerate(#[from] walkdir::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled before every file was copied; carries the
    /// first upload failure recorded before that, if any
    #[error("Sync cancelled{}", first_error_suffix(.first))]
    Cancelled { first: Option<Box<SyncError>> },

    /// Some uploads failed; carries the first failure
    #[error("{failed} of {total} file(s) failed to copy; first error: {first}")]
    Incomplete {
        failed: usize,
        total: usize,
        first: Box<SyncError>,
    },
}

impl SyncError {
    pub fn transfer(file: impl Into<PathBuf>, message: impl ToString) -> Self {
        SyncError::Transfer {
            file: file.into(),
            message: message.to_string(),
        }
    }

    pub fn command(command: impl Into<String>, output: impl Into<String>) -> Self {
        SyncError::Command {
            command: command.into(),
            output: output.into(),
        }
    }

    /// Errors after which no further remote call should be attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_)
                | SyncError::PathOutsideRoot { .. }
                | SyncError::Cancelled { .. }
        )
    }
}

fn first_error_suffix(first: &Option<Box<SyncError>>) -> String {
    match first {
        Some(e) => format!("; first error: {e}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SyncError::Connection("refused".into()).is_fatal());
        assert!(SyncError::Cancelled { first: None }.is_fatal());
        assert!(!SyncError::transfer("/src/a.txt", "disk full").is_fatal());
        assert!(!SyncError::command("mkdir", "denied").is_fatal());
    }

    #[test]
    fn incomplete_mentions_first_error() {
        let err = SyncError::Incomplete {
            failed: 2,
            total: 5,
            first: Box::new(SyncError::transfer("/src/a.txt", "permission denied")),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 of 5 file(s) failed"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn cancelled_keeps_earlier_failure() {
        assert_eq!(SyncError::Cancelled { first: None }.to_string(), "Sync cancelled");
        let err = SyncError::Cancelled {
            first: Some(Box::new(SyncError::transfer("/src/a.txt", "disk full"))),
        };
        assert_eq!(
            err.to_string(),
            "Sync cancelled; first error: Transfer failed for /src/a.txt: disk full"
        );
    }
}
