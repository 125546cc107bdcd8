//! Core library for scpsync – copies a filtered local tree to a remote host over SSH.

pub mod command;
mod config;
mod error;
pub mod filter;
pub mod mapper;
mod remote;
mod task;

pub use config::{pattern_lines, Auth, ConnectionParams, SyncConfig, DEFAULT_SSH_PORT};
pub use error::{Result, SyncError};
pub use filter::{resolve, PathFilter, PatternExpr, Polarity};
pub use mapper::{dir_of, map_to_remote, PathMapper};
pub use remote::{CommandOutput, RemoteSession};
pub use task::{
    spawn_task, sync, SyncReport, SyncState, SyncTask, SyncTaskHandle, TransferOutcome,
    TransferStatus,
};
