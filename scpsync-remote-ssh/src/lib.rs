//! SSH transport for scpsync: shell commands over an interactive channel,
//! file uploads over the SFTP subsystem.

mod ssh_client;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{decode_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use scpsync_core::mapper::join_remote;
use scpsync_core::{Auth, CommandOutput, ConnectionParams, RemoteSession, Result, SyncError};
use ssh_client::Client;
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// `ext` value of SSH extended data carrying stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

fn connection_err(what: &str, e: impl Display) -> SyncError {
    SyncError::Connection(format!("{what}: {e}"))
}

/// Opens a fresh SSH connection for every command and every upload.
pub struct SshSession {
    params: ConnectionParams,
    config: Arc<client::Config>,
}

impl SshSession {
    pub fn new(params: ConnectionParams) -> Result<Self> {
        params.validate()?;
        if params.port.unwrap_or(0) == 0 {
            info!(
                "Using port {} which is the default for SSH since no port was specified.",
                scpsync_core::DEFAULT_SSH_PORT
            );
        }
        if matches!(params.auth, Auth::Key { .. }) {
            debug!("Using private key and passphrase for connecting.");
        } else {
            debug!("Using password for connecting.");
        }
        Ok(Self {
            params,
            config: Arc::new(client::Config::default()),
        })
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.params.command_timeout_secs)
    }

    async fn connect(&self) -> Result<Handle<Client>> {
        let limit = Duration::from_secs(self.params.connect_timeout_secs);
        let host = &self.params.host;
        tokio::time::timeout(limit, self.connect_and_authenticate())
            .await
            .map_err(|_| {
                SyncError::Connection(format!(
                    "timed out after {}s connecting to {host}",
                    limit.as_secs()
                ))
            })?
    }

    async fn connect_and_authenticate(&self) -> Result<Handle<Client>> {
        let host = self.params.host.as_str();
        let port = self.params.port();
        let user = self.params.username.as_str();
        let handler = Client::new(self.params.fingerprints.clone());
        let mut session = client::connect(self.config.clone(), (host, port), handler)
            .await
            .map_err(|e| connection_err(&format!("connect to {host}:{port}"), e))?;

        let res = match &self.params.auth {
            Auth::Password { password } => session.authenticate_password(user, password).await,
            Auth::Key { .. } => {
                let key = self.load_key().await?;
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| connection_err("negotiate key hash", e))?
                    .flatten();
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
                session.authenticate_publickey(user, key).await
            }
        }
        .map_err(|e| connection_err("authenticate", e))?;

        if let AuthResult::Failure {
            remaining_methods,
            partial_success,
        } = res
        {
            return Err(SyncError::Connection(format!(
                "Authentication failed for {user}@{host}, \
                 remaining_methods: {remaining_methods:?}, partial_success: {partial_success}"
            )));
        }
        debug!(host, port, user, "connected");
        Ok(session)
    }

    async fn load_key(&self) -> Result<PrivateKey> {
        let Auth::Key {
            key,
            key_path,
            passphrase,
        } = &self.params.auth
        else {
            return Err(SyncError::Config("not using key authentication".into()));
        };
        let text = match (key, key_path) {
            (Some(k), _) if !k.trim().is_empty() => k.clone(),
            (_, Some(path)) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| connection_err(&format!("read private key {}", path.display()), e))?,
            _ => return Err(SyncError::Config("no private key configured".into())),
        };
        decode_secret_key(&text, passphrase.as_deref())
            .map_err(|e| connection_err("decode private key", e))
    }
}

async fn close(session: Handle<Client>) {
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "en-US")
        .await
    {
        debug!("disconnect: {e}");
    }
}

/// Write the command and `exit` into a shell channel and collect everything
/// it prints until the server closes the channel.
async fn run_in_shell(session: &Handle<Client>, command: &str) -> Result<CommandOutput> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| connection_err("open channel", e))?;
    channel
        .request_shell(true)
        .await
        .map_err(|e| connection_err("request shell", e))?;
    let script = format!("{command}\nexit\n");
    channel
        .data(script.as_bytes())
        .await
        .map_err(|e| connection_err("write command", e))?;
    channel
        .eof()
        .await
        .map_err(|e| connection_err("close stdin", e))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
        exit_status,
    })
}

async fn upload_over_sftp(session: &Handle<Client>, local: &Path, remote_dir: &str) -> Result<()> {
    let name = local
        .file_name()
        .ok_or_else(|| SyncError::transfer(local, "path has no file name"))?
        .to_string_lossy()
        .to_string();
    let remote = join_remote(remote_dir, &name);
    let mut reader = tokio::fs::File::open(local)
        .await
        .map_err(|e| SyncError::transfer(local, e))?;

    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| connection_err("open channel", e))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| connection_err("request sftp subsystem", e))?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| connection_err("start sftp", e))?;

    let copied = async {
        let mut remote_file = sftp
            .create(remote.clone())
            .await
            .map_err(|e| SyncError::transfer(local, format!("create {remote}: {e}")))?;
        let bytes = tokio::io::copy(&mut reader, &mut remote_file)
            .await
            .map_err(|e| SyncError::transfer(local, e))?;
        // only a clean close means the server has the whole file
        remote_file
            .shutdown()
            .await
            .map_err(|e| SyncError::transfer(local, format!("close {remote}: {e}")))?;
        Ok::<u64, SyncError>(bytes)
    }
    .await;

    match copied {
        Ok(bytes) => {
            debug!(remote = %remote, bytes, "upload complete");
            Ok(())
        }
        Err(e) => {
            if let Err(rm) = sftp.remove_file(remote.clone()).await {
                debug!("could not remove partial file {remote}: {rm}");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        let session = self.connect().await?;
        let limit = self.command_timeout();
        let result = match tokio::time::timeout(limit, run_in_shell(&session, command)).await {
            Ok(res) => res,
            Err(_) => Err(SyncError::command(
                command,
                format!("timed out after {}s", limit.as_secs()),
            )),
        };
        close(session).await;
        if let Ok(out) = &result {
            debug!(exit_status = ?out.exit_status, output = %out.combined(), "command finished");
        }
        result
    }

    async fn upload_file(&self, local: &Path, remote_dir: &str) -> Result<()> {
        let session = self.connect().await?;
        let limit = self.command_timeout();
        let upload = upload_over_sftp(&session, local, remote_dir);
        let result = match tokio::time::timeout(limit, upload).await {
            Ok(res) => res,
            Err(_) => Err(SyncError::transfer(
                local,
                format!("timed out after {}s", limit.as_secs()),
            )),
        };
        close(session).await;
        if let Err(e) = &result {
            warn!("upload of {} failed: {e}", local.display());
        } else {
            info!("Copied {} successfully to {} on remote machine.", local.display(), remote_dir);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn params(port: u16, auth: Auth) -> ConnectionParams {
        ConnectionParams {
            host: "127.0.0.1".into(),
            port: Some(port),
            username: "tester".into(),
            auth,
            fingerprints: None,
            connect_timeout_secs: 1,
            command_timeout_secs: 1,
        }
    }

    fn password() -> Auth {
        Auth::Password {
            password: "secret".into(),
        }
    }

    #[test]
    fn rejects_invalid_params() {
        let mut p = params(22, password());
        p.host = " ".into();
        assert!(matches!(SshSession::new(p), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let session = SshSession::new(params(port, password())).unwrap();
        let err = session.run_command("true").await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)), "{err}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        // accepts TCP but never speaks SSH
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let session = SshSession::new(params(port, password())).unwrap();
        let err = session
            .upload_file(Path::new("Cargo.toml"), "/tmp")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Connection(ref m) if m.contains("timed out")), "{err}");
        drop(listener);
    }

    #[tokio::test]
    async fn unreadable_key_file_fails_before_auth() {
        let dir = tempfile::tempdir().unwrap();
        let session = SshSession::new(params(
            22,
            Auth::Key {
                key: None,
                key_path: Some(dir.path().join("missing_id")),
                passphrase: None,
            },
        ))
        .unwrap();
        let err = session.load_key().await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(ref m) if m.contains("read private key")));
    }

    #[tokio::test]
    async fn garbage_inline_key_is_rejected() {
        let session = SshSession::new(params(
            22,
            Auth::Key {
                key: Some("not a key".into()),
                key_path: None,
                passphrase: Some("pw".into()),
            },
        ))
        .unwrap();
        let err = session.load_key().await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(ref m) if m.contains("decode private key")));
    }
}
