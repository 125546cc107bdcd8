use crate::error::{Result, SyncError};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Credentials used to open an SSH connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Auth {
    Password {
        password: String,
    },
    /// Private key given inline (`key`) or as a file (`key_path`).
    /// The passphrase is optional for unencrypted keys.
    Key {
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        key_path: Option<PathBuf>,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    pub auth: Auth,
    /// allowed host key fingerprints (`SHA256:...`) or base64 keys
    #[serde(default)]
    pub fingerprints: Option<Vec<String>>,
    #[serde(default = "ConnectionParams::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "ConnectionParams::default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl ConnectionParams {
    fn default_connect_timeout_secs() -> u64 { 30 }
    fn default_command_timeout_secs() -> u64 { 600 }

    pub fn port(&self) -> u16 {
        match self.port {
            Some(p) if p != 0 => p,
            _ => DEFAULT_SSH_PORT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SyncError::Config("connection host is empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(SyncError::Config("connection username is empty".into()));
        }
        if let Auth::Key { key, key_path, .. } = &self.auth {
            let inline = key.as_deref().map(|k| !k.trim().is_empty()).unwrap_or(false);
            if !inline && key_path.is_none() {
                return Err(SyncError::Config(
                    "key authentication needs either `key` or `key_path`".into(),
                ));
            }
        }
        Ok(())
    }
}

/// One copy job: which local files go where on which host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub name:      String,
    /// local source folder
    pub source:    PathBuf,
    /// remote target folder (POSIX path)
    pub target:    String,
    /// include / exclude glob lines: a list, or one newline-delimited block
    #[serde(default, deserialize_with = "deserialize_contents")]
    pub contents:  Vec<String>,
    /// remove the target folder before copying
    #[serde(default)]
    pub clean_target: bool,
    /// copy every file straight into the target folder
    #[serde(default)]
    pub flatten_folders: bool,
    /// number of uploads in flight; 1 keeps the strictly sequential order
    #[serde(default = "SyncConfig::default_concurrency")]
    pub concurrency: usize,
    /// Max retry attempts for a failed upload
    #[serde(default)]
    pub retry_max: u32,
    /// Initial backoff in ms for retries (exponential)
    #[serde(default = "SyncConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    pub connection: ConnectionParams,
}

impl SyncConfig {
    fn default_concurrency() -> usize { 1 }
    fn default_retry_backoff_ms() -> u64 { 500 }

    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(SyncError::Config(format!("job '{}': target folder is empty", self.name)));
        }
        if self.source.as_os_str().is_empty() {
            return Err(SyncError::Config(format!("job '{}': source folder is empty", self.name)));
        }
        self.connection.validate()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PatternInput {
    Lines(Vec<String>),
    Block(String),
}

fn deserialize_contents<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match PatternInput::deserialize(d)? {
        PatternInput::Lines(lines) => lines,
        PatternInput::Block(text) => pattern_lines(&text),
    })
}

/// Split a newline-delimited pattern block into lines. Empty lines are kept.
pub fn pattern_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
- name: web
  source: /build/out
  target: /var/www/site
  contents:
    - "**"
    - "!**/*.map"
  clean_target: true
  connection:
    host: deploy.example.com
    username: ci
    auth:
      type: key
      key_path: /home/ci/.ssh/id_ed25519
"#;

    #[test]
    fn parses_yaml_jobs_with_defaults() {
        let jobs: Vec<SyncConfig> = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.contents, vec!["**", "!**/*.map"]);
        assert!(job.clean_target);
        assert!(!job.flatten_folders);
        assert_eq!(job.concurrency, 1);
        assert_eq!(job.retry_max, 0);
        assert_eq!(job.connection.port(), DEFAULT_SSH_PORT);
        assert_eq!(job.connection.command_timeout_secs, 600);
        job.validate().unwrap();
    }

    #[test]
    fn parses_json_password_auth() {
        let json = r#"{
            "name": "docs", "source": "docs", "target": "/srv/docs",
            "connection": {
                "host": "10.0.0.5", "port": 2222, "username": "u",
                "auth": { "type": "password", "password": "secret" }
            }
        }"#;
        let job: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(job.connection.port(), 2222);
        assert!(matches!(job.connection.auth, Auth::Password { .. }));
        assert!(job.contents.is_empty());
    }

    #[test]
    fn key_auth_requires_key_material() {
        let params = ConnectionParams {
            host: "h".into(),
            port: None,
            username: "u".into(),
            auth: Auth::Key { key: Some("  ".into()), key_path: None, passphrase: None },
            fingerprints: None,
            connect_timeout_secs: 30,
            command_timeout_secs: 600,
        };
        assert!(matches!(params.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn contents_accepts_text_block() {
        let yaml = r#"
name: block
source: out
target: /t
contents: "**\n!*.log\n\n!!keep.log"
connection:
  host: h
  username: u
  auth: { type: password, password: p }
"#;
        let job: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(job.contents, vec!["**", "!*.log", "", "!!keep.log"]);
    }

    #[test]
    fn pattern_lines_keep_empty_lines() {
        assert_eq!(pattern_lines("**\r\n\n!*.log"), vec!["**", "", "!*.log"]);
        assert!(pattern_lines("").is_empty());
    }
}
