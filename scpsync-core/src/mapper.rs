use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};

pub fn to_posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Forward slashes, no repeated or trailing separators (`/` stays `/`).
pub fn normalize_remote(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Join `rel` onto the remote folder `dir`.
pub fn join_remote(dir: &str, rel: &str) -> String {
    let dir = normalize_remote(dir);
    let rel = normalize_remote(rel);
    let rel = rel.trim_start_matches('/');
    match dir.as_str() {
        "" => rel.to_string(),
        "/" => format!("/{rel}"),
        _ => format!("{dir}/{rel}"),
    }
}

/// Re-root `local_file` from `source_root` onto `target_root`.
pub fn map_to_remote(source_root: &Path, target_root: &str, local_file: &Path) -> Result<String> {
    let rel = local_file
        .strip_prefix(source_root)
        .ok()
        .filter(|rel| !rel.as_os_str().is_empty())
        .ok_or_else(|| SyncError::PathOutsideRoot {
            path: local_file.to_path_buf(),
            root: source_root.to_path_buf(),
        })?;
    Ok(join_remote(target_root, &to_posix(rel)))
}

/// Parent folder of a remote path.
pub fn dir_of(remote_path: &str) -> String {
    match remote_path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    }
}

/// Maps local files of one job onto the remote target folder.
#[derive(Debug, Clone)]
pub struct PathMapper {
    source: PathBuf,
    target: String,
    flatten: bool,
}

impl PathMapper {
    pub fn new(source: impl Into<PathBuf>, target: &str, flatten: bool) -> Self {
        Self {
            source: source.into(),
            target: normalize_remote(target),
            flatten,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn remote_path(&self, local_file: &Path) -> Result<String> {
        let mapped = map_to_remote(&self.source, &self.target, local_file)?;
        if !self.flatten {
            return Ok(mapped);
        }
        let name = mapped.rsplit('/').next().unwrap_or(&mapped);
        Ok(join_remote(&self.target, name))
    }

    pub fn remote_dir(&self, local_file: &Path) -> Result<String> {
        self.remote_path(local_file).map(|p| dir_of(&p))
    }
}
