//! Pattern resolution: turns include / exclude glob lines plus a source
//! folder into the ordered list of local files to copy.
//!
//! Each line may start with a run of `!` markers. Every marker toggles the
//! polarity, so `!a` excludes, `!!a` includes and `!!!a` excludes again.
//! Lines are trimmed but never dropped; an empty line is a pattern that
//! matches nothing.

use crate::error::{Result, SyncError};
use crate::mapper::to_posix;
use globset::{GlobBuilder, GlobMatcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Case folding follows the usual filesystem convention of the platform.
const CASE_INSENSITIVE: bool = cfg!(any(windows, target_os = "macos"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Include,
    Exclude,
}

/// One trimmed line of the pattern list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternExpr {
    pub raw: String,
    pub polarity: Polarity,
    /// pattern text after the `!` markers, relative to the source folder
    pub remainder: String,
    /// source folder joined with the remainder, forward slashes
    pub glob: String,
}

impl PatternExpr {
    pub fn parse(root: &Path, line: &str) -> Self {
        let raw = line.trim().to_string();
        let markers = raw.bytes().take_while(|b| *b == b'!').count();
        let polarity = if markers % 2 == 1 {
            Polarity::Exclude
        } else {
            Polarity::Include
        };
        let remainder = clean_remainder(&raw[markers..]);
        let glob = format!("{}/{}", to_posix(root).trim_end_matches('/'), remainder);
        Self {
            raw,
            polarity,
            remainder,
            glob,
        }
    }
}

fn clean_remainder(s: &str) -> String {
    // a backslash is a separator on Windows and a glob escape everywhere else
    let s = if cfg!(windows) {
        s.replace('\\', "/")
    } else {
        s.to_string()
    };
    let mut rest = s.as_str();
    loop {
        if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
        } else {
            break;
        }
    }
    rest.to_string()
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    expr: PatternExpr,
    matcher: GlobMatcher,
    /// pattern has no separator, so it is also tried against the file name
    basename: bool,
}

impl CompiledPattern {
    fn compile(expr: PatternExpr) -> Result<Self> {
        let glob = GlobBuilder::new(&expr.remainder)
            .literal_separator(true)
            .case_insensitive(CASE_INSENSITIVE)
            .build()
            .map_err(|source| SyncError::PatternSyntax {
                pattern: expr.raw.clone(),
                source,
            })?;
        let basename = !expr.remainder.contains('/');
        Ok(Self {
            matcher: glob.compile_matcher(),
            basename,
            expr,
        })
    }

    fn is_match(&self, file: &SourceFile) -> bool {
        if self.matcher.is_match(&file.rel) {
            return true;
        }
        self.basename && self.matcher.is_match(file.name())
    }
}

/// A regular file found under the source folder.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    /// path relative to the source folder, forward slashes
    pub rel: String,
}

impl SourceFile {
    fn name(&self) -> &str {
        self.rel.rsplit('/').next().unwrap_or(&self.rel)
    }
}

/// Runtime filter compiled from the pattern lines.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Vec<CompiledPattern>,
    exclude: Vec<CompiledPattern>,
}

impl PathFilter {
    /// Compile every line. Fails on the first malformed glob.
    pub fn new<S: AsRef<str>>(root: &Path, lines: &[S]) -> Result<Self> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for line in lines {
            let expr = PatternExpr::parse(root, line.as_ref());
            debug!(pattern = %expr.raw, glob = %expr.glob, polarity = ?expr.polarity, "pattern");
            let compiled = CompiledPattern::compile(expr)?;
            match compiled.expr.polarity {
                Polarity::Include => include.push(compiled),
                Polarity::Exclude => exclude.push(compiled),
            }
        }
        if include.is_empty() && !exclude.is_empty() {
            debug!("only exclude patterns given, matching everything first");
            include.push(CompiledPattern::compile(PatternExpr::parse(root, "**"))?);
        }
        Ok(Self { include, exclude })
    }

    pub fn includes(&self) -> impl Iterator<Item = &PatternExpr> {
        self.include.iter().map(|p| &p.expr)
    }

    pub fn excludes(&self) -> impl Iterator<Item = &PatternExpr> {
        self.exclude.iter().map(|p| &p.expr)
    }

    /// Union of include matches in first-seen order, minus exclude matches.
    pub fn select(&self, candidates: &[SourceFile]) -> Vec<PathBuf> {
        let mut seen: HashSet<&Path> = HashSet::new();
        let mut working: Vec<&SourceFile> = Vec::new();
        for pat in &self.include {
            let mut hits = 0usize;
            for file in candidates {
                if pat.is_match(file) {
                    hits += 1;
                    if seen.insert(file.path.as_path()) {
                        working.push(file);
                    }
                }
            }
            if hits == 0 && !pat.expr.remainder.is_empty() {
                warn!(pattern = %pat.expr.raw, "include pattern matched no files");
            }
        }
        working
            .into_iter()
            .filter(|file| !self.exclude.iter().any(|pat| pat.is_match(file)))
            .map(|file| file.path.clone())
            .collect()
    }
}

/// Recursively list regular files under `root`, sorted by name per folder.
///
/// Symlinks are not followed while walking. A link whose target is a
/// regular file counts as a file; links to folders and broken links are
/// skipped.
pub fn enumerate(root: &Path) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let ft = entry.file_type();
        let is_file = if ft.is_symlink() {
            std::fs::metadata(entry.path())
                .map(|m| m.is_file())
                .unwrap_or(false)
        } else {
            ft.is_file()
        };
        if !is_file {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => to_posix(rel),
            Err(_) => continue,
        };
        files.push(SourceFile {
            path: entry.into_path(),
            rel,
        });
    }
    Ok(files)
}

/// Resolve pattern lines against the files under `root`.
///
/// An empty pattern list resolves to nothing; there is no implicit
/// "copy everything".
pub fn resolve<S: AsRef<str>>(root: &Path, lines: &[S]) -> Result<Vec<PathBuf>> {
    if lines.is_empty() {
        debug!("no patterns given, nothing to copy");
        return Ok(Vec::new());
    }
    // compile before touching the filesystem
    let filter = PathFilter::new(root, lines)?;
    let candidates = enumerate(root)?;
    debug!(candidates = candidates.len(), root = %root.display(), "enumerated source files");
    Ok(filter.select(&candidates))
}
