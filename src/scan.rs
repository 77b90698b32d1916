//! Artifact discovery under build output directories.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ArtifactPattern;

/// Immediate target of a discovered symbolic link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    /// Target exactly as stored in the link.
    pub raw: PathBuf,
    pub absolute: bool,
    /// Absolute target path, if something exists there.
    pub resolved: Option<PathBuf>,
    /// The target is itself one of the discovered regular files.
    pub discovered: bool,
}

impl LinkTarget {
    /// Base name of the immediate target.
    pub fn file_name(&self) -> Option<&str> {
        self.raw.file_name().and_then(|name| name.to_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    SymbolicLink(LinkTarget),
}

/// A file or symbolic link found under a build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEntry {
    /// Absolute source path.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// First pattern the file name matched.
    pub pattern: ArtifactPattern,
}

impl DiscoveredEntry {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::SymbolicLink(_))
    }

    pub fn link_target(&self) -> Option<&LinkTarget> {
        match &self.kind {
            EntryKind::SymbolicLink(target) => Some(target),
            EntryKind::RegularFile => None,
        }
    }
}

/// Read the immediate target of a symbolic link.
///
/// Chains are not followed: only the first hop matters when the link is
/// recreated next to its target. Relative targets are resolved against the
/// link's directory purely to check that they exist.
pub fn resolve_link(link: &Path) -> Result<LinkTarget> {
    let raw = fs::read_link(link)
        .with_context(|| format!("Failed to read symlink: {}", link.display()))?;
    let absolute = raw.is_absolute();

    let candidate = if absolute {
        raw.clone()
    } else {
        let parent = link
            .parent()
            .with_context(|| format!("Symlink has no parent: {}", link.display()))?;
        normalize(&parent.join(&raw))
    };

    // symlink_metadata so a target that is itself a (possibly dangling)
    // link still counts as present
    let resolved = fs::symlink_metadata(&candidate).ok().map(|_| candidate);

    Ok(LinkTarget {
        raw,
        absolute,
        resolved,
        discovered: false,
    })
}

/// Discover matching artifacts under a single build root.
///
/// A missing root is not an error and yields nothing.
pub fn scan_root(root: &Path, patterns: &[ArtifactPattern]) -> Result<Vec<DiscoveredEntry>> {
    scan(&[root.to_path_buf()], patterns)
}

/// Discover matching artifacts under every root, in root order.
///
/// Entries within a root are sorted by path. An entry reachable from two
/// roots is reported once, under the first.
pub fn scan(roots: &[PathBuf], patterns: &[ArtifactPattern]) -> Result<Vec<DiscoveredEntry>> {
    scan_excluding(roots, patterns, None)
}

/// Like [`scan`], but never descends into `excluded` when it lies strictly
/// inside a root.
///
/// Used to keep a destination nested in a build root (`build/lib.*` under
/// `build/`) from rediscovering the copies of an earlier run. A root equal
/// to `excluded` is still walked.
pub fn scan_excluding(
    roots: &[PathBuf],
    patterns: &[ArtifactPattern],
    excluded: Option<&Path>,
) -> Result<Vec<DiscoveredEntry>> {
    let excluded = excluded.map(absolute).transpose()?;
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for root in roots {
        let root = absolute(root)?;
        if !root.is_dir() {
            tracing::debug!(root = %root.display(), "Build root does not exist, skipping");
            continue;
        }

        let skip = excluded
            .as_deref()
            .filter(|dir| *dir != root.as_path() && dir.starts_with(&root));
        let mut found = walk_root(&root, patterns, skip)?;
        found.sort_by(|a, b| a.path.cmp(&b.path));
        for entry in found {
            if seen.insert(entry.path.clone()) {
                entries.push(entry);
            }
        }
    }

    let files: HashSet<PathBuf> = entries
        .iter()
        .filter(|entry| !entry.is_symlink())
        .map(|entry| entry.path.clone())
        .collect();

    for entry in &mut entries {
        if let EntryKind::SymbolicLink(target) = &mut entry.kind {
            target.discovered = target
                .resolved
                .as_ref()
                .is_some_and(|resolved| files.contains(resolved));
        }
    }

    Ok(entries)
}

fn walk_root(
    root: &Path,
    patterns: &[ArtifactPattern],
    skip: Option<&Path>,
) -> Result<Vec<DiscoveredEntry>> {
    let mut found = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| skip.is_none_or(|dir| normalize(entry.path()) != dir));
    for entry in walker {
        let entry =
            entry.with_context(|| format!("Failed to traverse build root: {}", root.display()))?;

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(pattern) = patterns.iter().find(|p| p.matches(name)) else {
            continue;
        };

        let file_type = entry.file_type();
        let path = normalize(entry.path());

        let kind = if file_type.is_file() {
            EntryKind::RegularFile
        } else if file_type.is_symlink() {
            // links to directories are not artifacts
            if fs::metadata(&path).is_ok_and(|m| m.is_dir()) {
                continue;
            }
            EntryKind::SymbolicLink(resolve_link(&path)?)
        } else {
            continue;
        };

        found.push(DiscoveredEntry {
            path,
            kind,
            pattern: pattern.clone(),
        });
    }

    Ok(found)
}

/// Log every file under the roots, for diagnosing an empty scan.
pub fn log_tree(roots: &[PathBuf]) {
    for root in roots.iter().filter(|root| root.is_dir()) {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_dir() {
                tracing::debug!(path = %entry.path().display(), "Unmatched build output");
            }
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve path: {}", path.display()))?;
    Ok(normalize(&path))
}

/// Lexically remove `.` and `..` components without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
