//! Copying artifacts and recreating their symbolic links.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::report::{Warning, WarningKind};
use crate::scan::{DiscoveredEntry, EntryKind, LinkTarget};

/// Files actually copied during one run, keyed by source base name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentRecord {
    names: BTreeMap<String, String>,
    /// Destination names held by regular files this run, in place ones included.
    taken: BTreeSet<String>,
    destination: PathBuf,
}

impl DeploymentRecord {
    /// Deployed base name of a source file, if it was copied.
    pub fn deployed_name(&self, source_name: &str) -> Option<&str> {
        self.names.get(source_name).map(String::as_str)
    }

    pub fn deployed_path(&self, source_name: &str) -> Option<PathBuf> {
        self.deployed_name(source_name)
            .map(|name| self.destination.join(name))
    }

    /// Deployed base names, in source-name order.
    pub fn deployed_names(&self) -> impl Iterator<Item = &str> {
        self.names.values().map(String::as_str)
    }

    /// Whether a regular file deployed this run already owns `dest_name`.
    pub fn is_taken(&self, dest_name: &str) -> bool {
        self.taken.contains(dest_name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Result of deploying one regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied(PathBuf),
    /// A stale file from an earlier run was overwritten.
    Replaced(PathBuf),
    /// Source and destination are the same file.
    SameFile(PathBuf),
    /// An earlier artifact already took this destination name.
    Shadowed(PathBuf),
}

/// Copies regular files into the destination and remembers their names.
#[derive(Debug)]
pub struct Deployer {
    destination: PathBuf,
    rename: BTreeMap<String, String>,
    record: DeploymentRecord,
}

impl Deployer {
    /// Create the destination directory if needed.
    pub fn new(destination: &Path, rename: BTreeMap<String, String>) -> Result<Self> {
        if destination.exists() && !destination.is_dir() {
            bail!(
                "Destination exists but is not a directory: {}",
                destination.display()
            );
        }
        fs::create_dir_all(destination).with_context(|| {
            format!("Failed to create destination: {}", destination.display())
        })?;

        Ok(Self {
            destination: destination.to_path_buf(),
            rename,
            record: DeploymentRecord {
                names: BTreeMap::new(),
                taken: BTreeSet::new(),
                destination: destination.to_path_buf(),
            },
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Copy one regular file, preserving permissions and timestamps.
    ///
    /// # Errors
    ///
    /// Any I/O failure is returned with the source path attached; the caller
    /// must not continue the run.
    pub fn deploy(&mut self, entry: &DiscoveredEntry) -> Result<CopyOutcome> {
        if entry.is_symlink() {
            bail!(
                "Symbolic links are recreated, not copied: {}",
                entry.path.display()
            );
        }

        let source_name = entry.file_name();
        let dest_name = self
            .rename
            .get(source_name)
            .map_or(source_name, String::as_str)
            .to_string();
        let dest_path = self.destination.join(&dest_name);

        if !self.record.taken.insert(dest_name.clone()) {
            return Ok(CopyOutcome::Shadowed(dest_path));
        }

        if is_same_file(&entry.path, &dest_path) {
            tracing::info!(path = %entry.path.display(), "Skipping copy of file onto itself");
            return Ok(CopyOutcome::SameFile(dest_path));
        }

        let replaced = remove_existing(&dest_path).with_context(|| {
            format!(
                "Failed to deploy {}: cannot replace {}",
                entry.path.display(),
                dest_path.display()
            )
        })?;
        if replaced {
            tracing::info!(path = %dest_path.display(), "Overwriting artifact from a previous run");
        }

        copy_with_metadata(&entry.path, &dest_path).with_context(|| {
            format!(
                "Failed to copy {} -> {}",
                entry.path.display(),
                dest_path.display()
            )
        })?;
        tracing::info!(
            source = %entry.path.display(),
            dest = %dest_path.display(),
            "Deployed artifact"
        );

        self.record
            .names
            .insert(source_name.to_string(), dest_name);

        Ok(if replaced {
            CopyOutcome::Replaced(dest_path)
        } else {
            CopyOutcome::Copied(dest_path)
        })
    }

    /// Finish the copy phase and hand over the record.
    pub fn into_record(self) -> DeploymentRecord {
        self.record
    }
}

/// Result of recreating one symbolic link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Created { link: PathBuf, target: String },
    /// An existing entry at the link's name was removed first.
    Replaced { link: PathBuf, target: String },
    /// The link already points where it should.
    Unchanged { link: PathBuf, target: String },
    /// The link would point at itself, so the file it resolves to was
    /// copied in its place.
    Dereferenced { link: PathBuf, source: PathBuf },
}

/// Links recreated by [`reconstruct_links`] and the ones that failed.
#[derive(Debug, Default)]
pub struct LinkReport {
    pub outcomes: Vec<LinkOutcome>,
    pub warnings: Vec<Warning>,
}

impl LinkReport {
    pub fn relinked(&self) -> usize {
        self.outcomes.len()
    }

    /// Names of the links now present in the destination.
    pub fn link_names(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|outcome| {
            let link = match outcome {
                LinkOutcome::Created { link, .. }
                | LinkOutcome::Replaced { link, .. }
                | LinkOutcome::Unchanged { link, .. }
                | LinkOutcome::Dereferenced { link, .. } => link,
            };
            link.file_name().and_then(|name| name.to_str())
        })
    }
}

/// Recreate every deployable symbolic link inside `destination`.
///
/// Each link keeps its name and points at the deployed name of its target
/// when the target was copied this run, or at the target's bare name
/// otherwise. Must run after every regular file has been deployed.
/// A link whose name a deployed file or an earlier link already holds is
/// skipped. Failures are collected as warnings.
pub fn reconstruct_links(
    entries: &[DiscoveredEntry],
    record: &DeploymentRecord,
    destination: &Path,
) -> LinkReport {
    let mut report = LinkReport::default();
    let mut linked = HashSet::new();

    for entry in entries.iter().filter(|e| e.pattern.deploy()) {
        let EntryKind::SymbolicLink(target) = &entry.kind else {
            continue;
        };

        let name = entry.file_name();
        if record.is_taken(name) || !linked.insert(name) {
            report.warnings.push(Warning::emit(
                WarningKind::DuplicateName,
                format!(
                    "{} skipped, {} was already deployed from another location",
                    entry.path.display(),
                    destination.join(name).display()
                ),
            ));
            continue;
        }

        match reconstruct_link(entry, target, record, destination) {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(err) => report.warnings.push(Warning::emit(
                WarningKind::LinkFailed,
                format!("Could not recreate {}: {:#}", entry.path.display(), err),
            )),
        }
    }

    report
}

fn reconstruct_link(
    entry: &DiscoveredEntry,
    target: &LinkTarget,
    record: &DeploymentRecord,
    destination: &Path,
) -> Result<LinkOutcome> {
    let name = entry.file_name();
    let target_name = target
        .file_name()
        .with_context(|| format!("Symlink target has no file name: {}", target.raw.display()))?;
    let new_target = record.deployed_name(target_name).unwrap_or(target_name);
    let link = destination.join(name);

    if new_target == name {
        // e.g. build/libz.so.1 -> /usr/lib/libz.so.1
        return dereference(entry, target, &link);
    }

    if fs::read_link(&link).is_ok_and(|current| current == Path::new(new_target)) {
        tracing::debug!(link = %link.display(), target = new_target, "Link already up to date");
        return Ok(LinkOutcome::Unchanged {
            link,
            target: new_target.to_string(),
        });
    }

    let replaced = remove_existing(&link)
        .with_context(|| format!("Failed to remove existing {}", link.display()))?;
    create_symlink(Path::new(new_target), &link).with_context(|| {
        format!(
            "Failed to create symlink {} -> {}",
            link.display(),
            new_target
        )
    })?;
    tracing::info!(link = %link.display(), target = new_target, "Recreated symlink");

    let target = new_target.to_string();
    Ok(if replaced {
        LinkOutcome::Replaced { link, target }
    } else {
        LinkOutcome::Created { link, target }
    })
}

fn dereference(entry: &DiscoveredEntry, target: &LinkTarget, link: &Path) -> Result<LinkOutcome> {
    let source = target
        .resolved
        .as_ref()
        .filter(|resolved| resolved.is_file())
        .with_context(|| {
            format!(
                "Symlink {} would point at itself and its target {} is not a file",
                entry.path.display(),
                target.raw.display()
            )
        })?;

    if is_same_file(source, link) {
        return Ok(LinkOutcome::Unchanged {
            link: link.to_path_buf(),
            target: entry.file_name().to_string(),
        });
    }

    remove_existing(link)?;
    copy_with_metadata(source, link)
        .with_context(|| format!("Failed to copy {} -> {}", source.display(), link.display()))?;
    tracing::info!(link = %link.display(), source = %source.display(), "Copied link target in place of link");

    Ok(LinkOutcome::Dereferenced {
        link: link.to_path_buf(),
        source: source.clone(),
    })
}

/// True when `dest` is a real file that is the very same file as `src`.
///
/// A link at `dest` never counts: it belongs to an earlier run and is
/// replaced rather than copied onto.
fn is_same_file(src: &Path, dest: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(dest) else {
        return false;
    };
    if meta.file_type().is_symlink() {
        return false;
    }
    match (fs::canonicalize(src), fs::canonicalize(dest)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Remove whatever file or link sits at `path`.
///
/// Returns `Ok(true)` if something was removed.
fn remove_existing(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Copy contents and permissions, then carry over access and modification times.
fn copy_with_metadata(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest)?;

    let meta = fs::metadata(src)?;
    let times = fs::FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    // futimens only needs ownership, so a read-only handle works even for
    // files copied without write permission
    fs::File::open(dest)?.set_times(times)
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
