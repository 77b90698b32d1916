//! Rewriting a deployed module's loader metadata so it finds the libraries
//! deployed next to it.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::config::{ArtifactPattern, ReferencePair};
use crate::platform::{Platform, RewriteStrategy};
use crate::report::{Warning, WarningKind};

/// Result of probing a metadata tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Available { version: String },
    Missing,
    /// Installed but the probe itself failed.
    Broken { reason: String },
}

/// Result of one metadata edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Applied,
    /// The tool ran and exited non-zero.
    Rejected { code: Option<i32>, stderr: String },
    Missing,
    /// The tool could not be started for another reason.
    Failed { reason: String },
}

/// A program that edits the dynamic-linker metadata of a binary.
pub trait MetadataTool {
    /// Name used in log messages and warnings.
    fn name(&self) -> String;

    /// Check the tool can run, without touching any file.
    fn probe(&self) -> ToolStatus;

    /// Replace one embedded dependency reference.
    fn change_reference(&self, old: &str, new: &str, module: &Path) -> ToolOutcome;

    /// Set the module's runtime library search path.
    fn set_search_directive(&self, token: &str, module: &Path) -> ToolOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    InstallNameTool,
    Patchelf,
}

/// A [`MetadataTool`] backed by `install_name_tool` or `patchelf`.
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: PathBuf,
    flavor: Flavor,
}

impl CommandTool {
    pub fn install_name_tool() -> Self {
        Self {
            program: PathBuf::from("install_name_tool"),
            flavor: Flavor::InstallNameTool,
        }
    }

    pub fn patchelf() -> Self {
        Self {
            program: PathBuf::from("patchelf"),
            flavor: Flavor::Patchelf,
        }
    }

    /// The tool matching a platform's rewrite strategy, if it needs one.
    pub fn for_platform(platform: Platform) -> Option<Self> {
        match platform.rewrite_strategy() {
            RewriteStrategy::ReferenceRewrite => Some(Self::install_name_tool()),
            RewriteStrategy::SingleDirective => Some(Self::patchelf()),
            RewriteStrategy::None => None,
        }
    }

    /// Run a different executable with the same command-line conventions.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn run<I, S>(&self, args: I) -> ToolOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match Command::new(&self.program).args(args).output() {
            Ok(output) if output.status.success() => ToolOutcome::Applied,
            Ok(output) => ToolOutcome::Rejected {
                code: output.status.code(),
                stderr: stderr_of(&output),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => ToolOutcome::Missing,
            Err(err) => ToolOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }
}

impl MetadataTool for CommandTool {
    fn name(&self) -> String {
        self.program.display().to_string()
    }

    fn probe(&self) -> ToolStatus {
        match Command::new(&self.program).arg("--version").output() {
            Ok(output) if output.status.success() => ToolStatus::Available {
                version: String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            },
            Ok(output) => ToolStatus::Broken {
                reason: format!("version probe exited with {}: {}", output.status, stderr_of(&output)),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => ToolStatus::Missing,
            Err(err) => ToolStatus::Broken {
                reason: err.to_string(),
            },
        }
    }

    fn change_reference(&self, old: &str, new: &str, module: &Path) -> ToolOutcome {
        let flag = match self.flavor {
            Flavor::InstallNameTool => "-change",
            Flavor::Patchelf => "--replace-needed",
        };
        self.run([OsStr::new(flag), OsStr::new(old), OsStr::new(new), module.as_os_str()])
    }

    fn set_search_directive(&self, token: &str, module: &Path) -> ToolOutcome {
        let flag = match self.flavor {
            Flavor::InstallNameTool => "-add_rpath",
            Flavor::Patchelf => "--set-rpath",
        };
        self.run([OsStr::new(flag), OsStr::new(token), module.as_os_str()])
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Files in the destination that look like the primary module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryModuleSearch {
    /// All matches, sorted by name.
    pub candidates: Vec<PathBuf>,
}

impl PrimaryModuleSearch {
    /// The module to rewrite: the first candidate.
    pub fn handle(&self) -> Option<&Path> {
        self.candidates.first().map(PathBuf::as_path)
    }
}

/// Look for the primary module among the files directly in `destination`.
///
/// Finding nothing is a valid result.
pub fn find_primary_module(
    destination: &Path,
    patterns: &[ArtifactPattern],
) -> Result<PrimaryModuleSearch> {
    let mut candidates = Vec::new();

    let entries = match fs::read_dir(destination) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(PrimaryModuleSearch::default()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to list destination: {}", destination.display()))
        }
    };

    for entry in entries {
        let entry = entry
            .with_context(|| format!("Failed to list destination: {}", destination.display()))?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if path.is_file() && patterns.iter().any(|p| p.matches(&name)) {
            candidates.push(path);
        }
    }

    candidates.sort();
    Ok(PrimaryModuleSearch { candidates })
}

/// Reference rewrites for a module: the explicit ones first, then one per
/// deployed library, mapping its `@rpath` reference to a loader-relative one.
pub fn derive_references<'a>(
    platform: Platform,
    explicit: &[ReferencePair],
    deployed_libraries: impl IntoIterator<Item = &'a str>,
) -> Vec<ReferencePair> {
    let mut pairs: Vec<ReferencePair> = Vec::new();
    let token = platform.self_relative_token();

    let derived = deployed_libraries
        .into_iter()
        .map(|name| ReferencePair::new(format!("@rpath/{name}"), format!("{token}/{name}")));

    for pair in explicit.iter().cloned().chain(derived) {
        if !pairs.iter().any(|existing| existing.old == pair.old) {
            pairs.push(pair);
        }
    }
    pairs
}

/// What the rewrite pass did to the module.
#[derive(Debug, Default)]
pub struct RewriteReport {
    /// Edits that took effect.
    pub applied: usize,
    /// References the module did not contain.
    pub absent: Vec<String>,
    pub warnings: Vec<Warning>,
}

/// Applies a platform's rewrite strategy to a deployed module.
pub struct PathRewriter<'a> {
    platform: Platform,
    tool: Option<&'a dyn MetadataTool>,
}

impl<'a> PathRewriter<'a> {
    pub fn new(platform: Platform, tool: Option<&'a dyn MetadataTool>) -> Self {
        Self { platform, tool }
    }

    pub fn rewrite(&self, module: &Path, references: &[ReferencePair]) -> RewriteReport {
        let strategy = self.platform.rewrite_strategy();
        if strategy == RewriteStrategy::None {
            tracing::debug!(platform = %self.platform, "Loader searches the module directory, nothing to rewrite");
            return RewriteReport::default();
        }

        let Some(tool) = self.tool else {
            return RewriteReport {
                warnings: vec![Warning::emit(
                    WarningKind::ToolMissing,
                    format!(
                        "No metadata tool configured for {}; {} will not find its libraries unless they are on the system search path",
                        self.platform,
                        module.display()
                    ),
                )],
                ..RewriteReport::default()
            };
        };

        match strategy {
            RewriteStrategy::ReferenceRewrite => rewrite_references(tool, module, references),
            RewriteStrategy::SingleDirective => {
                set_directive(tool, self.platform.self_relative_token(), module)
            }
            RewriteStrategy::None => RewriteReport::default(),
        }
    }
}

fn missing_tool_warning(tool: &dyn MetadataTool, module: &Path) -> Warning {
    Warning::emit(
        WarningKind::ToolMissing,
        format!(
            "{} not found; {} will not find its libraries unless they are on the system search path",
            tool.name(),
            module.display()
        ),
    )
}

fn rewrite_references(
    tool: &dyn MetadataTool,
    module: &Path,
    references: &[ReferencePair],
) -> RewriteReport {
    let mut report = RewriteReport::default();

    // with nothing to rewrite the tool never runs, so check it is there
    if references.is_empty() {
        if tool.probe() == ToolStatus::Missing {
            report.warnings.push(missing_tool_warning(tool, module));
        } else {
            tracing::debug!(module = %module.display(), "No dependency references to rewrite");
        }
        return report;
    }

    for pair in references {
        match tool.change_reference(&pair.old, &pair.new, module) {
            ToolOutcome::Applied => {
                tracing::info!(old = %pair.old, new = %pair.new, "Rewrote dependency reference");
                report.applied += 1;
            }
            ToolOutcome::Rejected { stderr, .. } => {
                // the dependency may simply not have been linked
                tracing::info!(old = %pair.old, stderr = %stderr, "Reference not rewritten");
                report.absent.push(pair.old.clone());
            }
            ToolOutcome::Missing => {
                report.warnings.push(missing_tool_warning(tool, module));
                break;
            }
            ToolOutcome::Failed { reason } => {
                report.warnings.push(Warning::emit(
                    WarningKind::ToolFailed,
                    format!(
                        "Could not run {} to rewrite {}: {}",
                        tool.name(),
                        pair.old,
                        reason
                    ),
                ));
            }
        }
    }

    report
}

fn set_directive(tool: &dyn MetadataTool, token: &str, module: &Path) -> RewriteReport {
    let mut report = RewriteReport::default();

    match tool.probe() {
        ToolStatus::Available { version } => {
            tracing::debug!(tool = %tool.name(), version = %version, "Metadata tool available");
        }
        ToolStatus::Missing => {
            report.warnings.push(missing_tool_warning(tool, module));
            return report;
        }
        ToolStatus::Broken { reason } => {
            report.warnings.push(Warning::emit(
                WarningKind::ToolFailed,
                format!(
                    "{} is unusable ({}); search path of {} left unchanged",
                    tool.name(),
                    reason,
                    module.display()
                ),
            ));
            return report;
        }
    }

    match tool.set_search_directive(token, module) {
        ToolOutcome::Applied => {
            tracing::info!(module = %module.display(), token, "Set library search path");
            report.applied = 1;
        }
        ToolOutcome::Rejected { code, stderr } => report.warnings.push(Warning::emit(
            WarningKind::RewriteFailed,
            format!(
                "{} failed to set search path {} on {} (exit code {:?}): {}",
                tool.name(),
                token,
                module.display(),
                code,
                stderr
            ),
        )),
        ToolOutcome::Missing => report.warnings.push(missing_tool_warning(tool, module)),
        ToolOutcome::Failed { reason } => report.warnings.push(Warning::emit(
            WarningKind::ToolFailed,
            format!("Could not run {}: {}", tool.name(), reason),
        )),
    }

    report
}
