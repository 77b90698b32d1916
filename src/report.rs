//! Outcome of a deployment run.

use std::fmt;
use std::path::PathBuf;

/// Category of a non-fatal problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKind {
    /// No build output matched any pattern.
    NoArtifacts,
    /// A second file with an already-deployed name was skipped.
    DuplicateName,
    /// A symbolic link could not be recreated in the destination.
    LinkFailed,
    /// No primary module was found in the destination.
    NoPrimaryModule,
    /// More than one file looks like the primary module.
    MultiplePrimaryModules,
    /// The loader metadata tool is not installed.
    ToolMissing,
    /// The loader metadata tool could not be run.
    ToolFailed,
    /// The tool ran but refused the edit.
    RewriteFailed,
    /// The module needs a library that is not in the destination.
    UnresolvedDependency,
}

/// A problem the run survived but the operator has to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    /// Create a warning and log it.
    pub fn emit(kind: WarningKind, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!(kind = ?kind, "{}", message);
        Self { kind, message }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Summary of a completed deployment run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Entries found by the scanner.
    pub discovered: usize,
    /// Regular files copied into the destination.
    pub deployed: usize,
    /// Regular files already in place (source is the destination).
    pub in_place: usize,
    /// Symbolic links recreated in the destination.
    pub relinked: usize,
    /// Loader metadata edits that took effect.
    pub rewritten: usize,
    pub primary_module: Option<PathBuf>,
    pub warnings: Vec<Warning>,
}

impl RunReport {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn warnings_of(&self, kind: WarningKind) -> impl Iterator<Item = &Warning> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }
}
