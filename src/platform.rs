//! Target platform identifiers and their naming conventions.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Platform the extension module is deployed for.
///
/// Selects the file suffixes used to recognise artifacts and the strategy
/// used to fix up dynamic-linker search metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

/// How the deployed module is taught to find its co-located dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteStrategy {
    /// Rewrite each embedded dependency reference individually.
    ReferenceRewrite,
    /// Set one search directive that points at the module's own directory.
    SingleDirective,
    /// The platform loader already searches the module's directory.
    None,
}

impl Platform {
    /// Platform this crate was compiled for.
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    /// Suffix of a compiled extension module.
    pub fn module_suffix(self) -> &'static str {
        match self {
            Platform::Linux | Platform::MacOs => ".so",
            Platform::Windows => ".pyd",
        }
    }

    /// Glob matching every file of a shared-library family.
    ///
    /// Linux libraries carry their version after the suffix
    /// (`libfoo.so.1.2`), the others before it (`libfoo.1.dylib`).
    pub fn library_glob(self, stem: &str) -> String {
        match self {
            Platform::Linux => format!("{stem}*.so*"),
            Platform::MacOs => format!("{stem}*.dylib"),
            Platform::Windows => format!("{stem}*.dll"),
        }
    }

    pub fn rewrite_strategy(self) -> RewriteStrategy {
        match self {
            Platform::Linux => RewriteStrategy::SingleDirective,
            Platform::MacOs => RewriteStrategy::ReferenceRewrite,
            Platform::Windows => RewriteStrategy::None,
        }
    }

    /// Token the loader expands to the directory of the module itself.
    pub fn self_relative_token(self) -> &'static str {
        match self {
            Platform::Linux => "$ORIGIN",
            Platform::MacOs => "@loader_path",
            Platform::Windows => ".",
        }
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" | "osx" => Ok(Platform::MacOs),
            "windows" | "win32" => Ok(Platform::Windows),
            other => bail!("Unknown platform '{}' (expected linux, macos or windows)", other),
        }
    }
}

impl TryFrom<String> for Platform {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
        })
    }
}
