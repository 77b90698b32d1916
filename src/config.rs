//! Deployment configuration and artifact name patterns.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::platform::Platform;

/// Build output directories searched when none are configured explicitly,
/// relative to the project root. Earlier entries win on name clashes.
pub const DEFAULT_BUILD_DIRS: &[&str] = &[
    "cmake-build-release",
    "build",
    "cmake-build-debug",
    "Release",
    "Debug",
];

/// What a pattern identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    PrimaryModule,
    #[default]
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Glob(glob::Pattern),
    Substring(String),
}

/// A file-name matching rule identifying artifacts of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPattern {
    label: String,
    matcher: Matcher,
    role: ArtifactRole,
    deploy: bool,
}

impl ArtifactPattern {
    /// Build a pattern from a shell-style glob matched against file names.
    pub fn glob(label: impl Into<String>, pattern: &str, role: ArtifactRole) -> Result<Self> {
        let compiled = glob::Pattern::new(pattern)
            .with_context(|| format!("Invalid artifact glob: {}", pattern))?;
        Ok(Self {
            label: label.into(),
            matcher: Matcher::Glob(compiled),
            role,
            deploy: true,
        })
    }

    /// Build a pattern that matches any file name containing `needle`.
    pub fn substring(label: impl Into<String>, needle: impl Into<String>, role: ArtifactRole) -> Self {
        Self {
            label: label.into(),
            matcher: Matcher::Substring(needle.into()),
            role,
            deploy: true,
        }
    }

    /// Keep the pattern for discovery but exclude its matches from deployment.
    #[must_use]
    pub fn with_deploy(mut self, deploy: bool) -> Self {
        self.deploy = deploy;
        self
    }

    pub fn matches(&self, file_name: &str) -> bool {
        match &self.matcher {
            Matcher::Glob(pattern) => pattern.matches(file_name),
            Matcher::Substring(needle) => file_name.contains(needle.as_str()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> ArtifactRole {
        self.role
    }

    pub fn deploy(&self) -> bool {
        self.deploy
    }
}

/// An extra pattern as written in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternSpec {
    pub label: String,
    pub pattern: String,
    #[serde(default)]
    pub substring: bool,
    #[serde(default)]
    pub role: ArtifactRole,
    #[serde(default = "default_true")]
    pub deploy: bool,
}

impl PatternSpec {
    fn compile(&self) -> Result<ArtifactPattern> {
        let pattern = if self.substring {
            ArtifactPattern::substring(&self.label, &self.pattern, self.role)
        } else {
            ArtifactPattern::glob(&self.label, &self.pattern, self.role)?
        };
        Ok(pattern.with_deploy(self.deploy))
    }
}

/// One embedded dependency reference and its replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferencePair {
    pub old: String,
    pub new: String,
}

impl ReferencePair {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Everything one deployment run needs to know.
///
/// ```toml
/// build_roots = ["build"]
/// destination = "dist"
/// platform = "linux"
/// module_name = "twitter_dm"
/// dependencies = ["libcpr", "libcurl", "libz"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    /// Build output directories, searched in order.
    pub build_roots: Vec<PathBuf>,
    /// Directory the module and its libraries are installed into.
    pub destination: PathBuf,
    #[serde(default = "Platform::host")]
    pub platform: Platform,
    /// Logical name of the primary extension module.
    pub module_name: String,
    /// Library name stems of the runtime dependencies (e.g. `libcurl`).
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub extra_patterns: Vec<PatternSpec>,
    /// Source base name to deployed base name.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Reference rewrites applied in addition to the ones derived from
    /// the deployed libraries.
    #[serde(default)]
    pub references: Vec<ReferencePair>,
    /// Program used to edit loader metadata instead of the platform default.
    #[serde(default)]
    pub tool: Option<PathBuf>,
    /// Inspect the rewritten module afterwards (Linux only).
    #[serde(default = "default_true")]
    pub verify: bool,
}

fn default_true() -> bool {
    true
}

impl DeployConfig {
    pub fn new(
        build_root: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        platform: Platform,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            build_roots: vec![build_root.into()],
            destination: destination.into(),
            platform,
            module_name: module_name.into(),
            dependencies: Vec::new(),
            extra_patterns: Vec::new(),
            rename: BTreeMap::new(),
            references: Vec::new(),
            tool: None,
            verify: true,
        }
    }

    /// The conventional build output directories of a CMake project.
    pub fn candidate_roots(project_root: &Path) -> Vec<PathBuf> {
        DEFAULT_BUILD_DIRS
            .iter()
            .map(|dir| project_root.join(dir))
            .collect()
    }

    #[must_use]
    pub fn with_build_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.build_roots.push(root.into());
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, stem: impl Into<String>) -> Self {
        self.dependencies.push(stem.into());
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, spec: PatternSpec) -> Self {
        self.extra_patterns.push(spec);
        self
    }

    #[must_use]
    pub fn with_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.insert(from.into(), to.into());
        self
    }

    #[must_use]
    pub fn with_reference(mut self, pair: ReferencePair) -> Self {
        self.references.push(pair);
        self
    }

    #[must_use]
    pub fn with_tool(mut self, program: impl Into<PathBuf>) -> Self {
        self.tool = Some(program.into());
        self
    }

    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse deployment configuration")
    }

    /// Load a configuration file. Relative paths inside it are taken
    /// relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config: {}", path.display()))?;

        if let Some(base) = path.parent() {
            for root in &mut config.build_roots {
                if root.is_relative() {
                    *root = base.join(&*root);
                }
            }
            if config.destination.is_relative() {
                config.destination = base.join(&config.destination);
            }
            if let Some(tool) = &mut config.tool {
                // Bare program names are looked up on PATH, keep them as-is.
                if tool.components().count() > 1 && tool.is_relative() {
                    *tool = base.join(&*tool);
                }
            }
        }

        Ok(config)
    }

    /// Patterns identifying the primary module, with the platform suffix.
    ///
    /// Build systems are inconsistent about `_` versus `-` in target names,
    /// so both spellings are accepted.
    pub fn primary_patterns(&self) -> Result<Vec<ArtifactPattern>> {
        let suffix = self.platform.module_suffix();
        let mut names = vec![self.module_name.clone()];
        let hyphenated = self.module_name.replace('_', "-");
        if hyphenated != self.module_name {
            names.push(hyphenated);
        }

        names
            .iter()
            .map(|name| {
                let pattern = format!("{}*{}", glob::Pattern::escape(name), suffix);
                ArtifactPattern::glob(name.as_str(), &pattern, ArtifactRole::PrimaryModule)
            })
            .collect()
    }

    /// Every pattern a run scans for: primary module, dependency families,
    /// then the configured extras.
    pub fn patterns(&self) -> Result<Vec<ArtifactPattern>> {
        let mut patterns = self.primary_patterns()?;

        for stem in &self.dependencies {
            let glob = self.platform.library_glob(&glob::Pattern::escape(stem));
            patterns.push(ArtifactPattern::glob(stem.as_str(), &glob, ArtifactRole::Dependency)?);
        }

        for spec in &self.extra_patterns {
            patterns.push(spec.compile()?);
        }

        Ok(patterns)
    }
}
