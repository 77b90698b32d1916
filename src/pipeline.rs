//! The scan, deploy, relink and rewrite phases run in order.

use anyhow::Result;
use std::path::Path;

use crate::analyze::read_dynamic_section;
use crate::config::{ArtifactPattern, ArtifactRole, DeployConfig};
use crate::copy::{reconstruct_links, CopyOutcome, Deployer};
use crate::platform::{Platform, RewriteStrategy};
use crate::relink::{
    derive_references, find_primary_module, CommandTool, MetadataTool, PathRewriter,
};
use crate::report::{RunReport, Warning, WarningKind};
use crate::scan::{log_tree, scan_excluding};

/// One deployment run against a fixed build output and destination.
///
/// Runs targeting the same destination must not overlap.
pub struct Pipeline {
    config: DeployConfig,
    tool: Option<Box<dyn MetadataTool>>,
}

impl Pipeline {
    /// Use the platform's default metadata tool, or the configured override.
    pub fn new(config: DeployConfig) -> Self {
        let tool = CommandTool::for_platform(config.platform).map(|tool| {
            let tool = match &config.tool {
                Some(program) => tool.with_program(program),
                None => tool,
            };
            Box::new(tool) as Box<dyn MetadataTool>
        });
        Self { config, tool }
    }

    /// Replace the metadata tool.
    #[must_use]
    pub fn with_tool(mut self, tool: impl MetadataTool + 'static) -> Self {
        self.tool = Some(Box::new(tool));
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Execute every phase.
    ///
    /// # Errors
    ///
    /// Fails if the build roots cannot be traversed, the destination cannot
    /// be created, or any artifact fails to copy. Everything else ends up in
    /// [`RunReport::warnings`].
    pub fn run(&self) -> Result<RunReport> {
        let config = &self.config;
        let patterns = config.patterns()?;
        let mut report = RunReport::default();

        tracing::info!(
            platform = %config.platform,
            module = %config.module_name,
            destination = %config.destination.display(),
            "Deploying extension module"
        );

        // a destination inside a build root holds last run's copies
        let entries = scan_excluding(
            &config.build_roots,
            &patterns,
            Some(config.destination.as_path()),
        )?;
        report.discovered = entries.len();
        if entries.is_empty() {
            report.warnings.push(Warning::emit(
                WarningKind::NoArtifacts,
                format!(
                    "No artifacts for {} found under {}",
                    config.module_name,
                    display_roots(config)
                ),
            ));
            log_tree(&config.build_roots);
        }

        // every regular file first: links are retargeted by deployed name
        let mut deployer = Deployer::new(&config.destination, config.rename.clone())?;
        for entry in entries
            .iter()
            .filter(|e| e.pattern.deploy() && !e.is_symlink())
        {
            match deployer.deploy(entry)? {
                CopyOutcome::Copied(_) | CopyOutcome::Replaced(_) => report.deployed += 1,
                CopyOutcome::SameFile(_) => report.in_place += 1,
                CopyOutcome::Shadowed(dest) => report.warnings.push(Warning::emit(
                    WarningKind::DuplicateName,
                    format!(
                        "{} skipped, {} was already deployed from another location",
                        entry.path.display(),
                        dest.display()
                    ),
                )),
            }
        }
        let record = deployer.into_record();

        let links = reconstruct_links(&entries, &record, &config.destination);
        report.relinked = links.relinked();

        let primary_patterns = config.primary_patterns()?;
        let search = find_primary_module(&config.destination, &primary_patterns)?;
        if search.candidates.len() > 1 {
            report.warnings.push(Warning::emit(
                WarningKind::MultiplePrimaryModules,
                format!(
                    "{} files look like the {} module, rewriting only {}",
                    search.candidates.len(),
                    config.module_name,
                    search.candidates[0].display()
                ),
            ));
        }

        let libraries: Vec<&str> = record
            .deployed_names()
            .chain(links.link_names())
            .filter(|name| !primary_patterns.iter().any(|p| p.matches(name)))
            .collect();
        report.warnings.extend(links.warnings.iter().cloned());

        let Some(module) = search.handle() else {
            report.warnings.push(Warning::emit(
                WarningKind::NoPrimaryModule,
                format!(
                    "No {} module in {}, skipping library path rewrite",
                    config.module_name,
                    config.destination.display()
                ),
            ));
            return Ok(report);
        };
        report.primary_module = Some(module.to_path_buf());

        let references = match config.platform.rewrite_strategy() {
            RewriteStrategy::ReferenceRewrite => {
                derive_references(config.platform, &config.references, libraries)
            }
            _ => Vec::new(),
        };
        let rewrite = PathRewriter::new(config.platform, self.tool.as_deref())
            .rewrite(module, &references);
        report.rewritten = rewrite.applied;
        report.warnings.extend(rewrite.warnings);

        if config.platform == Platform::Linux && config.verify {
            let dependencies: Vec<ArtifactPattern> = patterns
                .into_iter()
                .filter(|p| p.role() == ArtifactRole::Dependency)
                .collect();
            report.warnings.extend(verify_module(
                module,
                &config.destination,
                &dependencies,
                rewrite.applied > 0,
            ));
        }

        tracing::info!(
            discovered = report.discovered,
            deployed = report.deployed,
            relinked = report.relinked,
            rewritten = report.rewritten,
            warnings = report.warnings.len(),
            "Deployment finished"
        );
        Ok(report)
    }
}

/// Run a deployment with the default metadata tool.
pub fn deploy(config: DeployConfig) -> Result<RunReport> {
    Pipeline::new(config).run()
}

/// Check the rewritten module against what was deployed next to it.
fn verify_module(
    module: &Path,
    destination: &Path,
    dependencies: &[ArtifactPattern],
    expect_origin: bool,
) -> Vec<Warning> {
    let section = match read_dynamic_section(module) {
        Ok(Some(section)) => section,
        Ok(None) => {
            tracing::debug!(module = %module.display(), "Not inspectable, skipping verification");
            return Vec::new();
        }
        Err(err) => {
            tracing::debug!(module = %module.display(), error = %format!("{err:#}"), "Verification skipped");
            return Vec::new();
        }
    };

    let mut warnings = Vec::new();

    if expect_origin && !section.searches_own_directory() {
        warnings.push(Warning::emit(
            WarningKind::RewriteFailed,
            format!(
                "{} search path is {:?} after rewrite",
                module.display(),
                section.search_path
            ),
        ));
    }

    for needed in &section.needed {
        let ours = dependencies.iter().any(|p| p.matches(needed));
        let present = destination.join(needed).exists();
        if ours && !present {
            warnings.push(Warning::emit(
                WarningKind::UnresolvedDependency,
                format!(
                    "{} needs {} which was not deployed to {}",
                    module.display(),
                    needed,
                    destination.display()
                ),
            ));
        }
    }

    warnings
}

fn display_roots(config: &DeployConfig) -> String {
    config
        .build_roots
        .iter()
        .map(|root| root.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
