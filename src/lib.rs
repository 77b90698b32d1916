//! Deployment of compiled native extension modules.
//!
//! Finds an extension module and its shared libraries under a native build
//! output, copies them into an install directory while keeping their
//! symbolic links consistent, and edits the module's loader metadata so it
//! finds the libraries next to itself (`$ORIGIN` with patchelf on Linux,
//! `@loader_path` references with install_name_tool on macOS).

mod analyze;
mod config;
mod copy;
mod pipeline;
mod platform;
mod relink;
mod report;
mod scan;

pub use analyze::{parse_readelf_output, read_dynamic_section, DynamicSection};
pub use config::{
    ArtifactPattern, ArtifactRole, DeployConfig, PatternSpec, ReferencePair, DEFAULT_BUILD_DIRS,
};
pub use copy::{reconstruct_links, CopyOutcome, DeploymentRecord, Deployer, LinkOutcome, LinkReport};
pub use pipeline::{deploy, Pipeline};
pub use platform::{Platform, RewriteStrategy};
pub use relink::{
    derive_references, find_primary_module, CommandTool, MetadataTool, PathRewriter,
    PrimaryModuleSearch, RewriteReport, ToolOutcome, ToolStatus,
};
pub use report::{RunReport, Warning, WarningKind};
pub use scan::{
    log_tree, resolve_link, scan, scan_excluding, scan_root, DiscoveredEntry, EntryKind,
    LinkTarget,
};
