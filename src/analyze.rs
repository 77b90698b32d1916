//! Inspecting a deployed ELF module with readelf.

use anyhow::{bail, Context, Result};
use std::io;
use std::path::Path;
use std::process::Command;

/// The parts of an ELF dynamic section that matter for loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicSection {
    /// Libraries listed as NEEDED, in order.
    pub needed: Vec<String>,
    /// RUNPATH, or RPATH when no RUNPATH is present.
    pub search_path: Option<String>,
}

impl DynamicSection {
    /// Whether the search path lets the module find libraries next to itself.
    pub fn searches_own_directory(&self) -> bool {
        self.search_path
            .as_deref()
            .is_some_and(|path| path.split(':').any(|dir| dir == "$ORIGIN" || dir == "${ORIGIN}"))
    }
}

/// Read the dynamic section of a binary using `readelf -d`.
///
/// readelf parses the headers without loading the binary, so this works for
/// modules built for another architecture.
///
/// Returns `Ok(None)` when readelf is not installed or the file is not an
/// ELF binary: inspection is best-effort.
///
/// # Errors
///
/// Returns an error if the file does not exist or readelf fails for any
/// other reason.
pub fn read_dynamic_section(binary_path: &Path) -> Result<Option<DynamicSection>> {
    if !binary_path.exists() {
        bail!("File does not exist: {}", binary_path.display());
    }

    let output = match Command::new("readelf").arg("-d").arg(binary_path).output() {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("readelf not found, skipping module inspection");
            return Ok(None);
        }
        Err(err) => return Err(err).context("Failed to run readelf"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Not an ELF file")
            || stderr.contains("not a dynamic executable")
            || stderr.contains("File format not recognized")
        {
            return Ok(None);
        }
        bail!(
            "readelf failed on {}: {}",
            binary_path.display(),
            stderr.trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Some(parse_readelf_output(&stdout)))
}

/// Parse `readelf -d` output.
///
/// Example readelf output:
/// ```text
/// Dynamic section at offset 0x2d0e0 contains 28 entries:
///   Tag        Type                         Name/Value
///  0x0000000000000001 (NEEDED)             Shared library: [libcpr.so.1]
///  0x0000000000000001 (NEEDED)             Shared library: [libc.so.6]
///  0x000000000000001d (RUNPATH)            Library runpath: [$ORIGIN]
/// ```
pub fn parse_readelf_output(output: &str) -> DynamicSection {
    let mut section = DynamicSection::default();
    let mut rpath = None;

    for line in output.lines() {
        let Some(value) = bracketed(line) else {
            continue;
        };
        if line.contains("(NEEDED)") {
            section.needed.push(value.to_string());
        } else if line.contains("(RUNPATH)") {
            section.search_path = Some(value.to_string());
        } else if line.contains("(RPATH)") {
            rpath = Some(value.to_string());
        }
    }

    if section.search_path.is_none() {
        section.search_path = rpath;
    }
    section
}

fn bracketed(line: &str) -> Option<&str> {
    let start = line.find('[')?;
    let end = line.rfind(']')?;
    (end > start).then(|| &line[start + 1..end])
}
