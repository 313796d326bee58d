//! Picks the remote archive that best satisfies a version constraint.
//!
//! Archives of a package live under `<root>/<name>/` as `<name>-<ver>.tar.gz`.
//! Every resolution lists that directory afresh; nothing is cached.

use log::{debug, warn};
use std::path::Path;
use thiserror::Error;

use crate::package::{PackageSpec, VersionConstraint, compare_versions};
use crate::remote::{RemoteChannel, shell_quote};

const ARCHIVE_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no archive found for package {package}")]
    NoCandidates { package: String },

    #[error("no archive of package {package} carries a valid version")]
    NoValidCandidates { package: String },

    #[error("no archive of package {package} satisfies version {constraint}")]
    NoMatch {
        package: String,
        constraint: VersionConstraint,
    },

    #[error("failed to list archives of package {package}")]
    Transport {
        package: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// An archive file observed in a package's remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub file_name: String,
    pub version: String,
}

impl Candidate {
    /// Parse a listing line (bare name or full path) into a candidate of `package`.
    ///
    /// Returns `None` unless the base name is exactly `<package>-<version>.tar.gz`
    /// with a non-empty version.
    pub fn parse(line: &str, package: &str) -> Option<Self> {
        let file_name = Path::new(line.trim()).file_name()?.to_str()?;
        let version = file_name
            .strip_prefix(package)?
            .strip_prefix('-')?
            .strip_suffix(ARCHIVE_SUFFIX)?;
        if version.is_empty() {
            return None;
        }
        Some(Candidate {
            file_name: file_name.to_string(),
            version: version.to_string(),
        })
    }
}

/// Shell command listing the archives of `package` in `remote_dir`.
pub fn listing_command(remote_dir: &str, package: &str) -> String {
    format!(
        "ls {}/{}*{}",
        shell_quote(remote_dir.trim_end_matches('/')),
        shell_quote(package),
        ARCHIVE_SUFFIX
    )
}

/// Choose the highest candidate satisfying `constraint`.
///
/// Candidates are sorted ascending; the scan keeps the last match and stops at
/// the first miss that follows a match.
pub fn select_candidate(
    mut candidates: Vec<Candidate>,
    constraint: &VersionConstraint,
) -> Option<Candidate> {
    candidates.sort_by(|a, b| compare_versions(&a.version, &b.version));
    debug!(
        "Sorted candidates: {:?}",
        candidates.iter().map(|c| &c.file_name).collect::<Vec<_>>()
    );

    let mut selected = None;
    for candidate in candidates {
        if constraint.matches(&candidate.version) {
            debug!("Candidate {} matches {}", candidate.file_name, constraint);
            selected = Some(candidate);
        } else {
            debug!("Candidate {} does not match {}", candidate.file_name, constraint);
            if selected.is_some() {
                break;
            }
        }
    }
    selected
}

/// List `remote_dir` over `channel` and pick the archive for `spec`.
#[tracing::instrument(skip(channel))]
pub fn resolve_archive(
    channel: &mut dyn RemoteChannel,
    remote_dir: &str,
    spec: &PackageSpec,
) -> Result<Candidate, ResolveError> {
    let command = listing_command(remote_dir, &spec.name);
    let output = channel
        .exec(&command)
        .map_err(|e| ResolveError::Transport {
            package: spec.name.clone(),
            source: e.into(),
        })?;

    if !output.success() {
        warn!(
            "Listing {:?} exited with {}: {}",
            command,
            output.exit_status,
            output.error_text()
        );
        return Err(ResolveError::NoCandidates {
            package: spec.name.clone(),
        });
    }

    let lines: Vec<&str> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(ResolveError::NoCandidates {
            package: spec.name.clone(),
        });
    }

    let candidates: Vec<Candidate> = lines
        .into_iter()
        .filter_map(|line| {
            let candidate = Candidate::parse(line, &spec.name);
            if candidate.is_none() {
                warn!(
                    "Archive name {:?} does not contain a valid version of {}",
                    line, spec.name
                );
            }
            candidate
        })
        .collect();
    if candidates.is_empty() {
        return Err(ResolveError::NoValidCandidates {
            package: spec.name.clone(),
        });
    }

    let constraint = spec.version_constraint();
    select_candidate(candidates, &constraint).ok_or_else(|| ResolveError::NoMatch {
        package: spec.name.clone(),
        constraint,
    })
}
