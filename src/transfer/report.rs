use std::path::PathBuf;

use crate::package::PackageSpec;

/// A package fetched and unpacked by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub archive: String,
    pub version: String,
    /// Where the downloaded archive was stored.
    pub local_path: PathBuf,
    /// Files written while unpacking, in archive order.
    pub files: Vec<PathBuf>,
}

/// Result of one unit of work.
#[derive(Debug, Clone)]
pub struct PackageOutcome {
    pub spec: PackageSpec,
    /// Failure carries the full error chain as text.
    pub result: Result<Installed, String>,
}

impl PackageOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of an update batch, in request order.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    outcomes: Vec<PackageOutcome>,
}

impl UpdateReport {
    pub fn new(outcomes: Vec<PackageOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[PackageOutcome] {
        &self.outcomes
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &PackageOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PackageOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// True when every package was installed.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(PackageOutcome::is_success)
    }
}
