//! Publish and update configuration files.
//!
//! Both are read as JSON, or as YAML when the file name ends in `.yaml`/`.yml`.

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::version::VersionConstraint;

/// On-disk format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        let name = path.to_string_lossy();
        if name.ends_with(".yaml") || name.ends_with(".yml") {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Json
        }
    }

    pub fn parse<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            ConfigFormat::Json => serde_json::from_slice(data).context("Failed to parse JSON config"),
            ConfigFormat::Yaml => serde_yaml::from_slice(data).context("Failed to parse YAML config"),
        }
    }
}

/// A package name with the version constraint requested for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    #[serde(rename = "ver", default)]
    pub constraint: String,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: constraint.into(),
        }
    }

    pub fn version_constraint(&self) -> VersionConstraint {
        VersionConstraint::parse(&self.constraint)
    }
}

/// One inclusion rule of a publish configuration.
///
/// `path` is split into a walk root (its directory) and an inclusion glob
/// (its file name); `exclude` is a comma-separated list of globs matched
/// against file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TargetRepr")]
pub struct Target {
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exclude: String,
}

/// A target may be written as a bare path string.
#[derive(Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Path(String),
    Full {
        path: String,
        #[serde(default)]
        exclude: String,
    },
}

impl From<TargetRepr> for Target {
    fn from(repr: TargetRepr) -> Self {
        match repr {
            TargetRepr::Path(path) => Target {
                path,
                exclude: String::new(),
            },
            TargetRepr::Full { path, exclude } => Target { path, exclude },
        }
    }
}

impl Target {
    pub fn new(path: impl Into<String>, exclude: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exclude: exclude.into(),
        }
    }

    /// Directory to walk. An empty parent means the working directory.
    pub fn root(&self) -> PathBuf {
        match Path::new(&self.path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Inclusion glob matched against file names.
    pub fn mask(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Non-empty exclude globs, whitespace-trimmed.
    pub fn exclude_patterns(&self) -> Vec<&str> {
        self.exclude
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Configuration of the package being published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    #[serde(rename = "ver")]
    pub version: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Companion packages declared by the publisher. Carried in the manifest only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packets: Vec<PackageSpec>,
}

impl PackageConfig {
    pub fn parse(data: &[u8], format: ConfigFormat) -> Result<Self> {
        let config: PackageConfig = format.parse(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Package config has an empty name");
        }
        if self.name.contains('/') {
            bail!("Package name {:?} must not contain '/'", self.name);
        }
        if self.version.trim().is_empty() {
            bail!("Package config for {} has an empty version", self.name);
        }
        Ok(())
    }

    /// `<name>-<ver>.tar.gz`
    pub fn archive_name(&self) -> String {
        archive_file_name(&self.name, &self.version)
    }

    /// `meta-<name>-<ver>.json`
    pub fn manifest_name(&self) -> String {
        format!("meta-{}-{}.json", self.name, self.version)
    }
}

/// Archive file name for a package version.
pub fn archive_file_name(name: &str, version: &str) -> String {
    format!("{}-{}.tar.gz", name, version)
}

/// List of packages requested by an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
}

impl UpdateConfig {
    pub fn parse(data: &[u8], format: ConfigFormat) -> Result<Self> {
        format.parse(data)
    }
}
