//! Package descriptions: configuration files and the version model.

pub mod config;
pub mod version;

pub use config::{
    ConfigFormat, PackageConfig, PackageSpec, Target, UpdateConfig, archive_file_name,
};
pub use version::{Operator, Version, VersionConstraint, check_version, compare_versions};
