use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use log::debug;
use std::path::{Component, Path, PathBuf};

use crate::runtime::Runtime;

/// How entry names of a fetched archive are mapped onto the local file system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathPolicy {
    /// Write every entry at its recorded path, joined to the destination.
    /// Absolute or `..` entries can land outside the destination.
    #[default]
    Verbatim,
    /// Refuse entries that are absolute or contain `..`.
    Contained,
}

impl PathPolicy {
    fn check(self, entry: &Path) -> Result<()> {
        if self == PathPolicy::Verbatim {
            return Ok(());
        }
        let escapes = entry.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            bail!("Archive entry {:?} escapes the destination directory", entry);
        }
        Ok(())
    }
}

/// Unpacks `.tar.gz` package archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarGzExtractor {
    policy: PathPolicy,
}

impl TarGzExtractor {
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }

    /// Extract every entry of `archive_path` under `dest`, creating parent
    /// directories as needed. Returns the written file paths in archive order.
    ///
    /// Files written before a failure are left in place.
    #[tracing::instrument(skip(self, runtime))]
    pub fn extract<R: Runtime + ?Sized>(
        &self,
        runtime: &R,
        archive_path: &Path,
        dest: &Path,
    ) -> Result<Vec<PathBuf>> {
        debug!("Extracting {:?} into {:?}", archive_path, dest);
        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut written = Vec::new();

        for entry in archive.entries().context("Failed to read tar")? {
            let mut entry = entry.context("Failed to read tar")?;
            let entry_path = entry
                .path()
                .context("Invalid entry path in archive")?
                .into_owned();
            self.policy.check(&entry_path)?;

            let out_path = dest.join(&entry_path);
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                runtime.create_dir_all(&out_path)?;
                continue;
            }
            if !entry_type.is_file() {
                debug!("Skipping {:?} entry {:?}", entry_type, entry_path);
                continue;
            }

            if let Some(parent) = out_path.parent() {
                runtime
                    .create_dir_all(parent)
                    .context("Failed to create directories")?;
            }
            {
                let mut out = runtime
                    .create_file(&out_path)
                    .context("Failed to create output file")?;
                std::io::copy(&mut entry, &mut out)
                    .with_context(|| format!("Failed to write output file {:?}", out_path))?;
            }

            #[cfg(unix)]
            {
                if let Ok(mode) = entry.header().mode()
                    && mode != 0
                    && let Err(e) = runtime.set_permissions(&out_path, mode)
                {
                    debug!("Failed to set permissions on {:?}: {}", out_path, e);
                }
            }

            debug!("extracted {:?}", out_path);
            written.push(out_path);
        }

        Ok(written)
    }
}
