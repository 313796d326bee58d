//! Concurrent fetch-and-unpack of a batch of packages.
//!
//! Each package is an independent unit of work: its own remote connection,
//! resolve, download, unpack. Units run in parallel on the blocking pool and
//! one unit's failure never touches the others. The batch waits for all of
//! them and reports each outcome.

mod report;

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::archive::{PathPolicy, TarGzExtractor};
use crate::package::PackageSpec;
use crate::remote::{Connector, remote_join};
use crate::resolver::resolve_archive;
use crate::runtime::Runtime;

pub use report::{Installed, PackageOutcome, UpdateReport};

/// Runs update batches against one repository root.
pub struct TransferOrchestrator<R: Runtime, C: Connector> {
    runtime: Arc<R>,
    connector: Arc<C>,
    root_dir: String,
    work_dir: PathBuf,
    extractor: TarGzExtractor,
}

impl<R: Runtime + 'static, C: Connector + 'static> TransferOrchestrator<R, C> {
    pub fn new(
        runtime: Arc<R>,
        connector: Arc<C>,
        root_dir: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        policy: PathPolicy,
    ) -> Self {
        Self {
            runtime,
            connector,
            root_dir: root_dir.into(),
            work_dir: work_dir.into(),
            extractor: TarGzExtractor::new(policy),
        }
    }

    /// Start one unit per package and wait for every unit to finish.
    ///
    /// Outcomes are returned in request order.
    #[tracing::instrument(skip(self, packages))]
    pub async fn run(&self, packages: Vec<PackageSpec>) -> UpdateReport {
        let mut units = JoinSet::new();
        let mut spawned = HashMap::new();

        for (index, spec) in packages.into_iter().enumerate() {
            let unit = PackageUnit {
                runtime: Arc::clone(&self.runtime),
                connector: Arc::clone(&self.connector),
                remote_dir: remote_join(&self.root_dir, &spec.name),
                work_dir: self.work_dir.clone(),
                extractor: self.extractor,
                spec: spec.clone(),
            };
            let handle = units.spawn_blocking(move || unit.run());
            spawned.insert(handle.id(), (index, spec));
        }

        let mut outcomes = Vec::with_capacity(spawned.len());
        while let Some(joined) = units.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result.map_err(|e| format!("{:#}", e))),
                Err(join_err) => (join_err.id(), Err(format!("unit aborted: {}", join_err))),
            };
            let Some((index, spec)) = spawned.remove(&id) else {
                warn!("Finished unit {} is not part of this batch", id);
                continue;
            };
            match &result {
                Ok(installed) => info!(
                    "Package {} {} installed ({} files)",
                    spec.name,
                    installed.version,
                    installed.files.len()
                ),
                Err(e) => error!("Skip package {} ({}): {}", spec.name, spec.constraint, e),
            }
            outcomes.push((index, PackageOutcome { spec, result }));
        }

        outcomes.sort_by_key(|(index, _)| *index);
        UpdateReport::new(outcomes.into_iter().map(|(_, o)| o).collect())
    }
}

/// Everything one package needs, owned so it can move onto the blocking pool.
struct PackageUnit<R: Runtime, C: Connector> {
    runtime: Arc<R>,
    connector: Arc<C>,
    remote_dir: String,
    work_dir: PathBuf,
    extractor: TarGzExtractor,
    spec: PackageSpec,
}

impl<R: Runtime, C: Connector> PackageUnit<R, C> {
    #[tracing::instrument(skip(self), fields(package = %self.spec.name, constraint = %self.spec.constraint))]
    fn run(self) -> Result<Installed> {
        info!("Update package {} ({})", self.spec.name, self.spec.constraint);

        let mut channel = self
            .connector
            .connect()
            .context("Failed to connect to SSH server")?;

        let candidate = resolve_archive(channel.as_mut(), &self.remote_dir, &self.spec)
            .context("Failed to get archive name")?;
        let remote_path = remote_join(&self.remote_dir, &candidate.file_name);
        let local_path = self.work_dir.join(&candidate.file_name);

        {
            let mut file = self
                .runtime
                .create_file(&local_path)
                .context("Failed to create local archive")?;
            let size = channel
                .download(&remote_path, &mut *file)
                .context("Failed to download archive from server")?;
            file.flush().context("Failed to flush local archive")?;
            info!("Downloaded {} ({} bytes)", candidate.file_name, size);
        }

        let files = self
            .extractor
            .extract(self.runtime.as_ref(), &local_path, &self.work_dir)
            .context("Failed to unpack archive")?;

        Ok(Installed {
            archive: candidate.file_name,
            version: candidate.version,
            local_path,
            files,
        })
    }
}
