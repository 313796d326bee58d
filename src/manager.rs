//! Package manager: the two top-level operations, publish and update.

use anyhow::{Context, Result, bail};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::archive::{ArchiveBuilder, ArchiveEntry, PathPolicy};
use crate::deadline::Deadline;
use crate::package::{ConfigFormat, UpdateConfig};
use crate::remote::{Connector, remote_join, shell_quote};
use crate::runtime::Runtime;
use crate::settings::ServerSettings;
use crate::transfer::{TransferOrchestrator, UpdateReport};

/// Archives are created readable by everyone on the repository host.
const REMOTE_ARCHIVE_MODE: i32 = 0o644;

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub package: String,
    pub version: String,
    pub archive: PathBuf,
    pub remote_path: String,
    pub entries: Vec<ArchiveEntry>,
}

pub struct PackageManager<R: Runtime, C: Connector> {
    runtime: Arc<R>,
    connector: Arc<C>,
    root_dir: String,
    path_policy: PathPolicy,
}

impl<R: Runtime + 'static, C: Connector + 'static> PackageManager<R, C> {
    pub fn new(runtime: R, connector: C, settings: &ServerSettings) -> Self {
        Self {
            runtime: Arc::new(runtime),
            connector: Arc::new(connector),
            root_dir: settings.root_dir.clone(),
            path_policy: PathPolicy::default(),
        }
    }

    pub fn with_path_policy(mut self, policy: PathPolicy) -> Self {
        self.path_policy = policy;
        self
    }

    /// Bundle the targets of `config_path` and upload the archive to
    /// `<root>/<name>/<name>-<ver>.tar.gz`.
    #[tracing::instrument(skip(self, deadline))]
    pub async fn publish(&self, config_path: &Path, deadline: Deadline) -> Result<PublishReport> {
        info!("Start create package...");
        let started = Instant::now();

        let runtime = Arc::clone(&self.runtime);
        let connector = Arc::clone(&self.connector);
        let root_dir = self.root_dir.clone();
        let config_path = config_path.to_path_buf();

        let report = tokio::task::spawn_blocking(move || {
            publish_blocking(runtime.as_ref(), connector.as_ref(), &root_dir, &config_path, &deadline)
        })
        .await
        .context("Publish task failed")??;

        info!("Finish create package in {:?}", started.elapsed());
        Ok(report)
    }

    /// Fetch and unpack every package listed in `config_path`.
    ///
    /// Fails only when the invocation itself cannot start (cancelled, bad
    /// config). Per-package failures are carried in the returned report.
    #[tracing::instrument(skip(self, deadline))]
    pub async fn update(&self, config_path: &Path, deadline: Deadline) -> Result<UpdateReport> {
        info!("Start update packages...");
        let started = Instant::now();

        deadline.check("Update packages")?;

        let work_dir = self.runtime.current_dir()?;
        let data = self
            .runtime
            .read(&work_dir.join(config_path))
            .context("Failed to read config")?;
        let config = UpdateConfig::parse(&data, ConfigFormat::from_path(config_path))
            .context("Failed to parse config")?;

        let orchestrator = TransferOrchestrator::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.connector),
            self.root_dir.clone(),
            work_dir,
            self.path_policy,
        );
        let report = orchestrator.run(config.packages).await;

        info!("Finish update packages in {:?}", started.elapsed());
        Ok(report)
    }
}

fn publish_blocking<R: Runtime, C: Connector>(
    runtime: &R,
    connector: &C,
    root_dir: &str,
    config_path: &Path,
    deadline: &Deadline,
) -> Result<PublishReport> {
    deadline.check("Create package")?;

    let work_dir = runtime.current_dir()?;
    let built = ArchiveBuilder::new(runtime, work_dir)
        .build_from_file(config_path, deadline)
        .context("Failed to create archive for upload")?;

    let mut channel = connector
        .connect()
        .context("Failed to connect to SSH server")?;

    let remote_dir = remote_join(root_dir, &built.package);
    let output = channel
        .exec(&format!("mkdir -p {}", shell_quote(&remote_dir)))
        .with_context(|| format!("Can't create remote dir {} on server", remote_dir))?;
    if !output.success() {
        bail!(
            "Can't create remote dir {} on server: {}",
            remote_dir,
            output.error_text()
        );
    }

    let remote_path = remote_join(&remote_dir, &built.archive_name());
    let size = runtime.file_size(&built.archive_path)?;
    let mut archive = runtime
        .open(&built.archive_path)
        .context("Failed to open archive for upload")?;
    channel
        .upload(&mut *archive, size, &remote_path, REMOTE_ARCHIVE_MODE)
        .with_context(|| format!("Failed to upload archive to {}", remote_path))?;
    info!("Uploaded {} ({} bytes)", remote_path, size);

    Ok(PublishReport {
        package: built.package,
        version: built.version,
        archive: built.archive_path,
        remote_path,
        entries: built.entries,
    })
}
