use anyhow::{Context, Result, anyhow};
use flate2::Compression;
use flate2::write::GzEncoder;
use glob::Pattern;
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::deadline::Deadline;
use crate::package::{ConfigFormat, PackageConfig, Target};
use crate::runtime::Runtime;

/// Fixed modification time stamped on every entry so identical inputs
/// produce identical tar streams.
const DETERMINISTIC_MTIME: u64 = 1_153_704_088;

/// Name of the GNU extension record carrying an over-long entry name.
const GNU_LONG_LINK: &[u8] = b"././@LongLink";

/// One file stored in a built archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
}

/// Result of assembling a package archive.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub package: String,
    pub version: String,
    pub archive_path: PathBuf,
    /// Entries in archive order; the manifest is always last.
    pub entries: Vec<ArchiveEntry>,
}

impl BuiltArchive {
    pub fn archive_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Compiled filters of one target.
struct TargetFilter {
    root: PathBuf,
    /// Entries of an absolute target keep their absolute path.
    absolute: bool,
    mask: Pattern,
    excludes: Vec<Pattern>,
}

impl TargetFilter {
    fn compile(target: &Target, work_dir: &Path) -> Result<Self> {
        let mask = Pattern::new(&target.mask())
            .with_context(|| format!("Invalid path mask in target {:?}", target.path))?;
        let excludes = target
            .exclude_patterns()
            .into_iter()
            .map(|p| Pattern::new(p).with_context(|| format!("Invalid exclude pattern {:?}", p)))
            .collect::<Result<Vec<_>>>()?;

        let root = target.root();
        let absolute = root.is_absolute();
        let root = if root == Path::new(".") {
            work_dir.to_path_buf()
        } else {
            work_dir.join(root)
        };

        Ok(Self {
            root,
            absolute,
            mask,
            excludes,
        })
    }

    /// Excludes win over the mask.
    fn accepts(&self, file_name: &str) -> bool {
        if self.excludes.iter().any(|p| p.matches(file_name)) {
            return false;
        }
        self.mask.matches(file_name)
    }
}

/// Assembles `<name>-<ver>.tar.gz` from the targets of a package config.
///
/// Paths in the config are resolved against `work_dir`, entry names are
/// recorded relative to it and the archive is written into it.
pub struct ArchiveBuilder<'a, R: Runtime> {
    runtime: &'a R,
    work_dir: PathBuf,
}

impl<'a, R: Runtime> ArchiveBuilder<'a, R> {
    pub fn new(runtime: &'a R, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            work_dir: work_dir.into(),
        }
    }

    /// Read and parse `config_path`, then build the archive it describes.
    #[tracing::instrument(skip(self, deadline))]
    pub fn build_from_file(&self, config_path: &Path, deadline: &Deadline) -> Result<BuiltArchive> {
        deadline.check("Create package")?;

        let config_path = self.work_dir.join(config_path);
        let data = self
            .runtime
            .read(&config_path)
            .context("Failed to read config")?;
        let config = PackageConfig::parse(&data, ConfigFormat::from_path(&config_path))
            .context("Failed to parse config")?;

        self.build(&config, &data, deadline)
    }

    /// Build the archive for `config`, embedding `manifest` (the config file's
    /// original bytes) as the final entry.
    ///
    /// Any failure removes the partially written archive.
    #[tracing::instrument(skip(self, config, manifest, deadline), fields(package = %config.name))]
    pub fn build(
        &self,
        config: &PackageConfig,
        manifest: &[u8],
        deadline: &Deadline,
    ) -> Result<BuiltArchive> {
        let archive_path = self.work_dir.join(config.archive_name());
        info!("Creating archive {:?}", archive_path);

        match self.write_archive(&archive_path, config, manifest, deadline) {
            Ok(entries) => Ok(BuiltArchive {
                package: config.name.clone(),
                version: config.version.clone(),
                archive_path,
                entries,
            }),
            Err(e) => {
                if let Err(cleanup) = self.runtime.remove_file(&archive_path) {
                    debug!("Failed to remove partial archive: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn write_archive(
        &self,
        archive_path: &Path,
        config: &PackageConfig,
        manifest: &[u8],
        deadline: &Deadline,
    ) -> Result<Vec<ArchiveEntry>> {
        let file = self
            .runtime
            .create_file(archive_path)
            .context("Failed to create archive")?;
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut entries = Vec::new();

        for target in &config.targets {
            deadline.check("Create package")?;
            self.append_target(&mut tar, target, archive_path, &mut entries)
                .with_context(|| format!("Failed to add files of target {:?}", target.path))?;
        }

        if !config.packets.is_empty() {
            debug!("Declared packets: {:?}", config.packets);
        }

        let manifest_name = config.manifest_name();
        append_named(
            &mut tar,
            entry_header(manifest.len() as u64, 0o644),
            &manifest_name,
            manifest,
        )
        .with_context(|| format!("Failed to add manifest {}", manifest_name))?;
        debug!("add file {} ({} bytes)", manifest_name, manifest.len());
        entries.push(ArchiveEntry {
            name: manifest_name,
            size: manifest.len() as u64,
        });

        let encoder = tar.into_inner().context("Failed to finish tar stream")?;
        let mut file = encoder.finish().context("Failed to finish gzip stream")?;
        file.flush().context("Failed to flush archive")?;

        Ok(entries)
    }

    fn append_target<W: Write>(
        &self,
        tar: &mut tar::Builder<W>,
        target: &Target,
        archive_path: &Path,
        entries: &mut Vec<ArchiveEntry>,
    ) -> Result<()> {
        let filter = TargetFilter::compile(target, &self.work_dir)?;
        let before = entries.len();
        // The archive being written lives in the working directory too.
        let own_name = self.entry_name(archive_path)?;

        for path in self.runtime.walk_files(&filter.root)? {
            if self.entry_name(&path).is_ok_and(|name| name == own_name) {
                continue;
            }
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy()) else {
                continue;
            };
            if !filter.accepts(&file_name) {
                continue;
            }
            let name = if filter.absolute {
                path.to_string_lossy().into_owned()
            } else {
                self.entry_name(&path)?
            };
            entries.push(self.append_file(tar, &path, name)?);
        }

        if entries.len() == before {
            warn!("Target {:?} matched no files", target.path);
        }
        Ok(())
    }

    fn append_file<W: Write>(
        &self,
        tar: &mut tar::Builder<W>,
        path: &Path,
        name: String,
    ) -> Result<ArchiveEntry> {
        let size = self.runtime.file_size(path)?;
        let mode = self.runtime.file_mode(path)?;
        let reader = self.runtime.open(path)?;

        append_named(tar, entry_header(size, mode), &name, reader)
            .with_context(|| format!("Failed to write {} to archive", name))?;
        debug!("add file {} ({} bytes)", name, size);

        Ok(ArchiveEntry { name, size })
    }

    /// Path of `path` relative to the working directory, with `/` separators.
    /// Files beside or above the working directory keep their `..` steps.
    fn entry_name(&self, path: &Path) -> Result<String> {
        let relative = pathdiff::diff_paths(path, &self.work_dir)
            .ok_or_else(|| anyhow!("Cannot express {:?} relative to {:?}", path, self.work_dir))?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        Ok(parts.join("/"))
    }
}

/// Append `data` under `name` exactly as given.
///
/// `tar::Builder::append_data` refuses absolute and `..` names, so the name
/// is written into the header directly, preceded by a GNU long-name record
/// when it does not fit.
fn append_named<W: Write, D: Read>(
    tar: &mut tar::Builder<W>,
    mut header: tar::Header,
    name: &str,
    data: D,
) -> Result<()> {
    let bytes = name.as_bytes();
    let capacity = header.as_old().name.len();

    if bytes.len() > capacity {
        let mut long = entry_header(bytes.len() as u64 + 1, 0o644);
        long.set_entry_type(tar::EntryType::GNULongName);
        long.as_old_mut().name[..GNU_LONG_LINK.len()].copy_from_slice(GNU_LONG_LINK);
        long.set_cksum();
        let mut payload = bytes.to_vec();
        payload.push(0);
        tar.append(&long, payload.as_slice())?;
    }

    let stored = bytes.len().min(capacity);
    header.as_old_mut().name[..stored].copy_from_slice(&bytes[..stored]);
    header.set_cksum();
    tar.append(&header, data)?;
    Ok(())
}

fn entry_header(size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(DETERMINISTIC_MTIME);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use flate2::read::GzDecoder;
    use std::fs::{self, File};
    use std::time::Instant;
    use tempfile::{TempDir, tempdir};

    /// (name, size) of every entry, in archive order.
    fn list_tar_gz_contents(path: &Path) -> Vec<(String, u64)> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.header().size().unwrap(),
                )
            })
            .collect()
    }

    /// (name, body) of every entry, in archive order.
    fn read_tar_gz_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mut body = Vec::new();
                e.read_to_end(&mut body).unwrap();
                (name, body)
            })
            .collect()
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = tempdir().unwrap();
        write(dir.path(), "testdata/package/main.go", "package main\n\nfunc main() {}\n");
        write(dir.path(), "testdata/package/main_test.go", "package main\n");
        write(dir.path(), "testdata/package/README.md", "readme");
        write(dir.path(), "testdata/package1/packet.txt", "packet contents");
        write(dir.path(), "testdata/package1/nested/packages.txt", "a\nb\nc\n");
        write(dir.path(), "testdata/package1/skip.log", "log");
        dir
    }

    fn config(targets: Vec<Target>) -> PackageConfig {
        PackageConfig {
            name: "packet-1".into(),
            version: "1.10".into(),
            targets,
            packets: vec![],
        }
    }

    #[test]
    fn test_build_excludes_one_of_two_matches() -> Result<()> {
        let dir = fixture();
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());
        let manifest = br#"{"name":"packet-1","ver":"1.10"}"#;

        let built = builder.build(
            &config(vec![Target::new("testdata/package/*.go", "*_test.go")]),
            manifest,
            &Deadline::none(),
        )?;

        assert_eq!(built.package, "packet-1");
        assert_eq!(built.archive_name(), "packet-1-1.10.tar.gz");
        assert_eq!(built.archive_path, dir.path().join("packet-1-1.10.tar.gz"));

        let contents = list_tar_gz_contents(&built.archive_path);
        assert_eq!(
            contents,
            vec![
                ("testdata/package/main.go".to_string(), 29),
                ("meta-packet-1-1.10.json".to_string(), manifest.len() as u64),
            ]
        );

        let source = fs::read(dir.path().join("testdata/package/main.go"))?;
        let bodies = read_tar_gz_entries(&built.archive_path);
        assert_eq!(bodies[0].1, source);
        assert_eq!(bodies[0].1.len(), 29);
        assert_eq!(bodies[1].1, manifest.to_vec());
        assert_eq!(
            built.entries,
            vec![
                ArchiveEntry {
                    name: "testdata/package/main.go".into(),
                    size: 29
                },
                ArchiveEntry {
                    name: "meta-packet-1-1.10.json".into(),
                    size: manifest.len() as u64
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_exclude_wins_over_mask() -> Result<()> {
        let dir = fixture();
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());

        let built = builder.build(
            &config(vec![Target::new("testdata/package/main.go", "main.go")]),
            b"{}",
            &Deadline::none(),
        )?;

        let names: Vec<_> = list_tar_gz_contents(&built.archive_path)
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["meta-packet-1-1.10.json"]);
        Ok(())
    }

    #[test]
    fn test_build_walks_recursively_in_target_order() -> Result<()> {
        let dir = fixture();
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());

        let built = builder.build(
            &config(vec![
                Target::new("./testdata/package1/*", "*.log"),
                Target::new("testdata/package/README.md", ""),
            ]),
            b"{}",
            &Deadline::none(),
        )?;

        let names: Vec<_> = list_tar_gz_contents(&built.archive_path)
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(
            names,
            vec![
                "testdata/package1/nested/packages.txt",
                "testdata/package1/packet.txt",
                "testdata/package/README.md",
                "meta-packet-1-1.10.json",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_build_from_yaml_file_embeds_verbatim_config() -> Result<()> {
        let dir = fixture();
        let yaml = "name: packet-1\nver: '1.10'\ntargets:\n  - testdata/package1/packet.txt\n";
        write(dir.path(), "p.yaml", yaml);

        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());
        let built = builder.build_from_file(Path::new("p.yaml"), &Deadline::none())?;

        let file = File::open(&built.archive_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut manifest = None;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() == "meta-packet-1-1.10.json" {
                let mut s = String::new();
                std::io::Read::read_to_string(&mut entry, &mut s)?;
                manifest = Some(s);
            }
        }
        assert_eq!(manifest.as_deref(), Some(yaml));
        Ok(())
    }

    #[test]
    fn test_build_is_reproducible() -> Result<()> {
        let dir = fixture();
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());
        let cfg = config(vec![Target::new("testdata/package1/*", "")]);

        let first = builder.build(&cfg, b"{}", &Deadline::none())?;
        let first_bytes = fs::read(&first.archive_path)?;
        let second = builder.build(&cfg, b"{}", &Deadline::none())?;
        assert_eq!(first_bytes, fs::read(&second.archive_path)?);
        Ok(())
    }

    #[test]
    fn test_archive_never_contains_itself() -> Result<()> {
        let dir = tempdir()?;
        write(dir.path(), "a.txt", "a");
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());

        let built = builder.build(&config(vec![Target::new("*", "")]), b"{}", &Deadline::none())?;

        let names: Vec<_> = built.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "meta-packet-1-1.10.json"]);
        Ok(())
    }

    #[test]
    fn test_malformed_exclude_aborts_and_removes_archive() {
        let dir = fixture();
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());

        let err = builder
            .build(
                &config(vec![Target::new("testdata/package/*.go", "[")]),
                b"{}",
                &Deadline::none(),
            )
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Invalid exclude pattern"));
        assert!(!dir.path().join("packet-1-1.10.tar.gz").exists());
    }

    #[test]
    fn test_missing_root_aborts_build() {
        let dir = fixture();
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());

        let result = builder.build(
            &config(vec![Target::new("nowhere/*.go", "")]),
            b"{}",
            &Deadline::none(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_expired_deadline_cancels_build() {
        let dir = fixture();
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());

        let err = builder
            .build(
                &config(vec![Target::new("testdata/package/*.go", "")]),
                b"{}",
                &Deadline::at(Instant::now()),
            )
            .unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }

    #[test]
    fn test_build_from_file_unreadable_config() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_read()
            .returning(|_| Err(anyhow!("permission denied")));

        let builder = ArchiveBuilder::new(&runtime, "/work");
        let err = builder
            .build_from_file(Path::new("p.json"), &Deadline::none())
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_build_from_file_unparsable_config() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_read()
            .returning(|_| Ok(b"{not json".to_vec()));

        let builder = ArchiveBuilder::new(&runtime, "/work");
        let err = builder
            .build_from_file(Path::new("p.json"), &Deadline::none())
            .unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_sibling_target_keeps_parent_steps() -> Result<()> {
        let dir = tempdir()?;
        write(dir.path(), "shared/app.conf", "listen 80\n");
        write(dir.path(), "shared/notes.txt", "skip");
        let work = dir.path().join("work");
        fs::create_dir(&work)?;

        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, &work);
        let built = builder.build(
            &config(vec![Target::new("../shared/*.conf", "")]),
            b"{}",
            &Deadline::none(),
        )?;

        assert_eq!(
            read_tar_gz_entries(&built.archive_path),
            vec![
                ("../shared/app.conf".to_string(), b"listen 80\n".to_vec()),
                ("meta-packet-1-1.10.json".to_string(), b"{}".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_absolute_target_keeps_absolute_names() -> Result<()> {
        let dir = tempdir()?;
        write(dir.path(), "etc/app/app.conf", "debug = false\n");
        let work = dir.path().join("work");
        fs::create_dir(&work)?;
        let target = dir.path().join("etc/app/*.conf");

        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, &work);
        let built = builder.build(
            &config(vec![Target::new(target.to_string_lossy(), "")]),
            b"{}",
            &Deadline::none(),
        )?;

        let expected = dir.path().join("etc/app/app.conf");
        assert_eq!(built.entries[0].name, expected.to_string_lossy());
        let entries = read_tar_gz_entries(&built.archive_path);
        assert_eq!(entries[0].0, expected.to_string_lossy());
        assert_eq!(entries[0].1, b"debug = false\n");
        Ok(())
    }

    #[test]
    fn test_long_entry_names_survive() -> Result<()> {
        let dir = tempdir()?;
        let deep = format!("{}/{}/file.txt", "a".repeat(60), "b".repeat(60));
        write(dir.path(), &deep, "deep");

        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, dir.path());
        let built = builder.build(&config(vec![Target::new("*.txt", "")]), b"{}", &Deadline::none())?;

        let entries = read_tar_gz_entries(&built.archive_path);
        assert_eq!(entries[0], (deep, b"deep".to_vec()));
        Ok(())
    }

    #[test]
    fn test_entry_name_relative_to_work_dir() {
        let runtime = RealRuntime;
        let builder = ArchiveBuilder::new(&runtime, "/work/dir");
        assert_eq!(
            builder.entry_name(Path::new("/work/dir/a/b.txt")).unwrap(),
            "a/b.txt"
        );
        assert_eq!(
            builder.entry_name(Path::new("/work/other/b.txt")).unwrap(),
            "../other/b.txt"
        );
    }
}
