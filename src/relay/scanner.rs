use crate::relay::config::WatchConfig;
use crate::relay::util::{extension_lowercase, file_hash, move_file, now_epoch_millis, path_key};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    Report,
    Metadata,
    ArchiveContainer,
    LockMarker,
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    /// sha256 of the containing directory path.
    pub dir_key: String,
    pub class: FileClass,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub discovered: usize,
    pub duplicates: usize,
    pub lock_skipped: usize,
    pub unsupported: usize,
    pub archives_expanded: usize,
    pub archives_failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub stats: ScanStats,
    /// Eligible reports (deduplicated) and metadata sidecars in walk order.
    pub files: Vec<WatchedFile>,
}

pub struct Scanner<'a> {
    watch_root: &'a Path,
    zip_archive_dir: &'a Path,
    watch: &'a WatchConfig,
    excluded: Vec<PathBuf>,
}

impl<'a> Scanner<'a> {
    pub fn new(watch_root: &'a Path, zip_archive_dir: &'a Path, watch: &'a WatchConfig) -> Self {
        Self {
            watch_root,
            zip_archive_dir,
            watch,
            excluded: Vec::new(),
        }
        .exclude(zip_archive_dir)
    }

    /// Never descend into `dir` when it lives inside the watch root.
    pub fn exclude(mut self, dir: &Path) -> Self {
        if dir != self.watch_root && dir.starts_with(self.watch_root) {
            self.excluded.push(dir.to_path_buf());
        }
        self
    }

    pub fn classify(&self, path: &Path) -> FileClass {
        let Some(ext) = extension_lowercase(path) else {
            return FileClass::Unsupported;
        };
        if ext == self.watch.lock_marker_extension {
            FileClass::LockMarker
        } else if self.watch.archive_extensions.contains(&ext) {
            FileClass::ArchiveContainer
        } else if ext == self.watch.metadata_extension {
            FileClass::Metadata
        } else if self.watch.supported_extensions.contains(&ext) {
            FileClass::Report
        } else {
            FileClass::Unsupported
        }
    }

    /// Every regular file under the watch root, in sorted walk order.
    pub fn walk_files(&self) -> Vec<PathBuf> {
        let excluded = &self.excluded;
        let mut out = Vec::new();
        for entry in WalkDir::new(self.watch_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !excluded.iter().any(|dir| e.path().starts_with(dir)))
        {
            match entry {
                Ok(entry) if entry.file_type().is_file() => out.push(entry.into_path()),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping unreadable watch entry"),
            }
        }
        out
    }

    pub fn lock_marked_dirs(&self, files: &[PathBuf]) -> HashSet<PathBuf> {
        files
            .iter()
            .filter(|path| self.classify(path) == FileClass::LockMarker)
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect()
    }

    /// Expand every archive outside lock-marked directories. Failures are
    /// counted and the archive stays where it is.
    pub fn expand_archives(&self, stats: &mut ScanStats) {
        let files = self.walk_files();
        let locked = self.lock_marked_dirs(&files);
        for path in files {
            if self.classify(&path) != FileClass::ArchiveContainer {
                continue;
            }
            if path.parent().is_some_and(|dir| locked.contains(dir)) {
                debug!(path = %path.display(), "archive in lock-marked directory left untouched");
                continue;
            }
            match self.expand_one(&path) {
                Ok(target) => {
                    stats.archives_expanded += 1;
                    info!(
                        archive = %path.display(),
                        target = %target.display(),
                        "archive expanded"
                    );
                }
                Err(err) => {
                    stats.archives_failed += 1;
                    warn!(archive = %path.display(), error = %format!("{err:#}"), "archive expansion failed");
                }
            }
        }
    }

    fn expand_one(&self, archive_path: &Path) -> Result<PathBuf> {
        let parent = archive_path
            .parent()
            .context("archive has no parent directory")?;
        let stem = archive_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("archive");

        let file = fs::File::open(archive_path)
            .with_context(|| format!("failed to open {}", archive_path.display()))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("{} is not a readable zip", archive_path.display()))?;

        let target = unique_sibling_dir(parent, stem);
        fs::create_dir_all(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        if let Err(err) = archive.extract(&target) {
            let _ = fs::remove_dir_all(&target);
            return Err(err).with_context(|| format!("failed to extract {}", archive_path.display()));
        }
        drop(archive);

        let holding = self.holding_path(archive_path);
        if let Err(err) = move_file(archive_path, &holding) {
            let _ = fs::remove_dir_all(&target);
            return Err(err);
        }

        for sidecar in self.sidecars_beside(parent)? {
            if let Some(name) = sidecar.file_name() {
                move_file(&sidecar, &target.join(name))?;
            }
        }
        Ok(target)
    }

    /// Mirror the archive's position below the watch root inside the
    /// archive-holding area, never overwriting an earlier archive.
    fn holding_path(&self, archive_path: &Path) -> PathBuf {
        let relative = archive_path
            .strip_prefix(self.watch_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(archive_path.file_name().unwrap_or_default()));
        let dest = self.zip_archive_dir.join(relative);
        if !dest.exists() {
            return dest;
        }
        let stem = dest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = extension_lowercase(&dest).unwrap_or_else(|| "zip".to_string());
        dest.with_file_name(format!("{stem}-{}.{ext}", now_epoch_millis()))
    }

    fn sidecars_beside(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let path = entry?.path();
            if path.is_file() && self.classify(&path) == FileClass::Metadata {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Expand archives, then walk again and classify. Lock-marked
    /// directories, unsupported files and duplicate reports are counted and
    /// left on disk.
    pub fn scan(&self) -> ScanOutcome {
        let mut stats = ScanStats::default();
        self.expand_archives(&mut stats);

        let files = self.walk_files();
        let locked = self.lock_marked_dirs(&files);
        let mut seen_hashes = HashSet::new();
        let mut eligible = Vec::new();

        for path in files {
            let class = self.classify(&path);
            if class == FileClass::LockMarker {
                continue;
            }
            stats.discovered += 1;
            let Some(dir) = path.parent() else {
                continue;
            };
            if locked.contains(dir) {
                stats.lock_skipped += 1;
                continue;
            }

            match class {
                FileClass::Report => {
                    let hash = match file_hash(&path) {
                        Ok(hash) => hash,
                        Err(err) => {
                            warn!(path = %path.display(), error = %format!("{err:#}"), "cannot hash report");
                            continue;
                        }
                    };
                    if !seen_hashes.insert(hash) {
                        stats.duplicates += 1;
                        info!(path = %path.display(), "duplicate report content skipped");
                        continue;
                    }
                }
                FileClass::Metadata => {}
                FileClass::ArchiveContainer | FileClass::Unsupported | FileClass::LockMarker => {
                    stats.unsupported += 1;
                    debug!(path = %path.display(), "unsupported file ignored");
                    continue;
                }
            }

            eligible.push(WatchedFile {
                dir_key: path_key(dir),
                class,
                path,
            });
        }

        ScanOutcome {
            stats,
            files: eligible,
        }
    }
}

/// `parent/stem`, or the first free `parent/stem-N`.
fn unique_sibling_dir(parent: &Path, stem: &str) -> PathBuf {
    let first = parent.join(stem);
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| parent.join(format!("{stem}-{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::{FileClass, Scanner};
    use crate::relay::config::WatchConfig;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, body) in entries {
            writer.start_file(*name, options).expect("start entry");
            writer.write_all(body.as_bytes()).expect("write entry");
        }
        writer.finish().expect("finish zip");
    }

    fn touch(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write");
    }

    #[test]
    fn classification_follows_extensions() {
        let cfg = WatchConfig::default();
        let root = Path::new("/w");
        let scanner = Scanner::new(root, Path::new("/z"), &cfg);
        assert_eq!(scanner.classify(Path::new("/w/a.CSV")), FileClass::Report);
        assert_eq!(scanner.classify(Path::new("/w/a.pdf.meta")), FileClass::Metadata);
        assert_eq!(scanner.classify(Path::new("/w/a.zip")), FileClass::ArchiveContainer);
        assert_eq!(scanner.classify(Path::new("/w/upload.lock")), FileClass::LockMarker);
        assert_eq!(scanner.classify(Path::new("/w/a.pdf")), FileClass::Unsupported);
        assert_eq!(scanner.classify(Path::new("/w/README")), FileClass::Unsupported);
    }

    #[test]
    fn duplicates_are_counted_but_left_on_disk() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("watch");
        let body = "date,clicks\n2024-01-01,4\n";
        touch(&root.join("1/p/fetcher/a.csv"), body);
        touch(&root.join("1/p/fetcher/b.csv"), body);
        touch(&root.join("2/q/fetcher/c.csv"), body);
        touch(&root.join("2/q/fetcher/d.csv"), "other\n1\n");

        let cfg = WatchConfig::default();
        let zips = tmp.path().join("zips");
        let outcome = Scanner::new(&root, &zips, &cfg).scan();

        assert_eq!(outcome.stats.discovered, 4);
        assert_eq!(outcome.stats.duplicates, 2);
        let kept = outcome.files.iter().map(|f| f.path.clone()).collect::<Vec<_>>();
        assert_eq!(kept, vec![root.join("1/p/fetcher/a.csv"), root.join("2/q/fetcher/d.csv")]);
        assert!(root.join("1/p/fetcher/b.csv").exists());
        assert!(root.join("2/q/fetcher/c.csv").exists());
    }

    #[test]
    fn lock_marked_directories_are_skipped() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("watch");
        touch(&root.join("1/p/email/busy/a.csv"), "x\n1\n");
        touch(&root.join("1/p/email/busy/upload.lock"), "");
        touch(&root.join("1/p/email/busy/nested.zip"), "not really a zip");
        touch(&root.join("1/p/email/free/b.csv"), "y\n2\n");

        let cfg = WatchConfig::default();
        let zips = tmp.path().join("zips");
        let outcome = Scanner::new(&root, &zips, &cfg).scan();

        assert_eq!(outcome.stats.lock_skipped, 2);
        assert_eq!(outcome.stats.archives_failed, 0);
        assert_eq!(outcome.files.len(), 1);
        assert!(root.join("1/p/email/busy/nested.zip").exists());
    }

    #[test]
    fn unsupported_files_are_counted_and_metadata_always_kept() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("watch");
        touch(&root.join("1/p/email/notes.pdf"), "pdf");
        touch(&root.join("1/p/email/remote.pdf.meta"), "{}");

        let cfg = WatchConfig::default();
        let zips = tmp.path().join("zips");
        let outcome = Scanner::new(&root, &zips, &cfg).scan();

        assert_eq!(outcome.stats.unsupported, 1);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].class, FileClass::Metadata);
    }

    #[test]
    fn zip_is_expanded_beside_itself_and_moved_out() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("watch");
        let dir = root.join("9/partnerY/fetcher");
        fs::create_dir_all(dir.join("batch")).expect("collision dir");
        write_zip(&dir.join("batch.zip"), &[("a.csv", "date,clicks\n2024-01-01,1\n")]);
        touch(&dir.join("batch.zip.meta"), "{\"dataSourceId\": 3}");

        let cfg = WatchConfig::default();
        let zips = tmp.path().join("zip-archive");
        let outcome = Scanner::new(&root, &zips, &cfg).scan();

        assert_eq!(outcome.stats.archives_expanded, 1);
        assert!(!dir.join("batch.zip").exists());
        assert!(zips.join("9/partnerY/fetcher/batch.zip").exists());
        assert!(dir.join("batch-1/a.csv").exists());
        assert!(dir.join("batch-1/batch.zip.meta").exists());
        assert!(!dir.join("batch.zip.meta").exists());

        let reports = outcome
            .files
            .iter()
            .filter(|f| f.class == FileClass::Report)
            .map(|f| f.path.clone())
            .collect::<Vec<_>>();
        assert_eq!(reports, vec![dir.join("batch-1/a.csv")]);
    }

    #[test]
    fn unreadable_zip_is_left_in_place() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("watch");
        let broken = root.join("9/p/fetcher/broken.zip");
        touch(&broken, "definitely not a zip archive");

        let cfg = WatchConfig::default();
        let zips = tmp.path().join("zip-archive");
        let outcome = Scanner::new(&root, &zips, &cfg).scan();

        assert_eq!(outcome.stats.archives_failed, 1);
        assert!(broken.exists());
        assert!(!root.join("9/p/fetcher/broken").exists());
    }

    #[test]
    fn holding_area_inside_watch_root_is_not_rescanned() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("watch");
        let zips = root.join(".zip-archive");
        touch(&zips.join("1/p/fetcher/old.csv"), "a\n1\n");
        touch(&root.join("1/p/fetcher/new.csv"), "b\n2\n");

        let cfg = WatchConfig::default();
        let outcome = Scanner::new(&root, &zips, &cfg).scan();
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].path, root.join("1/p/fetcher/new.csv"));
    }
}
