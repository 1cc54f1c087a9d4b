use crate::relay::metadata::Metadata;
use crate::relay::scanner::{FileClass, WatchedFile};
use crate::relay::util::path_key;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One delivery: a report, its sidecar, or both. Never neither.
#[derive(Debug, Clone)]
pub struct PairedUnit {
    pub report: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub metadata: Metadata,
}

/// How many reports of the current run still point at each sidecar.
/// Owned by one run and passed to the scanner and the dispatcher.
#[derive(Debug, Default)]
pub struct MetadataRefCounts {
    counts: HashMap<String, usize>,
}

impl MetadataRefCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, metadata: &Path) -> usize {
        let count = self.counts.entry(path_key(metadata)).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one reference. True when the sidecar may be archived: the last
    /// reference went away, or it was never tracked at all.
    pub fn release(&mut self, metadata: &Path) -> bool {
        let key = path_key(metadata);
        match self.counts.get_mut(&key) {
            None => true,
            Some(count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.counts.remove(&key);
                    true
                } else {
                    false
                }
            }
        }
    }

    #[cfg(test)]
    pub fn count(&self, metadata: &Path) -> usize {
        self.counts.get(&path_key(metadata)).copied().unwrap_or(0)
    }
}

/// Group scanned files by directory, in the order directories were first
/// seen. The first sidecar in a directory serves every report beside it.
pub fn pair_units(files: &[WatchedFile], refs: &mut MetadataRefCounts) -> Vec<PairedUnit> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&WatchedFile>> = HashMap::new();
    for file in files {
        let key = file.dir_key.as_str();
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(file);
    }

    let mut units = Vec::new();
    for key in order {
        let members = groups.remove(key).unwrap_or_default();
        let mut sidecars = members.iter().filter(|f| f.class == FileClass::Metadata);
        let sidecar = sidecars.next().map(|f| f.path.clone());
        for extra in sidecars {
            warn!(
                path = %extra.path.display(),
                "additional metadata file in directory ignored"
            );
        }
        let metadata = sidecar.as_deref().map(Metadata::load).unwrap_or_default();

        let reports = members
            .iter()
            .filter(|f| f.class == FileClass::Report)
            .map(|f| f.path.clone())
            .collect::<Vec<_>>();

        if reports.is_empty() {
            if let Some(sidecar) = sidecar {
                units.push(PairedUnit {
                    report: None,
                    metadata_path: Some(sidecar),
                    metadata,
                });
            }
            continue;
        }

        for report in reports {
            if let Some(sidecar) = &sidecar {
                refs.track(sidecar);
            }
            units.push(PairedUnit {
                report: Some(report),
                metadata_path: sidecar.clone(),
                metadata: metadata.clone(),
            });
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::{MetadataRefCounts, pair_units};
    use crate::relay::scanner::{FileClass, WatchedFile};
    use crate::relay::util::path_key;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn watched(path: &Path, class: FileClass) -> WatchedFile {
        WatchedFile {
            path: path.to_path_buf(),
            dir_key: path_key(path.parent().expect("parent")),
            class,
        }
    }

    #[test]
    fn shared_sidecar_is_released_only_by_its_last_report() {
        let mut refs = MetadataRefCounts::new();
        let meta = PathBuf::from("/w/1/p/fetcher/r.meta");
        refs.track(&meta);
        refs.track(&meta);
        refs.track(&meta);

        assert!(!refs.release(&meta));
        assert!(!refs.release(&meta));
        assert_eq!(refs.count(&meta), 1);
        assert!(refs.release(&meta));
        assert_eq!(refs.count(&meta), 0);
    }

    #[test]
    fn untracked_sidecar_may_be_archived() {
        let mut refs = MetadataRefCounts::new();
        assert!(refs.release(Path::new("/never/seen.meta")));
    }

    #[test]
    fn units_share_the_first_sidecar_of_their_directory() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("1/p/fetcher");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("a.meta"), "{\"dataSourceId\": 5}").expect("meta");
        fs::write(dir.join("b.meta"), "{\"dataSourceId\": 6}").expect("meta");

        let files = vec![
            watched(&dir.join("a.meta"), FileClass::Metadata),
            watched(&dir.join("b.meta"), FileClass::Metadata),
            watched(&dir.join("r1.csv"), FileClass::Report),
            watched(&dir.join("r2.csv"), FileClass::Report),
        ];
        let mut refs = MetadataRefCounts::new();
        let units = pair_units(&files, &mut refs);

        assert_eq!(units.len(), 2);
        for unit in &units {
            assert_eq!(unit.metadata_path.as_deref(), Some(dir.join("a.meta").as_path()));
            assert_eq!(unit.metadata.data_source_id(), Some(5));
        }
        assert_eq!(refs.count(&dir.join("a.meta")), 2);
        assert_eq!(refs.count(&dir.join("b.meta")), 0);
    }

    #[test]
    fn metadata_only_directory_yields_one_unit_without_report() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("1/p/email");
        fs::create_dir_all(&dir).expect("mkdir");
        let meta = dir.join("remote.csv.meta");
        fs::write(&meta, "{\"reportFileUrl\": \"https://x.test/r.csv\"}").expect("meta");

        let mut refs = MetadataRefCounts::new();
        let units = pair_units(&[watched(&meta, FileClass::Metadata)], &mut refs);

        assert_eq!(units.len(), 1);
        assert!(units[0].report.is_none());
        assert_eq!(units[0].metadata.report_file_url(), Some("https://x.test/r.csv"));
        assert_eq!(refs.count(&meta), 0);
    }

    #[test]
    fn reports_without_sidecar_get_empty_metadata() {
        let files = vec![
            watched(Path::new("/w/1/p/email/a.csv"), FileClass::Report),
            watched(Path::new("/w/2/q/email/b.csv"), FileClass::Report),
        ];
        let mut refs = MetadataRefCounts::new();
        let units = pair_units(&files, &mut refs);

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].report.as_deref(), Some(Path::new("/w/1/p/email/a.csv")));
        assert!(units.iter().all(|u| u.metadata_path.is_none() && u.metadata.is_empty()));
    }
}
