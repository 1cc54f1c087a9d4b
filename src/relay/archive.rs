use crate::relay::util::move_file;
use anyhow::{Context, Result};
use chrono::{Local, Utc};
use chrono_tz::Tz;
use std::path::{Path, PathBuf};

const DATE_FOLDER_FORMAT: &str = "%Y-%m-%d";

/// Relocates terminal files into `{root}/{publisher}/{partner}/{date}/`.
/// Same-named files already there are overwritten.
#[derive(Debug, Clone)]
pub struct ArchiveMover {
    processed_root: PathBuf,
    invalid_root: PathBuf,
    timezone: Option<Tz>,
}

impl ArchiveMover {
    pub fn new(processed_root: PathBuf, invalid_root: PathBuf, timezone: Option<&str>) -> Result<Self> {
        let timezone = match timezone {
            Some(name) => Some(
                name.parse::<Tz>()
                    .map_err(|err| anyhow::anyhow!("unknown archive timezone `{name}`: {err}"))?,
            ),
            None => None,
        };
        Ok(Self {
            processed_root,
            invalid_root,
            timezone,
        })
    }

    pub fn today(&self) -> String {
        match self.timezone {
            Some(tz) => Utc::now().with_timezone(&tz).format(DATE_FOLDER_FORMAT).to_string(),
            None => Local::now().format(DATE_FOLDER_FORMAT).to_string(),
        }
    }

    pub fn processed_dir_for(&self, publisher: &str, partner: &str) -> PathBuf {
        self.processed_root.join(publisher).join(partner).join(self.today())
    }

    pub fn move_to_processed(&self, path: &Path, publisher: &str, partner: &str) -> Result<PathBuf> {
        relocate(path, &self.processed_dir_for(publisher, partner))
    }

    pub fn move_to_invalid(&self, path: &Path, publisher: &str, partner: &str) -> Result<PathBuf> {
        let dir = self.invalid_root.join(publisher).join(partner).join(self.today());
        relocate(path, &dir)
    }
}

fn relocate(path: &Path, dir: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let dest = dir.join(name);
    move_file(path, &dest)?;
    Ok(dest)
}
