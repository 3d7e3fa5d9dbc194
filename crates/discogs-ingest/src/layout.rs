//! On-disk layout of downloaded dumps
//!
//! `<root>/<YYYY-MM>/<file type>.xml.gz`, with in-flight downloads written to
//! a `.part` sibling and renamed into place once verified.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use crate::models::{FileType, PeriodKey};

const DUMP_EXTENSION: &str = "xml.gz";
const PARTIAL_SUFFIX: &str = "part";

/// Paths of the artifacts of every period under one root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn period_dir(&self, key: PeriodKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    /// Final location of a dump file
    pub fn file_path(&self, key: PeriodKey, file_type: FileType) -> PathBuf {
        self.period_dir(key)
            .join(format!("{}.{}", file_type.as_str(), DUMP_EXTENSION))
    }

    /// Location while the download is in flight
    pub fn partial_path(&self, key: PeriodKey, file_type: FileType) -> PathBuf {
        self.period_dir(key).join(format!(
            "{}.{}.{}",
            file_type.as_str(),
            DUMP_EXTENSION,
            PARTIAL_SUFFIX
        ))
    }

    /// File types whose finished dump exists for the period
    pub fn available_file_types(&self, key: PeriodKey) -> Vec<FileType> {
        FileType::ALL
            .into_iter()
            .filter(|ft| self.file_path(key, *ft).is_file())
            .collect()
    }

    /// Periods that have a directory under the root, newest first
    pub fn periods(&self) -> Result<Vec<PeriodKey>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(key) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                keys.push(key);
            }
        }
        keys.sort_by(|a: &PeriodKey, b| b.cmp(a));
        Ok(keys)
    }

    /// Delete the in-flight `.part` files of a period
    ///
    /// Finished dumps are only renamed into place after verification, so they
    /// are left alone. Returns the removed paths.
    pub fn remove_partial_files(&self, key: PeriodKey) -> Result<Vec<PathBuf>> {
        let dir = self.period_dir(key);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let suffix = format!(".{}", PARTIAL_SUFFIX);
        let mut removed = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let is_partial = entry.file_type()?.is_file()
                && entry.file_name().to_str().is_some_and(|n| n.ends_with(&suffix));
            if is_partial {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                info!(period = %key, path = %path.display(), "Removed partial download");
                removed.push(path);
            }
        }
        removed.sort();
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_paths() {
        let layout = ArtifactLayout::new("/data");
        let k = key("2024-01");
        assert_eq!(layout.period_dir(k), PathBuf::from("/data/2024-01"));
        assert_eq!(
            layout.file_path(k, FileType::Releases),
            PathBuf::from("/data/2024-01/releases.xml.gz")
        );
        assert_eq!(
            layout.partial_path(k, FileType::Labels),
            PathBuf::from("/data/2024-01/labels.xml.gz.part")
        );
    }

    #[test]
    fn test_available_ignores_partial_files() {
        let tmp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(tmp.path());
        let k = key("2024-02");
        std::fs::create_dir_all(layout.period_dir(k)).unwrap();
        std::fs::write(layout.file_path(k, FileType::Artists), b"x").unwrap();
        std::fs::write(layout.partial_path(k, FileType::Labels), b"x").unwrap();

        assert_eq!(layout.available_file_types(k), vec![FileType::Artists]);
    }

    #[test]
    fn test_periods_newest_first() {
        let tmp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(tmp.path());
        for k in ["2023-12", "2024-03", "2024-01"] {
            std::fs::create_dir_all(layout.period_dir(key(k))).unwrap();
        }
        std::fs::create_dir_all(tmp.path().join("scratch")).unwrap();

        let periods = layout.periods().unwrap();
        assert_eq!(periods, vec![key("2024-03"), key("2024-01"), key("2023-12")]);
    }

    #[test]
    fn test_remove_partial_files_keeps_finished_dumps() {
        let tmp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(tmp.path());
        let k = key("2024-04");
        std::fs::create_dir_all(layout.period_dir(k)).unwrap();
        std::fs::write(layout.file_path(k, FileType::Labels), b"done").unwrap();
        std::fs::write(layout.partial_path(k, FileType::Artists), b"half").unwrap();
        std::fs::write(layout.partial_path(k, FileType::Masters), b"half").unwrap();

        let removed = layout.remove_partial_files(k).unwrap();

        assert_eq!(
            removed,
            vec![
                layout.partial_path(k, FileType::Artists),
                layout.partial_path(k, FileType::Masters)
            ]
        );
        assert_eq!(layout.available_file_types(k), vec![FileType::Labels]);
        assert!(layout.remove_partial_files(k).unwrap().is_empty());
        assert!(layout.remove_partial_files(key("2030-01")).unwrap().is_empty());
    }
}
