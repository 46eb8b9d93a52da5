//! Image asset discovery.
//!
//! The scraper lays images out as `<base>/<channel>/<message_id>.<ext>`. This
//! module walks that tree and recovers the owning message id from each file
//! name. It never opens image contents.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// One candidate image found under the base directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageAsset {
    pub path: PathBuf,
    /// First path component below the base directory, when there is one.
    pub channel: Option<String>,
}

impl ImageAsset {
    pub fn message_id(&self) -> Option<i64> {
        extract_message_id(&self.path)
    }
}

/// Finds image files by extension under a base directory.
#[derive(Clone, Debug)]
pub struct AssetLocator {
    base_dir: PathBuf,
    extensions: Vec<String>,
}

impl AssetLocator {
    pub fn new(base_dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            base_dir: base_dir.into(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Start a fresh scan. Each call re-reads the tree from the top.
    ///
    /// A missing or unreadable base directory is fatal; unreadable
    /// subdirectories are logged and skipped.
    pub fn enumerate(&self) -> Result<AssetScan<'_>, PipelineError> {
        let metadata = fs::metadata(&self.base_dir).map_err(|e| PipelineError::Scan {
            path: self.base_dir.clone(),
            message: e.to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(PipelineError::Scan {
                path: self.base_dir.clone(),
                message: "not a directory".to_string(),
            });
        }
        let mut scan = AssetScan {
            locator: self,
            pending_dirs: VecDeque::new(),
            ready: VecDeque::new(),
        };
        scan.pending_dirs.push_back(self.base_dir.clone());
        Ok(scan)
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|wanted| *wanted == ext)
            })
            .unwrap_or(false)
    }

    fn channel_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_dir).ok()?;
        let mut components = relative.components();
        let first = components.next()?;
        // A file directly under the base directory has no channel.
        components.next()?;
        first.as_os_str().to_str().map(|s| s.to_string())
    }
}

/// Lazy, finite walk over one directory tree.
///
/// Directories are read one at a time as the iterator advances; entries
/// within a directory are yielded in file-name order.
pub struct AssetScan<'a> {
    locator: &'a AssetLocator,
    pending_dirs: VecDeque<PathBuf>,
    ready: VecDeque<ImageAsset>,
}

impl AssetScan<'_> {
    fn expand(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("skipping unreadable directory {}: {}", dir.display(), e);
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    log::warn!("skipping unreadable entry in {}: {}", dir.display(), e);
                    None
                }
            })
            .collect();
        paths.sort();

        for path in paths {
            if path.is_dir() {
                self.pending_dirs.push_back(path);
            } else if self.locator.matches_extension(&path) {
                let channel = self.locator.channel_of(&path);
                self.ready.push_back(ImageAsset { path, channel });
            }
        }
    }
}

impl Iterator for AssetScan<'_> {
    type Item = ImageAsset;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(asset) = self.ready.pop_front() {
                return Some(asset);
            }
            let dir = self.pending_dirs.pop_front()?;
            self.expand(&dir);
        }
    }
}

/// Parse the message id from a file's base name.
///
/// The stem must be a plain run of ASCII digits naming a positive integer
/// that fits in `i64`. Anything else yields `None`.
pub fn extract_message_id(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<i64>().ok().filter(|id| *id > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"img").unwrap();
    }

    #[test]
    fn extracts_numeric_stems_only() {
        assert_eq!(extract_message_id(Path::new("imgs/chan/1234.jpg")), Some(1234));
        assert_eq!(extract_message_id(Path::new("007.jpg")), Some(7));
        assert_eq!(extract_message_id(Path::new("abc.jpg")), None);
        assert_eq!(extract_message_id(Path::new("12a.jpg")), None);
        assert_eq!(extract_message_id(Path::new("-5.jpg")), None);
        assert_eq!(extract_message_id(Path::new("+5.jpg")), None);
        assert_eq!(extract_message_id(Path::new("0.jpg")), None);
        assert_eq!(extract_message_id(Path::new(".jpg")), None);
        assert_eq!(
            extract_message_id(Path::new("99999999999999999999.jpg")),
            None
        );
    }

    #[test]
    fn enumerates_nested_channels_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        touch(&base.join("chan_b/20.jpg"));
        touch(&base.join("chan_a/10.JPG"));
        touch(&base.join("chan_a/11.png"));
        touch(&base.join("chan_a/notes.txt"));
        touch(&base.join("loose.jpg"));

        let locator = AssetLocator::new(base, &["jpg".to_string()]);
        let assets: Vec<ImageAsset> = locator.enumerate().unwrap().collect();

        let names: Vec<String> = assets
            .iter()
            .map(|a| a.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["loose.jpg", "10.JPG", "20.jpg"]);
        assert_eq!(assets[0].channel, None);
        assert_eq!(assets[1].channel.as_deref(), Some("chan_a"));
        assert_eq!(assets[2].channel.as_deref(), Some("chan_b"));
    }

    #[test]
    fn rescans_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("c/1.jpg"));
        let locator = AssetLocator::new(dir.path(), &["jpg".to_string()]);
        assert_eq!(locator.enumerate().unwrap().count(), 1);
        touch(&dir.path().join("c/2.jpg"));
        assert_eq!(locator.enumerate().unwrap().count(), 2);
    }

    #[test]
    fn missing_base_directory_is_a_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let locator = AssetLocator::new(dir.path().join("absent"), &["jpg".to_string()]);
        assert!(matches!(
            locator.enumerate(),
            Err(PipelineError::Scan { .. })
        ));
    }
}
