//! Record sources
//!
//! Pull-style readers that turn input into [`ContentRecord`]s. A source
//! either yields a record, a skip signal for malformed input, or the end
//! of the partition; it also reports coarse progress for the monitor.

use crate::error::{LoadError, Result};
use crate::types::{ContentKind, ContentRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One item pulled from a source
#[derive(Debug)]
pub enum SourceItem {
    /// A document ready for loading
    Record(ContentRecord),
    /// Malformed or unreadable input, skipped with a reason
    Skip { uri: String, reason: String },
}

/// Pull-style record iterator for one input partition
#[async_trait]
pub trait RecordSource: Send {
    /// Pull the next item; `None` marks the end of the partition
    async fn next(&mut self) -> Result<Option<SourceItem>>;

    /// Fraction of the partition consumed so far, in `[0, 1]`
    fn progress(&self) -> f32;
}

/// In-memory source over prepared records
///
/// Used by tests and by embedders that already hold their documents.
pub struct VecSource {
    records: std::vec::IntoIter<ContentRecord>,
    total: usize,
    consumed: usize,
}

impl VecSource {
    pub fn new(records: Vec<ContentRecord>) -> Self {
        let total = records.len();
        Self {
            records: records.into_iter(),
            total,
            consumed: 0,
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn next(&mut self) -> Result<Option<SourceItem>> {
        match self.records.next() {
            Some(record) => {
                self.consumed += 1;
                Ok(Some(SourceItem::Record(record)))
            }
            None => Ok(None),
        }
    }

    fn progress(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.consumed as f32 / self.total as f32
        }
    }
}

/// Filesystem source: one document per file
///
/// Files are enumerated up front (see [`collect_files`]); bodies are read
/// lazily as the pipeline pulls. Unreadable files become skip signals, not
/// errors: one bad file must not sink the partition.
pub struct DirectorySource {
    root: PathBuf,
    files: std::vec::IntoIter<(PathBuf, u64)>,
    total: usize,
    consumed: usize,
    uri_prefix: String,
    uri_suffix: String,
}

impl DirectorySource {
    /// Create a source over an explicit file list (paths under `root`)
    pub fn new(root: PathBuf, files: Vec<(PathBuf, u64)>) -> Self {
        let total = files.len();
        Self {
            root,
            files: files.into_iter(),
            total,
            consumed: 0,
            uri_prefix: String::new(),
            uri_suffix: String::new(),
        }
    }

    /// Apply a URI prefix and suffix to every generated URI
    pub fn with_uri_transform(
        mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        self.uri_prefix = prefix.into();
        self.uri_suffix = suffix.into();
        self
    }

    fn uri_for(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let mut rel = String::new();
        for component in relative.components() {
            rel.push('/');
            rel.push_str(&component.as_os_str().to_string_lossy());
        }
        format!("{}{}{}", self.uri_prefix, rel, self.uri_suffix)
    }
}

#[async_trait]
impl RecordSource for DirectorySource {
    async fn next(&mut self) -> Result<Option<SourceItem>> {
        let Some((path, _size)) = self.files.next() else {
            return Ok(None);
        };
        self.consumed += 1;

        let uri = self.uri_for(&path);
        match tokio::fs::read(&path).await {
            Ok(body) => {
                let kind = path
                    .extension()
                    .map(|ext| ContentKind::from_extension(&ext.to_string_lossy()))
                    .unwrap_or(ContentKind::Binary);
                Ok(Some(SourceItem::Record(ContentRecord::new(
                    uri, body, kind,
                ))))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                Ok(Some(SourceItem::Skip {
                    uri,
                    reason: e.to_string(),
                }))
            }
        }
    }

    fn progress(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.consumed as f32 / self.total as f32
        }
    }
}

/// Enumerate regular files under a root directory, sorted by path
pub fn collect_files(root: &Path) -> Result<Vec<(PathBuf, u64)>> {
    fn walk(dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(&path, out)?;
            } else if file_type.is_file() {
                let size = entry.metadata()?.len();
                out.push((path, size));
            }
        }
        Ok(())
    }

    if !root.is_dir() {
        return Err(LoadError::source(
            root.display().to_string(),
            "input path is not a directory",
        ));
    }

    let mut files = Vec::new();
    walk(root, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Pack files into at most `max_splits` partitions balanced by size
///
/// Longest-processing-time packing: files are placed largest first onto the
/// currently smallest partition. The returned partitions are ordered
/// largest total size first, which is the order the runner wants.
pub fn plan_splits(mut files: Vec<(PathBuf, u64)>, max_splits: usize) -> Vec<Vec<(PathBuf, u64)>> {
    if files.is_empty() || max_splits == 0 {
        return Vec::new();
    }

    let split_count = max_splits.min(files.len());
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut splits: Vec<(u64, Vec<(PathBuf, u64)>)> = vec![(0, Vec::new()); split_count];
    for file in files {
        let target = splits
            .iter_mut()
            .min_by_key(|(size, _)| *size)
            .expect("split_count is at least 1");
        target.0 += file.1;
        target.1.push(file);
    }

    splits.sort_by(|a, b| b.0.cmp(&a.0));
    splits.into_iter().map(|(_, files)| files).collect()
}
