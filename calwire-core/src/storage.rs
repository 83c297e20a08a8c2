//! Storage collaborator: where received books go.
//!
//! Paths handed to a [`Storage`] are device paths using `/` separators, such as
//! `/Books/Author/Title.epub`. [`FsStorage`] maps them under a root directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::protocol::BookEntry;

/// Streamed writer for one file.
pub type BookWriter = Box<dyn Write + Send>;

/// Filesystem operations the engine needs.
pub trait Storage: Send {
    /// Create `path` and all missing parents as directories.
    fn create_dirs(&mut self, path: &str) -> io::Result<()>;

    /// Create or truncate `path` for streamed writing.
    fn create(&mut self, path: &str) -> io::Result<BookWriter>;

    fn remove(&mut self, path: &str) -> io::Result<()>;

    fn exists(&self, path: &str) -> bool;

    /// Books stored under `dir` whose extension is in `extensions`. `lpath` is relative
    /// to `dir`.
    fn list_books(&self, dir: &str, extensions: &[String]) -> io::Result<Vec<BookEntry>>;

    /// `(total, free)` bytes. An estimate is acceptable.
    fn capacity_estimate(&self) -> (u64, u64);
}

/// Parent directory of a device path, if it has one below the root.
pub fn parent_dir(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// [`Storage`] backed by a directory on the host filesystem.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    total_bytes: u64,
    free_bytes: u64,
}

impl FsStorage {
    /// Default capacity report: a typical 16 GB card, half free.
    pub const DEFAULT_TOTAL: u64 = 16 * 1024 * 1024 * 1024;
    pub const DEFAULT_FREE: u64 = 8 * 1024 * 1024 * 1024;

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            total_bytes: Self::DEFAULT_TOTAL,
            free_bytes: Self::DEFAULT_FREE,
        }
    }

    pub fn with_capacity_estimate(mut self, total: u64, free: u64) -> Self {
        self.total_bytes = total;
        self.free_bytes = free.min(total);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for a device path. Parent and prefix components are dropped.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for component in Path::new(path).components() {
            if let Component::Normal(part) = component {
                out.push(part);
            }
        }
        out
    }
}

impl Storage for FsStorage {
    fn create_dirs(&mut self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path))
    }

    fn create(&mut self, path: &str) -> io::Result<BookWriter> {
        let file = File::create(self.resolve(path))?;
        Ok(Box::new(io::BufWriter::new(file)))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn list_books(&self, dir: &str, extensions: &[String]) -> io::Result<Vec<BookEntry>> {
        let base = self.resolve(dir);
        let mut out = Vec::new();
        if !base.is_dir() {
            return Ok(out);
        }
        let mut pending = vec![base.clone()];
        while let Some(current) = pending.pop() {
            for entry in fs::read_dir(&current)? {
                let entry = entry?;
                let path = entry.path();
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let accepted = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
                if !accepted {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&base) else {
                    continue;
                };
                let lpath = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let title = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                out.push(BookEntry {
                    lpath,
                    title,
                    authors: Vec::new(),
                    size: meta.len(),
                });
            }
        }
        out.sort_by(|a, b| a.lpath.cmp(&b.lpath));
        Ok(out)
    }

    fn capacity_estimate(&self) -> (u64, u64) {
        (self.total_bytes, self.free_bytes)
    }
}
