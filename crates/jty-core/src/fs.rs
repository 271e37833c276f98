//! Filesystem abstraction used by the read and write stages.
//!
//! Two implementations are provided: [`OsFs`] for the real disk and
//! [`MemoryFs`] for tests and embedding.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Byte-oriented filesystem access.
///
/// Implementations must be safe to use from several read and write workers
/// at once, as long as the workers touch different paths.
pub trait FileSystem: Send + Sync {
    /// Read the full contents of `path`.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Create or truncate `path` and return a writer for it.
    ///
    /// Missing parent directories are created.
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
}

/// The operating system's filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl OsFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for OsFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(path)?))
    }
}

/// In-memory filesystem.
///
/// Cloning yields a handle to the same set of files. Directories are
/// implicit, so creating `a/b/c.yml` never fails for a missing `a/b`.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemoryFs {
    /// Create an empty filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `contents` at `path`, replacing any previous file.
    pub fn write(&self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .insert(normalize(path.as_ref()), contents.into());
    }

    /// Get a copy of the file at `path`, if it exists.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().get(&normalize(path.as_ref())).cloned()
    }

    /// Get the file at `path` as UTF-8 text (lossy), if it exists.
    pub fn get_string(&self, path: impl AsRef<Path>) -> Option<String> {
        self.get(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Check whether a file exists at `path`.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.files.lock().contains_key(&normalize(path.as_ref()))
    }

    /// Number of files stored.
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl FileSystem for MemoryFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.get(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("open {}: file does not exist", path.display()),
            )
        })
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let path = normalize(path);
        self.files.lock().insert(path.clone(), Vec::new());
        Ok(Box::new(MemoryFile {
            path,
            files: Arc::clone(&self.files),
        }))
    }
}

/// Writer returned by [`MemoryFs::create`]. Writes land in the shared map
/// immediately.
struct MemoryFile {
    path: PathBuf,
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drop `.` components so `./a.yml` and `a.yml` name the same file.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}
