use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::cache_key::CacheKey;

/// The on-disk tier: a single flat directory of image files.
///
/// Each file is named by the [`CacheKey::file_name`] of its key and contains exactly the
/// encoded bytes that were written at store time. There is no index and no metadata sidecar;
/// the file `mtime` records when it was written.
///
/// All methods do blocking file system I/O. The [`ImageCache`](super::ImageCache) only calls
/// them from its background queues, except for the few documented synchronous lookups.
#[derive(Debug)]
pub struct DiskStore {
    /// Directory to use for storing image files. Will be created if it does not exist.
    path: PathBuf,
}

impl DiskStore {
    /// Opens the store at `path`, creating the directory if it does not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the full path of the file backing `key`.
    pub fn file_path(&self, key: &CacheKey) -> PathBuf {
        self.path.join(key.file_name())
    }

    /// Creates or overwrites the file for `key`.
    ///
    /// The bytes are written to a temporary file in the same directory first and then moved
    /// into place, so readers never observe a partially written file.
    pub fn write(&self, key: &CacheKey, data: &[u8]) -> io::Result<()> {
        let path = self.file_path(key);
        tracing::trace!("Writing {} bytes to {}", data.len(), path.display());

        // `clear` could potentially remove the directory we are operating in, so be
        // defensive here and recreate it.
        fs::create_dir_all(&self.path)?;
        let mut temp_file = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.path)?;
        io::Write::write_all(&mut temp_file, data)?;
        temp_file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Reads the file for `key`, returning `None` if it does not exist.
    pub fn read(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        catch_not_found(|| fs::read(self.file_path(key)))
    }

    /// Whether a file for `key` exists.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.file_path(key).is_file()
    }

    /// Removes the file for `key`. Removing a missing file is not an error.
    pub fn remove(&self, key: &CacheKey) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(self.file_path(key)))?;
        Ok(())
    }

    /// Deletes the whole directory and recreates it empty.
    pub fn clear(&self) -> io::Result<()> {
        tracing::debug!("Clearing image directory `{}`", self.path.display());
        catch_not_found(|| fs::remove_dir_all(&self.path))?;
        fs::create_dir_all(&self.path)
    }

    /// Returns the sum of the sizes of all files in the store.
    pub fn total_size(&self) -> io::Result<u64> {
        let Some(entries) = catch_not_found(|| fs::read_dir(&self.path))? else {
            return Ok(0);
        };

        let mut size = 0;
        for entry in entries {
            let entry = entry?;
            // files can vanish while we are iterating, which is fine
            if let Some(metadata) = catch_not_found(|| entry.metadata())? {
                if metadata.is_file() {
                    size += metadata.len();
                }
            }
        }
        Ok(size)
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
