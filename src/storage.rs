//! Storage abstraction for frame files and checkpoint artifacts.
//!
//! A trimmed-down storage seam: everything the streaming engine and the
//! checkpoint coordinator touch on disk goes through [`StorageBackend`], so
//! tests can run against temporary directories and the checkpoint commit
//! protocol has explicit durability points.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::config::StorageConfig;
use crate::error::{Result, StreamError};

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Size of the object in bytes.
    pub size: u64,
    /// Last modification time, if available.
    pub modified: Option<std::time::SystemTime>,
    /// Whether this object is a directory.
    pub is_dir: bool,
}

/// A handle for reading from storage.
pub trait StorageReader: Read + Seek + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads a range of bytes from the object.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Finishes the write operation, flushing buffers and syncing the file
    /// to durable storage. The writer must not be used afterwards.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// A handle for in-place updates to an existing or new object.
///
/// The checkpoint commit protocol rewrites a file in phases (tag, payload,
/// tag flip) with a durability barrier after each, which plain append-style
/// writers cannot express.
pub trait StorageFile: Read + Write + Seek + Send {
    /// Flushes buffered data and syncs the file to durable storage.
    fn sync(&mut self) -> Result<()>;
}

/// The storage backend trait.
///
/// Object-safe; used as `Arc<dyn StorageBackend>` throughout the crate.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Retrieves metadata for an object.
    fn metadata(&self, path: &Path) -> Result<ObjectMeta>;

    /// Opens an object for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating any existing content.
    /// Parent directories are created if they don't exist.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Opens an object for in-place read/write access, creating it if it
    /// does not exist. Existing content is preserved.
    fn open_update(&self, path: &Path) -> Result<Box<dyn StorageFile>>;

    /// Deletes an object. Deleting a missing object is not an error.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists objects under the given prefix, sorted by name.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Renames an object from one path to another.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Creates a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// Local filesystem storage backend.
///
/// Uses buffered I/O for small files and memory-mapped reads above a
/// configurable size threshold.
pub struct LocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
    use_mmap: bool,
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StreamError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    /// Resolves a path relative to the base path.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(&self, full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    StreamError::storage_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path).map_err(|e| {
            StreamError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        Ok(ObjectMeta {
            size: meta.len(),
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
        })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| StreamError::storage_with_source(&full_path, "failed to open file", e))?;

        let meta = file.metadata().map_err(|e| {
            StreamError::storage_with_source(&full_path, "failed to read file metadata", e)
        })?;
        let size = meta.len();

        if self.use_mmap && size >= self.mmap_threshold {
            // SAFETY: The file is opened read-only and the Mmap is held for
            // the lifetime of the reader.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;

            Ok(Box::new(MmapReader::new(mmap)))
        } else {
            Ok(Box::new(LocalReader::new(file, size, self.buffer_size)))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        self.ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalWriter::new(file, full_path, self.buffer_size)))
    }

    fn open_update(&self, path: &Path) -> Result<Box<dyn StorageFile>> {
        let full_path = self.resolve_path(path);
        self.ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&full_path)
            .map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to open file for update", e)
            })?;

        Ok(Box::new(LocalFile {
            file,
            path: full_path,
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);

        let result = if full_path.is_dir() {
            fs::remove_dir_all(&full_path)
        } else {
            fs::remove_file(&full_path)
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StreamError::storage_with_source(
                &full_path,
                "failed to delete object",
                e,
            )),
        }
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(prefix);

        if !full_path.exists() {
            return Ok(Vec::new());
        }

        if !full_path.is_dir() {
            return Err(StreamError::storage(&full_path, "path is not a directory"));
        }

        let mut entries = Vec::new();

        for entry in fs::read_dir(&full_path).map_err(|e| {
            StreamError::storage_with_source(&full_path, "failed to read directory", e)
        })? {
            let entry = entry.map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to read directory entry", e)
            })?;

            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        self.ensure_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            StreamError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path).map_err(|e| {
            StreamError::storage_with_source(&full_path, "failed to create directories", e)
        })
    }
}

/// Buffered file reader for local storage.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
}

impl LocalReader {
    fn new(file: File, size: u64, buffer_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
        }
    }
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(start)).map_err(|e| {
            StreamError::storage_with_source(
                "<file>",
                format!("failed to seek to position {start}"),
                e,
            )
        })?;

        let mut buf = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = self.read(&mut buf[filled..]).map_err(|e| {
                StreamError::storage_with_source(
                    "<file>",
                    format!("failed to read {length} bytes at position {start}"),
                    e,
                )
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

/// Memory-mapped reader for large files.
struct MmapReader {
    mmap: Mmap,
    pos: u64,
}

impl MmapReader {
    fn new(mmap: Mmap) -> Self {
        Self { mmap, pos: 0 }
    }
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = self.mmap.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(self.mmap.len() - start);
        buf[..n].copy_from_slice(&self.mmap[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for MmapReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.mmap.len() as i64;
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(off) => len + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of mmap",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let start = start as usize;
        let end = (start + length).min(self.mmap.len());
        if start > self.mmap.len() {
            return Ok(Vec::new());
        }
        Ok(self.mmap[start..end].to_vec())
    }
}

/// Buffered file writer for local storage.
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LocalWriter {
    fn new(file: File, path: PathBuf, buffer_size: usize) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
        }
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| {
            StreamError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;
        self.writer.get_ref().sync_all().map_err(|e| {
            StreamError::storage_with_source(&self.path, "failed to sync file", e)
        })?;
        Ok(())
    }
}

/// Read/write/seek handle over a local file.
struct LocalFile {
    file: File,
    path: PathBuf,
}

impl Read for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LocalFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl StorageFile for LocalFile {
    fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| StreamError::storage_with_source(&self.path, "failed to sync file", e))
    }
}
