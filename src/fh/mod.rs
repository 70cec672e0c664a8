//! File handles and the OS layer
//!
//! Positional read/write, sync, extend/truncate, advisory hints, optional
//! read-only mapping, and home-directory locking. All block I/O above this
//! layer is aligned to the file's allocation unit.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt as _;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::error::{Result, TernError};

/// Sync granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
  /// Data only (`fdatasync`)
  Data,
  /// Data and metadata (`fsync`)
  Full,
}

/// Access-pattern hint forwarded to the OS where supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviseHint {
  Sequential,
  Random,
  DontNeed,
}

/// A positional-I/O file handle
pub struct FileHandle {
  path: PathBuf,
  file: File,
  read_only: bool,
  /// Bytes written since the last sync; lets callers schedule periodic
  /// background flushing
  bytes_written_since_sync: AtomicU64,
  map: Mutex<Option<Mmap>>,
}

impl FileHandle {
  /// Open an existing file
  pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
    let path = path.as_ref();
    let file = OpenOptions::new()
      .read(true)
      .write(!read_only)
      .open(path)
      .map_err(|e| map_open_error(path, e))?;
    Ok(Self {
      path: path.to_path_buf(),
      file,
      read_only,
      bytes_written_since_sync: AtomicU64::new(0),
      map: Mutex::new(None),
    })
  }

  /// Create a new file, failing if it already exists
  pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create_new(true)
      .open(path)
      .map_err(|e| {
        if e.kind() == ErrorKind::AlreadyExists {
          TernError::ObjectExists(path.display().to_string())
        } else {
          TernError::Io(e)
        }
      })?;
    Ok(Self {
      path: path.to_path_buf(),
      file,
      read_only: false,
      bytes_written_since_sync: AtomicU64::new(0),
      map: Mutex::new(None),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  /// Positional read of exactly `len` bytes
  pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    self.file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
  }

  /// Positional read into a caller buffer
  pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
    self.file.read_exact_at(buf, offset)?;
    Ok(())
  }

  /// Positional write of the whole buffer; EINTR is retried by the standard
  /// library's write_all_at loop
  pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
    if self.read_only {
      return Err(TernError::ReadOnly);
    }
    self.file.write_all_at(data, offset)?;
    self
      .bytes_written_since_sync
      .fetch_add(data.len() as u64, Ordering::Relaxed);
    Ok(())
  }

  /// Current file length
  pub fn size(&self) -> Result<u64> {
    Ok(self.file.metadata()?.len())
  }

  /// Grow the file to `new_size` bytes
  pub fn extend(&self, new_size: u64) -> Result<()> {
    if self.read_only {
      return Err(TernError::ReadOnly);
    }
    let current = self.size()?;
    if new_size > current {
      self.file.set_len(new_size)?;
    }
    Ok(())
  }

  /// Shrink the file to `new_size` bytes
  pub fn truncate(&self, new_size: u64) -> Result<()> {
    if self.read_only {
      return Err(TernError::ReadOnly);
    }
    self.file.set_len(new_size)?;
    Ok(())
  }

  /// Flush written data to stable storage
  pub fn sync(&self, kind: SyncKind) -> Result<()> {
    match kind {
      SyncKind::Data => self.file.sync_data()?,
      SyncKind::Full => self.file.sync_all()?,
    }
    self.bytes_written_since_sync.store(0, Ordering::Relaxed);
    Ok(())
  }

  pub fn bytes_written_since_sync(&self) -> u64 {
    self.bytes_written_since_sync.load(Ordering::Relaxed)
  }

  /// Forward an access-pattern hint; best effort, ignored on error
  pub fn advise(&self, _offset: u64, _len: u64, _hint: AdviseHint) {
    // posix_fadvise is not exposed portably by std; the hint is advisory
    // and skipping it never affects correctness.
  }

  /// Map the file read-only; subsequent `read_mapped` calls serve zero-copy
  /// views until `unmap`
  pub fn map(&self) -> Result<()> {
    let mut guard = self.map.lock();
    if guard.is_none() {
      // Safety: the mapping is dropped before the file handle and the block
      // layer never maps files it writes through concurrently.
      let mmap = unsafe { Mmap::map(&self.file)? };
      *guard = Some(mmap);
    }
    Ok(())
  }

  pub fn unmap(&self) {
    self.map.lock().take();
  }

  pub fn is_mapped(&self) -> bool {
    self.map.lock().is_some()
  }

  /// Copy out of the mapping; None when unmapped or out of range
  pub fn read_mapped(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
    let guard = self.map.lock();
    let mmap = guard.as_ref()?;
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(len)?;
    if end > mmap.len() {
      return None;
    }
    Some(mmap[start..end].to_vec())
  }
}

fn map_open_error(path: &Path, e: std::io::Error) -> TernError {
  if e.kind() == ErrorKind::NotFound {
    TernError::ObjectNotFound(path.display().to_string())
  } else {
    TernError::Io(e)
  }
}

// ============================================================================
// Home-directory lock
// ============================================================================

/// Advisory lock on the engine home; dropped on close
pub struct HomeLock {
  _file: File,
  path: PathBuf,
}

impl HomeLock {
  pub fn acquire<P: AsRef<Path>>(lock_path: P) -> Result<Self> {
    let path = lock_path.as_ref().to_path_buf();
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)?;
    file.try_lock_exclusive().map_err(|_| {
      TernError::LockFailed(format!("{} is locked by another process", path.display()))
    })?;
    Ok(Self { _file: file, path })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// Fsync a directory so a rename inside it is durable
pub fn sync_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
  let handle = File::open(dir.as_ref())?;
  handle.sync_all()?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn positional_write_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fh.bin");
    let fh = FileHandle::create(&path).unwrap();
    fh.extend(8192).unwrap();
    fh.write(4096, b"terndb").unwrap();
    assert_eq!(fh.read(4096, 6).unwrap(), b"terndb");
    assert!(fh.bytes_written_since_sync() >= 6);
    fh.sync(SyncKind::Data).unwrap();
    assert_eq!(fh.bytes_written_since_sync(), 0);
  }

  #[test]
  fn create_refuses_existing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fh.bin");
    FileHandle::create(&path).unwrap();
    assert!(matches!(
      FileHandle::create(&path),
      Err(TernError::ObjectExists(_))
    ));
  }

  #[test]
  fn mapped_reads_match_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fh.bin");
    let fh = FileHandle::create(&path).unwrap();
    fh.extend(4096).unwrap();
    fh.write(100, b"mapped").unwrap();
    fh.sync(SyncKind::Full).unwrap();
    fh.map().unwrap();
    assert_eq!(fh.read_mapped(100, 6).unwrap(), b"mapped");
    assert!(fh.read_mapped(4090, 100).is_none());
    fh.unmap();
    assert!(!fh.is_mapped());
  }

  #[test]
  fn home_lock_excludes_second_holder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tern.lock");
    let first = HomeLock::acquire(&path).unwrap();
    assert!(HomeLock::acquire(&path).is_err());
    drop(first);
    HomeLock::acquire(&path).unwrap();
  }
}
