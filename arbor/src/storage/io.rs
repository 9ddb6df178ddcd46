//! Block device abstraction for the page file and the transaction log.
//!
//! Both files are accessed through positional reads and writes so that
//! readers never contend on a shared file cursor. Production code uses
//! `FileDevice`; tests swap in `simulation::SimulatedDevice` to control
//! exactly which writes survive a crash and to inject I/O faults.
//!
//! # Implementation Notes
//!
//! Implementations must ensure:
//! - `read_at` returns the last written content for a byte range
//! - `sync` makes all previous writes durable
//! - a write past the current end extends the device

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// A read ran past the end of the device.
    ShortRead { offset: u64, len: usize, device_len: u64 },
    /// The device was detached by `close`.
    Detached,
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ShortRead {
                offset,
                len,
                device_len,
            } => write!(
                f,
                "read of {len} bytes at offset {offset} runs past end of device ({device_len} bytes)"
            ),
            Self::Detached => write!(f, "device has been closed"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Positional byte storage shared between threads.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `data` at `offset`, extending the device if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Make every previous write durable.
    fn sync(&self) -> Result<(), StorageError>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64, StorageError>;

    /// Whether the device holds no bytes at all.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Shrink or grow the device to exactly `len` bytes.
    fn set_len(&self, len: u64) -> Result<(), StorageError>;
}

/// A `BlockDevice` backed by a regular file.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    /// Open the file at `path`, creating it when it does not exist.
    pub fn open_or_create(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match positional::read_exact_at(&self.file, buf, offset) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(StorageError::ShortRead {
                    offset,
                    len: buf.len(),
                    device_len: self.len()?,
                })
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        positional::write_all_at(&self.file, data, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<(), StorageError> {
        self.file.set_len(len)?;
        Ok(())
    }
}

#[cfg(unix)]
mod positional {
    use std::fs::File;
    use std::os::unix::fs::FileExt;

    pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
        file.write_all_at(data, offset)
    }
}

#[cfg(windows)]
mod positional {
    use std::fs::File;
    use std::os::windows::fs::FileExt;

    pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
        while !buf.is_empty() {
            match file.seek_read(buf, offset) {
                Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
        while !data.is_empty() {
            match file.seek_write(data, offset) {
                Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    data = &data[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
