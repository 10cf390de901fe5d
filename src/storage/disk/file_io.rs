use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::common::Result;

/// FileIo is a seekable file with fixed-width big-endian primitives.
/// Both the main store and the undo log are laid out through it.
pub struct FileIo {
    file: File,
    path: PathBuf,
}

impl FileIo {
    /// Opens the file for read/write, creating it if it doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.file.read_i32::<BigEndian>()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.file.read_i64::<BigEndian>()?)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.file.write_i32::<BigEndian>(value)?;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.file.write_i64::<BigEndian>(value)?;
        Ok(())
    }

    /// Reads until `buf` is full or end of file. Returns the number of bytes
    /// actually read so callers can detect short records.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Truncates or extends the file.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Forces file content and metadata to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
