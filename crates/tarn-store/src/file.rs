//! Positional I/O over the store file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(not(unix))]
use std::sync::Mutex;

/// The store file, accessed only by offset.
///
/// Readers on any thread read concurrently; the single writer appends and
/// patches the header.
pub struct StoreFile {
    file: File,
    #[cfg(not(unix))]
    cursor: Mutex<()>,
}

impl StoreFile {
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            #[cfg(not(unix))]
            cursor: Mutex::new(()),
        })
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    #[cfg(unix)]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let _guard = self.cursor.lock().expect("lock poisoned");
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let _guard = self.cursor.lock().expect("lock poisoned");
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = StoreFile::open(&dir.path().join("f"), false).unwrap();
        file.write_at(4, b"tarn").unwrap();
        assert_eq!(file.len().unwrap(), 8);

        let mut buf = [0u8; 4];
        file.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"tarn");

        file.set_len(2).unwrap();
        assert!(file.read_at(4, &mut buf).is_err());
    }
}
