// SPDX-License-Identifier: Apache-2.0
//! Binary persistence: a magic-framed cursor over a byte buffer, plus two
//! backends (a file on disk, and a fixed-capacity in-process ring for
//! tests and transient snapshots).
//!
//! Every saved section is written `write_magic(tag) ... write_magic(tag)`,
//! bracketing its payload so a corrupt or truncated section is caught at
//! load time instead of silently misreading the next section.

use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// A tag identifying one saved section, written before and after its body.
pub type Magic = u32;

/// World-level save framing tags.
pub const MAGIC_WORLD: Magic = 0x4C47_5731;
/// Atom table framing tag.
pub const MAGIC_ATOMS: Magic = 0x4C47_4154;
/// Module registry framing tag.
pub const MAGIC_MODS: Magic = 0x4C47_4D4F;
/// Lanes framing tag.
pub const MAGIC_LANES: Magic = 0x4C47_4C4E;
/// Pills framing tag.
pub const MAGIC_PILLS: Magic = 0x4C47_5049;
/// Log framing tag.
pub const MAGIC_LOG: Magic = 0x4C47_4C47;
/// User registry framing tag.
pub const MAGIC_USERS: Magic = 0x4C47_5553;

/// Errors produced while reading a saved buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaveError {
    /// The buffer ended before the expected data was read.
    #[error("unexpected end of save data")]
    UnexpectedEof,
    /// A magic tag didn't match what the reader expected, at either the
    /// opening or closing bracket of a section.
    #[error("bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic {
        /// Expected section tag.
        expected: Magic,
        /// Tag actually read.
        found: Magic,
    },
}

/// An append-only byte writer with magic-framing helpers.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Construct an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a section's opening or closing magic tag.
    pub fn write_magic(&mut self, magic: Magic) {
        self.buf.extend_from_slice(&magic.to_le_bytes());
    }

    /// Write a `u8`.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a `u16`, little-endian.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a `u32`, little-endian.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a `u64`, little-endian.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Consume the writer, returning the accumulated buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// A read-only cursor over a saved buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Construct a reader over `buf`, starting at the beginning.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SaveError> {
        let end = self.pos.checked_add(len).ok_or(SaveError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(SaveError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Read and check a section's magic tag.
    pub fn read_magic(&mut self, expected: Magic) -> Result<(), SaveError> {
        let found = self.read_u32()?;
        if found != expected {
            return Err(SaveError::BadMagic { expected, found });
        }
        Ok(())
    }

    /// Read a `u8`.
    pub fn read_u8(&mut self) -> Result<u8, SaveError> {
        Ok(self.take(1)?[0])
    }

    /// Read a `u16`, little-endian.
    pub fn read_u16(&mut self) -> Result<u16, SaveError> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(bytes))
    }

    /// Read a `u32`, little-endian.
    pub fn read_u32(&mut self) -> Result<u32, SaveError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a `u64`, little-endian.
    pub fn read_u64(&mut self) -> Result<u64, SaveError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], SaveError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Whether the cursor has consumed the whole buffer.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

/// A save backend: somewhere a snapshot's bytes live.
pub trait SaveBackend {
    /// Persist `bytes` as the current snapshot, replacing any prior one.
    fn store(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Load the current snapshot, if one exists.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;
}

/// A backend that writes the snapshot to a single file on disk.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: std::path::PathBuf,
}

impl FileBackend {
    /// Construct a backend writing to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SaveBackend for FileBackend {
    fn store(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// A backend that keeps the most recent `cap` snapshots in memory, for
/// tests and short-lived in-process history.
#[derive(Debug, Default)]
pub struct RingBackend {
    cap: usize,
    history: std::collections::VecDeque<Vec<u8>>,
}

impl RingBackend {
    /// Construct a ring retaining up to `cap` snapshots.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            history: std::collections::VecDeque::new(),
        }
    }

    /// The full retained history, oldest first.
    #[must_use]
    pub fn history(&self) -> &std::collections::VecDeque<Vec<u8>> {
        &self.history
    }
}

impl SaveBackend for RingBackend {
    fn store(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.history.len() == self.cap {
            self.history.pop_front();
        }
        self.history.push_back(bytes.to_vec());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.history.back().cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip_with_magic_framing() {
        let mut w = Writer::new();
        w.write_magic(MAGIC_ATOMS);
        w.write_u64(7);
        w.write_bytes(b"hello");
        w.write_magic(MAGIC_ATOMS);

        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        r.read_magic(MAGIC_ATOMS).unwrap();
        assert_eq!(r.read_u64().unwrap(), 7);
        assert_eq!(r.read_bytes().unwrap(), b"hello");
        r.read_magic(MAGIC_ATOMS).unwrap();
        assert!(r.is_at_end());
    }

    #[test]
    fn mismatched_magic_is_rejected() {
        let mut w = Writer::new();
        w.write_magic(MAGIC_PILLS);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        assert_eq!(
            r.read_magic(MAGIC_ATOMS),
            Err(SaveError::BadMagic {
                expected: MAGIC_ATOMS,
                found: MAGIC_PILLS,
            })
        );
    }

    #[test]
    fn truncated_buffer_is_unexpected_eof() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.read_u64(), Err(SaveError::UnexpectedEof));
    }

    #[test]
    fn ring_backend_keeps_latest_within_capacity() {
        let mut ring = RingBackend::new(2);
        ring.store(b"a").unwrap();
        ring.store(b"b").unwrap();
        ring.store(b"c").unwrap();
        assert_eq!(ring.history().len(), 2);
        assert_eq!(ring.load().unwrap().as_deref(), Some(&b"c"[..]));
    }

    #[test]
    fn file_backend_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("legion-save-test-{}", std::process::id()));
        let path = dir.join("world.save");
        let mut backend = FileBackend::new(&path);
        assert!(backend.load().unwrap().is_none());
        backend.store(b"snapshot").unwrap();
        assert_eq!(backend.load().unwrap().as_deref(), Some(&b"snapshot"[..]));
        let _ = fs::remove_dir_all(&dir);
    }
}
