// SPDX-License-Identifier: Apache-2.0
//! Module registry: named VM programs, versioned by content hash.
//!
//! A module name is registered once and keeps a stable `major` id for its
//! lifetime; each upload of compiled code under that name either appends a
//! new version or, if its content hash matches the most recent version, is
//! deduplicated as a no-op.

use crate::save::{Reader, SaveError, Writer, MAGIC_MODS};
use rustc_hash::FxHashMap;

/// A compile error attached to a module version, with the source line it
/// was raised on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModError {
    /// Source line the error applies to.
    pub line: u32,
    /// Human-readable message.
    pub message: String,
}

/// One entry of the line/byte index: the first instruction byte produced by
/// source `line`. The index is sorted ascending by both fields and used to
/// map an instruction pointer back to a source line, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineIndex {
    /// Source line.
    pub line: u32,
    /// First code byte generated from that line.
    pub byte: u32,
}

/// One compiled, versioned module.
#[derive(Debug, Clone)]
pub struct Mod {
    /// Stable identity shared by every version of this module.
    pub major: u32,
    /// Version number, starting at 0 for the first stored upload.
    pub version: u16,
    /// Compiled bytecode.
    pub code: Vec<u8>,
    /// Compile errors, if any (a module with errors still stores its
    /// partial code, matching the original's "store whatever compiled").
    pub errors: Vec<ModError>,
    /// Line/byte index, terminated by a sentinel entry one past the end.
    pub index: Vec<LineIndex>,
    hash: blake3::Hash,
}

impl Mod {
    /// Source line that produced the instruction at `byte`.
    #[must_use]
    pub fn line_for_byte(&self, byte: u32) -> Option<u32> {
        self.index
            .windows(2)
            .find(|w| byte < w[1].byte)
            .map(|w| w[0].line)
    }

    /// First code byte generated from `line`.
    #[must_use]
    pub fn byte_for_line(&self, line: u32) -> Option<u32> {
        self.index
            .windows(2)
            .find(|w| line < w[1].line)
            .map(|w| w[0].byte)
    }

    /// Whether this version failed to compile cleanly.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

fn content_hash(code: &[u8]) -> blake3::Hash {
    blake3::hash(code)
}

#[derive(Debug, Default)]
struct Entry {
    name: String,
    versions: Vec<Mod>,
}

/// The world's module registry.
#[derive(Debug, Default)]
pub struct ModRegistry {
    by_major: FxHashMap<u32, Entry>,
    by_name: FxHashMap<String, u32>,
    next_major: u32,
}

impl ModRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module name, returning its existing `major` id if already
    /// registered, or allocating a new one.
    pub fn register(&mut self, name: &str) -> u32 {
        if let Some(&major) = self.by_name.get(name) {
            return major;
        }
        self.next_major += 1;
        let major = self.next_major;
        self.by_name.insert(name.to_owned(), major);
        self.by_major.insert(
            major,
            Entry {
                name: name.to_owned(),
                versions: Vec::new(),
            },
        );
        major
    }

    /// Store a compiled upload under `major`. Returns the version it now
    /// lives at. If its content hash matches the most recent version, no
    /// new version is appended and the existing version number is reused.
    pub fn store(
        &mut self,
        major: u32,
        code: Vec<u8>,
        errors: Vec<ModError>,
        index: Vec<LineIndex>,
    ) -> Option<u16> {
        let entry = self.by_major.get_mut(&major)?;
        let hash = content_hash(&code);

        if let Some(last) = entry.versions.last() {
            if last.hash == hash {
                return Some(last.version);
            }
        }

        let version = entry.versions.len() as u16;
        entry.versions.push(Mod {
            major,
            version,
            code,
            errors,
            index,
            hash,
        });
        Some(version)
    }

    /// Look up a specific version, or the latest if `version` is `None`.
    #[must_use]
    pub fn get(&self, major: u32, version: Option<u16>) -> Option<&Mod> {
        let entry = self.by_major.get(&major)?;
        match version {
            Some(v) => entry.versions.iter().find(|m| m.version == v),
            None => entry.versions.last(),
        }
    }

    /// The registered name for a `major` id.
    #[must_use]
    pub fn name(&self, major: u32) -> Option<&str> {
        self.by_major.get(&major).map(|e| e.name.as_str())
    }

    /// Find a module's `major` id by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// List all registered modules, sorted by name.
    pub fn list(&self) -> Vec<(u32, &str)> {
        let mut items: Vec<_> = self
            .by_major
            .iter()
            .map(|(&major, entry)| (major, entry.name.as_str()))
            .collect();
        items.sort_by_key(|&(_, name)| name);
        items
    }

    /// Write the full registry, every name and every stored version's
    /// code/errors/index, bracketed by [`MAGIC_MODS`]. Content hashes are
    /// not written; [`Self::decode`] recomputes them from `code`.
    pub fn encode(&self, w: &mut Writer) {
        w.write_magic(MAGIC_MODS);
        w.write_u32(self.next_major);
        w.write_u32(self.by_major.len() as u32);
        let mut majors: Vec<_> = self.by_major.keys().copied().collect();
        majors.sort_unstable();
        for major in majors {
            let entry = &self.by_major[&major];
            w.write_u32(major);
            w.write_bytes(entry.name.as_bytes());
            w.write_u32(entry.versions.len() as u32);
            for m in &entry.versions {
                w.write_u16(m.version);
                w.write_bytes(&m.code);
                w.write_u32(m.errors.len() as u32);
                for e in &m.errors {
                    w.write_u32(e.line);
                    w.write_bytes(e.message.as_bytes());
                }
                w.write_u32(m.index.len() as u32);
                for entry in &m.index {
                    w.write_u32(entry.line);
                    w.write_u32(entry.byte);
                }
            }
        }
        w.write_magic(MAGIC_MODS);
    }

    /// Read a registry previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data or a mismatched framing tag.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        r.read_magic(MAGIC_MODS)?;
        let next_major = r.read_u32()?;
        let entry_count = r.read_u32()?;
        let mut by_major = FxHashMap::default();
        let mut by_name = FxHashMap::default();
        for _ in 0..entry_count {
            let major = r.read_u32()?;
            let name = String::from_utf8_lossy(r.read_bytes()?).into_owned();
            let version_count = r.read_u32()?;
            let mut versions = Vec::with_capacity(version_count as usize);
            for _ in 0..version_count {
                let version = r.read_u16()?;
                let code = r.read_bytes()?.to_vec();
                let error_count = r.read_u32()?;
                let mut errors = Vec::with_capacity(error_count as usize);
                for _ in 0..error_count {
                    let line = r.read_u32()?;
                    let message = String::from_utf8_lossy(r.read_bytes()?).into_owned();
                    errors.push(ModError { line, message });
                }
                let index_count = r.read_u32()?;
                let mut index = Vec::with_capacity(index_count as usize);
                for _ in 0..index_count {
                    let line = r.read_u32()?;
                    let byte = r.read_u32()?;
                    index.push(LineIndex { line, byte });
                }
                let hash = content_hash(&code);
                versions.push(Mod {
                    major,
                    version,
                    code,
                    errors,
                    index,
                    hash,
                });
            }
            by_name.insert(name.clone(), major);
            by_major.insert(major, Entry { name, versions });
        }
        r.read_magic(MAGIC_MODS)?;
        Ok(Self {
            by_major,
            by_name,
            next_major,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_by_name() {
        let mut reg = ModRegistry::new();
        let a = reg.register("alpha");
        let b = reg.register("alpha");
        assert_eq!(a, b);
        assert_eq!(reg.find("alpha"), Some(a));
    }

    #[test]
    fn store_appends_new_version_on_changed_content() {
        let mut reg = ModRegistry::new();
        let major = reg.register("alpha");
        let v0 = reg.store(major, vec![1, 2, 3], vec![], vec![]).unwrap();
        let v1 = reg.store(major, vec![1, 2, 3, 4], vec![], vec![]).unwrap();
        assert_eq!(v0, 0);
        assert_eq!(v1, 1);
        assert_eq!(reg.get(major, None).unwrap().version, 1);
    }

    #[test]
    fn store_dedups_identical_content() {
        let mut reg = ModRegistry::new();
        let major = reg.register("alpha");
        let v0 = reg.store(major, vec![9, 9, 9], vec![], vec![]).unwrap();
        let v1 = reg.store(major, vec![9, 9, 9], vec![], vec![]).unwrap();
        assert_eq!(v0, v1);
        assert_eq!(reg.get(major, None).unwrap().code, vec![9, 9, 9]);
    }

    #[test]
    fn encode_decode_roundtrips_versions_and_errors() {
        let mut reg = ModRegistry::new();
        let major = reg.register("boot");
        reg.store(
            major,
            vec![1, 2, 3],
            vec![ModError {
                line: 4,
                message: "bad opcode".to_owned(),
            }],
            vec![LineIndex { line: 0, byte: 0 }],
        );
        reg.store(major, vec![1, 2, 3, 4], vec![], vec![]);

        let mut w = Writer::new();
        reg.encode(&mut w);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        let decoded = ModRegistry::decode(&mut r).unwrap();

        assert_eq!(decoded.find("boot"), Some(major));
        let latest = decoded.get(major, None).unwrap();
        assert_eq!(latest.code, vec![1, 2, 3, 4]);
        let v0 = decoded.get(major, Some(0)).unwrap();
        assert_eq!(v0.errors.len(), 1);
        assert_eq!(v0.errors[0].message, "bad opcode");
    }

    #[test]
    fn line_index_maps_byte_to_source_line() {
        let index = vec![
            LineIndex { line: 0, byte: 0 },
            LineIndex { line: 1, byte: 4 },
            LineIndex { line: 2, byte: 9 },
        ];
        let module = Mod {
            major: 1,
            version: 0,
            code: vec![0; 9],
            errors: vec![],
            index,
            hash: content_hash(&[0; 9]),
        };
        assert_eq!(module.line_for_byte(0), Some(0));
        assert_eq!(module.line_for_byte(5), Some(1));
        assert_eq!(module.byte_for_line(1), Some(4));
    }
}
