//! Shared-library closure of a dynamically linked binary.
//!
//! Walks `DT_NEEDED` entries, resolving each name through `RUNPATH`/`RPATH`
//! (with `$ORIGIN` expanded), `/etc/ld.so.cache` and the default library
//! directories, and reports every directory the loader will read from.

use crate::{Result, StockadeError};
use goblin::elf::Elf;
use memmap2::Mmap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

const LDCACHE_PATH: &str = "/etc/ld.so.cache";
const LDCACHE_MAGIC_NEW: &[u8] = b"glibc-ld.so.cache1.1";
const LDCACHE_MAGIC_OLD: &[u8] = b"ld.so-1.7.0";

const DEFAULT_LIB_DIRS: &[&str] = &[
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/lib64",
    #[cfg(target_arch = "x86_64")]
    "/lib/x86_64-linux-gnu",
    #[cfg(target_arch = "x86_64")]
    "/usr/lib/x86_64-linux-gnu",
    #[cfg(target_arch = "aarch64")]
    "/lib/aarch64-linux-gnu",
    #[cfg(target_arch = "aarch64")]
    "/usr/lib/aarch64-linux-gnu",
];

/// Directories holding `binary`, its interpreter and its library closure
pub fn library_dirs(binary: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = BTreeSet::new();
    if let Some(parent) = binary.parent() {
        dirs.insert(parent.to_path_buf());
    }
    for path in library_closure(binary)? {
        if let Some(parent) = path.parent() {
            dirs.insert(parent.to_path_buf());
        }
    }
    Ok(dirs.into_iter().collect())
}

/// The interpreter and every shared library `binary` transitively needs
pub fn library_closure(binary: &Path) -> Result<Vec<PathBuf>> {
    let ldcache = LdCache::load();
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    let mut queue = vec![binary.to_path_buf()];

    while let Some(path) = queue.pop() {
        if !seen.insert(path.clone()) {
            continue;
        }
        let info = DynamicInfo::read(&path)?;

        if let Some(interp) = info.interpreter {
            if seen.insert(interp.clone()) {
                result.push(interp);
            }
        }
        for name in &info.needed {
            match resolve_library(name, &info.search_path, &ldcache) {
                Some(lib) if !seen.contains(&lib) => {
                    result.push(lib.clone());
                    queue.push(lib);
                }
                Some(_) => {}
                None => tracing::debug!(library = %name, from = %path.display(), "unresolved library"),
            }
        }
    }

    Ok(result)
}

#[derive(Debug, Default)]
struct DynamicInfo {
    needed: Vec<String>,
    search_path: Vec<PathBuf>,
    interpreter: Option<PathBuf>,
}

impl DynamicInfo {
    fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: read-only private mapping of a file we only parse
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| StockadeError::Config(format!("mmap {}: {e}", path.display())))?;
        let elf = Elf::parse(&map)
            .map_err(|e| StockadeError::Config(format!("{}: {e}", path.display())))?;

        let origin = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let expand = |s: &str| PathBuf::from(s.replace("${ORIGIN}", &origin).replace("$ORIGIN", &origin));

        // RUNPATH takes precedence over RPATH when both are present
        let raw = if elf.runpaths.is_empty() {
            &elf.rpaths
        } else {
            &elf.runpaths
        };
        let search_path = raw
            .iter()
            .flat_map(|p| p.split(':'))
            .filter(|p| !p.is_empty())
            .map(expand)
            .collect();

        Ok(Self {
            needed: elf.libraries.iter().map(|s| (*s).to_string()).collect(),
            search_path,
            interpreter: elf.interpreter.map(PathBuf::from),
        })
    }
}

fn resolve_library(name: &str, search_path: &[PathBuf], ldcache: &LdCache) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.exists().then_some(path);
    }
    search_path
        .iter()
        .map(|dir| dir.join(name))
        .find(|p| p.exists())
        .or_else(|| ldcache.lookup(name))
        .or_else(|| {
            DEFAULT_LIB_DIRS
                .iter()
                .map(|dir| Path::new(dir).join(name))
                .find(|p| p.exists())
        })
}

/// Parsed `/etc/ld.so.cache`
#[derive(Debug, Default)]
pub struct LdCache {
    entries: HashMap<String, PathBuf>,
}

impl LdCache {
    /// Load the system cache. A missing or unreadable cache is empty.
    #[must_use]
    pub fn load() -> Self {
        Self::load_from(Path::new(LDCACHE_PATH))
    }

    #[must_use]
    pub fn load_from(path: &Path) -> Self {
        std::fs::read(path).map(|data| Self::parse(&data)).unwrap_or_default()
    }

    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        if data.starts_with(LDCACHE_MAGIC_NEW) {
            Self::parse_table(data, 48, 24, 20, true)
        } else if data.starts_with(LDCACHE_MAGIC_OLD) {
            Self::parse_table(data, 16, 12, 12, false)
        } else {
            Self::default()
        }
    }

    // The new format stores string offsets relative to the file start as
    // well, so both layouts resolve against `data`.
    fn parse_table(data: &[u8], header: usize, entry: usize, count_at: usize, new: bool) -> Self {
        let Some(count) = read_u32_le(data, count_at) else {
            return Self::default();
        };
        let strings_base = if new { 0 } else { header + count as usize * entry };

        let mut entries = HashMap::new();
        for i in 0..count as usize {
            let at = header + i * entry;
            let (Some(key), Some(value)) = (read_u32_le(data, at + 4), read_u32_le(data, at + 8))
            else {
                break;
            };
            let key = read_cstr(data, strings_base + key as usize);
            let value = read_cstr(data, strings_base + value as usize);
            if let (Some(k), Some(v)) = (key, value) {
                entries.entry(k.to_string()).or_insert_with(|| PathBuf::from(v));
            }
        }
        Self { entries }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        self.entries.get(name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_u32_le(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_cstr(data: &[u8], at: usize) -> Option<&str> {
    let rest = data.get(at..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_format_cache(entries: &[(&str, &str)]) -> Vec<u8> {
        let header = 48;
        let entry = 24;
        let mut strings = Vec::new();
        let mut offsets = Vec::new();
        let strings_at = header + entries.len() * entry;
        for (k, v) in entries {
            let k_off = strings_at + strings.len();
            strings.extend_from_slice(k.as_bytes());
            strings.push(0);
            let v_off = strings_at + strings.len();
            strings.extend_from_slice(v.as_bytes());
            strings.push(0);
            offsets.push((k_off as u32, v_off as u32));
        }

        let mut data = vec![0u8; header];
        data[..LDCACHE_MAGIC_NEW.len()].copy_from_slice(LDCACHE_MAGIC_NEW);
        data[20..24].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        data[24..28].copy_from_slice(&(strings.len() as u32).to_le_bytes());
        for (k, v) in offsets {
            let mut e = vec![0u8; entry];
            e[0..4].copy_from_slice(&1i32.to_le_bytes());
            e[4..8].copy_from_slice(&k.to_le_bytes());
            e[8..12].copy_from_slice(&v.to_le_bytes());
            data.extend_from_slice(&e);
        }
        data.extend_from_slice(&strings);
        data
    }

    #[test]
    fn parses_new_format_cache() {
        let data = new_format_cache(&[
            ("libc.so.6", "/usr/lib/libc.so.6"),
            ("libm.so.6", "/usr/lib/libm.so.6"),
        ]);
        let cache = LdCache::parse(&data);
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.lookup("libm.so.6"),
            Some(PathBuf::from("/usr/lib/libm.so.6"))
        );
        assert_eq!(cache.lookup("libz.so.1"), None);
    }

    #[test]
    fn truncated_cache_does_not_panic() {
        let data = new_format_cache(&[("libc.so.6", "/usr/lib/libc.so.6")]);
        for cut in 0..data.len() {
            let _ = LdCache::parse(&data[..cut]);
        }
    }

    #[test]
    fn missing_cache_is_empty() {
        assert!(LdCache::load_from(Path::new("/nonexistent/ld.so.cache")).is_empty());
    }

    #[test]
    fn non_elf_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"#!/bin/sh\necho hi\n").unwrap();
        assert!(library_closure(file.path()).is_err());
    }

    #[test]
    fn closure_of_current_executable_includes_its_directory() {
        let exe = std::env::current_exe().unwrap();
        let dirs = library_dirs(&exe).unwrap();
        assert!(dirs.contains(&exe.parent().unwrap().to_path_buf()));
    }
}
