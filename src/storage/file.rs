//! Durable file-backed text backend.
//!
//! One file per raw key inside a directory. File names are the raw key with
//! every byte outside `[A-Za-z0-9_-]` percent-encoded, so names never contain
//! a `.` and temporary files (`<name>.tmp`) are never mistaken for keys.
//!
//! Keys whose encoded name would pass [`MAX_NAME_LEN`] are stored under
//! `=<sha256 hex>` instead, with the raw key as a JSON header line in front
//! of the record text.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::StorageNamespace;
use crate::error::{CacheError, Result};
use crate::storage::{Record, StorageBackend};

/// Longest plain file name, well under common 255-byte limits
pub const MAX_NAME_LEN: usize = 200;

/// Marks digest-named files; `encode_name` never emits it
const DIGEST_PREFIX: &str = "=";

/// Directory of text records that outlives the process.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    /// Byte limit over all record files
    quota: Option<u64>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, quota: None })
    }

    /// Rejects writes that would grow the store beyond `quota` bytes.
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes used by all record files.
    pub fn used_bytes(&self) -> u64 {
        self.record_files()
            .filter_map(|(_, path)| fs::metadata(path).ok())
            .map(|m| m.len())
            .sum()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }

    fn record_files(&self) -> impl Iterator<Item = (String, PathBuf)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!("Cannot list cache directory {}: {}", self.dir.display(), e);
                None
            }
        };
        entries
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let key = if is_digest_name(&name) {
                    read_header(&entry.path())?
                } else {
                    decode_name(&name)?
                };
                Some((key, entry.path()))
            })
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }
}

impl StorageBackend for FileStore {
    fn namespace(&self) -> StorageNamespace {
        StorageNamespace::DurablePersistent
    }

    fn read(&self, key: &str) -> Option<Record> {
        let name = file_name(key);
        let text = match fs::read_to_string(self.dir.join(&name)) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cache record '{}': {}", key, e);
                return None;
            }
        };

        if !is_digest_name(&name) {
            return Some(Record::Text(text));
        }
        match split_header(&text) {
            Some((owner, body)) if owner == key => Some(Record::Text(body.to_string())),
            _ => {
                warn!("Digest-named record '{}' does not hold key '{}'", name, key);
                None
            }
        }
    }

    fn write(&mut self, key: &str, record: Record) -> Result<()> {
        let text = record.into_text()?;
        let name = file_name(key);
        let path = self.dir.join(&name);
        let contents = if is_digest_name(&name) {
            with_header(key, &text)?
        } else {
            text
        };

        if let Some(quota) = self.quota {
            let previous = fs::metadata(&path).map_or(0, |m| m.len());
            let needed = self.used_bytes().saturating_sub(previous) + contents.len() as u64;
            if needed > quota {
                return Err(CacheError::QuotaExceeded(key.to_string()));
            }
        }

        self.write_file(&path, &contents).map_err(|e| match e.kind() {
            ErrorKind::StorageFull => CacheError::QuotaExceeded(key.to_string()),
            _ => CacheError::Io(e),
        })
    }

    fn remove(&mut self, key: &str) {
        if let Err(e) = fs::remove_file(self.path_for(key)) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove cache record '{}': {}", key, e);
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.record_files().map(|(key, _)| key).collect();
        keys.sort();
        keys
    }
}

// == File Name Encoding ==
fn file_name(key: &str) -> String {
    let name = encode_name(key);
    if name.len() <= MAX_NAME_LEN {
        name
    } else {
        format!("{}{:x}", DIGEST_PREFIX, Sha256::digest(key.as_bytes()))
    }
}

fn is_digest_name(name: &str) -> bool {
    name.strip_prefix(DIGEST_PREFIX)
        .is_some_and(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

// == Key Header ==
fn with_header(key: &str, text: &str) -> Result<String> {
    let header = serde_json::to_string(key).map_err(|e| CacheError::Serialization(e.to_string()))?;
    Ok(format!("{}\n{}", header, text))
}

fn split_header(contents: &str) -> Option<(String, &str)> {
    let (header, body) = contents.split_once('\n')?;
    let key = serde_json::from_str(header).ok()?;
    Some((key, body))
}

/// Reads only the header line of a digest-named file.
fn read_header(path: &Path) -> Option<String> {
    let mut line = String::new();
    BufReader::new(File::open(path).ok()?).read_line(&mut line).ok()?;
    serde_json::from_str(line.trim_end()).ok()
}

fn encode_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

fn decode_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = name.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' => {
                out.push(b);
                i += 1;
            }
            // Anything else (temp files, foreign files) is not a record
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}
