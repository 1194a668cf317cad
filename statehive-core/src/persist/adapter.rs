/*
    adapter.rs - Storage adapter contract and two adapters

    A storage medium is anything that can get, set and remove string items
    and enumerate its keys by index. `MemoryStorage` backs tests and
    ephemeral stores; `FileStorage` keeps one JSON file per item in a
    directory, written atomically (temp file, then rename).
*/

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::store::errors::StoreResult;

pub trait StorageAdapter: Send + Sync {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()>;

    fn remove_item(&self, key: &str) -> StoreResult<()>;

    /// Key at position `index` of the adapter's enumeration order
    fn key(&self, index: usize) -> StoreResult<Option<String>>;

    fn len(&self) -> StoreResult<usize>;

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Every key, via `len` and `key`
    fn keys(&self) -> StoreResult<Vec<String>> {
        let len = self.len()?;
        let mut keys = Vec::with_capacity(len);
        for index in 0..len {
            if let Some(key) = self.key(index)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// In-memory adapter; share one behind an `Arc` to simulate a restart
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        self.items.lock().remove(key);
        Ok(())
    }

    fn key(&self, index: usize) -> StoreResult<Option<String>> {
        Ok(self.items.lock().keys().nth(index).cloned())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.items.lock().len())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.items.lock().keys().cloned().collect())
    }
}

/// One file per item under `dir`
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

const ITEM_EXT: &str = "json";

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_file_name(key), ITEM_EXT))
    }

    fn sorted_keys(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(ITEM_EXT) {
                    return None;
                }
                path.file_stem().and_then(|stem| stem.to_str()).and_then(decode_file_name)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

impl StorageAdapter for FileStorage {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        let final_path = self.path_for(key);
        let temp_path = final_path.with_extension("tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(temp_path, final_path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn key(&self, index: usize) -> StoreResult<Option<String>> {
        Ok(self.sorted_keys()?.into_iter().nth(index))
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.sorted_keys()?.len())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        self.sorted_keys()
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_.-]`
fn encode_file_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
