//! One file per entry under a table directory.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex};

use super::{BackendError, BackendOptions, BackendResult, LruIndex, StorageBackend};

const EXTENSION: &str = "bin";
const TMP_MARKER: &str = ".tmp-";

/// State shared by every backend instance opened on one directory.
///
/// Lock order is `lock` first, then `lru`.
struct DirState {
    lock: ReentrantMutex<()>,
    lru: Mutex<Option<LruIndex>>,
}

/// Directories with at least one open backend.
static DIRS: Lazy<Mutex<HashMap<PathBuf, Weak<DirState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn dir_state(dir: &Path) -> Arc<DirState> {
    let mut dirs = DIRS.lock();
    dirs.retain(|_, state| state.strong_count() > 0);
    if let Some(state) = dirs.get(dir).and_then(Weak::upgrade) {
        return state;
    }
    let state = Arc::new(DirState {
        lock: ReentrantMutex::new(()),
        lru: Mutex::new(None),
    });
    dirs.insert(dir.to_path_buf(), Arc::downgrade(&state));
    state
}

/// Maps a key to a file stem, hex-escaping keys that are not plain names.
fn file_stem(key: &str) -> String {
    let plain = !key.is_empty()
        && !key.starts_with(['.', '~'])
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if plain {
        key.to_owned()
    } else {
        format!("~{}", hex::encode(key))
    }
}

fn key_from_stem(stem: &str) -> Option<String> {
    match stem.strip_prefix('~') {
        Some(encoded) => hex::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok()),
        None => Some(stem.to_owned()),
    }
}

/// Stores each entry as `<dir>/<key>.bin`.
///
/// Writes go to a temporary file that is renamed into place, so readers never
/// observe a partial entry. Instances on the same directory share one
/// reentrant write lock and one size index, so a total-size bound covers the
/// directory rather than a single handle. The first bounded open fixes the
/// limits.
pub struct FileSystemBackend {
    name: String,
    dir: PathBuf,
    shared: Arc<DirState>,
}

impl FileSystemBackend {
    /// Opens (creating if needed) the table directory `dir`.
    pub fn open(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        options: &BackendOptions,
    ) -> BackendResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| BackendError::io(&dir, e))?;
        let dir = dir.canonicalize().map_err(|e| BackendError::io(&dir, e))?;
        let backend = Self {
            name: name.into(),
            shared: dir_state(&dir),
            dir,
        };
        if let Some(index) = options.lru_index() {
            backend.install_lru(index)?;
        }
        Ok(backend)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", file_stem(key)))
    }

    fn with_lru<T>(&self, f: impl FnOnce(&mut LruIndex) -> T) -> Option<T> {
        self.shared.lru.lock().as_mut().map(f)
    }

    /// Entry files with their keys, skipping temporaries and foreign files.
    fn entries(&self) -> BackendResult<Vec<(String, fs::Metadata)>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::io(&self.dir, e)),
        };
        let mut entries = Vec::new();
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| BackendError::io(&self.dir, e))?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.contains(TMP_MARKER) {
                continue;
            }
            let Some(key) = key_from_stem(stem) else {
                continue;
            };
            match dirent.metadata() {
                Ok(meta) if meta.is_file() => entries.push((key, meta)),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::io(&path, e)),
            }
        }
        Ok(entries)
    }

    /// Seeds `index` from the files on disk, oldest first, unless another
    /// instance already bounds this directory.
    fn install_lru(&self, mut index: LruIndex) -> BackendResult<()> {
        let _guard = self.shared.lock.lock();
        let mut lru = self.shared.lru.lock();
        if lru.is_some() {
            return Ok(());
        }
        let mut entries = self.entries()?;
        entries.sort_by_key(|(_, meta)| meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
        for (key, meta) in entries {
            for evicted in index.record_write(&key, meta.len()) {
                self.remove_file(&evicted)?;
            }
        }
        *lru = Some(index);
        Ok(())
    }

    fn remove_file(&self, key: &str) -> BackendResult<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BackendError::io(path, e)),
        }
    }
}

impl StorageBackend for FileSystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => {
                self.with_lru(|lru| lru.touch(key));
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::io(path, e)),
        }
    }

    fn set(&self, key: &str, value: Vec<u8>) -> BackendResult<()> {
        let len = value.len() as u64;
        self.with_lru(|lru| lru.check_entry(len)).transpose()?;

        let path = self.path_for(key);
        let tmp = self.dir.join(format!(
            "{}{TMP_MARKER}{}-{}.{EXTENSION}",
            file_stem(key),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let _guard = self.shared.lock.lock();
        fs::write(&tmp, &value).map_err(|e| BackendError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(BackendError::io(path, e));
        }

        let evicted = self
            .with_lru(|lru| lru.record_write(key, len))
            .unwrap_or_default();
        for key in evicted {
            self.remove_file(&key)?;
            tracing::debug!(backend = %self.name, key = %key, "evicted entry");
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        let _guard = self.shared.lock.lock();
        let existed = self.remove_file(key)?;
        self.with_lru(|lru| lru.remove(key));
        Ok(existed)
    }

    fn delete_if(&self, key: &str, expected: &[u8]) -> BackendResult<bool> {
        let _guard = self.shared.lock.lock();
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) if bytes == expected => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BackendError::io(path, e)),
        }
        let removed = self.remove_file(key)?;
        self.with_lru(|lru| lru.remove(key));
        Ok(removed)
    }

    fn keys(&self) -> BackendResult<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|(key, _)| key).collect())
    }

    fn len(&self) -> BackendResult<usize> {
        Ok(self.entries()?.len())
    }

    fn clear(&self) -> BackendResult<()> {
        let _guard = self.shared.lock.lock();
        for key in self.keys()? {
            self.remove_file(&key)?;
        }
        self.with_lru(LruIndex::clear);
        Ok(())
    }
}

impl std::fmt::Debug for FileSystemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemBackend")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("bounded", &self.shared.lru.lock().is_some())
            .finish()
    }
}
