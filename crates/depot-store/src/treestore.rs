//! Diskv-style keyed file store over a sharded directory tree.
//!
//! Each namespace of the image store is one [`TreeStore`]: a minimal
//! mapping from string key to byte payload with streaming read/write,
//! atomic admission of staged files, and lazy key iteration. A store may
//! carry an in-memory ordered key index (rebuilt from a directory walk at
//! open) to serve batched range scans; only the secondary name index needs
//! one.
//!
//! Writes stage to a temp file in a sibling `tmp/` directory and rename
//! into place, so a value is either fully present or absent. The staging
//! directory must live on the same filesystem as the tree for the rename
//! to be atomic.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::transform::shard;
use crate::{Result, StoreError};

/// Configuration for one keyed namespace.
#[derive(Debug, Clone)]
pub struct TreeStoreOptions {
    /// Directory the sharded tree lives under.
    pub base: PathBuf,
    /// Staging directory for in-flight writes; same filesystem as `base`.
    pub tmp: PathBuf,
    /// Maintain an in-memory ordered key index for [`TreeStore::index_keys`]
    /// range scans.
    pub ordered_index: bool,
}

pub struct TreeStore {
    base: PathBuf,
    tmp: PathBuf,
    index: Option<RwLock<BTreeSet<String>>>,
}

impl TreeStore {
    /// Open a store rooted at `opts.base`, creating directories as needed.
    ///
    /// With `ordered_index` set, the existing tree is walked once to rebuild
    /// the in-memory index. The index is per-process; writes from another
    /// process are not observed until reopen.
    pub fn open(opts: TreeStoreOptions) -> Result<Self> {
        create_dir_all_world(&opts.base).map_err(StoreError::io("creating store directory"))?;
        create_dir_all_world(&opts.tmp).map_err(StoreError::io("creating staging directory"))?;

        let index = if opts.ordered_index {
            let mut keys = BTreeSet::new();
            for key in Keys::walk(&opts.base, None) {
                keys.insert(key?);
            }
            debug!(base = %opts.base.display(), keys = keys.len(), "rebuilt ordered key index");
            Some(RwLock::new(keys))
        } else {
            None
        };

        Ok(Self {
            base: opts.base,
            tmp: opts.tmp,
            index,
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.base.clone();
        for segment in shard(key) {
            path.push(segment);
        }
        path.push(key);
        path
    }

    /// Whether a value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Read the whole value stored under `key`.
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path_for(key)).map_err(|e| Self::read_err(key, e))
    }

    /// Open the value stored under `key` for streaming reads.
    pub fn read_stream(&self, key: &str) -> Result<File> {
        File::open(self.path_for(key)).map_err(|e| Self::read_err(key, e))
    }

    fn read_err(key: &str, source: io::Error) -> StoreError {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::KeyNotFound {
                key: key.to_string(),
            }
        } else {
            StoreError::Io {
                context: "reading key",
                source,
            }
        }
    }

    /// Store `value` under `key`. Overwrites any previous value.
    pub fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_stream(key, value)
    }

    /// Store everything `r` yields under `key`; size need not be known in
    /// advance. Staged to `tmp/`, fsynced, then renamed into place.
    pub fn write_stream<R: Read>(&self, key: &str, mut r: R) -> Result<()> {
        let mut staged =
            NamedTempFile::new_in(&self.tmp).map_err(StoreError::io("staging write"))?;
        io::copy(&mut r, &mut staged).map_err(StoreError::io("writing value"))?;
        staged
            .as_file()
            .sync_all()
            .map_err(StoreError::io("syncing value"))?;
        normalize_mode(staged.as_file()).map_err(StoreError::io("setting value permissions"))?;

        let dest = self.path_for(key);
        if let Some(parent) = dest.parent() {
            create_dir_all_world(parent).map_err(StoreError::io("creating shard directory"))?;
        }
        staged.persist(&dest).map_err(|e| StoreError::Io {
            context: "committing value",
            source: e.error,
        })?;
        self.note_key(key);
        Ok(())
    }

    /// Admit a file already staged on the same filesystem under `key`.
    ///
    /// With `move_ok` the file is renamed into place; on failure the source
    /// is left for the caller to unlink. Without it the contents go through
    /// the usual staged copy and the source is untouched.
    pub fn import(&self, src: &Path, key: &str, move_ok: bool) -> Result<()> {
        if !move_ok {
            let f = File::open(src).map_err(StoreError::io("opening import source"))?;
            return self.write_stream(key, f);
        }

        let dest = self.path_for(key);
        if let Some(parent) = dest.parent() {
            create_dir_all_world(parent).map_err(StoreError::io("creating shard directory"))?;
        }
        fs::rename(src, &dest).map_err(StoreError::io("importing staged file"))?;
        self.note_key(key);
        Ok(())
    }

    /// Remove the value stored under `key`.
    pub fn erase(&self, key: &str) -> Result<()> {
        fs::remove_file(self.path_for(key)).map_err(|e| Self::read_err(key, e))?;
        if let Some(index) = &self.index {
            index.write().unwrap().remove(key);
        }
        Ok(())
    }

    /// Lazily enumerate every key in the store. Dropping the iterator
    /// cancels the scan.
    pub fn keys(&self) -> Keys {
        match &self.index {
            Some(index) => Keys::sorted(index.read().unwrap().iter().cloned().collect()),
            None => Keys::walk(&self.base, None),
        }
    }

    /// Lazily enumerate keys starting with `prefix`.
    ///
    /// Indexed stores serve an ordered range scan; unindexed stores walk the
    /// tree and filter. Either way, dropping the iterator cancels it.
    pub fn keys_prefix(&self, prefix: &str) -> Keys {
        match &self.index {
            Some(index) => {
                let keys = index
                    .read()
                    .unwrap()
                    .range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded))
                    .take_while(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                Keys::sorted(keys)
            }
            None => Keys::walk(&self.base, Some(prefix.to_string())),
        }
    }

    /// Batched ordered range scan: up to `n` keys strictly after `from`,
    /// or from the smallest key when `from` is empty.
    ///
    /// Panics if the store was opened without an ordered index; asking an
    /// unordered namespace for ordered batches is a programming error.
    pub fn index_keys(&self, from: &str, n: usize) -> Vec<String> {
        let index = self
            .index
            .as_ref()
            .expect("index_keys on a store without an ordered index");
        let lower = if from.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(from.to_string())
        };
        index
            .read()
            .unwrap()
            .range::<String, _>((lower, Bound::Unbounded))
            .take(n)
            .cloned()
            .collect()
    }

    fn note_key(&self, key: &str) {
        if let Some(index) = &self.index {
            index.write().unwrap().insert(key.to_string());
        }
    }
}

/// Lazy key iterator over one store.
pub struct Keys {
    inner: KeysInner,
    prefix: Option<String>,
}

enum KeysInner {
    Walk(walkdir::IntoIter),
    Sorted(std::vec::IntoIter<String>),
}

impl Keys {
    fn walk(base: &Path, prefix: Option<String>) -> Self {
        Self {
            inner: KeysInner::Walk(WalkDir::new(base).min_depth(1).into_iter()),
            prefix,
        }
    }

    fn sorted(keys: Vec<String>) -> Self {
        Self {
            inner: KeysInner::Sorted(keys.into_iter()),
            prefix: None,
        }
    }
}

impl Iterator for Keys {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.inner {
                KeysInner::Sorted(keys) => return keys.next().map(Ok),
                KeysInner::Walk(walk) => match walk.next()? {
                    Err(e) => {
                        return Some(Err(StoreError::Io {
                            context: "scanning keys",
                            source: e.into(),
                        }))
                    }
                    Ok(entry) => {
                        if !entry.file_type().is_file() {
                            continue;
                        }
                        let Some(name) = entry.file_name().to_str() else {
                            continue;
                        };
                        if name.starts_with('.') {
                            continue;
                        }
                        if let Some(prefix) = &self.prefix {
                            if !name.starts_with(prefix.as_str()) {
                                continue;
                            }
                        }
                        return Some(Ok(name.to_string()));
                    }
                },
            }
        }
    }
}

/// Create a directory chain with 0777 (umask-adjusted) permissions.
#[cfg(unix)]
fn create_dir_all_world(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o777).create(path)
}

#[cfg(not(unix))]
fn create_dir_all_world(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Stamp a staged file with the usual creation mode; temp files start life
/// owner-only.
#[cfg(unix)]
pub(crate) fn normalize_mode(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
pub(crate) fn normalize_mode(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, ordered: bool) -> TreeStore {
        TreeStore::open(TreeStoreOptions {
            base: dir.path().join("tree"),
            tmp: dir.path().join("tmp"),
            ordered_index: ordered,
        })
        .unwrap()
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        store.write("sha512-aabbcc00", b"value").unwrap();
        assert_eq!(store.read("sha512-aabbcc00").unwrap(), b"value");
        assert!(store.contains("sha512-aabbcc00"));
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        let err = store.read("sha512-ffffff00").unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[test]
    fn test_write_lands_in_sharded_path() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        store.write("sha512-aabbcc00", b"value").unwrap();
        let expected = dir
            .path()
            .join("tree")
            .join("aa")
            .join("bb")
            .join("cc")
            .join("sha512-aabbcc00");
        assert!(expected.is_file());
    }

    #[test]
    fn test_overwrite_wins() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        store.write("k0", b"old").unwrap();
        store.write("k0", b"new").unwrap();
        assert_eq!(store.read("k0").unwrap(), b"new");
    }

    #[test]
    fn test_write_stream() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        let payload = vec![7u8; 64 * 1024];
        store.write_stream("big0", payload.as_slice()).unwrap();
        assert_eq!(store.read("big0").unwrap(), payload);
    }

    #[test]
    fn test_import_move_consumes_source() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        let src = dir.path().join("tmp").join("staged");
        fs::write(&src, b"imported").unwrap();
        store.import(&src, "im00", true).unwrap();

        assert!(!src.exists());
        assert_eq!(store.read("im00").unwrap(), b"imported");
    }

    #[test]
    fn test_import_copy_keeps_source() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        let src = dir.path().join("tmp").join("staged");
        fs::write(&src, b"imported").unwrap();
        store.import(&src, "im00", false).unwrap();

        assert!(src.exists());
        assert_eq!(store.read("im00").unwrap(), b"imported");
    }

    #[test]
    fn test_erase() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        store.write("gone0", b"bytes").unwrap();
        store.erase("gone0").unwrap();
        assert!(store.read("gone0").unwrap_err().is_not_found());
        assert!(store.erase("gone0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_keys_prefix_unordered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);

        store.write("aa0011", b"1").unwrap();
        store.write("aa0022", b"2").unwrap();
        store.write("bb0033", b"3").unwrap();

        let mut found: Vec<_> = store
            .keys_prefix("aa00")
            .collect::<Result<Vec<_>>>()
            .unwrap();
        found.sort();
        assert_eq!(found, vec!["aa0011", "aa0022"]);
    }

    #[test]
    fn test_keys_prefix_ordered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, true);

        store.write("aa0022", b"2").unwrap();
        store.write("aa0011", b"1").unwrap();
        store.write("ab0033", b"3").unwrap();

        let found: Vec<_> = store
            .keys_prefix("aa")
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(found, vec!["aa0011", "aa0022"]);
    }

    #[test]
    fn test_index_keys_excludes_from() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, true);

        for key in ["aa01", "aa02", "aa03", "bb01"] {
            store.write(key, b"v").unwrap();
        }

        assert_eq!(store.index_keys("", 2), vec!["aa01", "aa02"]);
        assert_eq!(store.index_keys("aa02", 10), vec!["aa03", "bb01"]);
        assert!(store.index_keys("bb01", 10).is_empty());
        // A bare prefix that is no stored key still ranges from the right spot.
        assert_eq!(store.index_keys("aa", 1), vec!["aa01"]);
    }

    #[test]
    fn test_index_rebuild_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir, true);
            store.write("cc0011", b"1").unwrap();
            store.write("cc0022", b"2").unwrap();
        }

        let reopened = open_store(&dir, true);
        assert_eq!(reopened.index_keys("", 10), vec!["cc0011", "cc0022"]);
    }

    #[test]
    #[should_panic(expected = "without an ordered index")]
    fn test_index_keys_requires_index() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);
        store.index_keys("", 1);
    }
}
