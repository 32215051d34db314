//! # depot-store
//!
//! Content-addressable storage for application container images.
//!
//! Images enter through a streaming write pipeline that sniffs the
//! compression envelope, decompresses, hashes and stages in a single pass,
//! then atomically admits the blob under a key derived from the digest of
//! its uncompressed bytes. Three metadata namespaces sit alongside the
//! blobs:
//!
//! - `remote`: origin memos keyed by source-URL hash
//! - `aciinfo`: per-blob manifest metadata keyed by blob-key hash
//! - `appindex`: ordered secondary index keyed by name digest, serving
//!   best-match lookup by logical name plus label constraints
//!
//! ## Directory layout
//!
//! ```text
//! <base>/
//! ├── cas/
//! │   ├── blob/      sharded tree, file names are full `sha512-…` keys
//! │   ├── remote/
//! │   ├── aciinfo/
//! │   └── appindex/
//! └── tmp/           in-flight write staging
//! ```
//!
//! The store is a passive library: operations are synchronous, atomicity
//! comes from same-filesystem renames, and a blob is always visible before
//! its index records.

pub mod keys;
pub mod records;
pub mod transform;
pub mod treestore;

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument};

use depot_aci::{
    decompress, detect_file_type, manifest_from_image, AciError, FileType, HEADER_PEEK_LEN,
};
use depot_schema::{AppName, Labels};

use keys::{short_sha512, HashingReader, HASH_PREFIX, KEY_LEN};
pub use records::{AciInfo, AppIndex, IndexRecord, Remote};
pub use treestore::{Keys, TreeStore, TreeStoreOptions};

/// Errors surfaced by the image store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure, wrapped with the step that hit it.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// The byte stream is not an image we recognize, or its manifest does
    /// not parse.
    #[error("{context}: {source}")]
    Image {
        context: &'static str,
        #[source]
        source: AciError,
    },

    /// A stored record failed to decode.
    #[error("record {key} failed to decode: {source}")]
    Record {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// No key (or no key with the given prefix) is present.
    #[error("no keys found matching {key:?}")]
    KeyNotFound { key: String },

    /// A partial key matched more than one stored key.
    #[error("ambiguous key prefix {prefix:?}")]
    AmbiguousKey { prefix: String },

    /// No stored image satisfies the requested name and labels.
    #[error("no image found for {name}")]
    ImageNotFound { name: String },
}

impl StoreError {
    /// Non-fatal "nothing there" errors, as opposed to failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::KeyNotFound { .. } | StoreError::ImageNotFound { .. }
        )
    }

    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> StoreError {
        move |source| StoreError::Io { context, source }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The four on-disk namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Blob,
    Remote,
    AciInfo,
    AppIndex,
}

impl StoreKind {
    const ALL: [StoreKind; 4] = [
        StoreKind::Blob,
        StoreKind::Remote,
        StoreKind::AciInfo,
        StoreKind::AppIndex,
    ];

    fn dir(self) -> &'static str {
        match self {
            StoreKind::Blob => "blob",
            StoreKind::Remote => "remote",
            StoreKind::AciInfo => "aciinfo",
            StoreKind::AppIndex => "appindex",
        }
    }
}

/// Appindex keys fetched per range-scan batch during selection.
const INDEX_BATCH: usize = 10;

/// Content-addressable image store rooted at one base directory.
pub struct Store {
    tmp: PathBuf,
    blob: TreeStore,
    remote: TreeStore,
    aciinfo: TreeStore,
    appindex: TreeStore,
}

impl Store {
    /// Open a store rooted at `base`, creating the namespace trees and the
    /// staging directory as needed.
    ///
    /// Only the `appindex` namespace carries an ordered key index (rebuilt
    /// from a directory walk here); the others are looked up by exact key.
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let tmp = base.join("tmp");
        let open = |kind: StoreKind, ordered_index: bool| {
            TreeStore::open(TreeStoreOptions {
                base: base.join("cas").join(kind.dir()),
                tmp: tmp.clone(),
                ordered_index,
            })
        };
        Ok(Self {
            blob: open(StoreKind::Blob, false)?,
            remote: open(StoreKind::Remote, false)?,
            aciinfo: open(StoreKind::AciInfo, false)?,
            appindex: open(StoreKind::AppIndex, true)?,
            tmp,
        })
    }

    fn store_for(&self, kind: StoreKind) -> &TreeStore {
        match kind {
            StoreKind::Blob => &self.blob,
            StoreKind::Remote => &self.remote,
            StoreKind::AciInfo => &self.aciinfo,
            StoreKind::AppIndex => &self.appindex,
        }
    }

    /// Stream the raw bytes stored under a full blob key.
    pub fn read_stream(&self, key: &str) -> Result<std::fs::File> {
        self.blob.read_stream(key)
    }

    /// Store raw bytes under a caller-supplied blob key.
    ///
    /// No hashing happens here; [`Store::write_aci`] is the admission path
    /// that derives keys from content.
    pub fn write_stream<R: Read>(&self, key: &str, r: R) -> Result<()> {
        self.blob.write_stream(key, r)
    }

    /// Admit an image supplied as a (possibly compressed) byte stream and
    /// return its blob key.
    ///
    /// The stream is decompressed on the fly, hashed, and staged to the
    /// store's `tmp/` directory in one pass, then renamed into the blob
    /// namespace under a key derived from the digest of the uncompressed
    /// bytes. `latest` marks an admission that did not pin a specific
    /// version; selection prefers such images when no version is requested.
    ///
    /// The blob becomes visible strictly before its index records, so a
    /// reader that observes the `aciinfo` record can assume the blob
    /// resolves. The staged temp file is unlinked on every failure path.
    #[instrument(level = "debug", skip(self, r))]
    pub fn write_aci<R: Read>(&self, mut r: R, latest: bool) -> Result<String> {
        let mut head = [0u8; HEADER_PEEK_LEN];
        let peeked =
            read_head(&mut r, &mut head).map_err(StoreError::io("reading image header"))?;

        let file_type = detect_file_type(&head[..peeked]);
        if file_type == FileType::Unknown {
            return Err(StoreError::Image {
                context: "detecting image type",
                source: AciError::UnknownFileType,
            });
        }
        let body = io::Cursor::new(&head[..peeked]).chain(r);
        let decompressed = decompress(body, file_type).map_err(|source| StoreError::Image {
            context: "decompressing image",
            source,
        })?;

        let mut tee = HashingReader::new(decompressed);
        let mut staged =
            NamedTempFile::new_in(&self.tmp).map_err(StoreError::io("staging image"))?;
        io::copy(&mut tee, &mut staged).map_err(StoreError::io("copying image"))?;
        staged
            .as_file()
            .sync_all()
            .map_err(StoreError::io("syncing image"))?;
        treestore::normalize_mode(staged.as_file())
            .map_err(StoreError::io("setting image permissions"))?;

        let reopened = staged.reopen().map_err(StoreError::io("reopening image"))?;
        let manifest = manifest_from_image(reopened).map_err(|source| StoreError::Image {
            context: "extracting image manifest",
            source,
        })?;

        let key = tee.into_key();
        let staged = staged.into_temp_path();
        self.blob.import(&staged, &key, true)?;
        // The rename consumed the staged file; nothing left to unlink.
        let _ = staged.keep();

        let name = manifest.name.clone();
        let info = AciInfo::new(manifest, key.clone(), latest, Utc::now());
        let info_key = info.key();
        self.write_index(&info)?;
        self.write_index(&AppIndex::new(name, info_key))?;

        debug!(%key, latest, "image admitted");
        Ok(key)
    }

    /// Resolve a possibly-partial key to the unique full key it prefixes.
    ///
    /// Input longer than a full key is truncated first, so pasting an entire
    /// untruncated hex digest works. A full, prefixed key comes back
    /// unchanged without touching the store. Otherwise the blob keys are
    /// scanned, cancelling as soon as a second match is seen.
    pub fn resolve_key(&self, key: &str) -> Result<String> {
        let key = if key.len() > KEY_LEN {
            key.get(..KEY_LEN).unwrap_or(key)
        } else {
            key
        };
        if key.len() == KEY_LEN && key.starts_with(HASH_PREFIX) {
            return Ok(key.to_string());
        }

        let mut matches = self.blob.keys_prefix(key);
        let first = match matches.next() {
            None => {
                return Err(StoreError::KeyNotFound {
                    key: key.to_string(),
                })
            }
            Some(first) => first?,
        };
        match matches.next() {
            None => Ok(first),
            Some(Ok(_)) => Err(StoreError::AmbiguousKey {
                prefix: key.to_string(),
            }),
            Some(Err(e)) => Err(e),
        }
    }

    /// Find the best stored image for a logical name and a set of label
    /// constraints, returning its blob key.
    ///
    /// Every requested `(name, value)` label must appear verbatim in a
    /// candidate's manifest. Among the survivors, images marked latest win
    /// when no `version` label was requested; otherwise, and among equals,
    /// the later import wins. An exact timestamp tie keeps the candidate
    /// seen first.
    #[instrument(level = "debug", skip(self))]
    pub fn get_aci(&self, name: &AppName, labels: &Labels) -> Result<String> {
        let prefix = short_sha512(name.as_str());

        let mut candidate_keys = Vec::new();
        let mut from = prefix.clone();
        'scan: loop {
            let batch = self.appindex.index_keys(&from, INDEX_BATCH);
            let Some(last) = batch.last().cloned() else {
                break;
            };
            for key in batch {
                if key.starts_with(&prefix) {
                    candidate_keys.push(key);
                } else {
                    break 'scan;
                }
            }
            from = last;
        }

        let version_requested = labels.get("version").is_some();
        let mut best: Option<AciInfo> = None;

        'candidates: for key in candidate_keys {
            let pointer: AppIndex = self.read_index(&key)?;
            let info: AciInfo = self.read_index(&pointer.aciinfo_key)?;

            for requested in labels {
                if !info.manifest.labels.has(&requested.name, &requested.value) {
                    continue 'candidates;
                }
            }

            match &best {
                None => best = Some(info),
                Some(current) => {
                    if !version_requested && current.latest != info.latest {
                        if info.latest {
                            best = Some(info);
                        }
                        continue;
                    }
                    if info.imported_at > current.imported_at {
                        best = Some(info);
                    }
                }
            }
        }

        match best {
            Some(info) => {
                debug!(key = %info.blob_key, "selected image");
                Ok(info.blob_key)
            }
            None => Err(StoreError::ImageNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Write a typed record into its namespace under its own key.
    pub fn write_index<R: IndexRecord>(&self, record: &R) -> Result<()> {
        let key = record.key();
        let buf = serde_json::to_vec(record).map_err(|source| StoreError::Record {
            key: key.clone(),
            source,
        })?;
        self.store_for(R::STORE).write(&key, &buf)
    }

    /// Read the typed record stored under `key` in the record's namespace.
    pub fn read_index<R: IndexRecord>(&self, key: &str) -> Result<R> {
        let buf = self.store_for(R::STORE).read(key)?;
        serde_json::from_slice(&buf).map_err(|source| StoreError::Record {
            key: key.to_string(),
            source,
        })
    }

    /// Write every key and a short value preview from every namespace, for
    /// inspecting store contents.
    pub fn dump<W: Write>(&self, out: &mut W, hex: bool) -> Result<()> {
        for kind in StoreKind::ALL {
            let store = self.store_for(kind);
            let mut count = 0usize;
            for key in store.keys() {
                let key = key?;
                let value = store.read(&key)?;
                let value = &value[..value.len().min(128)];
                let preview = if hex {
                    hex::encode(value)
                } else {
                    String::from_utf8_lossy(value).into_owned()
                };
                writeln!(out, "{}/{}: {}", kind.dir(), key, preview)
                    .map_err(StoreError::io("writing dump"))?;
                count += 1;
            }
            writeln!(out, "{} total keys", count).map_err(StoreError::io("writing dump"))?;
        }
        Ok(())
    }
}

/// Fill `buf` from the head of a stream, tolerating EOF short of the full
/// window.
fn read_head<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_head_short_stream() {
        let mut buf = [0u8; HEADER_PEEK_LEN];
        let n = read_head(&mut &b"tiny"[..], &mut buf).unwrap();
        assert_eq!(&buf[..n], b"tiny");
    }

    #[test]
    fn test_resolve_full_key_without_io() {
        // Store on an empty directory: a full prefixed key must resolve to
        // itself even though nothing is stored.
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let full = format!("{}{}", HASH_PREFIX, "0".repeat(keys::KEY_HEX_LEN));
        assert_eq!(store.resolve_key(&full).unwrap(), full);

        // Over-long input truncates down to the same key.
        let long = format!("{full}deadbeef");
        assert_eq!(store.resolve_key(&long).unwrap(), full);
    }

    #[test]
    fn test_resolve_missing_prefix() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let err = store.resolve_key("sha512-00").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let err = store.write_aci(&b"definitely not an image"[..], false).unwrap_err();
        assert!(matches!(err, StoreError::Image { .. }), "{err}");
        // Nothing may be left behind in staging.
        let staged: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(staged.is_empty());
    }
}
