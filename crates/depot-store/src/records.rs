//! Typed records for the metadata namespaces.
//!
//! Records serialize to self-describing JSON and know which namespace they
//! live in and what key they are written under; `Store::write_index` and
//! `Store::read_index` route them accordingly.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use depot_schema::{AppName, ImageManifest};

use crate::keys::short_sha512;
use crate::StoreKind;

/// A record bound to one metadata namespace, keyed by its own contents.
pub trait IndexRecord: Serialize + DeserializeOwned {
    /// Namespace the record lives in.
    const STORE: StoreKind;

    /// Key the record is written under.
    fn key(&self) -> String;
}

/// Origin memo for a fetched image: which URL produced which blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub aci_url: String,
    pub etag: Option<String>,
    pub blob_key: String,
    pub cached_at: DateTime<Utc>,
}

impl Remote {
    pub fn new(aci_url: impl Into<String>, blob_key: impl Into<String>) -> Self {
        Self {
            aci_url: aci_url.into(),
            etag: None,
            blob_key: blob_key.into(),
            cached_at: Utc::now(),
        }
    }
}

impl IndexRecord for Remote {
    const STORE: StoreKind = StoreKind::Remote;

    fn key(&self) -> String {
        short_sha512(&self.aci_url)
    }
}

/// Searchable per-blob metadata written at admission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AciInfo {
    pub manifest: ImageManifest,
    pub blob_key: String,
    /// Set when the image was admitted without a pinned version (the
    /// "latest" pattern); preferred during selection when no version label
    /// is requested.
    pub latest: bool,
    pub imported_at: DateTime<Utc>,
}

impl AciInfo {
    pub fn new(
        manifest: ImageManifest,
        blob_key: String,
        latest: bool,
        imported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            manifest,
            blob_key,
            latest,
            imported_at,
        }
    }
}

impl IndexRecord for AciInfo {
    const STORE: StoreKind = StoreKind::AciInfo;

    fn key(&self) -> String {
        short_sha512(&self.blob_key)
    }
}

/// Pointer record making `aciinfo` entries reachable by image name.
///
/// Keyed by the name digest followed by the target `aciinfo` key, so every
/// image sharing a logical name clusters under one ordered key range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIndex {
    pub name: AppName,
    pub aciinfo_key: String,
}

impl AppIndex {
    pub fn new(name: AppName, aciinfo_key: String) -> Self {
        Self { name, aciinfo_key }
    }
}

impl IndexRecord for AppIndex {
    const STORE: StoreKind = StoreKind::AppIndex;

    fn key(&self) -> String {
        format!("{}{}", short_sha512(self.name.as_str()), self.aciinfo_key)
    }
}
