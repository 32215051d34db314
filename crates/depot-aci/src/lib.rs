//! # depot-aci
//!
//! Archive handling for application container images.
//!
//! An image arrives as a tar stream, optionally wrapped in gzip, bzip2 or
//! xz. This crate classifies the stream from its first bytes, selects the
//! matching decompressor, and digs the manifest out of the (uncompressed)
//! archive.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

use depot_schema::ImageManifest;

/// How far into the stream the classifier looks. A stream that ends sooner
/// is still classified from whatever was read.
pub const HEADER_PEEK_LEN: usize = 512;

/// Archive entry holding the image manifest.
pub const MANIFEST_ENTRY: &str = "manifest";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const TAR_MAGIC: &[u8; 5] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

#[derive(Error, Debug)]
pub enum AciError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized image format (not a tar, gzip, bzip2 or xz stream)")]
    UnknownFileType,

    #[error("no \"manifest\" entry present in image")]
    MissingManifest,

    #[error("malformed image manifest: {0}")]
    MalformedManifest(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AciError>;

/// Compression envelope of an incoming image stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Bare uncompressed tar.
    Tar,
    Gzip,
    Bzip2,
    Xz,
    /// None of the known magic numbers matched.
    Unknown,
}

/// Classify a stream from its peeked head bytes.
pub fn detect_file_type(head: &[u8]) -> FileType {
    if head.starts_with(&GZIP_MAGIC) {
        return FileType::Gzip;
    }
    if head.starts_with(&BZIP2_MAGIC) {
        return FileType::Bzip2;
    }
    if head.starts_with(&XZ_MAGIC) {
        return FileType::Xz;
    }
    let magic_end = TAR_MAGIC_OFFSET + TAR_MAGIC.len();
    if head.len() >= magic_end && &head[TAR_MAGIC_OFFSET..magic_end] == TAR_MAGIC {
        return FileType::Tar;
    }
    FileType::Unknown
}

/// Wrap a stream with the decompressor its classification calls for.
///
/// Uncompressed tar passes through untouched; `Unknown` is fatal.
pub fn decompress<'a, R: Read + 'a>(r: R, file_type: FileType) -> Result<Box<dyn Read + 'a>> {
    Ok(match file_type {
        FileType::Tar => Box::new(r),
        FileType::Gzip => Box::new(flate2::read::GzDecoder::new(r)),
        FileType::Bzip2 => Box::new(bzip2::read::BzDecoder::new(r)),
        FileType::Xz => Box::new(xz2::read::XzDecoder::new(r)),
        FileType::Unknown => return Err(AciError::UnknownFileType),
    })
}

/// Extract and parse the manifest from an uncompressed tar stream.
///
/// Scans entries in archive order and stops at the first one named
/// [`MANIFEST_ENTRY`] at the archive root.
pub fn manifest_from_image<R: Read>(r: R) -> Result<ImageManifest> {
    let mut archive = tar::Archive::new(r);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()? == Path::new(MANIFEST_ENTRY) {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            return Ok(serde_json::from_slice(&buf)?);
        }
    }
    Err(AciError::MissingManifest)
}
