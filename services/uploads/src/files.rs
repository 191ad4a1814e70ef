use crate::token::TokenScope;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Catalog row describing one uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct File {
    /// Externally addressable identifier
    pub id: String,
    /// SHA-256 over content bytes and MIME type, shared by duplicates.
    /// Also the object key, so never exposed to clients.
    #[serde(skip)]
    pub hash: String,
    /// Logical bucket, also the object store bucket
    pub bucket: String,
    /// Declared content type
    pub mime: String,
    /// Cleaned original filename
    pub filename: String,
    /// Width in pixels, 0 when unknown
    pub width: i32,
    /// Height in pixels, 0 when unknown
    pub height: i32,
    /// Region the object was first written to
    pub upload_region: String,
    pub uploaded_by: String,
    /// Epoch seconds
    pub uploaded_at: i64,
    /// Attached to a durable resource
    pub claimed: bool,
    /// Resource holding the file, set by claim events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

/// Logical upload bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Icons,
    Emojis,
    Stickers,
    Attachments,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Bucket::Icons,
        Bucket::Emojis,
        Bucket::Stickers,
        Bucket::Attachments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Icons => "icons",
            Bucket::Emojis => "emojis",
            Bucket::Stickers => "stickers",
            Bucket::Attachments => "attachments",
        }
    }

    /// Longest edge stored objects are scaled down to, if any
    pub fn max_dimension(&self) -> Option<u32> {
        match self {
            Bucket::Icons => Some(256),
            Bucket::Emojis => Some(128),
            Bucket::Stickers => Some(384),
            Bucket::Attachments => None,
        }
    }

    /// Token scope required to upload into this bucket
    pub fn upload_scope(&self) -> TokenScope {
        match self {
            Bucket::Icons => TokenScope::UploadIcon,
            Bucket::Emojis => TokenScope::UploadEmoji,
            Bucket::Stickers => TokenScope::UploadSticker,
            Bucket::Attachments => TokenScope::UploadAttachment,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bucket::ALL
            .iter()
            .copied()
            .find(|b| b.as_str() == s)
            .ok_or(())
    }
}

/// Content types eligible for previews and dimension probing
pub const SUPPORTED_IMAGES: [&str; 4] = ["image/png", "image/jpeg", "image/webp", "image/gif"];

pub fn is_supported_image(mime: &str) -> bool {
    SUPPORTED_IMAGES.contains(&mime)
}

/// Deduplication key: hex SHA-256 of the bytes followed by the MIME type
pub fn content_hash(bytes: &[u8], mime: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(mime.as_bytes());
    hex::encode(hasher.finalize())
}

/// Random 24-character URL- and filesystem-safe identifier
pub fn generate_id() -> String {
    let mut raw = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

const MAX_FILENAME_CHARS: usize = 255;

/// Column widths of the `files` table
pub const MAX_ID_CHARS: usize = 64;
pub const MAX_MIME_CHARS: usize = 255;
pub const MAX_UPLOADER_CHARS: usize = 255;

/// Strip directories, control and quoting characters from a client filename
pub fn clean_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | ';'))
        .take(MAX_FILENAME_CHARS)
        .collect();

    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
